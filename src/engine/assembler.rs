//! Reassembles complete replies from raw, arbitrarily fragmented output.
//!
//! A worker feeds whatever bytes a non-blocking read produced. Only complete
//! lines are classified; an unterminated tail is carried into the next
//! `feed`. The one exception is the ready prompt, which the engine prints
//! without a newline: a tail that is exactly a prompt completes the cycle.
//!
//! Every statement the engine evaluates ends with its own prompt, so the
//! assembler counts prompts rather than stopping at the first one.

use std::sync::Arc;

use crate::engine::protocol::{self, ReplyLine};
use crate::log::Logger;
use crate::log_debug;

/// Longest tail that can still be an unterminated prompt.
const MAX_PROMPT_LEN: usize = 32;

/// Per-worker reply accumulator.
pub struct ReplyAssembler {
    name: String,
    logger: Arc<dyn Logger>,
    /// Result payloads seen this cycle, newline-joined
    result: Option<String>,
    /// Ready prompts seen this cycle
    prompts: usize,
    /// Bytes after the last newline
    tail: Vec<u8>,
}

impl ReplyAssembler {
    /// `name` identifies the owning worker in diagnostic log lines.
    pub fn new(name: impl Into<String>, logger: Arc<dyn Logger>) -> Self {
        Self {
            name: name.into(),
            logger,
            result: None,
            prompts: 0,
            tail: Vec::new(),
        }
    }

    /// Feed one chunk of raw engine output.
    ///
    /// Returns the result accumulated so far and whether at least one ready
    /// prompt has been seen this cycle. Cost is linear in the chunk size.
    pub fn feed(&mut self, chunk: &[u8]) -> (Option<&str>, bool) {
        let mut tail = std::mem::take(&mut self.tail);
        // The carried tail never holds a newline, so scanning resumes after it.
        let mut from = tail.len();
        tail.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = tail[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            self.accept_line(&String::from_utf8_lossy(&tail[start..end]));
            start = end + 1;
            from = start;
        }
        tail.drain(..start);
        self.tail = tail;

        if self.tail_is_prompt() {
            self.tail.clear();
            self.prompts += 1;
        }

        (self.result.as_deref(), self.is_ready())
    }

    /// True once a ready prompt has been seen since the last reset.
    pub fn is_ready(&self) -> bool {
        self.prompts > 0
    }

    /// Ready prompts seen since the last reset.
    pub fn prompts(&self) -> usize {
        self.prompts
    }

    /// Take the accumulated result and start a new cycle.
    ///
    /// `None` means no result line was seen; `Some("")` means a result line
    /// with an empty payload was.
    pub fn finish(&mut self) -> Option<String> {
        let result = self.result.take();
        self.reset();
        result
    }

    /// Drop everything accumulated, including any partial line.
    pub fn reset(&mut self) {
        self.result = None;
        self.prompts = 0;
        self.tail.clear();
    }

    fn accept_line(&mut self, line: &str) {
        match protocol::classify(line) {
            ReplyLine::Result(payload) => match self.result.as_mut() {
                Some(result) => {
                    result.push('\n');
                    result.push_str(payload);
                }
                None => self.result = Some(payload.to_string()),
            },
            ReplyLine::ReadyPrompt => self.prompts += 1,
            ReplyLine::Diagnostic(text) => {
                if !text.trim().is_empty() {
                    log_debug!(self.logger, "engine {} message: {}", self.name, text);
                }
            }
        }
    }

    fn tail_is_prompt(&self) -> bool {
        if self.tail.is_empty() || self.tail.len() > MAX_PROMPT_LEN {
            return false;
        }
        // The prompt's trailing space must be present, otherwise a byte-wise
        // split would detect "(%i1)" and orphan the space.
        match std::str::from_utf8(&self.tail) {
            Ok(tail) => tail.ends_with(' ') && protocol::is_ready_prompt(tail),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogLevel, MemoryLogger, NoOpLogger};

    fn assembler() -> ReplyAssembler {
        ReplyAssembler::new("test", Arc::new(NoOpLogger))
    }

    #[test]
    fn test_single_chunk_reply() {
        let mut asm = assembler();
        let (reply, ready) = asm.feed(b"(%o1) 24\n(%i2) ");
        assert_eq!(reply, Some("24"));
        assert!(ready);
        assert_eq!(asm.finish(), Some("24".to_string()));
        assert!(!asm.is_ready());
    }

    #[test]
    fn test_byte_by_byte_matches_single_chunk() {
        let input = b"(%o1) 24\n";

        let mut whole = assembler();
        let whole_state = {
            let (reply, ready) = whole.feed(input);
            (reply.map(str::to_string), ready)
        };

        let mut split = assembler();
        let mut split_state = (None, false);
        for byte in input.iter() {
            let (reply, ready) = split.feed(std::slice::from_ref(byte));
            split_state = (reply.map(str::to_string), ready);
        }

        assert_eq!(whole_state, (Some("24".to_string()), false));
        assert_eq!(split_state, whole_state);
    }

    #[test]
    fn test_byte_by_byte_prompt_becomes_ready_only_when_complete() {
        let mut asm = assembler();
        for byte in b"(%o1) 24\n(%i2)".iter() {
            let (_, ready) = asm.feed(std::slice::from_ref(byte));
            assert!(!ready);
        }
        let (reply, ready) = asm.feed(b" ");
        assert_eq!(reply, Some("24"));
        assert!(ready);
    }

    #[test]
    fn test_partial_result_line_is_held_back() {
        let mut asm = assembler();
        let (reply, ready) = asm.feed(b"(%o1) 12");
        assert_eq!(reply, None);
        assert!(!ready);

        let (reply, ready) = asm.feed(b"34\n(%i2) ");
        assert_eq!(reply, Some("1234"));
        assert!(ready);
    }

    #[test]
    fn test_multiple_results_are_newline_joined() {
        let mut asm = assembler();
        asm.feed(b"(%o1) a\n");
        asm.feed(b"(%o2) b\n(%o3) c\n(%i4) ");
        assert_eq!(asm.finish(), Some("a\nb\nc".to_string()));
    }

    #[test]
    fn test_ready_without_result() {
        let mut asm = assembler();
        let (reply, ready) = asm.feed(b"(%i2) ");
        assert_eq!(reply, None);
        assert!(ready);
        assert_eq!(asm.finish(), None);
    }

    #[test]
    fn test_empty_result_is_distinct_from_none() {
        let mut asm = assembler();
        asm.feed(b"(%o1)\n(%i2) ");
        assert_eq!(asm.finish(), Some(String::new()));
    }

    #[test]
    fn test_ready_is_sticky_within_cycle() {
        let mut asm = assembler();
        asm.feed(b"(%i1) \n");
        let (_, ready) = asm.feed(b"some trailing noise\n");
        assert!(ready);
    }

    #[test]
    fn test_diagnostics_go_to_logger_not_result() {
        let logger = Arc::new(MemoryLogger::new());
        let mut asm = ReplyAssembler::new("w0", logger.clone());

        asm.feed(b"rat: replaced 0.5 by 1/2 = 0.5\n\n(%o1) 1/2\n(%i2) ");
        assert_eq!(asm.finish(), Some("1/2".to_string()));
        assert!(logger.contains(LogLevel::Debug, "engine w0 message: rat: replaced"));
        assert_eq!(logger.lines().len(), 1);
    }

    #[test]
    fn test_crlf_output() {
        let mut asm = assembler();
        let (reply, ready) = asm.feed(b"(%o1) 8\r\n(%i2) \r\n");
        assert_eq!(reply, Some("8"));
        assert!(ready);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let mut asm = assembler();
        let bytes = "(%o1) π\n(%i2) ".as_bytes();
        // Split inside the two-byte encoding of π.
        let cut = bytes.iter().position(|&b| b == 0xCF).unwrap() + 1;
        asm.feed(&bytes[..cut]);
        let (reply, ready) = asm.feed(&bytes[cut..]);
        assert_eq!(reply, Some("π"));
        assert!(ready);
    }

    #[test]
    fn test_reset_drops_partial_line() {
        let mut asm = assembler();
        asm.feed(b"(%o1) stale");
        asm.reset();
        let (reply, ready) = asm.feed(b"(%o2) fresh\n(%i3) ");
        assert_eq!(reply, Some("fresh"));
        assert!(ready);
    }

    #[test]
    fn test_counts_every_prompt_in_one_chunk() {
        let mut asm = assembler();
        let (_, ready) = asm.feed(b"\n(%i2) \n(%i3) \n(%i4) ");
        assert!(ready);
        assert_eq!(asm.prompts(), 3);
        assert_eq!(asm.finish(), None);
        assert_eq!(asm.prompts(), 0);
    }

    #[test]
    fn test_flood_of_diagnostics_is_not_kept() {
        let mut asm = assembler();
        let flood = b"y\n".repeat(512 * 1024);
        let start = std::time::Instant::now();
        for chunk in flood.chunks(64 * 1024) {
            let (reply, ready) = asm.feed(chunk);
            assert_eq!(reply, None);
            assert!(!ready);
        }
        assert!(
            start.elapsed() < std::time::Duration::from_secs(10),
            "1 MiB took {:?}",
            start.elapsed()
        );
        assert!(asm.tail.is_empty());
    }

    #[test]
    fn test_long_unterminated_tail_is_not_a_prompt() {
        let mut asm = assembler();
        let mut noise = vec![b'x'; 4096];
        noise.extend_from_slice(b"(%i2) ");
        let (_, ready) = asm.feed(&noise);
        assert!(!ready);
    }
}
