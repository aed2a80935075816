//! Line protocol spoken by the engine over its pipes.
//!
//! The engine prints results as `(%oN) payload`, and prints `(%iN) ` with
//! nothing after it when it is idle and waiting for the next statement.
//! Everything else it prints (warnings, banners, error text) is a
//! diagnostic that never reaches a client.

use once_cell::sync::Lazy;
use regex::Regex;

/// Output marker followed by optional spaces and the payload.
static RESULT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\(%o\d+\) *(.*)$").expect("result line pattern is valid")
});

/// Input prompt with no trailing payload.
static PROMPT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\(%i\d+\) ?$").expect("prompt line pattern is valid")
});

/// Line terminator appended to every write.
pub const LINE_TERMINATOR: char = '\n';

/// Statement terminator that prints the statement's value
pub const DISPLAY_TERMINATOR: char = ';';

/// Statement terminator that evaluates silently
pub const SILENT_TERMINATOR: char = '$';

/// One classified line of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine<'a> {
    /// A result line; holds the payload after the marker
    Result(&'a str),
    /// The engine is idle and waiting for input
    ReadyPrompt,
    /// Anything else the engine printed
    Diagnostic(&'a str),
}

/// Classify one line of engine output (without its trailing newline).
///
/// Never fails: anything unrecognised is a diagnostic. A trailing `\r` is
/// ignored so engines writing CRLF classify the same way.
pub fn classify(line: &str) -> ReplyLine<'_> {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if let Some(caps) = RESULT_LINE.captures(line) {
        let payload = caps.get(1).map_or("", |m| m.as_str());
        return ReplyLine::Result(payload);
    }

    if PROMPT_LINE.is_match(line) {
        return ReplyLine::ReadyPrompt;
    }

    ReplyLine::Diagnostic(line)
}

/// True if `fragment` on its own is a ready prompt.
///
/// The engine prints its prompt without a newline, so the tail of the last
/// read is checked with this before a newline ever arrives.
pub fn is_ready_prompt(fragment: &str) -> bool {
    matches!(classify(fragment), ReplyLine::ReadyPrompt)
}

/// Number of statements in `text`, i.e. how many prompts the engine prints
/// after evaluating it.
///
/// Terminators inside string literals and `/* */` comments do not count.
/// Text after the last terminator is an unfinished statement and does not
/// count either.
pub fn count_statements(text: &str) -> usize {
    let mut count = 0;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            DISPLAY_TERMINATOR | SILENT_TERMINATOR => count += 1,
            '"' => {
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            chars.next();
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut star = false;
                for c in chars.by_ref() {
                    if star && c == '/' {
                        break;
                    }
                    star = c == '*';
                }
            }
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_line() {
        assert_eq!(classify("(%o1) 24"), ReplyLine::Result("24"));
        assert_eq!(classify("(%o12)    x^2+1"), ReplyLine::Result("x^2+1"));
        assert_eq!(classify("(%o3)"), ReplyLine::Result(""));
    }

    #[test]
    fn test_result_payload_keeps_inner_spacing() {
        assert_eq!(classify("(%o7) [a, b,  c] "), ReplyLine::Result("[a, b,  c] "));
    }

    #[test]
    fn test_ready_prompt() {
        assert_eq!(classify("(%i1) "), ReplyLine::ReadyPrompt);
        assert_eq!(classify("(%i42) "), ReplyLine::ReadyPrompt);
        assert_eq!(classify("(%i2)"), ReplyLine::ReadyPrompt);
        assert_eq!(classify("(%i2) \r"), ReplyLine::ReadyPrompt);
    }

    #[test]
    fn test_prompt_with_payload_is_diagnostic() {
        // An echoed statement after the prompt is not a ready signal.
        assert_eq!(classify("(%i1) 12+12;"), ReplyLine::Diagnostic("(%i1) 12+12;"));
    }

    #[test]
    fn test_diagnostics() {
        assert_eq!(classify(""), ReplyLine::Diagnostic(""));
        assert_eq!(
            classify("incorrect syntax: Premature termination of input at ;."),
            ReplyLine::Diagnostic("incorrect syntax: Premature termination of input at ;.")
        );
        assert_eq!(classify("(%x1) 5"), ReplyLine::Diagnostic("(%x1) 5"));
        assert_eq!(classify("(%o) 5"), ReplyLine::Diagnostic("(%o) 5"));
        assert_eq!(classify(" (%o1) 5"), ReplyLine::Diagnostic(" (%o1) 5"));
    }

    #[test]
    fn test_is_ready_prompt() {
        assert!(is_ready_prompt("(%i3) "));
        assert!(!is_ready_prompt("(%i3"));
        assert!(!is_ready_prompt("(%o3) 1"));
    }

    #[test]
    fn test_count_statements() {
        assert_eq!(count_statements(""), 0);
        assert_eq!(count_statements("12+12"), 0);
        assert_eq!(count_statements("12+12;"), 1);
        assert_eq!(count_statements("kill(all)$\ndisplay2d:false$ linel:10000$"), 3);
        assert_eq!(count_statements("a:1; b:2$ c"), 2);
        assert_eq!(count_statements(";"), 1);
    }

    #[test]
    fn test_count_statements_skips_strings_and_comments() {
        assert_eq!(count_statements(r#"print("a;b$c");"#), 1);
        assert_eq!(count_statements(r#"s:"say \"hi;\"";"#), 1);
        assert_eq!(count_statements("/* x; y$ */ 1+1;"), 1);
        assert_eq!(count_statements("/* unterminated; "), 0);
    }
}
