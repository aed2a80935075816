//! Owns one engine subprocess and its pipes.
//!
//! The engine is started with stdin/stdout piped and its stdout switched to
//! non-blocking mode. Reads wait on `poll(2)` for at most the caller's
//! interval, then take whatever is available up to a fixed cap, so an engine
//! that never stops printing cannot hold a reader past its deadline. The
//! child is always killed and reaped when the handle is dropped.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::engine::protocol::LINE_TERMINATOR;
use crate::error::EngineError;

/// Read buffer size for one `read(2)` call
const READ_CHUNK: usize = 4096;

/// Most bytes returned by one `read_available` call
const MAX_READ_BYTES: usize = 64 * 1024;

/// How often `terminate` checks whether the child has exited
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What to run for each engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    /// Executable path
    pub path: String,
    /// Extra arguments
    pub args: Vec<String>,
    /// Niceness applied in the child before exec
    pub nice: Option<i32>,
}

impl EngineCommand {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            nice: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn nice(mut self, nice: i32) -> Self {
        self.nice = Some(nice);
        self
    }
}

/// A running engine subprocess.
pub struct EngineProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    /// Set once stdout reported EOF
    eof: bool,
    /// Set once the child has been waited for; its pid may be reused after
    reaped: Option<ExitStatus>,
}

impl EngineProcess {
    /// Start the engine with piped standard streams.
    pub fn spawn(command: &EngineCommand) -> Result<Self, EngineError> {
        let spawn_error = |source: io::Error| EngineError::Spawn {
            path: command.path.clone(),
            source,
        };

        let mut cmd = Command::new(&command.path);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // Own process group: a Ctrl-C aimed at the daemon must not reach
            // the engines before the pool shuts them down.
            .process_group(0);

        if let Some(nice) = command.nice {
            // SAFETY: setpriority is async-signal-safe and touches no
            // parent state.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::setpriority(libc::PRIO_PROCESS, 0, nice) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(spawn_error)?;

        let stdin = child.stdin.take();
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_error(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "engine stdout was not captured",
                )));
            }
        };

        if let Err(e) = set_nonblocking(&stdout) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(e));
        }

        Ok(Self {
            child,
            stdin,
            stdout,
            eof: false,
            reaped: None,
        })
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Write `text`, adding a line terminator if missing, and flush.
    pub fn write(&mut self, text: &str) -> Result<(), EngineError> {
        let stdin = self.stdin.as_mut().ok_or(EngineError::Exited)?;

        stdin.write_all(text.as_bytes()).map_err(EngineError::Write)?;
        if !text.ends_with(LINE_TERMINATOR) {
            let mut buf = [0u8; 4];
            stdin
                .write_all(LINE_TERMINATOR.encode_utf8(&mut buf).as_bytes())
                .map_err(EngineError::Write)?;
        }
        stdin.flush().map_err(EngineError::Write)
    }

    /// Read whatever output is available, waiting at most `wait` for the
    /// first byte. Stops after `MAX_READ_BYTES` even if more is pending.
    ///
    /// Returns an empty buffer when nothing arrived in time. Returns
    /// `EngineError::Exited` once stdout is closed and fully drained.
    pub fn read_available(&mut self, wait: Duration) -> Result<Vec<u8>, EngineError> {
        if self.eof {
            return Err(EngineError::Exited);
        }

        if !self.wait_readable(wait)? {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        while out.len() < MAX_READ_BYTES {
            let room = READ_CHUNK.min(MAX_READ_BYTES - out.len());
            match self.stdout.read(&mut buf[..room]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::Read(e)),
            }
        }

        if out.is_empty() && self.eof {
            return Err(EngineError::Exited);
        }
        Ok(out)
    }

    /// True while the child has not exited.
    pub fn is_alive(&mut self) -> bool {
        if self.reaped.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.reaped = Some(status);
                false
            }
            Err(_) => false,
        }
    }

    /// SIGTERM the process group, wait up to `grace`, then SIGKILL.
    /// Always reaps the child.
    ///
    /// Returns the exit status if the child could be reaped.
    pub fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if self.reaped.is_some() {
            return self.reaped;
        }
        // Closing stdin lets a well-behaved engine exit on EOF.
        self.stdin = None;
        let _ = killpg(self.pgid(), Signal::SIGTERM);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.reaped = Some(status);
                    return self.reaped;
                }
                Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
                Err(_) => break,
            }
        }

        self.kill()
    }

    /// SIGKILL the engine's process group and reap the child.
    pub fn kill(&mut self) -> Option<ExitStatus> {
        if self.reaped.is_some() {
            return self.reaped;
        }
        self.stdin = None;
        if killpg(self.pgid(), Signal::SIGKILL).is_err() {
            let _ = self.child.kill();
        }
        self.reaped = self.child.wait().ok();
        self.reaped
    }

    /// The engine leads its own process group.
    fn pgid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    fn wait_readable(&self, wait: Duration) -> Result<bool, EngineError> {
        let millis = wait.as_millis().min(u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(self.stdout.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(errno) => Err(EngineError::Read(io::Error::from(errno))),
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn set_nonblocking(stdout: &ChildStdout) -> io::Result<()> {
    let fd = stdout.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}
