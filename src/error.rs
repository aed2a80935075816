//! Error taxonomy for the bridge.
//!
//! Engine I/O failures never reach a submitting caller as an error value.
//! Workers turn them into a [`Reply`] outcome or recover by replacing the
//! engine process. [`EngineError`] is therefore internal plumbing between
//! the process handle, the worker, and the pool.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reply text for a request that never reached a ready prompt in time.
pub const TIMEOUT_REPLY: &str = ";ERR;TIMEOUT";

/// Reply text for a request that reached a ready prompt with no result.
pub const NO_OUTPUT_REPLY: &str = ";ERR;NO_OUTPUT";

/// Reply text for a request whose engine died while serving it.
pub const ENGINE_EXITED_REPLY: &str = ";ERR;ENGINE_EXITED";

/// Reply text for a request the pool never dispatched before shutting down.
pub const SHUTDOWN_REPLY: &str = ";ERR;SHUTDOWN";

/// Errors raised by an engine process handle or while driving it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine executable could not be started
    #[error("failed to spawn engine '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a request to the engine's input failed
    #[error("failed to write to engine input: {0}")]
    Write(#[source] std::io::Error),

    /// Reading the engine's output failed
    #[error("failed to read engine output: {0}")]
    Read(#[source] std::io::Error),

    /// The engine closed its output (process exited or was killed)
    #[error("engine process exited")]
    Exited,

    /// No ready prompt was observed before the deadline
    #[error("no ready prompt within {0:?}")]
    Timeout(Duration),
}

/// Final outcome of one submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Result text printed by the engine
    Output(String),
    /// No ready prompt within the per-request timeout
    Timeout,
    /// Engine became ready without printing a result
    NoOutput,
    /// Engine process died while the request was in flight
    EngineExited,
    /// Pool shut down before the request was dispatched
    ShutDown,
}

impl Reply {
    /// Text sent back to the client.
    pub fn to_wire(&self) -> &str {
        match self {
            Reply::Output(text) => text.as_str(),
            Reply::Timeout => TIMEOUT_REPLY,
            Reply::NoOutput => NO_OUTPUT_REPLY,
            Reply::EngineExited => ENGINE_EXITED_REPLY,
            Reply::ShutDown => SHUTDOWN_REPLY,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Reply::Output(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_wire())
    }
}
