// Library interface for casbridge
// The daemon binary, integration tests, and benchmarks build on these modules.

pub mod config;
pub mod engine;
pub mod error;
pub mod log;
pub mod logging;
pub mod pool;
pub mod server;

pub use error::{EngineError, Reply};
pub use pool::{PoolConfig, RequestFuture, WorkerPool};
