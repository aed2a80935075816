//! Shared helpers for tests that drive real pools against the fake engine.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use casbridge::engine::EngineCommand;
use casbridge::log::NoOpLogger;
use casbridge::pool::{PoolConfig, WorkerPool};

/// Script that speaks the engine protocol, see the header of the file.
pub const FAKE_ENGINE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake_engine.sh");

/// Generous upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(15);

pub fn fake_engine() -> EngineCommand {
    EngineCommand::new("/bin/sh").arg(FAKE_ENGINE)
}

/// Fake engine started with extra options, e.g. `--prompt-delay=0.1`.
pub fn fake_engine_with(options: &[&str]) -> EngineCommand {
    options
        .iter()
        .fold(fake_engine(), |engine, option| engine.arg(*option))
}

/// Pool config with a single-statement reset so every reset produces
/// exactly one prompt.
pub fn test_config(pool_size: usize, timeout: Duration) -> PoolConfig {
    PoolConfig {
        engine: fake_engine(),
        pool_size,
        timeout,
        init_script: String::new(),
        reset_command: "kill(all)$".to_string(),
        poll_interval: Duration::from_millis(20),
        watchdog: false,
        ..PoolConfig::default()
    }
}

/// Pool config that keeps the shipped init script and reset command.
pub fn default_scripts_config(engine: EngineCommand, pool_size: usize, timeout: Duration) -> PoolConfig {
    PoolConfig {
        engine,
        pool_size,
        timeout,
        watchdog: false,
        ..PoolConfig::default()
    }
}

/// Start a pool and wait for every worker to finish its handshake.
pub fn start_pool(config: PoolConfig) -> WorkerPool {
    let pool = WorkerPool::new(config, Arc::new(NoOpLogger)).expect("pool should start");
    assert!(pool.wait_until_idle(PATIENCE), "workers never became idle");
    pool
}
