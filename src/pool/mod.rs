//! Pool of long-lived engine workers fed from one shared queue.
//!
//! ## Architecture
//! - N workers, each on its own thread with its own engine process
//! - One MPMC queue of (request, reply sender) jobs; `submit` never blocks
//! - Workers reset the engine between requests and replace it on timeout
//! - An optional watchdog kills engines whose worker stays busy past the
//!   timeout, in case the worker's own deadline check is itself stuck
//! - `shutdown` drains the queue, stops and joins every thread, and fails
//!   whatever was never dispatched

pub mod activity;
pub mod future;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::engine::{EngineCommand, RequestSanitizer};
use crate::error::Reply;
use crate::log::Logger;
use crate::{log_error, log_info, log_warn};

pub use activity::{ActivityMap, WorkerActivity, WorkerState};
pub use future::{ReplySender, RequestFuture};
pub use worker::EngineWorker;

/// Default number of workers in the pool
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default polling interval for pipes and the queue
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Extra time the watchdog allows past the timeout before killing
pub const WATCHDOG_GRACE: Duration = Duration::from_secs(1);

/// Bounds for the watchdog's scan interval
const WATCHDOG_MIN_INTERVAL: Duration = Duration::from_millis(250);
const WATCHDOG_MAX_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Engine executable, arguments, and niceness
    pub engine: EngineCommand,
    /// Number of workers to maintain
    pub pool_size: usize,
    /// Deadline for one request (and for one reset cycle)
    pub timeout: Duration,
    /// Statements that bring a fresh engine to a known state
    pub init_script: String,
    /// Statement sent before the init script between requests
    pub reset_command: String,
    /// Sleep/poll granularity for pipe reads and queue polling
    pub poll_interval: Duration,
    /// Run the external watchdog thread
    pub watchdog: bool,
    /// Request transform entries, applied in order
    pub sanitizers: Vec<String>,
}

impl PoolConfig {
    /// How often the watchdog scans for stuck workers.
    pub fn watchdog_interval(&self) -> Duration {
        (self.timeout / 2).clamp(WATCHDOG_MIN_INTERVAL, WATCHDOG_MAX_INTERVAL)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            engine: EngineCommand::new("/usr/bin/maxima").arg("--very-quiet"),
            pool_size: DEFAULT_POOL_SIZE,
            timeout: DEFAULT_TIMEOUT,
            init_script: "display2d:false$ linel:10000$".to_string(),
            reset_command: "kill(all)$".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            watchdog: true,
            sanitizers: vec!["strip_line_breaks".to_string()],
        }
    }
}

/// An immutable client request.
#[derive(Debug, Clone)]
pub struct Request {
    pub text: String,
    pub submitted_at: Instant,
}

impl Request {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            submitted_at: Instant::now(),
        }
    }
}

/// A request travelling through the queue with the sender for its reply.
pub struct Job {
    pub request: Request,
    pub reply: ReplySender,
}

/// Worker pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers whose control loop is still running
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub restarting_workers: usize,
    pub queued_requests: usize,
    pub total_requests_processed: u64,
    pub total_restarts: u64,
}

/// Fixed pool of engine workers.
pub struct WorkerPool {
    config: Arc<PoolConfig>,
    /// `None` once shutdown has begun
    sender: Mutex<Option<Sender<Job>>>,
    /// Kept so undispatched jobs can be failed at shutdown
    receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    activity: ActivityMap,
    logger: Arc<dyn Logger>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Spawn every worker's engine and start the worker threads.
    ///
    /// A worker whose engine cannot be spawned is skipped with an error
    /// logged; the pool fails only if no worker could be started.
    pub fn new(config: PoolConfig, logger: Arc<dyn Logger>) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(anyhow!("pool size must be at least 1"));
        }
        if config.timeout.is_zero() || config.poll_interval.is_zero() {
            return Err(anyhow!("timeout and poll interval must be non-zero"));
        }
        // Validate once up front; each worker builds its own chain.
        RequestSanitizer::from_entries(&config.sanitizers)?;

        let config = Arc::new(config);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let stop = Arc::new(AtomicBool::new(false));
        let activity = ActivityMap::new();

        let mut workers = Vec::with_capacity(config.pool_size);
        for id in 0..config.pool_size {
            let sanitizer = RequestSanitizer::from_entries(&config.sanitizers)?;

            let worker = match EngineWorker::start(
                id,
                config.clone(),
                sanitizer,
                receiver.clone(),
                stop.clone(),
                activity.clone(),
                logger.clone(),
            ) {
                Ok(worker) => worker,
                Err(e) => {
                    log_error!(logger, "failed to start worker {}: {}", id, e);
                    continue;
                }
            };

            let handle = thread::Builder::new()
                .name(worker.name().to_string())
                .spawn(move || worker.run())
                .with_context(|| format!("failed to spawn thread for worker {}", id))?;
            workers.push(handle);
        }

        if workers.is_empty() {
            return Err(anyhow!(
                "failed to start any engine worker for '{}'",
                config.engine.path
            ));
        }

        let watchdog = if config.watchdog {
            Some(Self::spawn_watchdog(
                config.clone(),
                stop.clone(),
                activity.clone(),
                logger.clone(),
            )?)
        } else {
            None
        };

        log_info!(
            logger,
            "worker pool started with {} of {} workers",
            workers.len(),
            config.pool_size
        );

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(workers),
            watchdog: Mutex::new(watchdog),
            stop,
            activity,
            logger,
        })
    }

    /// Queue a request and return its future immediately.
    ///
    /// After shutdown has begun the future is already resolved to
    /// [`Reply::ShutDown`].
    pub fn submit(&self, text: impl Into<String>) -> RequestFuture {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return RequestFuture::resolved(Reply::ShutDown);
        };

        let (future, reply) = RequestFuture::pair();
        let job = Job {
            request: Request::new(text),
            reply,
        };
        // On failure the job is dropped, which resolves the future.
        let _ = sender.send(job);
        future
    }

    /// Current engine pid per worker, ordered by worker id.
    pub fn worker_pids(&self) -> Vec<Option<u32>> {
        self.activity
            .snapshot()
            .into_iter()
            .map(|(_, a)| a.pid)
            .collect()
    }

    /// Block until every live worker is idle with an engine, or `timeout`.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let all_idle = self
                .activity
                .snapshot()
                .iter()
                .filter(|(_, a)| a.state != WorkerState::Stopped)
                .all(|(_, a)| a.state == WorkerState::Idle && a.pid.is_some());
            if all_idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let snapshot = self.activity.snapshot();
        let count = |state: WorkerState| snapshot.iter().filter(|(_, a)| a.state == state).count();

        PoolStats {
            total_workers: snapshot.len() - count(WorkerState::Stopped),
            idle_workers: count(WorkerState::Idle),
            busy_workers: count(WorkerState::Busy),
            restarting_workers: count(WorkerState::Restarting),
            queued_requests: self.receiver.len(),
            total_requests_processed: snapshot.iter().map(|(_, a)| a.completed).sum(),
            total_restarts: snapshot.iter().map(|(_, a)| a.restarts).sum(),
        }
    }

    /// Stop accepting requests, let the workers drain the queue, stop and
    /// join every thread, then fail anything still queued.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let sender = lock(&self.sender).take();
        if sender.is_none() && lock(&self.workers).is_empty() {
            return;
        }
        drop(sender);

        let queued = self.receiver.len();
        if queued > 0 {
            let live = self.live_workers().max(1);
            let rounds = (queued / live + 1) as u32;
            let deadline = Instant::now() + self.config.timeout * rounds + WATCHDOG_GRACE;
            log_info!(self.logger, "draining {} queued requests", queued);
            while !self.receiver.is_empty() && Instant::now() < deadline {
                thread::sleep(self.config.poll_interval);
            }
        }

        self.stop.store(true, Ordering::SeqCst);

        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log_error!(self.logger, "{} panicked", name);
            }
        }
        if let Some(handle) = lock(&self.watchdog).take() {
            if handle.join().is_err() {
                log_error!(self.logger, "watchdog panicked");
            }
        }

        let mut abandoned = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job.reply.send(Reply::ShutDown);
            abandoned += 1;
        }
        if abandoned > 0 {
            log_warn!(self.logger, "failed {} undispatched requests at shutdown", abandoned);
        }

        log_info!(self.logger, "worker pool stopped");
    }

    fn live_workers(&self) -> usize {
        self.activity
            .snapshot()
            .iter()
            .filter(|(_, a)| a.state != WorkerState::Stopped)
            .count()
    }

    fn spawn_watchdog(
        config: Arc<PoolConfig>,
        stop: Arc<AtomicBool>,
        activity: ActivityMap,
        logger: Arc<dyn Logger>,
    ) -> Result<JoinHandle<()>> {
        let interval = config.watchdog_interval();
        let limit = config.timeout + WATCHDOG_GRACE;

        thread::Builder::new()
            .name("engine-watchdog".to_string())
            .spawn(move || {
                let mut last_scan = Instant::now();
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(config.poll_interval);
                    if last_scan.elapsed() < interval {
                        continue;
                    }
                    last_scan = Instant::now();

                    activity.kill_stuck(limit, |id, pid| {
                        log_warn!(
                            logger,
                            "engine-{} busy for more than {:?}, killing engine pid {}",
                            id,
                            limit,
                            pid
                        );
                        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                            log_warn!(logger, "failed to kill engine pid {}: {}", pid, e);
                        }
                    });
                }
            })
            .context("failed to spawn watchdog thread")
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NoOpLogger;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert!(config.watchdog);
        assert_eq!(config.sanitizers, vec!["strip_line_breaks"]);
    }

    #[test]
    fn test_watchdog_interval_is_clamped() {
        let with_timeout = |secs: u64| PoolConfig {
            timeout: Duration::from_secs(secs),
            ..PoolConfig::default()
        };
        assert_eq!(with_timeout(1).watchdog_interval(), Duration::from_millis(500));
        assert_eq!(with_timeout(60).watchdog_interval(), WATCHDOG_MAX_INTERVAL);
        let fast = PoolConfig {
            timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        };
        assert_eq!(fast.watchdog_interval(), WATCHDOG_MIN_INTERVAL);
    }

    #[test]
    fn test_zero_pool_size_is_rejected() {
        let config = PoolConfig {
            pool_size: 0,
            ..PoolConfig::default()
        };
        assert!(WorkerPool::new(config, Arc::new(NoOpLogger)).is_err());
    }

    #[test]
    fn test_unknown_transform_is_rejected() {
        let config = PoolConfig {
            engine: EngineCommand::new("cat"),
            sanitizers: vec!["shout".to_string()],
            ..PoolConfig::default()
        };
        let err = WorkerPool::new(config, Arc::new(NoOpLogger)).err().unwrap();
        assert!(err.to_string().contains("shout"));
    }

    #[test]
    fn test_missing_engine_fails_pool() {
        let config = PoolConfig {
            engine: EngineCommand::new("/nonexistent/engine"),
            pool_size: 2,
            ..PoolConfig::default()
        };
        let err = WorkerPool::new(config, Arc::new(NoOpLogger)).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/engine"));
    }

    #[test]
    fn test_request_records_submission_time() {
        let before = Instant::now();
        let request = Request::new("12+12;");
        assert_eq!(request.text, "12+12;");
        assert!(request.submitted_at >= before);
    }
}
