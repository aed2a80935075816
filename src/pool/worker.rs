//! One engine worker: owns an engine process, pulls requests from the shared
//! queue, and replaces its engine whenever it hangs or dies.
//!
//! ## States
//! - `Starting`: engine spawned, waiting for its first prompt, replaying the
//!   init script. A slow handshake is logged and tolerated.
//! - `Idle`: stop flag checked, engine reset, queue polled.
//! - `Busy`: request written, reply assembled until one prompt per
//!   statement has arrived or the deadline passes.
//! - `Restarting`: old engine killed, new one spawned with backoff, init
//!   script replayed.
//! - `Stopped`: engine terminated, control loop returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::engine::protocol::count_statements;
use crate::engine::{EngineProcess, ReplyAssembler, RequestSanitizer};
use crate::error::{EngineError, Reply};
use crate::log::Logger;
use crate::pool::activity::{ActivityMap, WorkerState};
use crate::pool::{Job, PoolConfig};
use crate::{log_debug, log_error, log_info, log_warn};

/// Upper bound for the delay between failed spawn attempts
const MAX_SPAWN_BACKOFF: Duration = Duration::from_secs(5);

/// How long a stopping engine gets to exit after SIGTERM
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// A worker and its exclusively owned engine.
pub struct EngineWorker {
    id: usize,
    name: String,
    config: Arc<PoolConfig>,
    process: Option<EngineProcess>,
    assembler: ReplyAssembler,
    sanitizer: RequestSanitizer,
    jobs: Receiver<Job>,
    stop: Arc<AtomicBool>,
    activity: ActivityMap,
    logger: Arc<dyn Logger>,
}

impl EngineWorker {
    /// Spawn the engine for worker `id`. The handshake runs later, on the
    /// worker's own thread, inside [`EngineWorker::run`].
    pub fn start(
        id: usize,
        config: Arc<PoolConfig>,
        sanitizer: RequestSanitizer,
        jobs: Receiver<Job>,
        stop: Arc<AtomicBool>,
        activity: ActivityMap,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, EngineError> {
        let name = format!("engine-{}", id);
        activity.register(id);

        let process = match EngineProcess::spawn(&config.engine) {
            Ok(process) => process,
            Err(e) => {
                activity.set_state(id, WorkerState::Stopped);
                return Err(e);
            }
        };
        activity.set_pid(id, Some(process.pid()));
        log_debug!(logger, "{}: spawned engine pid {}", name, process.pid());

        Ok(Self {
            id,
            assembler: ReplyAssembler::new(name.clone(), logger.clone()),
            name,
            config,
            process: Some(process),
            sanitizer,
            jobs,
            stop,
            activity,
            logger,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Control loop. Returns once the stop flag is observed while idle or
    /// the queue is closed and empty.
    pub fn run(mut self) {
        self.activity.set_state(self.id, WorkerState::Starting);
        if let Err(e) = self.handshake() {
            log_warn!(self.logger, "{}: engine failed during startup: {}", self.name, e);
            self.restart();
        }

        log_info!(self.logger, "{}: processing requests", self.name);

        loop {
            if self.stopping() {
                break;
            }
            self.activity.set_state(self.id, WorkerState::Idle);

            if let Err(e) = self.reset() {
                log_warn!(self.logger, "{}: reset failed: {}", self.name, e);
                self.restart();
                continue;
            }

            match self.next_job() {
                Some(job) => self.serve(job),
                None => break,
            }
        }

        self.stop_engine();
        self.activity.set_state(self.id, WorkerState::Stopped);
        log_info!(self.logger, "{}: stopped", self.name);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Wait for the first prompt, then replay the init script.
    ///
    /// Timeouts here are logged and tolerated; only a dead engine is an
    /// error.
    fn handshake(&mut self) -> Result<(), EngineError> {
        match self.read_reply(1) {
            Ok(_) => {}
            Err(EngineError::Timeout(after)) => {
                log_warn!(
                    self.logger,
                    "{}: no prompt after {:?} at startup, continuing",
                    self.name,
                    after
                );
            }
            Err(e) => return Err(e),
        }

        let init = self.config.init_script.clone();
        self.run_script(&init, true)
    }

    /// Send reset command and init script before taking the next request.
    fn reset(&mut self) -> Result<(), EngineError> {
        let script = [self.config.reset_command.trim(), self.config.init_script.trim()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        self.run_script(&script, false)
    }

    /// Write `script` and discard its replies, waiting for one prompt per
    /// statement so none of them is mistaken for the next request's.
    ///
    /// With `tolerate_timeout` missing prompts are only logged.
    fn run_script(&mut self, script: &str, tolerate_timeout: bool) -> Result<(), EngineError> {
        let statements = count_statements(script);
        if statements == 0 {
            if !script.trim().is_empty() {
                log_warn!(self.logger, "{}: script has no terminated statement, not sent", self.name);
            }
            return Ok(());
        }

        self.assembler.reset();
        let process = self.process.as_mut().ok_or(EngineError::Exited)?;
        process.write(script)?;

        match self.read_reply(statements) {
            Ok(_) => Ok(()),
            Err(EngineError::Timeout(after)) if tolerate_timeout => {
                log_warn!(self.logger, "{}: init script not acknowledged after {:?}", self.name, after);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Poll the queue until a job arrives, the stop flag is set, or the
    /// queue is closed and drained.
    fn next_job(&self) -> Option<Job> {
        loop {
            if self.stopping() {
                return None;
            }
            match self.jobs.recv_timeout(self.config.poll_interval) {
                Ok(job) => return Some(job),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn serve(&mut self, job: Job) {
        self.activity.set_state(self.id, WorkerState::Busy);

        let request = self.sanitizer.sanitize(&job.request.text);
        log_debug!(
            self.logger,
            "{}: request (queued {:?}): {}",
            self.name,
            job.request.submitted_at.elapsed(),
            request
        );

        let (reply, restart) = match self.exchange(&request) {
            Ok(Some(result)) => (Reply::Output(result), false),
            Ok(None) => (Reply::NoOutput, false),
            Err(EngineError::Timeout(after)) => {
                log_info!(self.logger, "{}: request timed out after {:?}", self.name, after);
                (Reply::Timeout, true)
            }
            Err(e) => {
                let killed = self
                    .activity
                    .get(self.id)
                    .map_or(false, |a| a.killed_by_watchdog);
                if killed {
                    log_info!(self.logger, "{}: engine was killed by the watchdog", self.name);
                    (Reply::Timeout, true)
                } else {
                    log_warn!(self.logger, "{}: engine failed mid-request: {}", self.name, e);
                    (Reply::EngineExited, true)
                }
            }
        };

        // The client hears back before the engine is replaced; whatever the
        // old engine still prints dies with it.
        job.reply.send(reply);
        self.activity.record_completed(self.id);

        if restart {
            self.restart();
        }
    }

    /// Write one request and assemble its reply.
    ///
    /// A request holding several statements is complete after the last of
    /// their prompts; one without a terminator still waits for a prompt and
    /// so runs into the deadline. `Ok(None)` means the engine became ready
    /// without a result.
    fn exchange(&mut self, request: &str) -> Result<Option<String>, EngineError> {
        self.assembler.reset();
        let process = self.process.as_mut().ok_or(EngineError::Exited)?;
        process.write(request)?;
        self.read_reply(count_statements(request).max(1))
    }

    /// Feed engine output into the assembler until `prompts` ready prompts
    /// have arrived or the per-request timeout elapses. Every read is
    /// bounded, so the deadline holds against an engine that never stops
    /// printing.
    fn read_reply(&mut self, prompts: usize) -> Result<Option<String>, EngineError> {
        let timeout = self.config.timeout;
        let deadline = Instant::now() + timeout;
        let process = self.process.as_mut().ok_or(EngineError::Exited)?;

        loop {
            let now = Instant::now();
            if now >= deadline {
                self.assembler.reset();
                return Err(EngineError::Timeout(timeout));
            }

            let wait = self.config.poll_interval.min(deadline - now);
            let chunk = match process.read_available(wait) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.assembler.reset();
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                continue;
            }

            self.assembler.feed(&chunk);
            if self.assembler.prompts() >= prompts {
                return Ok(self.assembler.finish());
            }
        }
    }

    /// Replace the engine. Retries spawning with backoff until it succeeds
    /// or the stop flag is set.
    fn restart(&mut self) {
        self.activity.set_state(self.id, WorkerState::Restarting);
        let mut backoff = self.config.poll_interval;

        loop {
            self.activity.record_restart(self.id);
            if let Some(mut old) = self.process.take() {
                let pid = old.pid();
                old.kill();
                log_info!(self.logger, "{}: killed engine pid {}", self.name, pid);
            }
            self.activity.set_pid(self.id, None);
            self.assembler.reset();

            match EngineProcess::spawn(&self.config.engine) {
                Ok(process) => {
                    log_info!(self.logger, "{}: started new engine pid {}", self.name, process.pid());
                    self.activity.set_pid(self.id, Some(process.pid()));
                    self.process = Some(process);

                    self.activity.set_state(self.id, WorkerState::Starting);
                    match self.handshake() {
                        Ok(()) => return,
                        Err(e) => {
                            log_warn!(self.logger, "{}: new engine failed handshake: {}", self.name, e);
                            self.activity.set_state(self.id, WorkerState::Restarting);
                        }
                    }
                }
                Err(e) => log_error!(self.logger, "{}: {}", self.name, e),
            }

            if !self.pause(backoff) {
                return;
            }
            backoff = (backoff * 2).min(MAX_SPAWN_BACKOFF);
        }
    }

    /// Sleep for `duration` in poll-sized slices. Returns false if the stop
    /// flag was raised meanwhile.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    fn stop_engine(&mut self) {
        if let Some(mut process) = self.process.take() {
            let pid = process.pid();
            match process.terminate(TERMINATE_GRACE) {
                Some(status) => log_debug!(self.logger, "{}: engine pid {} exited: {}", self.name, pid, status),
                None => log_warn!(self.logger, "{}: could not reap engine pid {}", self.name, pid),
            }
        }
        self.activity.set_pid(self.id, None);
    }
}
