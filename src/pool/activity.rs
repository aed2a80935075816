//! Per-worker activity shared between workers and the watchdog.
//!
//! Every worker reports its state transitions and current engine pid here;
//! the watchdog reads it to find workers that have been busy for too long.
//! One mutex guards the whole map, so "is this worker stuck" is always
//! evaluated against a consistent entry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawning the engine and running the init script
    Starting,
    /// Resetting the engine or waiting for a request
    Idle,
    /// Serving a request
    Busy,
    /// Replacing the engine process
    Restarting,
    /// Control loop has exited
    Stopped,
}

/// Snapshot of one worker.
#[derive(Debug, Clone)]
pub struct WorkerActivity {
    pub state: WorkerState,
    /// When `state` was entered
    pub since: Instant,
    /// Current engine pid, if an engine is running
    pub pid: Option<u32>,
    /// Requests answered by this worker
    pub completed: u64,
    /// Engine replacements performed by this worker
    pub restarts: u64,
    /// Set when the watchdog killed the engine during the current Busy state
    pub killed_by_watchdog: bool,
}

impl WorkerActivity {
    fn new() -> Self {
        Self {
            state: WorkerState::Starting,
            since: Instant::now(),
            pid: None,
            completed: 0,
            restarts: 0,
            killed_by_watchdog: false,
        }
    }
}

/// Shared map from worker id to activity.
#[derive(Debug, Clone, Default)]
pub struct ActivityMap {
    inner: Arc<Mutex<BTreeMap<usize, WorkerActivity>>>,
}

impl ActivityMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, WorkerActivity>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, id: usize, f: impl FnOnce(&mut WorkerActivity)) {
        let mut map = self.lock();
        f(map.entry(id).or_insert_with(WorkerActivity::new));
    }

    /// Add a worker in the `Starting` state.
    pub fn register(&self, id: usize) {
        self.lock().insert(id, WorkerActivity::new());
    }

    pub fn set_state(&self, id: usize, state: WorkerState) {
        self.update(id, |a| {
            a.state = state;
            a.since = Instant::now();
            a.killed_by_watchdog = false;
        });
    }

    pub fn set_pid(&self, id: usize, pid: Option<u32>) {
        self.update(id, |a| a.pid = pid);
    }

    pub fn record_completed(&self, id: usize) {
        self.update(id, |a| a.completed += 1);
    }

    pub fn record_restart(&self, id: usize) {
        self.update(id, |a| a.restarts += 1);
    }

    pub fn get(&self, id: usize) -> Option<WorkerActivity> {
        self.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<(usize, WorkerActivity)> {
        self.lock().iter().map(|(id, a)| (*id, a.clone())).collect()
    }

    /// Call `kill` for every worker busy longer than `limit` whose engine
    /// has not already been killed in this Busy state, and flag it.
    ///
    /// `kill` runs with the map locked, so the worker cannot leave `Busy`
    /// (and reap or replace its engine) while the pid is being signalled.
    /// Returns the ids that were handled.
    pub fn kill_stuck(&self, limit: Duration, mut kill: impl FnMut(usize, u32)) -> Vec<usize> {
        let now = Instant::now();
        let mut handled = Vec::new();
        let mut map = self.lock();
        for (id, activity) in map.iter_mut() {
            if activity.state != WorkerState::Busy || activity.killed_by_watchdog {
                continue;
            }
            if now.duration_since(activity.since) <= limit {
                continue;
            }
            if let Some(pid) = activity.pid {
                kill(*id, pid);
                activity.killed_by_watchdog = true;
                handled.push(*id);
            }
        }
        handled
    }
}
