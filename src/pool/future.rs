//! Single-assignment handoff between a submitting caller and a worker.
//!
//! [`RequestFuture::pair`] creates the reading half, kept by the caller,
//! and a [`ReplySender`], which travels through the queue with the request.
//! `ReplySender::send` consumes the sender, so a reply can be written at
//! most once. A sender dropped without sending resolves the future to
//! [`Reply::ShutDown`], so a caller never waits on a request nobody will
//! serve.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Reply;

struct Slot {
    reply: Mutex<Option<Reply>>,
    ready: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Option<Reply>> {
        self.reply.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the reply unless one is already there, then wake waiters.
    fn fill(&self, reply: Reply) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reply);
        drop(slot);
        self.ready.notify_all();
        true
    }
}

/// Caller-side handle to a pending reply.
#[derive(Clone)]
pub struct RequestFuture {
    slot: Arc<Slot>,
}

/// Worker-side handle; writes the reply exactly once.
pub struct ReplySender {
    slot: Option<Arc<Slot>>,
}

impl RequestFuture {
    /// Create a linked future and sender.
    pub fn pair() -> (RequestFuture, ReplySender) {
        let slot = Arc::new(Slot {
            reply: Mutex::new(None),
            ready: Condvar::new(),
        });
        (
            RequestFuture { slot: slot.clone() },
            ReplySender { slot: Some(slot) },
        )
    }

    /// A future that is already resolved.
    pub fn resolved(reply: Reply) -> RequestFuture {
        let (future, sender) = Self::pair();
        sender.send(reply);
        future
    }

    pub fn is_ready(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// The reply, if one has been written.
    pub fn try_get(&self) -> Option<Reply> {
        self.slot.lock().clone()
    }

    /// Block until the reply is written.
    pub fn wait(&self) -> Reply {
        let mut slot = self.slot.lock();
        loop {
            if let Some(reply) = slot.as_ref() {
                return reply.clone();
            }
            slot = self
                .slot
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the reply is written or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Reply> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(reply) = slot.as_ref() {
                return Some(reply.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .slot
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl ReplySender {
    /// Write the reply and mark the future ready.
    pub fn send(mut self, reply: Reply) {
        if let Some(slot) = self.slot.take() {
            slot.fill(reply);
        }
    }
}

impl Drop for ReplySender {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Reply::ShutDown);
        }
    }
}
