//! Cooperative cancellation shared by every component of a run

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A one-way switch that can be flipped once and observed from any thread.
///
/// Components poll [`CancelToken::is_cancelled`] at their checkpoints: before
/// each read chunk, before each directory, before each file. Cloning yields a
/// handle to the same switch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the switch. Calling it again has no effect
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            let _guard = self.inner.lock.lock();
            self.inner.cvar.notify_all();
            tracing::debug!("cancellation requested");
        }
    }

    /// Non-blocking check
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block until the token is cancelled
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            self.inner.cvar.wait(&mut guard);
        }
    }

    /// Block for at most `timeout`. Returns true if cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if !self.is_cancelled() {
            self.inner.cvar.wait_for(&mut guard, timeout);
        }
        self.is_cancelled()
    }
}
