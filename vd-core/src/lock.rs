//! Named exclusive locks
//!
//! Serializes "energize an output, then measure" sequences between inputs
//! that share an output. Waiters are woken through [`Notify`] when a lock is
//! released. A wait that times out forcibly clears the lock, so a holder that
//! never released cannot block every later measurement cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct LockInner {
    /// Lock name -> token of the current holder
    held: Mutex<HashMap<String, u64>>,
    next_token: AtomicU64,
    released: Notify,
}

/// Process-wide lock namespace
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    inner: Arc<LockInner>,
}

/// Held lock; releasing happens on drop
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    manager: LockManager,
    name: String,
    token: u64,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release_token(&self.name, self.token);
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, name: &str) -> Option<LockGuard> {
        let mut held = self.inner.held.lock();
        if held.contains_key(name) {
            return None;
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        held.insert(name.to_string(), token);
        Some(LockGuard {
            manager: self.clone(),
            name: name.to_string(),
            token,
        })
    }

    /// Acquire `name`, waiting at most `timeout`
    ///
    /// Returns `None` on timeout; the lock is then cleared so the next
    /// acquire succeeds immediately.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Option<LockGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if let Some(guard) = self.try_take(name) {
                debug!("LOCK: Acquired {}", name);
                return Some(guard);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("LOCK: Timed out after {:?} waiting for {}, clearing it", timeout, name);
                self.release(name);
                return None;
            }
        }
    }

    /// Forcibly release `name` regardless of who holds it
    pub fn release(&self, name: &str) {
        if self.inner.held.lock().remove(name).is_some() {
            debug!("LOCK: Released {}", name);
        }
        self.inner.released.notify_waiters();
    }

    fn release_token(&self, name: &str, token: u64) {
        let mut held = self.inner.held.lock();
        // A holder whose lock was forcibly cleared must not release a newer holder
        if held.get(name) == Some(&token) {
            held.remove(name);
            drop(held);
            debug!("LOCK: Released {}", name);
            self.inner.released.notify_waiters();
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.inner.held.lock().contains_key(name)
    }
}
