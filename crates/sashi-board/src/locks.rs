//! Spin locks guarding the lease-update and queue-drain critical
//! sections.
//!
//! Both locks are non-reentrant and poll at one-second intervals.
//! Callers must never hold one while acquiring the other in reverse
//! order: the lease lock is always taken before the queue lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll interval while waiting for the lock.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A non-reentrant spin lock.
#[derive(Debug, Clone, Default)]
pub struct SpinLock {
    held: Arc<AtomicBool>,
}

/// Guard releasing the lock on drop.
#[derive(Debug)]
pub struct SpinGuard {
    held: Arc<AtomicBool>,
}

impl SpinLock {
    /// A new, unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, polling once a second until it frees.
    pub async fn acquire(&self) -> SpinGuard {
        loop {
            if self
                .held
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return SpinGuard {
                    held: Arc::clone(&self.held),
                };
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Take the lock only if it is free right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<SpinGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SpinGuard {
                held: Arc::clone(&self.held),
            })
    }
}

impl Drop for SpinGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
