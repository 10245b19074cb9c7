//! Cancelable, rearmable one-shot timers.
//!
//! Each [`ScheduledTask`] owns a tokio task that sleeps and then runs its
//! callback with the timer's token. Dropping or cancelling the task aborts
//! it; handlers compare the token against the currently armed timer so a
//! firing that raced a rearm is ignored.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A pending timer. Aborted on drop.
#[derive(Debug)]
pub struct ScheduledTask {
    token: u64,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `f(token)` after `delay` unless cancelled first.
    pub fn schedule<F, Fut>(delay: Duration, f: F) -> Self
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f(token).await;
        });
        Self { token, handle }
    }

    /// Identifies this arming of the timer.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Cancel the timer.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
