//! Graceful shutdown: drain sessions, persist resumable ids, tear down.

use crate::session::SessionRegistry;
use crate::store::ResumeStore;
use std::time::Duration;
use tether_core::DetachReason;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// What a shutdown run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions that were still running when the drain began.
    pub killed: usize,
    /// The grace period elapsed with processes still running.
    pub timed_out: bool,
    /// Resumable pairs written to the store.
    pub saved: usize,
    /// Sessions removed at the end.
    pub destroyed: usize,
}

/// Drains a registry within a bounded grace period.
pub struct ShutdownCoordinator {
    registry: SessionRegistry,
    store: ResumeStore,
    grace: Duration,
    poll: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: SessionRegistry, store: ResumeStore, grace: Duration, poll: Duration) -> Self {
        Self {
            registry,
            store,
            grace,
            poll,
        }
    }

    /// Kill live processes, wait for them to exit (at most `grace`), save the
    /// resumable ids found in every resident session and destroy everything.
    pub async fn run(&self) -> ShutdownReport {
        let resident = self.registry.count().await;
        let pending = self.registry.begin_drain().await;
        info!(
            resident,
            pending = pending.len(),
            grace_ms = self.grace.as_millis() as u64,
            "draining sessions"
        );

        let deadline = Instant::now() + self.grace;
        let mut timed_out = false;
        while !self.registry.all_exited(&pending).await {
            if Instant::now() >= deadline {
                warn!("shutdown grace period elapsed with processes still running");
                timed_out = true;
                break;
            }
            tokio::time::sleep(self.poll).await;
        }

        let entries = self.registry.resumable_entries().await;
        let saved = match self.store.save(&entries).await {
            Ok(()) => entries.len(),
            Err(e) => {
                error!(path = %self.store.path().display(), error = %e, "failed to save resumable sessions");
                0
            }
        };

        let destroyed = self.registry.destroy_all_with(DetachReason::Shutdown).await;
        info!(destroyed, saved, timed_out, "shutdown complete");

        ShutdownReport {
            killed: pending.len(),
            timed_out,
            saved,
            destroyed,
        }
    }
}
