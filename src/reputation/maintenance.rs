//! Single-worker maintenance queue for the reputation cache.
//!
//! Decay, garbage collection and cold eviction all mutate many entries at
//! once. They are funnelled through one bounded channel drained by one task,
//! so two sweeps never interleave. Foreground reads and writes go straight to
//! the map and are not queued.

use super::cache::CacheInner;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceKind {
    Decay,
    GarbageCollect,
    EvictCold,
}

/// Outcome of one maintenance job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub kind: MaintenanceKind,
    /// Entries looked at
    pub examined: usize,
    /// Entries whose lifecycle state changed
    pub state_changes: usize,
    /// Entries removed
    pub removed: usize,
}

impl MaintenanceReport {
    pub(crate) fn new(kind: MaintenanceKind) -> Self {
        Self {
            kind,
            examined: 0,
            state_changes: 0,
            removed: 0,
        }
    }
}

pub(crate) struct MaintenanceJob {
    pub kind: MaintenanceKind,
    /// `None` for fire-and-forget jobs
    pub reply: Option<oneshot::Sender<MaintenanceReport>>,
}

/// Spawn the worker and return the sending half of its queue.
///
/// The worker holds the cache state and exits once every sender is dropped.
pub(crate) fn spawn_worker(
    inner: Arc<CacheInner>,
    capacity: usize,
) -> mpsc::Sender<MaintenanceJob> {
    let (tx, mut rx) = mpsc::channel::<MaintenanceJob>(capacity.max(1));

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let report = match job.kind {
                MaintenanceKind::Decay => inner.run_decay(),
                MaintenanceKind::GarbageCollect => inner.run_gc(),
                MaintenanceKind::EvictCold => inner.run_evict_cold(),
            };
            debug!(
                job = ?report.kind,
                examined = report.examined,
                state_changes = report.state_changes,
                removed = report.removed,
                "Reputation maintenance finished"
            );
            if let Some(reply) = job.reply {
                let _ = reply.send(report);
            }
        }
        debug!("Reputation maintenance worker stopped");
    });

    tx
}
