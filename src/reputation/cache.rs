//! In-memory reputation cache with hot-key protection.

use super::maintenance::{spawn_worker, MaintenanceJob, MaintenanceKind, MaintenanceReport};
use super::store::{NoopReputationStore, ReputationStore};
use super::{Clock, PatternKey, PatternReputation, PatternType, ReputationState, SystemClock};
use crate::config::ReputationConfig;
use crate::error::ReputationError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    reputation: PatternReputation,
    access_count: u64,
    last_access: DateTime<Utc>,
    hot_until: Option<DateTime<Utc>>,
    /// Time the last decay was applied
    decayed_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(reputation: PatternReputation, now: DateTime<Utc>) -> Self {
        Self {
            reputation,
            access_count: 0,
            last_access: now,
            hot_until: None,
            decayed_at: now,
        }
    }

    fn is_hot(&self, now: DateTime<Utc>) -> bool {
        self.hot_until.is_some_and(|until| until > now)
    }

    fn decay_origin(&self) -> DateTime<Utc> {
        self.reputation.last_seen.max(self.decayed_at)
    }
}

/// Cache bookkeeping for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    pub hot_until: Option<DateTime<Utc>>,
}

/// A lifecycle change of one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub pattern_id: String,
    pub from: ReputationState,
    pub to: ReputationState,
}

pub(crate) struct CacheInner {
    entries: DashMap<String, CacheEntry>,
    config: ReputationConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ReputationStore>,
    hot_promotions: AtomicU64,
    state_changes: AtomicU64,
}

/// Concurrent map of pattern reputations.
///
/// Lookups and updates hit the map directly. Sweeps run on a background
/// worker, so the cache must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct ReputationCache {
    inner: Arc<CacheInner>,
    jobs: mpsc::Sender<MaintenanceJob>,
}

impl std::fmt::Debug for ReputationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationCache")
            .field("entries", &self.inner.entries.len())
            .field("max_entries", &self.inner.config.max_entries)
            .finish()
    }
}

impl ReputationCache {
    pub fn new(config: ReputationConfig) -> Self {
        Self::with_collaborators(config, Arc::new(SystemClock), Arc::new(NoopReputationStore))
    }

    pub fn with_collaborators(
        config: ReputationConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn ReputationStore>,
    ) -> Self {
        let capacity = config.queue_capacity;
        let inner = Arc::new(CacheInner {
            entries: DashMap::new(),
            config,
            clock,
            store,
            hot_promotions: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
        });
        let jobs = spawn_worker(Arc::clone(&inner), capacity);
        Self { inner, jobs }
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Look up a pattern, counting the access.
    pub fn get(&self, pattern_id: &str) -> Option<PatternReputation> {
        let now = self.inner.clock.now();
        let mut entry = self.inner.entries.get_mut(pattern_id)?;
        self.inner.touch(pattern_id, &mut entry, now);
        Some(entry.reputation.clone())
    }

    /// Look up a pattern, inserting a neutral entry when absent.
    pub fn get_or_create(
        &self,
        pattern_id: &str,
        pattern_type: PatternType,
        pattern: &str,
    ) -> PatternReputation {
        let now = self.inner.clock.now();
        let reputation = {
            let mut entry = self
                .inner
                .entries
                .entry(pattern_id.to_string())
                .or_insert_with(|| {
                    CacheEntry::new(
                        PatternReputation::neutral(pattern_id, pattern_type, pattern, now),
                        now,
                    )
                });
            self.inner.touch(pattern_id, &mut entry, now);
            entry.reputation.clone()
        };
        self.schedule_eviction_if_full();
        reputation
    }

    /// Replace a stored reputation. Returns the lifecycle change, if any.
    ///
    /// The written value is taken as current: decay restarts from now.
    pub fn update(&self, reputation: PatternReputation) -> Option<StateChange> {
        let now = self.inner.clock.now();
        let id = reputation.pattern_id.clone();
        let previous = match self.inner.entries.get_mut(&id) {
            Some(mut entry) => {
                let previous = entry.reputation.state;
                entry.reputation = reputation.clone();
                entry.decayed_at = now;
                Some(previous)
            }
            None => {
                self.inner
                    .entries
                    .insert(id.clone(), CacheEntry::new(reputation.clone(), now));
                None
            }
        };
        self.schedule_eviction_if_full();

        let change = previous
            .filter(|prev| *prev != reputation.state)
            .map(|from| StateChange {
                pattern_id: id,
                from,
                to: reputation.state,
            });
        if let Some(change) = &change {
            self.inner.emit_state_change(change, reputation.bot_score);
        }
        change
    }

    /// Fold a classification outcome into a pattern's reputation.
    pub fn record_observation(&self, key: &PatternKey, bot_probability: f64) -> PatternReputation {
        let now = self.inner.clock.now();
        let config = &self.inner.config;
        let (updated, change) = {
            let mut entry = self
                .inner
                .entries
                .entry(key.id.clone())
                .or_insert_with(|| {
                    CacheEntry::new(
                        PatternReputation::neutral(&key.id, key.pattern_type, &key.pattern, now),
                        now,
                    )
                });
            let before = entry.reputation.state;
            let updated = entry
                .reputation
                .decayed(entry.decay_origin(), config, now)
                .observe(bot_probability, config, now);
            entry.decayed_at = now;
            entry.reputation = updated.clone();
            let change = (before != updated.state).then(|| StateChange {
                pattern_id: key.id.clone(),
                from: before,
                to: updated.state,
            });
            (updated, change)
        };
        if let Some(change) = &change {
            self.inner.emit_state_change(change, updated.bot_score);
        }
        self.schedule_eviction_if_full();
        updated
    }

    /// Pin a pattern as blocked.
    pub fn block_pattern(&self, key: &PatternKey) -> Option<StateChange> {
        self.pin(key, ReputationState::ManuallyBlocked)
    }

    /// Pin a pattern as allowed.
    pub fn allow_pattern(&self, key: &PatternKey) -> Option<StateChange> {
        self.pin(key, ReputationState::ManuallyAllowed)
    }

    fn pin(&self, key: &PatternKey, state: ReputationState) -> Option<StateChange> {
        let now = self.inner.clock.now();
        let current = self
            .inner
            .entries
            .get(&key.id)
            .map(|e| e.reputation.clone())
            .unwrap_or_else(|| {
                PatternReputation::neutral(&key.id, key.pattern_type, &key.pattern, now)
            });
        self.update(current.manual(state, now))
    }

    pub fn stats(&self, pattern_id: &str) -> Option<EntryStats> {
        self.inner.entries.get(pattern_id).map(|e| EntryStats {
            access_count: e.access_count,
            last_access: e.last_access,
            hot_until: e.hot_until,
        })
    }

    pub fn is_hot(&self, pattern_id: &str) -> bool {
        let now = self.inner.clock.now();
        self.inner
            .entries
            .get(pattern_id)
            .is_some_and(|e| e.is_hot(now))
    }

    /// Lifecycle changes emitted since creation.
    pub fn state_change_count(&self) -> u64 {
        self.inner.state_changes.load(Ordering::Relaxed)
    }

    /// Pull every non-manual entry toward neutral.
    pub async fn decay_sweep(&self) -> Result<MaintenanceReport, ReputationError> {
        self.run_job(MaintenanceKind::Decay).await
    }

    /// Remove stale, cold, unpinned entries.
    pub async fn garbage_collect(&self) -> Result<MaintenanceReport, ReputationError> {
        self.run_job(MaintenanceKind::GarbageCollect).await
    }

    /// Remove the coldest eligible entries until the cache fits `max_entries`.
    pub async fn evict_cold(&self) -> Result<MaintenanceReport, ReputationError> {
        self.run_job(MaintenanceKind::EvictCold).await
    }

    async fn run_job(&self, kind: MaintenanceKind) -> Result<MaintenanceReport, ReputationError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(MaintenanceJob {
                kind,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ReputationError::WorkerClosed)?;
        rx.await.map_err(|_| ReputationError::WorkerClosed)
    }

    fn schedule_eviction_if_full(&self) {
        if self.inner.entries.len() <= self.inner.config.max_entries {
            return;
        }
        let job = MaintenanceJob {
            kind: MaintenanceKind::EvictCold,
            reply: None,
        };
        if self.jobs.try_send(job).is_err() {
            debug!("Maintenance queue busy, eviction deferred");
        }
    }

    /// Write every entry to the backing store. Failures are logged.
    pub async fn persist(&self) -> Result<usize, ReputationError> {
        let snapshot: Vec<PatternReputation> = self
            .inner
            .entries
            .iter()
            .map(|e| e.reputation.clone())
            .collect();
        match self.inner.store.save(&snapshot).await {
            Ok(saved) => {
                debug!(saved, "Persisted reputations");
                Ok(saved)
            }
            Err(e) => {
                warn!(error = %e, entries = snapshot.len(), "Reputation persistence failed");
                Err(e)
            }
        }
    }

    /// Merge reputations from the backing store. Failures are logged.
    pub async fn load(&self) -> Result<usize, ReputationError> {
        let loaded = match self.inner.store.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Reputation load failed, starting empty");
                return Err(e);
            }
        };
        let now = self.inner.clock.now();
        let count = loaded.len();
        for reputation in loaded {
            self.inner
                .entries
                .insert(reputation.pattern_id.clone(), CacheEntry::new(reputation, now));
        }
        info!(count, "Loaded reputations");
        Ok(count)
    }

    /// Enqueue decay then GC every `maintenance_interval_secs`.
    ///
    /// The loop ends once the cache and its worker are gone.
    pub fn start_periodic_maintenance(&self) -> JoinHandle<()> {
        let period = Duration::from_secs(self.inner.config.maintenance_interval_secs.max(1));
        let jobs = self.jobs.downgrade();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sender) = jobs.upgrade() else {
                    break;
                };
                for kind in [MaintenanceKind::Decay, MaintenanceKind::GarbageCollect] {
                    if sender.send(MaintenanceJob { kind, reply: None }).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}

impl CacheInner {
    fn touch(&self, pattern_id: &str, entry: &mut CacheEntry, now: DateTime<Utc>) {
        entry.access_count = entry.access_count.saturating_add(1);
        entry.last_access = now;

        let threshold = self.config.hot_access_threshold;
        if threshold == 0 || entry.access_count < threshold {
            return;
        }
        let was_hot = entry.is_hot(now);
        entry.hot_until = Some(now + secs(self.config.hot_window_secs));
        if !was_hot {
            let promoted = self.hot_promotions.fetch_add(1, Ordering::Relaxed);
            if promoted % self.config.hot_sample_rate.max(1) == 0 {
                debug!(
                    pattern_id = %pattern_id,
                    access_count = entry.access_count,
                    promotions = promoted + 1,
                    "Hot reputation key"
                );
            }
        }
    }

    fn emit_state_change(&self, change: &StateChange, score: f64) {
        self.state_changes.fetch_add(1, Ordering::Relaxed);
        info!(
            pattern_id = %change.pattern_id,
            from = %change.from,
            to = %change.to,
            score,
            "Reputation state changed"
        );
    }

    pub(crate) fn run_decay(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let mut report = MaintenanceReport::new(MaintenanceKind::Decay);
        let mut changes = Vec::new();

        for mut entry in self.entries.iter_mut() {
            report.examined += 1;
            if entry.reputation.is_manual {
                continue;
            }
            let before = entry.reputation.state;
            let decayed = entry.reputation.decayed(entry.decay_origin(), &self.config, now);
            entry.decayed_at = now;
            if decayed.state != before {
                changes.push((
                    StateChange {
                        pattern_id: entry.key().clone(),
                        from: before,
                        to: decayed.state,
                    },
                    decayed.bot_score,
                ));
            }
            entry.reputation = decayed;
        }

        report.state_changes = changes.len();
        for (change, score) in &changes {
            self.emit_state_change(change, *score);
        }
        report
    }

    fn collectable(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let rep = &entry.reputation;
        if rep.is_manual || entry.is_hot(now) {
            return false;
        }
        let idle = now - rep.last_seen >= secs(self.config.gc_min_age_secs);
        let weak = (rep.bot_score - 0.5).abs() <= self.config.gc_neutral_band
            || rep.support < self.config.gc_min_support;
        idle && weak
    }

    pub(crate) fn run_gc(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let mut report = MaintenanceReport::new(MaintenanceKind::GarbageCollect);
        report.examined = self.entries.len();
        self.entries.retain(|_, entry| !self.collectable(entry, now));
        report.removed = report.examined.saturating_sub(self.entries.len());
        report
    }

    fn evictable(entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        !entry.is_hot(now)
            && !entry.reputation.is_manual
            && entry.reputation.state == ReputationState::Neutral
    }

    pub(crate) fn run_evict_cold(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let mut report = MaintenanceReport::new(MaintenanceKind::EvictCold);
        let overflow = self.entries.len().saturating_sub(self.config.max_entries);
        if overflow == 0 {
            return report;
        }

        let mut candidates: Vec<(u64, DateTime<Utc>, String)> = self
            .entries
            .iter()
            .filter(|e| Self::evictable(e.value(), now))
            .map(|e| (e.access_count, e.last_access, e.key().clone()))
            .collect();
        report.examined = candidates.len();
        candidates.sort();

        for (_, _, id) in candidates.into_iter().take(overflow) {
            if self
                .entries
                .remove_if(&id, |_, e| Self::evictable(e, now))
                .is_some()
            {
                report.removed += 1;
            }
        }
        if report.removed < overflow {
            debug!(
                overflow,
                removed = report.removed,
                "Cache over capacity, remaining entries are protected"
            );
        }
        report
    }
}

fn secs(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}
