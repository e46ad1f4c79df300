//! Durable storage seam for reputations.

use super::PatternReputation;
use crate::error::ReputationError;
use async_trait::async_trait;

/// Durable backing store for the reputation cache.
///
/// The cache treats every call as best-effort: errors are logged and the
/// in-memory state keeps serving.
#[async_trait]
pub trait ReputationStore: Send + Sync {
    async fn save(&self, reputations: &[PatternReputation]) -> Result<usize, ReputationError>;

    async fn load(&self) -> Result<Vec<PatternReputation>, ReputationError>;
}

/// Store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReputationStore;

#[async_trait]
impl ReputationStore for NoopReputationStore {
    async fn save(&self, _reputations: &[PatternReputation]) -> Result<usize, ReputationError> {
        Ok(0)
    }

    async fn load(&self) -> Result<Vec<PatternReputation>, ReputationError> {
        Ok(vec![])
    }
}
