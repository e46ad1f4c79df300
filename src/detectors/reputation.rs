//! Reputation lookup detector.
//!
//! Reads the cached reputation of the request's IP range and user agent and
//! publishes the worst lifecycle state for later waves and policy transitions.

use super::{BlackboardState, Detector};
use crate::error::DetectorError;
use crate::evidence::{Contribution, EarlyExitVerdict};
use crate::reputation::{
    pattern_keys, PatternReputation, ReputationCache, ReputationState, NEUTRAL_SCORE,
    REPUTATION_SCORE_SIGNAL, REPUTATION_STATE_SIGNAL,
};
use async_trait::async_trait;

pub const NAME: &str = "reputation";
const CATEGORY: &str = "reputation";

/// Reputation detector backed by a shared [`ReputationCache`].
pub struct ReputationDetector {
    enabled: bool,
    cache: ReputationCache,
}

impl ReputationDetector {
    pub fn new(cache: ReputationCache) -> Self {
        Self {
            enabled: true,
            cache,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn cache(&self) -> &ReputationCache {
        &self.cache
    }
}

#[async_trait]
impl Detector for ReputationDetector {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        1
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn contribute(
        &self,
        state: &BlackboardState,
    ) -> Result<Vec<Contribution>, DetectorError> {
        let known: Vec<PatternReputation> = pattern_keys(&state.request)
            .iter()
            .filter_map(|key| self.cache.get(&key.id))
            .collect();

        // Worst state wins; among equals the score furthest from neutral
        let worst = known.iter().max_by(|a, b| {
            a.state.severity().cmp(&b.state.severity()).then(
                (a.bot_score - NEUTRAL_SCORE)
                    .abs()
                    .total_cmp(&(b.bot_score - NEUTRAL_SCORE).abs()),
            )
        });

        let Some(worst) = worst else {
            return Ok(vec![Contribution::info(NAME, CATEGORY, "No reputation history")
                .with_signal(REPUTATION_STATE_SIGNAL, ReputationState::Neutral.as_str())
                .with_signal(REPUTATION_SCORE_SIGNAL, NEUTRAL_SCORE)]);
        };

        let reason = format!("Pattern {} is {}", worst.pattern_id, worst.state);
        let contribution = match worst.state {
            ReputationState::ManuallyBlocked => {
                Contribution::verdict(NAME, CATEGORY, EarlyExitVerdict::Blacklisted, reason)
            }
            ReputationState::ManuallyAllowed => {
                Contribution::verdict(NAME, CATEGORY, EarlyExitVerdict::Whitelisted, reason)
            }
            ReputationState::ConfirmedBad => Contribution::new(NAME, CATEGORY, 0.8, 2.0, reason),
            ReputationState::ConfirmedGood => Contribution::new(NAME, CATEGORY, -0.6, 1.5, reason),
            ReputationState::Suspect => {
                let delta = (worst.bot_score - NEUTRAL_SCORE) * 2.0;
                Contribution::new(NAME, CATEGORY, delta, 1.0, reason)
            }
            ReputationState::Neutral => Contribution::info(NAME, CATEGORY, reason),
        };

        Ok(vec![contribution
            .with_signal(REPUTATION_STATE_SIGNAL, worst.state.as_str())
            .with_signal(REPUTATION_SCORE_SIGNAL, worst.bot_score)])
    }
}
