//! Evidence aggregation.
//!
//! Combines detector contributions into a bot probability, a confidence and a
//! risk band. Contributions are append-only; [`EvidenceAggregator::aggregate`]
//! is a pure function of the current contribution set and may be called any
//! number of times.

use crate::evidence::{AggregatedEvidence, CategoryScore, Contribution, RiskBand};
use crate::signals::SignalMap;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Probability reported when no weighted evidence exists (lean human).
pub const NO_EVIDENCE_PROBABILITY: f64 = 0.3;
/// Below this confidence the band is pinned to `Medium`.
pub const CONSERVATIVE_CONFIDENCE: f64 = 0.3;
/// Total weight at which confidence saturates at 1.0.
pub const FULL_CONFIDENCE_WEIGHT: f64 = 5.0;

#[derive(Debug, Default)]
struct AggregatorState {
    contributions: Vec<Contribution>,
    signals: SignalMap,
    /// Index of the first early-exit contribution
    early_exit: Option<usize>,
    failed: BTreeSet<String>,
}

/// Thread-safe accumulator of contributions for one request.
#[derive(Debug, Default)]
pub struct EvidenceAggregator {
    state: Mutex<AggregatorState>,
}

impl EvidenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a contribution and merge its signals. The first early-exit
    /// contribution wins and is never replaced.
    pub fn add_contribution(&self, contribution: Contribution) {
        let mut state = self.lock();
        for (key, value) in &contribution.signals {
            state.signals.insert(key.clone(), value.clone());
        }
        if contribution.early_exit.is_some() && state.early_exit.is_none() {
            state.early_exit = Some(state.contributions.len());
        }
        state.contributions.push(contribution);
    }

    /// Mark a detector as failed for the final report.
    pub fn record_failure(&self, detector: impl Into<String>) {
        self.lock().failed.insert(detector.into());
    }

    /// Publish a signal that did not come from a contribution (system signals).
    pub fn publish_signal(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.lock().signals.insert(key.into(), value.into());
    }

    pub fn should_early_exit(&self) -> bool {
        self.lock().early_exit.is_some()
    }

    /// Snapshot of the merged signal map.
    pub fn signals(&self) -> SignalMap {
        self.lock().signals.clone()
    }

    /// Compute the aggregated evidence from the current contribution set.
    pub fn aggregate(&self) -> AggregatedEvidence {
        let state = self.lock();
        let contributions = state.contributions.clone();
        let early = state.early_exit.map(|i| &state.contributions[i]);

        let (bot_probability, confidence, risk_band) = match early.and_then(|c| c.early_exit) {
            Some(verdict) => (verdict.probability(), 1.0, RiskBand::Verified),
            None => {
                let (probability, confidence) = weighted_score(&contributions);
                (probability, confidence, risk_band(probability, confidence))
            }
        };

        let (primary_bot_type, primary_bot_name) = match early {
            Some(c) if c.bot_type.is_some() => (c.bot_type, c.bot_name.clone()),
            _ => primary_bot(&contributions),
        };

        let contributing_detectors = contributions
            .iter()
            .filter(|c| !c.is_failure())
            .map(|c| c.detector.clone())
            .collect();

        AggregatedEvidence {
            category_breakdown: category_breakdown(&contributions),
            contributions,
            bot_probability,
            confidence,
            risk_band,
            early_exit: early.is_some(),
            early_exit_verdict: early.and_then(|c| c.early_exit),
            primary_bot_type,
            primary_bot_name,
            signals: state.signals.clone(),
            contributing_detectors,
            failed_detectors: state.failed.clone(),
            policy_name: None,
            policy_action: None,
            aggregated_at: Utc::now(),
        }
    }
}

/// Weighted mean of deltas mapped from [-1, 1] onto [0, 1], plus confidence.
fn weighted_score(contributions: &[Contribution]) -> (f64, f64) {
    let (weighted_sum, total_weight) = contributions
        .iter()
        .filter(|c| c.weight > 0.0)
        .fold((0.0, 0.0), |(sum, weight), c| {
            (sum + c.weighted_delta(), weight + c.weight)
        });

    if total_weight <= 0.0 {
        return (NO_EVIDENCE_PROBABILITY, 0.0);
    }

    let ratio = weighted_sum / total_weight;
    if !ratio.is_finite() {
        return (NO_EVIDENCE_PROBABILITY, 0.0);
    }

    let normalized = ((ratio + 1.0) / 2.0).clamp(0.0, 1.0);
    let confidence = (total_weight / FULL_CONFIDENCE_WEIGHT).min(1.0);
    (normalized, confidence)
}

/// Bucket a probability, falling back to `Medium` when evidence is thin.
pub fn risk_band(probability: f64, confidence: f64) -> RiskBand {
    if confidence < CONSERVATIVE_CONFIDENCE {
        return RiskBand::Medium;
    }
    match probability {
        p if p < 0.2 => RiskBand::VeryLow,
        p if p < 0.4 => RiskBand::Low,
        p if p < 0.6 => RiskBand::Medium,
        p if p < 0.8 => RiskBand::High,
        _ => RiskBand::VeryHigh,
    }
}

/// The bot-typed contribution with the strongest positive `delta * weight`.
fn primary_bot(
    contributions: &[Contribution],
) -> (Option<crate::score::BotCategory>, Option<String>) {
    contributions
        .iter()
        .filter(|c| c.bot_type.is_some() && c.confidence_delta > 0.0)
        .fold(None::<&Contribution>, |best, c| match best {
            Some(b) if b.weighted_delta() >= c.weighted_delta() => Some(b),
            _ => Some(c),
        })
        .map(|c| (c.bot_type, c.bot_name.clone()))
        .unwrap_or((None, None))
}

fn category_breakdown(contributions: &[Contribution]) -> BTreeMap<String, CategoryScore> {
    let mut breakdown: BTreeMap<String, CategoryScore> = BTreeMap::new();
    for c in contributions {
        let entry = breakdown.entry(c.category.clone()).or_default();
        entry.score += c.weighted_delta();
        entry.total_weight += c.weight;
        entry.reasons.push(c.reason.clone());
    }
    breakdown
}
