//! Evidence value types.
//!
//! A [`Contribution`] is one detector's opinion about a request. It is built
//! once by the detector and never mutated afterwards; "modified copies" such
//! as a stamped processing time are new values. [`AggregatedEvidence`] is the
//! derived result produced by the aggregator.

use crate::policy::PolicyAction;
use crate::score::BotCategory;
use crate::signals::SignalMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Category label used for failure records written by the orchestrator.
pub const FAILURE_CATEGORY: &str = "detector_failure";
/// Upper bound on a single contribution's weight.
pub const MAX_WEIGHT: f64 = 1_000_000.0;

/// Verdict attached to an early-exit contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EarlyExitVerdict {
    VerifiedGoodBot,
    VerifiedBadBot,
    Whitelisted,
    Blacklisted,
}

impl EarlyExitVerdict {
    /// True for verdicts that finalize the request as not-a-threat.
    pub fn is_good(&self) -> bool {
        matches!(self, Self::VerifiedGoodBot | Self::Whitelisted)
    }

    /// Bot probability this verdict pins the result to.
    pub fn probability(&self) -> f64 {
        if self.is_good() {
            0.0
        } else {
            1.0
        }
    }
}

/// Discretized risk derived from probability and confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskBand {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
    Verified,
}

impl RiskBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::VeryLow => "very_low",
            RiskBand::Low => "low",
            RiskBand::Medium => "medium",
            RiskBand::High => "high",
            RiskBand::VeryHigh => "very_high",
            RiskBand::Verified => "verified",
        }
    }
}

/// A single detector's opinion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// Name of the detector that produced this contribution
    pub detector: String,
    /// Category label used for the score breakdown
    pub category: String,
    /// Confidence delta in [-1, 1]; positive is more bot-like
    pub confidence_delta: f64,
    /// Weight >= 0; zero marks an informational contribution
    pub weight: f64,
    /// Human readable reason
    pub reason: String,
    /// Bot type, when the detector identified one
    pub bot_type: Option<BotCategory>,
    /// Bot name, when the detector identified one (e.g. "Googlebot")
    pub bot_name: Option<String>,
    /// Signals emitted alongside this contribution
    pub signals: SignalMap,
    /// Verdict that finalizes the classification
    pub early_exit: Option<EarlyExitVerdict>,
    /// Time the detector spent producing this contribution
    pub processing_time: Duration,
}

impl Contribution {
    /// Create a contribution. The delta is clamped to [-1, 1] and the weight to
    /// [0, `MAX_WEIGHT`].
    pub fn new(
        detector: impl Into<String>,
        category: impl Into<String>,
        confidence_delta: f64,
        weight: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            detector: detector.into(),
            category: category.into(),
            confidence_delta: sanitize(confidence_delta).clamp(-1.0, 1.0),
            weight: clamp_weight(weight),
            reason: reason.into(),
            bot_type: None,
            bot_name: None,
            signals: SignalMap::new(),
            early_exit: None,
            processing_time: Duration::ZERO,
        }
    }

    /// Informational contribution (weight 0) that only carries signals.
    pub fn info(
        detector: impl Into<String>,
        category: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(detector, category, 0.0, 0.0, reason)
    }

    /// Early-exit contribution fixing the final verdict.
    pub fn verdict(
        detector: impl Into<String>,
        category: impl Into<String>,
        verdict: EarlyExitVerdict,
        reason: impl Into<String>,
    ) -> Self {
        let delta = if verdict.is_good() { -1.0 } else { 1.0 };
        Self::new(detector, category, delta, 1.0, reason).with_early_exit(verdict)
    }

    /// Failure record for a detector that errored or timed out.
    pub fn failure(detector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::info(detector, FAILURE_CATEGORY, reason)
    }

    pub fn with_bot(mut self, bot_type: BotCategory, bot_name: Option<String>) -> Self {
        self.bot_type = Some(bot_type);
        self.bot_name = bot_name;
        self
    }

    pub fn with_signal(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.signals.insert(key.into(), value.into());
        self
    }

    pub fn with_early_exit(mut self, verdict: EarlyExitVerdict) -> Self {
        self.early_exit = Some(verdict);
        self
    }

    pub fn with_processing_time(mut self, processing_time: Duration) -> Self {
        self.processing_time = processing_time;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = clamp_weight(weight);
        self
    }

    /// `delta * weight`, the contribution's signed share of the score.
    pub fn weighted_delta(&self) -> f64 {
        self.confidence_delta * self.weight
    }

    pub fn is_failure(&self) -> bool {
        self.category == FAILURE_CATEGORY
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value
    }
}

fn clamp_weight(weight: f64) -> f64 {
    sanitize(weight).clamp(0.0, MAX_WEIGHT)
}

/// Per-category score breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    /// Sum of `delta * weight`
    pub score: f64,
    /// Sum of weights
    pub total_weight: f64,
    /// Reasons from contributions in this category
    pub reasons: Vec<String>,
}

/// Combined result of all contributions received so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvidence {
    /// Every contribution in arrival order
    pub contributions: Vec<Contribution>,
    /// Bot probability in [0, 1]
    pub bot_probability: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub risk_band: RiskBand,
    pub early_exit: bool,
    pub early_exit_verdict: Option<EarlyExitVerdict>,
    pub primary_bot_type: Option<BotCategory>,
    pub primary_bot_name: Option<String>,
    /// Merged signals from every contribution
    pub signals: SignalMap,
    pub category_breakdown: BTreeMap<String, CategoryScore>,
    pub contributing_detectors: BTreeSet<String>,
    pub failed_detectors: BTreeSet<String>,
    /// Policy that produced this evidence, set by the agent
    pub policy_name: Option<String>,
    /// Action chosen for this evidence, set by the agent
    pub policy_action: Option<PolicyAction>,
    pub aggregated_at: DateTime<Utc>,
}

impl AggregatedEvidence {
    /// Reasons of every weighted contribution, in arrival order.
    pub fn reasons(&self) -> Vec<&str> {
        self.contributions
            .iter()
            .filter(|c| c.weight > 0.0)
            .map(|c| c.reason.as_str())
            .collect()
    }

    pub fn with_policy(mut self, name: impl Into<String>, action: PolicyAction) -> Self {
        self.policy_name = Some(name.into());
        self.policy_action = Some(action);
        self
    }
}
