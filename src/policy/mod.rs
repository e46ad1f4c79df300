//! Detection policies.
//!
//! A policy names the detectors to run per phase (fast / slow / AI), the
//! thresholds that stop or escalate the pipeline, per-detector weight
//! overrides, and an ordered list of transitions that either hand the request
//! to another policy or fix the action.

pub mod engine;
pub mod matcher;

pub use engine::{MappingOrigin, PolicyEngine};
pub use matcher::PathPattern;

use crate::evidence::{AggregatedEvidence, RiskBand};
use crate::reputation::{ReputationState, REPUTATION_STATE_SIGNAL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Action recommended for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Block,
    Challenge,
    Throttle,
    LogOnly,
    EscalateToSlowPath,
    EscalateToAi,
    Continue,
}

impl PolicyAction {
    /// Terminal actions end policy evaluation.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            PolicyAction::EscalateToSlowPath | PolicyAction::EscalateToAi | PolicyAction::Continue
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Block => "block",
            PolicyAction::Challenge => "challenge",
            PolicyAction::Throttle => "throttle",
            PolicyAction::LogOnly => "log_only",
            PolicyAction::EscalateToSlowPath => "escalate_to_slow_path",
            PolicyAction::EscalateToAi => "escalate_to_ai",
            PolicyAction::Continue => "continue",
        }
    }
}

/// Condition under which a transition fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionGuard {
    /// Bot probability strictly above the threshold.
    RiskAbove { threshold: f64 },
    /// Bot probability strictly below the threshold.
    RiskBelow { threshold: f64 },
    SignalPresent { key: String },
    SignalEquals { key: String, value: Value },
    /// The reputation detector reported this lifecycle state.
    ReputationState { state: ReputationState },
}

impl TransitionGuard {
    pub fn is_satisfied(&self, evidence: &AggregatedEvidence) -> bool {
        match self {
            Self::RiskAbove { threshold } => evidence.bot_probability > *threshold,
            Self::RiskBelow { threshold } => evidence.bot_probability < *threshold,
            Self::SignalPresent { key } => evidence.signals.contains_key(key),
            Self::SignalEquals { key, value } => evidence.signals.get(key) == Some(value),
            Self::ReputationState { state } => {
                evidence.signals.get(REPUTATION_STATE_SIGNAL).and_then(Value::as_str)
                    == Some(state.as_str())
            }
        }
    }
}

/// What a fired transition produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTarget {
    /// Hand the request to another named policy.
    Policy(String),
    /// Fix the action directly.
    Action(PolicyAction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTransition {
    pub when: TransitionGuard,
    pub then: TransitionTarget,
}

impl PolicyTransition {
    pub fn to_policy(when: TransitionGuard, policy: impl Into<String>) -> Self {
        Self {
            when,
            then: TransitionTarget::Policy(policy.into()),
        }
    }

    pub fn to_action(when: TransitionGuard, action: PolicyAction) -> Self {
        Self {
            when,
            then: TransitionTarget::Action(action),
        }
    }
}

/// Phases unlocked beyond the fast path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Escalation {
    pub slow_path: bool,
    pub ai: bool,
}

/// Named detection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionPolicy {
    pub name: String,
    pub description: String,

    /// Detectors run first
    pub fast_path: Vec<String>,
    /// Detectors run when the slow path is enabled or escalated to
    pub slow_path: Vec<String>,
    /// Detectors run only on AI escalation
    pub ai_path: Vec<String>,

    pub use_fast_path: bool,
    pub force_slow_path: bool,
    /// Run every selected detector in wave 0 regardless of trigger conditions
    pub bypass_trigger_conditions: bool,

    /// Confidence at which the pipeline stops early
    pub early_exit_threshold: f64,
    /// Probability at which the request is blocked outright
    pub immediate_block_threshold: f64,
    /// Probability at which AI-path detectors are brought in
    pub ai_escalation_threshold: f64,

    /// Multipliers applied to the weight of a detector's contributions
    pub weight_overrides: BTreeMap<String, f64>,
    pub transitions: Vec<PolicyTransition>,

    /// Pipeline timeout in milliseconds
    pub timeout_ms: u64,
    pub enabled: bool,

    /// Action used when no transition fires, replacing the risk-band mapping
    pub default_action: Option<PolicyAction>,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: String::new(),
            fast_path: vec![],
            slow_path: vec![],
            ai_path: vec![],
            use_fast_path: true,
            force_slow_path: false,
            bypass_trigger_conditions: false,
            early_exit_threshold: 0.85,
            immediate_block_threshold: 0.95,
            ai_escalation_threshold: 0.6,
            weight_overrides: BTreeMap::new(),
            transitions: vec![],
            timeout_ms: 500,
            enabled: true,
            default_action: None,
        }
    }
}

impl DetectionPolicy {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Weight multiplier for a detector (1.0 when not overridden).
    pub fn weight_for(&self, detector: &str) -> f64 {
        self.weight_overrides
            .get(detector)
            .copied()
            .filter(|w| w.is_finite() && *w >= 0.0)
            .unwrap_or(1.0)
    }

    pub fn has_ai_path(&self) -> bool {
        !self.ai_path.is_empty()
    }

    /// Detector names selected for the given escalation, or `None` for every
    /// registered detector when the policy names none.
    pub fn detector_names(&self, escalation: Escalation) -> Option<Vec<String>> {
        if self.fast_path.is_empty() && self.slow_path.is_empty() && self.ai_path.is_empty() {
            return None;
        }

        let mut names: Vec<String> = Vec::new();
        let mut push_all = |list: &[String]| {
            for name in list {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        };

        push_all(&self.fast_path[..]);
        if !self.use_fast_path || self.force_slow_path || escalation.slow_path {
            push_all(&self.slow_path[..]);
        }
        if escalation.ai {
            push_all(&self.ai_path[..]);
        }
        Some(names)
    }

    /// Names of policies this policy can hand off to.
    pub fn transition_targets(&self) -> impl Iterator<Item = &str> {
        self.transitions.iter().filter_map(|t| match &t.then {
            TransitionTarget::Policy(name) => Some(name.as_str()),
            TransitionTarget::Action(_) => None,
        })
    }

    /// First transition whose guard holds, in declared order.
    pub fn first_transition(&self, evidence: &AggregatedEvidence) -> Option<&TransitionTarget> {
        self.transitions
            .iter()
            .find(|t| t.when.is_satisfied(evidence))
            .map(|t| &t.then)
    }

    /// Action in force when no transition fires.
    pub fn default_action_for(&self, evidence: &AggregatedEvidence) -> PolicyAction {
        if let Some(verdict) = evidence.early_exit_verdict {
            return if verdict.is_good() {
                PolicyAction::Allow
            } else {
                PolicyAction::Block
            };
        }
        if evidence.bot_probability >= self.immediate_block_threshold {
            return PolicyAction::Block;
        }
        if let Some(action) = self.default_action {
            return action;
        }
        match evidence.risk_band {
            RiskBand::VeryHigh => PolicyAction::Challenge,
            RiskBand::High => PolicyAction::Throttle,
            RiskBand::Medium => PolicyAction::LogOnly,
            RiskBand::Low | RiskBand::VeryLow | RiskBand::Verified => PolicyAction::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::EvidenceAggregator;
    use crate::evidence::{Contribution, EarlyExitVerdict};

    fn evidence_with(delta: f64, weight: f64) -> AggregatedEvidence {
        let agg = EvidenceAggregator::new();
        agg.add_contribution(
            Contribution::new("ua", "user_agent", delta, weight, "test")
                .with_signal(REPUTATION_STATE_SIGNAL, "confirmed_bad"),
        );
        agg.aggregate()
    }

    #[test]
    fn test_detector_selection_by_phase() {
        let policy = DetectionPolicy {
            fast_path: vec!["ua".into(), "headers".into()],
            slow_path: vec!["behavioral".into(), "ua".into()],
            ai_path: vec!["llm".into()],
            ..DetectionPolicy::named("p")
        };

        assert_eq!(
            policy.detector_names(Escalation::default()),
            Some(vec!["ua".to_string(), "headers".to_string()])
        );
        assert_eq!(
            policy.detector_names(Escalation { slow_path: true, ai: false }),
            Some(vec!["ua".into(), "headers".into(), "behavioral".into()])
        );
        assert_eq!(
            policy.detector_names(Escalation { slow_path: false, ai: true }),
            Some(vec!["ua".into(), "headers".into(), "llm".into()])
        );

        let slow_always = DetectionPolicy {
            force_slow_path: true,
            ..policy.clone()
        };
        assert!(slow_always
            .detector_names(Escalation::default())
            .unwrap()
            .contains(&"behavioral".to_string()));

        assert_eq!(DetectionPolicy::named("all").detector_names(Escalation::default()), None);
    }

    #[test]
    fn test_weight_for_ignores_invalid_overrides() {
        let mut policy = DetectionPolicy::named("p");
        policy.weight_overrides.insert("ua".into(), 2.0);
        policy.weight_overrides.insert("bad".into(), -1.0);

        assert_eq!(policy.weight_for("ua"), 2.0);
        assert_eq!(policy.weight_for("bad"), 1.0);
        assert_eq!(policy.weight_for("other"), 1.0);
    }

    #[test]
    fn test_transitions_first_match_wins() {
        let policy = DetectionPolicy {
            transitions: vec![
                PolicyTransition::to_action(
                    TransitionGuard::RiskBelow { threshold: 0.1 },
                    PolicyAction::Allow,
                ),
                PolicyTransition::to_policy(
                    TransitionGuard::RiskAbove { threshold: 0.6 },
                    "strict",
                ),
                PolicyTransition::to_action(
                    TransitionGuard::RiskAbove { threshold: 0.5 },
                    PolicyAction::Block,
                ),
            ],
            ..DetectionPolicy::named("p")
        };

        let high = evidence_with(0.9, 5.0);
        assert_eq!(
            policy.first_transition(&high),
            Some(&TransitionTarget::Policy("strict".into()))
        );

        let neutral = evidence_with(-0.1, 5.0);
        assert_eq!(policy.first_transition(&neutral), None);
    }

    #[test]
    fn test_reputation_guard() {
        let guard = TransitionGuard::ReputationState {
            state: ReputationState::ConfirmedBad,
        };
        assert!(guard.is_satisfied(&evidence_with(0.0, 1.0)));

        let other = TransitionGuard::ReputationState {
            state: ReputationState::Suspect,
        };
        assert!(!other.is_satisfied(&evidence_with(0.0, 1.0)));
    }

    #[test]
    fn test_default_action_mapping() {
        let policy = DetectionPolicy::named("p");

        assert_eq!(policy.default_action_for(&evidence_with(1.0, 5.0)), PolicyAction::Block);
        assert_eq!(policy.default_action_for(&evidence_with(0.7, 5.0)), PolicyAction::Challenge);
        assert_eq!(policy.default_action_for(&evidence_with(0.3, 5.0)), PolicyAction::Throttle);
        assert_eq!(policy.default_action_for(&evidence_with(-0.8, 5.0)), PolicyAction::Allow);
        // Thin evidence is Medium
        assert_eq!(policy.default_action_for(&evidence_with(0.3, 0.5)), PolicyAction::LogOnly);

        let agg = EvidenceAggregator::new();
        agg.add_contribution(Contribution::verdict(
            "known_bots",
            "verified_bot",
            EarlyExitVerdict::VerifiedGoodBot,
            "Googlebot",
        ));
        assert_eq!(policy.default_action_for(&agg.aggregate()), PolicyAction::Allow);

        let explicit = DetectionPolicy {
            default_action: Some(PolicyAction::LogOnly),
            ..DetectionPolicy::named("quiet")
        };
        assert_eq!(explicit.default_action_for(&evidence_with(0.7, 5.0)), PolicyAction::LogOnly);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: DetectionPolicy = serde_json::from_str(
            r#"{
                "name": "checkout",
                "fast_path": ["user_agent"],
                "transitions": [
                    {"when": {"type": "risk_above", "threshold": 0.7}, "then": {"policy": "strict"}},
                    {"when": {"type": "signal_present", "key": "headers.automation"}, "then": {"action": "block"}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(policy.name, "checkout");
        assert!(policy.enabled);
        assert_eq!(policy.timeout(), Duration::from_millis(500));
        assert_eq!(policy.transition_targets().collect::<Vec<_>>(), vec!["strict"]);
        assert_eq!(
            policy.transitions[1].then,
            TransitionTarget::Action(PolicyAction::Block)
        );
    }
}
