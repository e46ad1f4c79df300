//! Blackboard signals and the trigger conditions evaluated against them.
//!
//! Detectors publish signals alongside their contributions. Later waves admit
//! detectors whose [`TriggerCondition`]s are satisfied by the merged map.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Merged signal map shared across waves.
pub type SignalMap = BTreeMap<String, Value>;

/// Wave counter published after every wave.
pub const SYSTEM_WAVE: &str = "system.wave";
/// Number of detectors that completed successfully so far.
pub const SYSTEM_COMPLETED_DETECTORS: &str = "system.completed_detectors";
/// Current aggregated bot probability.
pub const SYSTEM_RISK: &str = "system.risk";

/// Predicate over the signal map gating whether a detector may run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// The signal has been emitted with any value.
    SignalExists { key: String },
    /// The signal has been emitted with exactly this value.
    SignalEquals { key: String, value: Value },
    /// The signal is numeric and strictly greater than the threshold.
    SignalAbove { key: String, threshold: f64 },
    /// The published aggregate risk is strictly greater than the threshold.
    RiskAbove { threshold: f64 },
    /// At least one inner condition holds.
    AnyOf { conditions: Vec<TriggerCondition> },
    /// Every inner condition holds.
    AllOf { conditions: Vec<TriggerCondition> },
    /// The inner condition does not hold.
    Not { condition: Box<TriggerCondition> },
}

impl TriggerCondition {
    pub fn exists(key: impl Into<String>) -> Self {
        Self::SignalExists { key: key.into() }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::SignalEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn above(key: impl Into<String>, threshold: f64) -> Self {
        Self::SignalAbove {
            key: key.into(),
            threshold,
        }
    }

    pub fn risk_above(threshold: f64) -> Self {
        Self::RiskAbove { threshold }
    }

    pub fn any_of(conditions: Vec<TriggerCondition>) -> Self {
        Self::AnyOf { conditions }
    }

    pub fn all_of(conditions: Vec<TriggerCondition>) -> Self {
        Self::AllOf { conditions }
    }

    pub fn negate(condition: TriggerCondition) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluate the condition against the current signal map.
    pub fn is_satisfied(&self, signals: &SignalMap) -> bool {
        match self {
            Self::SignalExists { key } => signals.contains_key(key),
            Self::SignalEquals { key, value } => signals.get(key) == Some(value),
            Self::SignalAbove { key, threshold } => signals
                .get(key)
                .and_then(Value::as_f64)
                .is_some_and(|v| v > *threshold),
            Self::RiskAbove { threshold } => signals
                .get(SYSTEM_RISK)
                .and_then(Value::as_f64)
                .is_some_and(|v| v > *threshold),
            // An empty AnyOf never holds, an empty AllOf always does.
            Self::AnyOf { conditions } => conditions.iter().any(|c| c.is_satisfied(signals)),
            Self::AllOf { conditions } => conditions.iter().all(|c| c.is_satisfied(signals)),
            Self::Not { condition } => !condition.is_satisfied(signals),
        }
    }

    /// Signal keys referenced anywhere in this condition.
    pub fn referenced_keys(&self) -> Vec<&str> {
        match self {
            Self::SignalExists { key }
            | Self::SignalEquals { key, .. }
            | Self::SignalAbove { key, .. } => vec![key.as_str()],
            Self::RiskAbove { .. } => vec![SYSTEM_RISK],
            Self::AnyOf { conditions } | Self::AllOf { conditions } => {
                conditions.iter().flat_map(|c| c.referenced_keys()).collect()
            }
            Self::Not { condition } => condition.referenced_keys(),
        }
    }
}

/// True when every condition holds. An empty slice always holds.
pub fn all_satisfied(conditions: &[TriggerCondition], signals: &SignalMap) -> bool {
    conditions.iter().all(|c| c.is_satisfied(signals))
}
