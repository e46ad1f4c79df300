//! Policy registry and path-based resolution.

use super::matcher::PathPattern;
use super::{
    DetectionPolicy, PolicyAction, PolicyTransition, TransitionGuard, TransitionTarget,
};
use crate::config::PolicyConfig;
use crate::error::PolicyError;
use crate::evidence::AggregatedEvidence;
use crate::reputation::ReputationState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A path pattern mapped to a policy name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub pattern: String,
    pub policy: String,
}

impl PathMapping {
    pub fn new(pattern: impl Into<String>, policy: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            policy: policy.into(),
        }
    }
}

/// Where a mapping came from. User mappings always outrank built-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MappingOrigin {
    User,
    BuiltIn,
}

#[derive(Debug, Clone)]
struct CompiledMapping {
    raw: String,
    pattern: PathPattern,
    policy: String,
    origin: MappingOrigin,
}

/// Registry of named policies with ordered path mappings.
#[derive(Debug)]
pub struct PolicyEngine {
    policies: HashMap<String, Arc<DetectionPolicy>>,
    mappings: Vec<CompiledMapping>,
    default: Arc<DetectionPolicy>,
}

impl PolicyEngine {
    /// Build the engine from configuration, layering user policies and mappings
    /// over the built-ins. Every referenced policy must exist.
    pub fn new(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let mut policies: HashMap<String, Arc<DetectionPolicy>> = builtin_policies()
            .into_iter()
            .map(|p| (p.name.clone(), Arc::new(p)))
            .collect();
        for policy in &config.policies {
            policies.insert(policy.name.clone(), Arc::new(policy.clone()));
        }

        let mut mappings = Vec::new();
        for mapping in &config.path_mappings {
            mappings.push(compile(mapping, MappingOrigin::User)?);
        }
        if config.include_builtin_mappings {
            for mapping in builtin_mappings() {
                mappings.push(compile(&mapping, MappingOrigin::BuiltIn)?);
            }
        }
        // Stable sort keeps declaration order between equal keys
        mappings.sort_by(|a, b| {
            a.origin
                .cmp(&b.origin)
                .then_with(|| b.pattern.specificity().cmp(&a.pattern.specificity()))
        });

        for mapping in &mappings {
            if !policies.contains_key(&mapping.policy) {
                return Err(PolicyError::UnknownMappingTarget {
                    pattern: mapping.raw.clone(),
                    policy: mapping.policy.clone(),
                });
            }
        }
        for policy in policies.values() {
            for target in policy.transition_targets() {
                if !policies.contains_key(target) {
                    return Err(PolicyError::UnknownTransitionTarget {
                        policy: policy.name.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }

        let default = policies
            .get(&config.default_policy)
            .cloned()
            .ok_or_else(|| PolicyError::UnknownDefault(config.default_policy.clone()))?;

        Ok(Self {
            policies,
            mappings,
            default,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<DetectionPolicy>> {
        self.policies.get(name).cloned()
    }

    pub fn default_policy(&self) -> Arc<DetectionPolicy> {
        Arc::clone(&self.default)
    }

    pub fn policy_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve the policy for a request path: first matching mapping whose
    /// policy is enabled, else the default policy.
    pub fn resolve(&self, path: &str) -> Arc<DetectionPolicy> {
        for mapping in &self.mappings {
            if !mapping.pattern.matches(path) {
                continue;
            }
            match self.policies.get(&mapping.policy) {
                Some(policy) if policy.enabled => {
                    debug!(
                        path = %path,
                        pattern = %mapping.raw,
                        policy = %policy.name,
                        origin = ?mapping.origin,
                        "Resolved detection policy"
                    );
                    return Arc::clone(policy);
                }
                _ => continue,
            }
        }
        self.default_policy()
    }

    /// Evaluate a policy's transitions against evidence, in declared order.
    pub fn evaluate_transitions(
        &self,
        policy: &DetectionPolicy,
        evidence: &AggregatedEvidence,
    ) -> Option<TransitionTarget> {
        policy.first_transition(evidence).cloned()
    }

    /// Mappings in resolution order, for diagnostics.
    pub fn mappings(&self) -> Vec<(&str, &str, MappingOrigin)> {
        self.mappings
            .iter()
            .map(|m| (m.raw.as_str(), m.policy.as_str(), m.origin))
            .collect()
    }
}

fn compile(mapping: &PathMapping, origin: MappingOrigin) -> Result<CompiledMapping, PolicyError> {
    Ok(CompiledMapping {
        raw: mapping.pattern.clone(),
        pattern: PathPattern::parse(&mapping.pattern)?,
        policy: mapping.policy.clone(),
        origin,
    })
}

/// Policies registered before user configuration is applied.
pub fn builtin_policies() -> Vec<DetectionPolicy> {
    vec![
        DetectionPolicy {
            description: "Every registered detector, risk-band actions".to_string(),
            ..DetectionPolicy::named("default")
        },
        DetectionPolicy {
            description: "Sensitive endpoints: full detector set, lower block threshold"
                .to_string(),
            force_slow_path: true,
            early_exit_threshold: 0.95,
            immediate_block_threshold: 0.85,
            transitions: vec![
                PolicyTransition::to_action(
                    TransitionGuard::ReputationState {
                        state: ReputationState::ConfirmedBad,
                    },
                    PolicyAction::Block,
                ),
                PolicyTransition::to_action(
                    TransitionGuard::RiskAbove { threshold: 0.6 },
                    PolicyAction::Challenge,
                ),
            ],
            timeout_ms: 1000,
            ..DetectionPolicy::named("strict")
        },
        DetectionPolicy {
            description: "Cheap checks only, throttle instead of blocking".to_string(),
            fast_path: vec![
                "reputation".to_string(),
                "known_bots".to_string(),
                "user_agent".to_string(),
            ],
            immediate_block_threshold: 0.98,
            transitions: vec![PolicyTransition::to_action(
                TransitionGuard::RiskAbove { threshold: 0.85 },
                PolicyAction::Throttle,
            )],
            default_action: Some(PolicyAction::Allow),
            ..DetectionPolicy::named("relaxed")
        },
        DetectionPolicy {
            description: "Static assets: minimal latency".to_string(),
            fast_path: vec!["reputation".to_string(), "user_agent".to_string()],
            immediate_block_threshold: 0.99,
            timeout_ms: 50,
            default_action: Some(PolicyAction::Allow),
            ..DetectionPolicy::named("static")
        },
        DetectionPolicy {
            description: "API traffic: header and UA checks, behavior on escalation".to_string(),
            fast_path: vec![
                "reputation".to_string(),
                "known_bots".to_string(),
                "user_agent".to_string(),
                "headers".to_string(),
            ],
            slow_path: vec!["behavioral".to_string()],
            transitions: vec![
                PolicyTransition::to_policy(
                    TransitionGuard::SignalEquals {
                        key: "headers.automation".to_string(),
                        value: serde_json::Value::Bool(true),
                    },
                    "strict",
                ),
                PolicyTransition::to_action(
                    TransitionGuard::RiskAbove { threshold: 0.6 },
                    PolicyAction::EscalateToSlowPath,
                ),
            ],
            ..DetectionPolicy::named("api")
        },
    ]
}

/// Mappings that apply unless a user mapping matches first.
pub fn builtin_mappings() -> Vec<PathMapping> {
    vec![
        PathMapping::new("/login", "strict"),
        PathMapping::new("/admin/**", "strict"),
        PathMapping::new("/api/**", "api"),
        PathMapping::new("/static/**", "static"),
        PathMapping::new("/assets/**", "static"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(mappings: Vec<PathMapping>, policies: Vec<DetectionPolicy>) -> PolicyEngine {
        let config = PolicyConfig {
            policies,
            path_mappings: mappings,
            ..PolicyConfig::default()
        };
        PolicyEngine::new(&config).unwrap()
    }

    #[test]
    fn test_builtin_resolution() {
        let engine = engine(vec![], vec![]);

        assert_eq!(engine.resolve("/login").name, "strict");
        assert_eq!(engine.resolve("/api/v1/items").name, "api");
        assert_eq!(engine.resolve("/static/app.js").name, "static");
        assert_eq!(engine.resolve("/blog/post").name, "default");
    }

    #[test]
    fn test_user_mapping_outranks_more_specific_builtin() {
        let engine = engine(
            vec![PathMapping::new("/api/*", "relaxed")],
            vec![],
        );

        assert_eq!(engine.resolve("/api/v1/items").name, "relaxed");
        let order = engine.mappings();
        assert_eq!(order[0], ("/api/*", "relaxed", MappingOrigin::User));
    }

    #[test]
    fn test_more_specific_user_mapping_wins() {
        let engine = engine(
            vec![
                PathMapping::new("/shop/*", "relaxed"),
                PathMapping::new("/shop/checkout", "strict"),
                PathMapping::new("/shop/cart/*", "default"),
            ],
            vec![],
        );

        assert_eq!(engine.resolve("/shop/checkout").name, "strict");
        assert_eq!(engine.resolve("/shop/cart/add").name, "default");
        assert_eq!(engine.resolve("/shop/items").name, "relaxed");
    }

    #[test]
    fn test_disabled_policy_falls_through() {
        let disabled = DetectionPolicy {
            enabled: false,
            ..DetectionPolicy::named("maintenance")
        };
        let engine = engine(
            vec![PathMapping::new("/api/*", "maintenance")],
            vec![disabled],
        );

        // Next match is the built-in /api/** mapping
        assert_eq!(engine.resolve("/api/x").name, "api");
    }

    #[test]
    fn test_user_policy_replaces_builtin() {
        let custom = DetectionPolicy {
            timeout_ms: 42,
            ..DetectionPolicy::named("strict")
        };
        let engine = engine(vec![], vec![custom]);
        assert_eq!(engine.resolve("/login").timeout_ms, 42);
    }

    #[test]
    fn test_unknown_references_are_rejected() {
        let config = PolicyConfig {
            path_mappings: vec![PathMapping::new("/x", "missing")],
            ..PolicyConfig::default()
        };
        assert!(matches!(
            PolicyEngine::new(&config),
            Err(PolicyError::UnknownMappingTarget { .. })
        ));

        let config = PolicyConfig {
            default_policy: "nope".to_string(),
            ..PolicyConfig::default()
        };
        assert!(matches!(
            PolicyEngine::new(&config),
            Err(PolicyError::UnknownDefault(_))
        ));

        let config = PolicyConfig {
            policies: vec![DetectionPolicy {
                transitions: vec![PolicyTransition::to_policy(
                    TransitionGuard::RiskAbove { threshold: 0.5 },
                    "ghost",
                )],
                ..DetectionPolicy::named("hopper")
            }],
            ..PolicyConfig::default()
        };
        assert!(matches!(
            PolicyEngine::new(&config),
            Err(PolicyError::UnknownTransitionTarget { .. })
        ));
    }

    #[test]
    fn test_builtin_mappings_can_be_disabled() {
        let config = PolicyConfig {
            include_builtin_mappings: false,
            ..PolicyConfig::default()
        };
        let engine = PolicyEngine::new(&config).unwrap();
        assert_eq!(engine.resolve("/login").name, "default");
    }
}
