//! Bot detection agent.
//!
//! Ties the pieces together for one request: resolve the policy for its path,
//! run the blackboard, follow policy transitions, pick the action and feed the
//! outcome back into the reputation cache.

use crate::config::{AgentConfig, DetectorConfig};
use crate::detectors::{
    BehavioralAnalyzer, DetectionContext, DetectorRegistry, HeaderAnalyzer, KnownBotDatabase,
    ReputationDetector, UserAgentAnalyzer,
};
use crate::error::ConfigError;
use crate::evidence::{AggregatedEvidence, EarlyExitVerdict};
use crate::orchestrator::{BlackboardOrchestrator, PipelineOutcome, PipelineSession};
use crate::policy::{DetectionPolicy, Escalation, PolicyAction, PolicyEngine, TransitionTarget};
use crate::reputation::{pattern_keys, ReputationCache};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Final decision for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    /// Evidence, tagged with the final policy and action
    pub evidence: AggregatedEvidence,
    pub action: PolicyAction,
    /// Policy in force when the action was chosen
    pub policy: String,
    /// Every policy visited, in order
    pub policy_path: Vec<String>,
    /// How the last orchestrator run ended
    pub outcome: PipelineOutcome,
    pub elapsed_ms: u64,
}

/// Bot detection agent.
pub struct BotDetectionAgent {
    config: AgentConfig,
    policies: PolicyEngine,
    reputation: ReputationCache,
    orchestrator: BlackboardOrchestrator,
}

impl BotDetectionAgent {
    /// Create an agent with the reference detectors enabled by `config`.
    ///
    /// Must be called inside a Tokio runtime (the reputation cache spawns its
    /// maintenance worker).
    pub fn new(config: AgentConfig) -> Result<Self, ConfigError> {
        let reputation = ReputationCache::new(config.reputation.clone());
        let registry = Self::default_registry(&config.detectors, &reputation)?;
        Self::with_registry(config, reputation, registry)
    }

    /// Create an agent around a caller-provided detector set.
    pub fn with_registry(
        config: AgentConfig,
        reputation: ReputationCache,
        registry: DetectorRegistry,
    ) -> Result<Self, ConfigError> {
        let policies = PolicyEngine::new(&config.policies)?;
        let orchestrator = BlackboardOrchestrator::new(
            registry,
            &config.circuit_breaker,
            config.orchestrator.clone(),
        );

        info!(
            detectors = ?orchestrator.registry().names(),
            policies = ?policies.policy_names(),
            default_policy = %config.policies.default_policy,
            learning = config.learning,
            "Bot detection agent initialized"
        );

        Ok(Self {
            config,
            policies,
            reputation,
            orchestrator,
        })
    }

    /// Reference detectors, each switched by its `DetectorConfig` flag.
    pub fn default_registry(
        config: &DetectorConfig,
        reputation: &ReputationCache,
    ) -> Result<DetectorRegistry, ConfigError> {
        Ok(DetectorRegistry::new()
            .with(Arc::new(
                ReputationDetector::new(reputation.clone()).enabled(config.reputation_lookup),
            ))
            .with(Arc::new(KnownBotDatabase::from_config(config)?))
            .with(Arc::new(
                UserAgentAnalyzer::new().enabled(config.user_agent_validation),
            ))
            .with(Arc::new(HeaderAnalyzer::new().enabled(config.header_analysis)))
            .with(Arc::new(
                BehavioralAnalyzer::new(config.behavioral.clone())
                    .enabled(config.behavioral_analysis),
            )))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn policies(&self) -> &PolicyEngine {
        &self.policies
    }

    pub fn reputation(&self) -> &ReputationCache {
        &self.reputation
    }

    pub fn orchestrator(&self) -> &BlackboardOrchestrator {
        &self.orchestrator
    }

    /// Classify one request.
    pub async fn classify(&self, request: DetectionContext) -> Classification {
        let mut session = self.orchestrator.session(request);
        let mut policy = self.policies.resolve(&session.request().path);
        let mut policy_path = vec![policy.name.clone()];

        let (outcome, action) = loop {
            let outcome = self.orchestrator.run(&mut session, &policy).await;
            let evidence = session.evidence();

            // A verdict is final: no hand-off can change it
            if evidence.early_exit {
                break (outcome, policy.default_action_for(&evidence));
            }

            match self.policies.evaluate_transitions(&policy, &evidence) {
                Some(TransitionTarget::Policy(next)) => match self.hand_off(&policy_path, &next) {
                    Some(next_policy) => {
                        info!(
                            from = %policy.name,
                            to = %next_policy.name,
                            probability = evidence.bot_probability,
                            "Policy transition"
                        );
                        policy_path.push(next_policy.name.clone());
                        policy = next_policy;
                    }
                    None => break (outcome, policy.default_action_for(&evidence)),
                },
                Some(TransitionTarget::Action(PolicyAction::EscalateToSlowPath))
                    if !session.escalation().slow_path =>
                {
                    debug!(policy = %policy.name, "Escalating to slow path");
                    session.escalate(Escalation {
                        slow_path: true,
                        ai: false,
                    });
                }
                Some(TransitionTarget::Action(PolicyAction::EscalateToAi))
                    if !session.escalation().ai =>
                {
                    debug!(policy = %policy.name, "Escalating to AI path");
                    session.escalate(Escalation {
                        slow_path: true,
                        ai: true,
                    });
                }
                Some(TransitionTarget::Action(action)) if action.is_terminal() => {
                    break (outcome, action);
                }
                _ => break (outcome, policy.default_action_for(&evidence)),
            }
        };

        let evidence = session.evidence().with_policy(&policy.name, action);
        self.learn(&session, &evidence);

        let classification = Classification {
            action,
            policy: policy.name.clone(),
            policy_path,
            outcome,
            elapsed_ms: session.elapsed().as_millis() as u64,
            evidence,
        };

        info!(
            correlation_id = %session.request().correlation_id,
            client_ip = %session.request().client_ip,
            path = %session.request().path,
            policy = %classification.policy,
            action = classification.action.as_str(),
            probability = classification.evidence.bot_probability,
            confidence = classification.evidence.confidence,
            risk_band = classification.evidence.risk_band.as_str(),
            outcome = ?classification.outcome,
            waves = session.waves(),
            elapsed_ms = classification.elapsed_ms,
            "Request classified"
        );
        classification
    }

    /// Next policy for a hand-off, or `None` when the hop budget is spent,
    /// the target was already visited or it is disabled.
    fn hand_off(&self, visited: &[String], next: &str) -> Option<Arc<DetectionPolicy>> {
        let hops = visited.len().saturating_sub(1);
        if hops >= self.config.orchestrator.max_policy_hops as usize {
            debug!(next_policy = %next, hops, "Policy hop limit reached");
            return None;
        }
        if visited.iter().any(|name| name == next) {
            debug!(next_policy = %next, "Policy already visited, not re-entering");
            return None;
        }
        self.policies.get(next).filter(|p| p.enabled)
    }

    /// Fold a confident outcome into the reputation of the request's patterns.
    /// Manual overrides are never learned from.
    fn learn(&self, session: &PipelineSession, evidence: &AggregatedEvidence) {
        if !self.config.learning {
            return;
        }
        if matches!(
            evidence.early_exit_verdict,
            Some(EarlyExitVerdict::Whitelisted | EarlyExitVerdict::Blacklisted)
        ) {
            return;
        }
        if evidence.confidence < self.reputation.config().learn_min_confidence {
            return;
        }
        for key in pattern_keys(session.request()) {
            self.reputation
                .record_observation(&key, evidence.bot_probability);
        }
    }
}

impl std::fmt::Debug for BotDetectionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotDetectionAgent")
            .field("policies", &self.policies.policy_names())
            .field("detectors", &self.orchestrator.registry().names())
            .field("reputation", &self.reputation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::policy::engine::PathMapping;
    use crate::policy::{PolicyTransition, TransitionGuard};

    fn quiet_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.detectors.verify_identity = false;
        config
    }

    fn curl(path: &str) -> DetectionContext {
        DetectionContext::new("192.0.2.10".parse().unwrap(), path)
            .with_header("user-agent", "curl/8.0")
    }

    #[tokio::test]
    async fn test_default_registry_respects_flags() {
        let mut config = quiet_config();
        config.detectors.behavioral_analysis = false;
        let agent = BotDetectionAgent::new(config).unwrap();

        let registry = agent.orchestrator().registry();
        assert_eq!(registry.len(), 5);
        assert!(!registry.get("behavioral").unwrap().is_enabled());
        assert!(registry.get("headers").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_invalid_policy_config_is_rejected() {
        let mut config = quiet_config();
        config.policies.default_policy = "missing".to_string();
        assert!(matches!(
            BotDetectionAgent::new(config),
            Err(ConfigError::Policy(_))
        ));
    }

    #[tokio::test]
    async fn test_hand_off_is_bounded_and_never_revisits() {
        let ping = DetectionPolicy {
            transitions: vec![PolicyTransition::to_policy(
                TransitionGuard::RiskAbove { threshold: 0.0 },
                "pong",
            )],
            ..DetectionPolicy::named("ping")
        };
        let pong = DetectionPolicy {
            transitions: vec![PolicyTransition::to_policy(
                TransitionGuard::RiskAbove { threshold: 0.0 },
                "ping",
            )],
            ..DetectionPolicy::named("pong")
        };
        let mut config = quiet_config();
        config.policies = PolicyConfig {
            policies: vec![ping, pong],
            path_mappings: vec![PathMapping::new("/loop", "ping")],
            ..PolicyConfig::default()
        };
        let agent = BotDetectionAgent::new(config).unwrap();

        let result = agent.classify(curl("/loop")).await;
        assert_eq!(result.policy_path, vec!["ping", "pong"]);
        assert_eq!(result.policy, "pong");
        assert!(result.action.is_terminal());
    }

    #[tokio::test]
    async fn test_learning_can_be_disabled() {
        let mut config = quiet_config();
        config.learning = false;
        let agent = BotDetectionAgent::new(config).unwrap();

        agent.classify(curl("/")).await;
        assert!(agent.reputation().is_empty());
    }
}
