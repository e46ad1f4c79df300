//! Bot detection orchestrator for Zentinel
//!
//! Classifies requests by running pluggable detectors in waves on a shared
//! blackboard, aggregating their evidence into a bot probability and mapping
//! it to an action through path-resolved detection policies.
//!
//! # Features
//!
//! - Wave scheduling with signal-based trigger conditions
//! - Per-detector circuit breakers and timeouts
//! - Named detection policies with path mappings and transitions
//! - Pattern reputation with decay, hot keys and background GC
//! - Reference detectors: reputation, known bots, user agent, headers, behavior
//!
//! # Example
//!
//! ```ignore
//! use zentinel_bot_orchestrator::{AgentConfig, BotDetectionAgent};
//! use zentinel_bot_orchestrator::detectors::DetectionContext;
//!
//! let agent = BotDetectionAgent::new(AgentConfig::default())?;
//! let request = DetectionContext::new("203.0.113.7".parse()?, "/login")
//!     .with_header("user-agent", "curl/8.0");
//! let result = agent.classify(request).await;
//! println!("{} ({:.2})", result.action.as_str(), result.evidence.bot_probability);
//! ```

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod detectors;
pub mod error;
pub mod evidence;
pub mod orchestrator;
pub mod policy;
pub mod reputation;
pub mod score;
pub mod signals;

pub use agent::{BotDetectionAgent, Classification};
pub use aggregator::EvidenceAggregator;
pub use config::AgentConfig;
pub use evidence::{AggregatedEvidence, Contribution, EarlyExitVerdict, RiskBand};
pub use orchestrator::{BlackboardOrchestrator, PipelineOutcome};
pub use policy::{DetectionPolicy, PolicyAction, PolicyEngine};
pub use reputation::{ReputationCache, ReputationState};
pub use score::BotCategory;
