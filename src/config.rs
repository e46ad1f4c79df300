//! Configuration types for the bot detection orchestrator.

use crate::error::ConfigError;
use crate::policy::engine::PathMapping;
use crate::policy::DetectionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Wave loop settings
    pub orchestrator: OrchestratorConfig,

    /// Per-detector failure isolation
    pub circuit_breaker: CircuitBreakerConfig,

    /// Pattern reputation cache
    pub reputation: ReputationConfig,

    /// Named policies and path mappings
    pub policies: PolicyConfig,

    /// Built-in detector settings
    pub detectors: DetectorConfig,

    /// Feed classification outcomes back into the reputation cache
    pub learning: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            reputation: ReputationConfig::default(),
            policies: PolicyConfig::default(),
            detectors: DetectorConfig::default(),
            learning: true,
        }
    }
}

impl AgentConfig {
    /// Load from a JSON or YAML file, chosen by extension (YAML unless `.json`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&raw)
        } else {
            Self::from_yaml(&raw)
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Orchestrator (wave loop) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum waves per orchestrator run
    pub max_waves: u32,

    /// Maximum detectors executing at once within a wave
    pub max_parallel_detectors: usize,

    /// Run a wave's detectors concurrently
    pub parallel: bool,

    /// Overall pipeline deadline in milliseconds
    pub total_timeout_ms: u64,

    /// Pause between waves in milliseconds
    pub inter_wave_delay_ms: u64,

    /// Maximum policy-to-policy hand-offs per request
    pub max_policy_hops: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_waves: 10,
            max_parallel_detectors: 8,
            parallel: true,
            total_timeout_ms: 500,
            inter_wave_delay_ms: 0,
            max_policy_hops: 4,
        }
    }
}

impl OrchestratorConfig {
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn inter_wave_delay(&self) -> Duration {
        Duration::from_millis(self.inter_wave_delay_ms)
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Time an open breaker waits before admitting a probe
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Reputation cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Entry count above which cold entries are evicted
    pub max_entries: usize,

    /// Access count at which an entry becomes hot
    pub hot_access_threshold: u64,

    /// How long a hot entry stays protected, in seconds
    pub hot_window_secs: u64,

    /// Log every Nth hot promotion
    pub hot_sample_rate: u64,

    /// Half-life of the pull toward neutral, in seconds (0 disables decay)
    pub decay_half_life_secs: u64,

    /// Minimum idle time before an entry can be collected
    pub gc_min_age_secs: u64,

    /// Entries within this distance of 0.5 count as neutral for GC
    pub gc_neutral_band: f64,

    /// Entries with less support are collectable regardless of score
    pub gc_min_support: f64,

    /// EMA rate used when learning from classifications
    pub learning_rate: f64,

    /// Minimum evidence confidence required to learn from a classification
    pub learn_min_confidence: f64,

    pub suspect_score: f64,
    pub confirmed_bad_score: f64,
    pub confirmed_good_score: f64,
    pub confirm_min_support: f64,

    /// Pending maintenance jobs before callers wait
    pub queue_capacity: usize,

    /// Period of the background decay + GC loop, in seconds
    pub maintenance_interval_secs: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            hot_access_threshold: 50,
            hot_window_secs: 600,
            hot_sample_rate: 100,
            decay_half_life_secs: 86_400,
            gc_min_age_secs: 7 * 86_400,
            gc_neutral_band: 0.1,
            gc_min_support: 3.0,
            learning_rate: 0.1,
            learn_min_confidence: 0.5,
            suspect_score: 0.65,
            confirmed_bad_score: 0.85,
            confirmed_good_score: 0.15,
            confirm_min_support: 10.0,
            queue_capacity: 64,
            maintenance_interval_secs: 300,
        }
    }
}

/// Policy registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// User policies; a policy named like a built-in replaces it
    pub policies: Vec<DetectionPolicy>,

    /// Ordered path pattern to policy mappings
    pub path_mappings: Vec<PathMapping>,

    /// Policy used when no mapping matches
    pub default_policy: String,

    /// Register the built-in mappings below the user ones
    pub include_builtin_mappings: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policies: vec![],
            path_mappings: vec![],
            default_policy: "default".to_string(),
            include_builtin_mappings: true,
        }
    }
}

/// Built-in detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Enable header analysis
    pub header_analysis: bool,

    /// Enable user-agent validation
    pub user_agent_validation: bool,

    /// Enable known bot database lookup
    pub known_bot_lookup: bool,

    /// Enable behavioral analysis
    pub behavioral_analysis: bool,

    /// Enable the reputation lookup detector
    pub reputation_lookup: bool,

    /// Verify claimed bot identity via IP ranges and reverse DNS
    pub verify_identity: bool,

    /// Bot verification cache size
    pub verification_cache_size: u64,

    /// Bot verification cache TTL in seconds
    pub verification_cache_ttl_seconds: u64,

    /// JSON list of known bots replacing the built-in list
    pub good_bots_path: Option<PathBuf>,

    /// JSON list of bad User-Agent patterns replacing the built-in list
    pub bad_patterns_path: Option<PathBuf>,

    /// Behavioral analysis settings
    pub behavioral: BehavioralConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            header_analysis: true,
            user_agent_validation: true,
            known_bot_lookup: true,
            behavioral_analysis: true,
            reputation_lookup: true,
            verify_identity: true,
            verification_cache_size: 10_000,
            verification_cache_ttl_seconds: 3600,
            good_bots_path: None,
            bad_patterns_path: None,
            behavioral: BehavioralConfig::default(),
        }
    }
}

/// Behavioral analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralConfig {
    /// Maximum sessions to track
    pub max_sessions: usize,

    /// Session timeout in seconds
    pub session_timeout_seconds: u64,

    /// Requests per minute threshold
    pub rpm_threshold: u32,

    /// Minimum requests before behavioral scoring
    pub min_requests_for_scoring: u32,

    /// Maximum request history per session
    pub max_request_history: usize,
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100_000,
            session_timeout_seconds: 3600,
            rpm_threshold: 60,
            min_requests_for_scoring: 5,
            max_request_history: 100,
        }
    }
}
