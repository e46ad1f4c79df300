//! Error types for the bot detection orchestrator.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single detector call. Never fatal to a classification.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// The detector ran but could not produce evidence.
    #[error("detector '{detector}' failed: {message}")]
    Failed { detector: String, message: String },

    /// The detector exceeded its execution timeout or the pipeline deadline.
    #[error("detector '{detector}' timed out after {elapsed:?}")]
    Timeout { detector: String, elapsed: Duration },

    /// The detector task panicked or was aborted.
    #[error("detector '{detector}' aborted: {message}")]
    Aborted { detector: String, message: String },
}

impl DetectorError {
    pub fn failed(detector: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            detector: detector.into(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Policy configuration errors, raised when the engine is built.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("default policy '{0}' is not registered")]
    UnknownDefault(String),

    #[error("path mapping '{pattern}' references unknown policy '{policy}'")]
    UnknownMappingTarget { pattern: String, policy: String },

    #[error("policy '{policy}' transitions to unknown policy '{target}'")]
    UnknownTransitionTarget { policy: String, target: String },

    #[error("invalid path pattern '{0}'")]
    InvalidPattern(String),
}

/// Reputation cache errors.
#[derive(Debug, Error)]
pub enum ReputationError {
    /// The durable store collaborator could not be reached.
    #[error("reputation store unavailable: {0}")]
    StoreUnavailable(String),

    /// The maintenance worker has shut down.
    #[error("reputation maintenance worker is not running")]
    WorkerClosed,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}
