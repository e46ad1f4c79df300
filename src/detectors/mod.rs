//! Detector contract and reference detectors.
//!
//! Each detector analyzes one aspect of the request and posts
//! [`Contribution`]s to the blackboard. The orchestrator decides when a
//! detector runs from its priority and trigger conditions.

pub mod behavioral;
pub mod headers;
pub mod known_bots;
pub mod reputation;
pub mod user_agent;

pub use behavioral::BehavioralAnalyzer;
pub use headers::HeaderAnalyzer;
pub use known_bots::KnownBotDatabase;
pub use reputation::ReputationDetector;
pub use user_agent::UserAgentAnalyzer;

use crate::error::DetectorError;
use crate::evidence::Contribution;
use crate::signals::{SignalMap, TriggerCondition};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Default per-detector execution timeout.
pub const DEFAULT_DETECTOR_TIMEOUT: Duration = Duration::from_millis(100);

/// Context for detection containing request information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionContext {
    /// Request headers (lowercase keys)
    #[serde(default, deserialize_with = "lowercase_headers")]
    pub headers: HashMap<String, Vec<String>>,
    /// Client IP address
    pub client_ip: IpAddr,
    /// Request path
    #[serde(default = "default_path")]
    pub path: String,
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// Correlation ID for the request
    #[serde(default)]
    pub correlation_id: String,
}

/// Header names are case-insensitive; values of names differing only in case
/// are merged.
fn lowercase_headers<'de, D>(deserializer: D) -> Result<HashMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, Vec<String>>::deserialize(deserializer)?;
    let mut headers: HashMap<String, Vec<String>> = HashMap::with_capacity(raw.len());
    for (name, values) in raw {
        headers.entry(name.to_lowercase()).or_default().extend(values);
    }
    Ok(headers)
}

fn default_path() -> String {
    "/".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

impl DetectionContext {
    /// Build a context with no headers.
    pub fn new(client_ip: IpAddr, path: impl Into<String>) -> Self {
        Self {
            headers: HashMap::new(),
            client_ip,
            path: path.into(),
            method: default_method(),
            correlation_id: String::new(),
        }
    }

    /// Add a header value (name is lowercased).
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// Get a single header value (first if multiple).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// Get the User-Agent header.
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

impl Default for DetectionContext {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), default_path())
    }
}

/// Read-mostly snapshot handed to detectors, rebuilt every wave.
#[derive(Debug, Clone)]
pub struct BlackboardState {
    /// The original request
    pub request: Arc<DetectionContext>,
    /// Signals merged from all previous waves
    pub signals: SignalMap,
    /// Aggregated bot probability at the start of the wave
    pub risk: f64,
    /// Time since the pipeline started
    pub elapsed: Duration,
    /// Current wave number (0-based)
    pub wave: usize,
    /// Name of the policy in force
    pub policy: String,
}

impl BlackboardState {
    /// Snapshot for a request before any detector ran.
    pub fn initial(request: Arc<DetectionContext>) -> Self {
        Self {
            request,
            signals: SignalMap::new(),
            risk: 0.0,
            elapsed: Duration::ZERO,
            wave: 0,
            policy: String::new(),
        }
    }
}

/// Trait for bot detectors.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Unique detector name, referenced by policies.
    fn name(&self) -> &str;

    /// Scheduling priority; lower runs earlier.
    fn priority(&self) -> i32 {
        100
    }

    fn is_enabled(&self) -> bool {
        true
    }

    /// Optional detectors log failures at a lower severity.
    fn is_optional(&self) -> bool {
        true
    }

    /// Maximum time this detector may run.
    fn execution_timeout(&self) -> Duration {
        DEFAULT_DETECTOR_TIMEOUT
    }

    /// Conditions that must all hold before the detector runs. Empty means wave 0.
    fn trigger_conditions(&self) -> Vec<TriggerCondition> {
        Vec::new()
    }

    /// Analyze the request and return contributions.
    async fn contribute(&self, state: &BlackboardState) -> Result<Vec<Contribution>, DetectorError>;
}

/// Registered detectors in registration order.
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn Detector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a detector. A later registration with the same name replaces the earlier one.
    pub fn register(&mut self, detector: Arc<dyn Detector>) {
        self.detectors.retain(|d| d.name() != detector.name());
        self.detectors.push(detector);
    }

    pub fn with(mut self, detector: Arc<dyn Detector>) -> Self {
        self.register(detector);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Detector>> {
        self.detectors.iter().find(|d| d.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Detectors sorted by priority, ties broken by registration order.
    pub fn by_priority(&self) -> Vec<Arc<dyn Detector>> {
        let mut sorted = self.detectors.clone();
        // sort_by_key is stable
        sorted.sort_by_key(|d| d.priority());
        sorted
    }
}

impl std::fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorRegistry")
            .field("detectors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        priority: i32,
    }

    #[async_trait]
    impl Detector for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn contribute(
            &self,
            _state: &BlackboardState,
        ) -> Result<Vec<Contribution>, DetectorError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_registry_priority_order_is_stable() {
        let registry = DetectorRegistry::new()
            .with(Arc::new(Fixed { name: "c", priority: 20 }))
            .with(Arc::new(Fixed { name: "a", priority: 10 }))
            .with(Arc::new(Fixed { name: "b", priority: 20 }));

        let order: Vec<String> = registry
            .by_priority()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_registry_replaces_by_name() {
        let registry = DetectorRegistry::new()
            .with(Arc::new(Fixed { name: "a", priority: 10 }))
            .with(Arc::new(Fixed { name: "a", priority: 5 }));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").map(|d| d.priority()), Some(5));
    }

    #[test]
    fn test_context_headers_are_case_insensitive() {
        let ctx = DetectionContext::new("10.0.0.1".parse().unwrap(), "/")
            .with_header("User-Agent", "curl/8.0");

        assert_eq!(ctx.user_agent(), Some("curl/8.0"));
        assert_eq!(ctx.header("USER-AGENT"), Some("curl/8.0"));
    }

    #[test]
    fn test_context_deserializes_with_defaults() {
        let ctx: DetectionContext =
            serde_json::from_str(r#"{"client_ip": "192.0.2.1"}"#).unwrap();
        assert_eq!(ctx.path, "/");
        assert_eq!(ctx.method, "GET");
        assert!(ctx.headers.is_empty());
    }

    #[test]
    fn test_context_deserialization_lowercases_header_names() {
        let ctx: DetectionContext = serde_json::from_str(
            r#"{
                "client_ip": "192.0.2.1",
                "headers": {"User-Agent": ["curl/8.0"], "Accept-Language": ["en"]}
            }"#,
        )
        .unwrap();

        assert_eq!(ctx.user_agent(), Some("curl/8.0"));
        assert_eq!(ctx.header("accept-language"), Some("en"));
        assert!(ctx.headers.contains_key("user-agent"));
        assert!(!ctx.headers.contains_key("User-Agent"));
    }
}
