//! Integration tests for the Zentinel bot detection orchestrator.
//!
//! These tests drive complete classifications through the agent: policy
//! resolution, wave scheduling, transitions, reputation learning and manual
//! overrides, and failure isolation of misbehaving detectors.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zentinel_bot_orchestrator::config::ReputationConfig;
use zentinel_bot_orchestrator::detectors::{
    BlackboardState, DetectionContext, Detector, DetectorRegistry, UserAgentAnalyzer,
};
use zentinel_bot_orchestrator::error::DetectorError;
use zentinel_bot_orchestrator::reputation::{
    ip_range_key, user_agent_key, PatternReputation, PatternType, REPUTATION_STATE_SIGNAL,
};
use zentinel_bot_orchestrator::signals::TriggerCondition;
use zentinel_bot_orchestrator::{
    AgentConfig, BotCategory, BotDetectionAgent, Contribution, EarlyExitVerdict,
    PipelineOutcome, PolicyAction, ReputationCache, ReputationState, RiskBand,
};

const CHROME_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    // No DNS in tests
    config.detectors.verify_identity = false;
    config
}

fn agent() -> BotDetectionAgent {
    BotDetectionAgent::new(test_config()).unwrap()
}

fn request(ip: &str, path: &str, ua: &str) -> DetectionContext {
    DetectionContext::new(ip.parse().unwrap(), path).with_header("user-agent", ua)
}

fn browser(ip: &str, path: &str) -> DetectionContext {
    request(ip, path, CHROME_UA)
        .with_header("accept", "text/html,application/xhtml+xml")
        .with_header("accept-language", "en-US,en;q=0.9")
        .with_header("accept-encoding", "gzip, deflate, br")
        .with_header("sec-ch-ua", "\"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"")
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[tokio::test]
async fn test_default_agent_builds() {
    let agent = agent();

    assert_eq!(agent.orchestrator().registry().len(), 5);
    assert_eq!(
        agent.policies().policy_names(),
        vec!["api", "default", "relaxed", "static", "strict"]
    );
    assert!(agent.reputation().is_empty());
}

#[tokio::test]
async fn test_agent_from_yaml_config() {
    let raw = r#"
orchestrator:
  max_waves: 4
detectors:
  verify_identity: false
policies:
  path_mappings:
    - pattern: "/checkout/*"
      policy: checkout
  policies:
    - name: checkout
      description: Payment flow
      fast_path: [reputation, user_agent, headers]
      transitions:
        - when: { type: risk_above, threshold: 0.5 }
          then: { action: block }
"#;
    let config = AgentConfig::from_yaml(raw).unwrap();
    let agent = BotDetectionAgent::new(config).unwrap();

    assert_eq!(agent.policies().resolve("/checkout/pay").name, "checkout");
    let result = agent
        .classify(request("198.51.100.1", "/checkout/pay", "curl/8.0"))
        .await;
    assert_eq!(result.policy, "checkout");
    assert_eq!(result.action, PolicyAction::Block);
    assert!(!result.evidence.contributing_detectors.contains("behavioral"));
}

// =============================================================================
// Classification Tests
// =============================================================================

#[tokio::test]
async fn test_browser_is_allowed() {
    let agent = agent();
    let result = agent.classify(browser("203.0.113.10", "/")).await;

    assert_eq!(result.policy, "default");
    assert_eq!(result.action, PolicyAction::Allow);
    assert!(result.evidence.bot_probability < 0.4);
    assert!(!result.evidence.early_exit);
    assert_eq!(result.evidence.policy_action, Some(PolicyAction::Allow));
}

#[tokio::test]
async fn test_curl_is_throttled_on_default_policy() {
    let agent = agent();
    let result = agent.classify(request("203.0.113.11", "/", "curl/8.0")).await;

    assert_eq!(result.evidence.risk_band, RiskBand::High);
    assert_eq!(result.action, PolicyAction::Throttle);
    assert_eq!(result.outcome, PipelineOutcome::Exhausted);
    assert_eq!(result.evidence.primary_bot_type, Some(BotCategory::Automation));
}

#[tokio::test]
async fn test_verified_good_bot_exits_early() {
    let agent = agent();
    let result = agent
        .classify(request(
            "66.249.66.1",
            "/",
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        ))
        .await;

    assert_eq!(result.outcome, PipelineOutcome::EarlyExit);
    assert_eq!(result.evidence.early_exit_verdict, Some(EarlyExitVerdict::VerifiedGoodBot));
    assert_eq!(result.evidence.bot_probability, 0.0);
    assert_eq!(result.evidence.risk_band, RiskBand::Verified);
    assert_eq!(result.evidence.primary_bot_name.as_deref(), Some("Googlebot"));
    assert_eq!(result.action, PolicyAction::Allow);
}

#[tokio::test]
async fn test_scanner_is_blocked() {
    let agent = agent();
    let result = agent
        .classify(request("203.0.113.12", "/", "sqlmap/1.7.2#stable"))
        .await;

    assert_eq!(result.evidence.early_exit_verdict, Some(EarlyExitVerdict::VerifiedBadBot));
    assert_eq!(result.evidence.bot_probability, 1.0);
    assert_eq!(result.action, PolicyAction::Block);
}

#[tokio::test]
async fn test_json_request_with_mixed_case_headers() {
    let agent = agent();
    let request: DetectionContext = serde_json::from_str(
        r#"{
            "client_ip": "203.0.113.14",
            "path": "/",
            "headers": {"User-Agent": ["sqlmap/1.7.2#stable"], "ACCEPT": ["*/*"]}
        }"#,
    )
    .unwrap();

    let result = agent.classify(request).await;

    assert_eq!(result.evidence.early_exit_verdict, Some(EarlyExitVerdict::VerifiedBadBot));
    assert_eq!(result.action, PolicyAction::Block);
}

#[tokio::test]
async fn test_classification_serializes() {
    let agent = agent();
    let result = agent.classify(request("203.0.113.13", "/login", "curl/8.0")).await;

    let json: serde_json::Value = serde_json::to_value(&result).unwrap();
    assert_eq!(json["action"], "challenge");
    assert_eq!(json["policy"], "strict");
    assert_eq!(json["outcome"], "exhausted");
    assert!(json["evidence"]["contributions"].as_array().unwrap().len() > 3);
}

// =============================================================================
// Policy Tests
// =============================================================================

#[tokio::test]
async fn test_static_policy_runs_fast_path_only() {
    let agent = agent();
    let result = agent
        .classify(request("203.0.113.20", "/static/app.js", "curl/8.0"))
        .await;

    assert_eq!(result.policy, "static");
    let ran: Vec<&str> = result
        .evidence
        .contributing_detectors
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(ran, vec!["reputation", "user_agent"]);
    // Explicit default action replaces the risk band mapping
    assert_eq!(result.action, PolicyAction::Allow);
}

#[tokio::test]
async fn test_strict_policy_challenges_risky_request() {
    let agent = agent();
    let result = agent.classify(request("203.0.113.21", "/login", "curl/8.0")).await;

    assert_eq!(result.policy, "strict");
    assert!(result.evidence.bot_probability > 0.6);
    assert_eq!(result.action, PolicyAction::Challenge);
}

#[tokio::test]
async fn test_api_hands_off_to_strict_on_automation() {
    let agent = agent();
    let ctx = request("203.0.113.22", "/api/v1/items", "curl/8.0").with_header("x-selenium", "1");
    let result = agent.classify(ctx).await;

    assert_eq!(result.policy_path, vec!["api", "strict"]);
    assert_eq!(result.policy, "strict");
    assert_eq!(result.action, PolicyAction::Challenge);
    // The hand-off continues the same session: strict adds the slow path
    assert!(result.evidence.contributing_detectors.contains("behavioral"));
    let headers_runs = result
        .evidence
        .contributions
        .iter()
        .filter(|c| c.detector == "headers" && c.weight == 0.0)
        .count();
    assert_eq!(headers_runs, 1);
}

#[tokio::test]
async fn test_api_escalates_to_slow_path() {
    let agent = agent();
    let result = agent
        .classify(request("203.0.113.23", "/api/v1/items", "curl/8.0"))
        .await;

    assert_eq!(result.policy_path, vec!["api"]);
    assert!(result.evidence.contributing_detectors.contains("behavioral"));
    assert_eq!(result.action, PolicyAction::Throttle);
}

#[tokio::test]
async fn test_api_browser_stays_on_fast_path() {
    let agent = agent();
    let result = agent.classify(browser("203.0.113.24", "/api/v1/items")).await;

    assert_eq!(result.policy_path, vec!["api"]);
    assert!(!result.evidence.contributing_detectors.contains("behavioral"));
    assert_eq!(result.action, PolicyAction::Allow);
}

// =============================================================================
// Reputation Tests
// =============================================================================

#[tokio::test]
async fn test_confident_outcomes_are_learned() {
    let mut config = test_config();
    config.reputation = ReputationConfig {
        learning_rate: 0.5,
        ..ReputationConfig::default()
    };
    let agent = BotDetectionAgent::new(config).unwrap();

    for _ in 0..5 {
        agent.classify(request("192.0.2.50", "/", "curl/8.0")).await;
    }

    let ip = agent
        .reputation()
        .get(&ip_range_key("192.0.2.50".parse().unwrap()).id)
        .unwrap();
    assert_eq!(ip.support, 5.0);
    assert!(ip.bot_score > 0.6);
    assert!(agent.reputation().get(&user_agent_key("curl/8.0").id).is_some());
}

#[tokio::test]
async fn test_manual_block_overrides_detectors() {
    let agent = agent();
    let key = ip_range_key("192.0.2.60".parse().unwrap());
    agent.reputation().block_pattern(&key);

    let result = agent.classify(browser("192.0.2.61", "/")).await;

    assert_eq!(result.evidence.early_exit_verdict, Some(EarlyExitVerdict::Blacklisted));
    assert_eq!(result.action, PolicyAction::Block);
    // Manual overrides are not learned from
    assert_eq!(agent.reputation().get(&key.id).unwrap().support, 0.0);
    assert!(agent.reputation().get(&user_agent_key(CHROME_UA).id).is_none());
}

#[tokio::test]
async fn test_manual_allow_overrides_detectors() {
    let agent = agent();
    agent
        .reputation()
        .allow_pattern(&user_agent_key("partner-monitor/1.0"));

    let result = agent
        .classify(request("192.0.2.70", "/login", "partner-monitor/1.0"))
        .await;

    assert_eq!(result.evidence.early_exit_verdict, Some(EarlyExitVerdict::Whitelisted));
    assert_eq!(result.action, PolicyAction::Allow);
}

#[tokio::test]
async fn test_confirmed_bad_reputation_blocks_on_strict() {
    let agent = agent();
    let key = ip_range_key("192.0.2.80".parse().unwrap());
    let now = Utc::now();
    let mut seeded = PatternReputation::neutral(&key.id, PatternType::IpRange, &key.pattern, now);
    seeded.support = 20.0;
    let seeded = seeded.with_score(0.95, agent.reputation().config(), now);
    assert_eq!(seeded.state, ReputationState::ConfirmedBad);
    agent.reputation().update(seeded);

    let result = agent.classify(browser("192.0.2.81", "/admin/users")).await;

    assert_eq!(result.policy, "strict");
    assert_eq!(
        result.evidence.signals[REPUTATION_STATE_SIGNAL],
        ReputationState::ConfirmedBad.as_str()
    );
    assert_eq!(result.action, PolicyAction::Block);
}

// =============================================================================
// Failure Isolation Tests
// =============================================================================

struct Flaky {
    calls: AtomicUsize,
}

#[async_trait]
impl Detector for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn contribute(
        &self,
        _state: &BlackboardState,
    ) -> Result<Vec<Contribution>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DetectorError::failed("flaky", "backend unavailable"))
    }
}

struct Slow;

#[async_trait]
impl Detector for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn contribute(
        &self,
        _state: &BlackboardState,
    ) -> Result<Vec<Contribution>, DetectorError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(vec![Contribution::new("slow", "slow", 1.0, 5.0, "too late")])
    }
}

/// Runs once `ua.bot_keyword` is "curl" and records the wave it saw.
#[derive(Default)]
struct CurlFollowUp {
    seen_wave: Mutex<Option<usize>>,
}

#[async_trait]
impl Detector for CurlFollowUp {
    fn name(&self) -> &str {
        "curl_follow_up"
    }

    fn trigger_conditions(&self) -> Vec<TriggerCondition> {
        vec![TriggerCondition::equals("ua.bot_keyword", "curl")]
    }

    async fn contribute(
        &self,
        state: &BlackboardState,
    ) -> Result<Vec<Contribution>, DetectorError> {
        *self.seen_wave.lock().unwrap() = Some(state.wave);
        Ok(vec![Contribution::new(
            "curl_follow_up",
            "follow_up",
            0.3,
            1.0,
            "curl seen in earlier wave",
        )])
    }
}

fn custom_agent(registry: DetectorRegistry) -> BotDetectionAgent {
    let config = test_config();
    let reputation = ReputationCache::new(config.reputation.clone());
    BotDetectionAgent::with_registry(config, reputation, registry).unwrap()
}

#[tokio::test]
async fn test_failing_detector_trips_its_breaker() {
    let flaky = Arc::new(Flaky {
        calls: AtomicUsize::new(0),
    });
    let agent = custom_agent(
        DetectorRegistry::new()
            .with(Arc::new(UserAgentAnalyzer::new()))
            .with(flaky.clone()),
    );

    for _ in 0..3 {
        let result = agent.classify(request("192.0.2.90", "/", "curl/8.0")).await;
        assert!(result.evidence.failed_detectors.contains("flaky"));
        assert!(result.evidence.contributing_detectors.contains("user_agent"));
    }

    let result = agent.classify(request("192.0.2.90", "/", "curl/8.0")).await;
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert!(!result.evidence.failed_detectors.contains("flaky"));
    assert!(result.evidence.contributing_detectors.contains("user_agent"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_detector_times_out() {
    let agent = custom_agent(
        DetectorRegistry::new()
            .with(Arc::new(UserAgentAnalyzer::new()))
            .with(Arc::new(Slow)),
    );

    let result = agent.classify(request("192.0.2.91", "/", "curl/8.0")).await;

    assert!(result.evidence.failed_detectors.contains("slow"));
    assert!(!result.evidence.reasons().contains(&"too late"));
    assert!(result.elapsed_ms < 1000);
}

#[tokio::test]
async fn test_trigger_conditions_chain_waves() {
    let follow_up = Arc::new(CurlFollowUp::default());
    let agent = custom_agent(
        DetectorRegistry::new()
            .with(Arc::new(UserAgentAnalyzer::new()))
            .with(follow_up.clone()),
    );

    let result = agent.classify(request("192.0.2.92", "/", "curl/8.0")).await;
    assert_eq!(*follow_up.seen_wave.lock().unwrap(), Some(1));
    assert!(result.evidence.contributing_detectors.contains("curl_follow_up"));

    let follow_up_browser = Arc::new(CurlFollowUp::default());
    let agent = custom_agent(
        DetectorRegistry::new()
            .with(Arc::new(UserAgentAnalyzer::new()))
            .with(follow_up_browser.clone()),
    );
    agent.classify(browser("192.0.2.93", "/")).await;
    assert_eq!(*follow_up_browser.seen_wave.lock().unwrap(), None);
}
