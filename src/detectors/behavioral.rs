//! Behavioral analysis detector.
//!
//! Tracks per-IP sessions across requests and scores request rate, timing
//! regularity and path diversity.

use super::{BlackboardState, Detector};
use crate::config::BehavioralConfig;
use crate::error::DetectorError;
use crate::evidence::Contribution;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const NAME: &str = "behavioral";
const CATEGORY: &str = "behavioral";

pub const SIGNAL_REQUEST_COUNT: &str = "behavior.request_count";
pub const SIGNAL_RPM: &str = "behavior.rpm";
pub const SIGNAL_TIMING_CV: &str = "behavior.timing_cv";

/// Paths remembered per session.
const MAX_PATHS: usize = 100;
/// Sweep expired sessions every N requests.
const CLEANUP_EVERY: u64 = 1000;

/// Per-client request history.
#[derive(Debug)]
pub struct SessionData {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub request_count: u32,
    /// Recent request timestamps (bounded)
    pub request_times: VecDeque<Instant>,
    /// Unique paths visited (bounded, query strings stripped)
    pub paths_visited: HashSet<String>,
    max_history: usize,
}

impl SessionData {
    pub fn new(max_history: usize) -> Self {
        let now = Instant::now();
        Self {
            first_seen: now,
            last_seen: now,
            request_count: 0,
            request_times: VecDeque::with_capacity(max_history.min(1024)),
            paths_visited: HashSet::new(),
            max_history: max_history.max(1),
        }
    }

    pub fn record_request(&mut self, path: &str) {
        let now = Instant::now();
        self.last_seen = now;
        self.request_count = self.request_count.saturating_add(1);

        if self.request_times.len() >= self.max_history {
            self.request_times.pop_front();
        }
        self.request_times.push_back(now);

        if self.paths_visited.len() < MAX_PATHS {
            let path_only = path.split('?').next().unwrap_or(path);
            self.paths_visited.insert(path_only.to_string());
        }
    }

    /// Requests per minute over the recorded window.
    pub fn requests_per_minute(&self) -> f64 {
        let (Some(first), Some(last)) = (self.request_times.front(), self.request_times.back())
        else {
            return 0.0;
        };
        if self.request_times.len() < 2 {
            return 0.0;
        }
        let window = last.duration_since(*first).as_secs_f64();
        if window < 1.0 {
            // Whole burst inside one second
            return self.request_times.len() as f64 * 60.0;
        }
        self.request_times.len() as f64 / window * 60.0
    }

    /// Coefficient of variation of request intervals. Low is machine-like.
    pub fn timing_regularity(&self) -> Option<f64> {
        if self.request_times.len() < 3 {
            return None;
        }
        let intervals: Vec<f64> = self
            .request_times
            .iter()
            .zip(self.request_times.iter().skip(1))
            .map(|(a, b)| b.duration_since(*a).as_secs_f64())
            .collect();

        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean == 0.0 {
            return Some(0.0);
        }
        let variance =
            intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
        Some(variance.sqrt() / mean)
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Behavioral analyzer detector.
pub struct BehavioralAnalyzer {
    enabled: bool,
    sessions: DashMap<IpAddr, SessionData>,
    config: BehavioralConfig,
    request_counter: AtomicU64,
}

impl BehavioralAnalyzer {
    pub fn new(config: BehavioralConfig) -> Self {
        Self {
            enabled: true,
            sessions: DashMap::new(),
            config,
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.config.session_timeout_seconds)
    }

    fn maybe_cleanup(&self) {
        let count = self.request_counter.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_EVERY == 0 {
            let timeout = self.session_timeout();
            self.sessions.retain(|_, s| !s.is_expired(timeout));
        }
    }

    /// Drop the least recently seen session when at capacity.
    fn make_room(&self, ip: &IpAddr) {
        if self.sessions.len() < self.config.max_sessions || self.sessions.contains_key(ip) {
            return;
        }
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|s| s.last_seen)
            .map(|s| *s.key());
        if let Some(oldest) = oldest {
            self.sessions.remove(&oldest);
        }
    }

    /// Record the request and score the session. Scores are (delta, reason).
    fn observe(&self, ip: IpAddr, path: &str) -> (u32, f64, Option<f64>, Vec<(f64, String)>) {
        self.maybe_cleanup();
        self.make_room(&ip);

        let mut session = self
            .sessions
            .entry(ip)
            .or_insert_with(|| SessionData::new(self.config.max_request_history));
        session.record_request(path);

        let count = session.request_count;
        let rpm = session.requests_per_minute();
        let cv = session.timing_regularity();
        if count < self.config.min_requests_for_scoring {
            return (count, rpm, cv, vec![]);
        }

        let mut findings = Vec::new();
        let threshold = f64::from(self.config.rpm_threshold.max(1));
        if rpm > threshold {
            findings.push((
                (rpm / threshold * 0.2).min(0.5),
                format!("High request rate ({rpm:.0}/min)"),
            ));
        }

        match cv {
            Some(cv) if cv < 0.1 => findings.push((0.3, "Very regular request timing".to_string())),
            Some(cv) if cv < 0.2 => findings.push((0.15, "Regular request timing".to_string())),
            _ => {}
        }

        if count > 10 {
            let diversity = session.paths_visited.len() as f64 / f64::from(count);
            if diversity > 0.9 {
                findings.push((0.2, "Systematic crawling of unique paths".to_string()));
            } else if diversity < 0.1 {
                findings.push((-0.1, "Repeated navigation of few paths".to_string()));
            }
        }

        let age = session.first_seen.elapsed().as_secs_f64();
        if age >= 1.0 && count > 100 && f64::from(count) / age > 2.0 {
            findings.push((0.15, "Sustained high request rate".to_string()));
        }

        (count, rpm, cv, findings)
    }
}

impl Default for BehavioralAnalyzer {
    fn default() -> Self {
        Self::new(BehavioralConfig::default())
    }
}

#[async_trait]
impl Detector for BehavioralAnalyzer {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        30
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn contribute(
        &self,
        state: &BlackboardState,
    ) -> Result<Vec<Contribution>, DetectorError> {
        let ctx = state.request.as_ref();
        let (count, rpm, cv, findings) = self.observe(ctx.client_ip, &ctx.path);

        let mut signals = Contribution::info(NAME, CATEGORY, "Behavioral signals")
            .with_signal(SIGNAL_REQUEST_COUNT, count)
            .with_signal(SIGNAL_RPM, rpm);
        if let Some(cv) = cv {
            signals = signals.with_signal(SIGNAL_TIMING_CV, cv);
        }

        let mut contributions = vec![signals];
        if count < self.config.min_requests_for_scoring {
            return Ok(contributions);
        }
        if findings.is_empty() {
            contributions.push(Contribution::new(
                NAME,
                CATEGORY,
                -0.2,
                0.5,
                "Human-like request pattern",
            ));
        }
        contributions.extend(
            findings
                .into_iter()
                .map(|(delta, reason)| Contribution::new(NAME, CATEGORY, delta, 1.0, reason)),
        );
        Ok(contributions)
    }
}
