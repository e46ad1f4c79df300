//! Pattern reputation.
//!
//! A reputation is a decaying bot score for a request pattern (an IP range, a
//! user-agent fingerprint, ...). Scores live in [0, 1] with 0.5 as neutral and
//! drive a lifecycle state that policies can react to.

pub mod cache;
pub mod maintenance;
pub mod store;

pub use cache::ReputationCache;
pub use maintenance::MaintenanceReport;
pub use store::{NoopReputationStore, ReputationStore};

use crate::config::ReputationConfig;
use crate::detectors::DetectionContext;
use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::sync::Mutex;

/// Signal carrying the worst reputation state seen for the request.
pub const REPUTATION_STATE_SIGNAL: &str = "reputation.state";
/// Signal carrying the strongest reputation score seen for the request.
pub const REPUTATION_SCORE_SIGNAL: &str = "reputation.score";

/// Neutral score.
pub const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    IpRange,
    UserAgent,
    HeaderFingerprint,
    Behavioral,
    Custom,
}

/// Lifecycle state of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationState {
    Neutral,
    Suspect,
    ConfirmedBad,
    ConfirmedGood,
    ManuallyBlocked,
    ManuallyAllowed,
}

impl ReputationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReputationState::Neutral => "neutral",
            ReputationState::Suspect => "suspect",
            ReputationState::ConfirmedBad => "confirmed_bad",
            ReputationState::ConfirmedGood => "confirmed_good",
            ReputationState::ManuallyBlocked => "manually_blocked",
            ReputationState::ManuallyAllowed => "manually_allowed",
        }
    }

    /// Severity used to pick the worst state across several patterns.
    pub fn severity(&self) -> u8 {
        match self {
            ReputationState::ManuallyAllowed => 0,
            ReputationState::ConfirmedGood => 1,
            ReputationState::Neutral => 2,
            ReputationState::Suspect => 3,
            ReputationState::ConfirmedBad => 4,
            ReputationState::ManuallyBlocked => 5,
        }
    }

    /// Derive the automatic state for a score and support count.
    pub fn derive(score: f64, support: f64, config: &ReputationConfig) -> Self {
        if score >= config.confirmed_bad_score && support >= config.confirm_min_support {
            ReputationState::ConfirmedBad
        } else if score <= config.confirmed_good_score && support >= config.confirm_min_support {
            ReputationState::ConfirmedGood
        } else if score >= config.suspect_score {
            ReputationState::Suspect
        } else {
            ReputationState::Neutral
        }
    }
}

impl fmt::Display for ReputationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Historical trust score for one pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternReputation {
    pub pattern_id: String,
    pub pattern_type: PatternType,
    /// Raw pattern (CIDR, user-agent string, ...)
    pub pattern: String,
    /// Bot score in [0, 1], 0.5 is neutral
    pub bot_score: f64,
    /// Accumulated observation weight
    pub support: f64,
    pub state: ReputationState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    /// Set by manual block/allow; pins the state and disables decay
    pub is_manual: bool,
}

impl PatternReputation {
    pub fn neutral(
        pattern_id: impl Into<String>,
        pattern_type: PatternType,
        pattern: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            pattern_type,
            pattern: pattern.into(),
            bot_score: NEUTRAL_SCORE,
            support: 0.0,
            state: ReputationState::Neutral,
            first_seen: now,
            last_seen: now,
            state_changed_at: now,
            is_manual: false,
        }
    }

    /// Copy with a new score, re-deriving the state unless manually pinned.
    pub fn with_score(&self, score: f64, config: &ReputationConfig, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.bot_score = if score.is_nan() { NEUTRAL_SCORE } else { score.clamp(0.0, 1.0) };
        if !next.is_manual {
            next.set_state(ReputationState::derive(next.bot_score, next.support, config), now);
        }
        next
    }

    /// Fold one classification outcome into the score.
    pub fn observe(
        &self,
        bot_probability: f64,
        config: &ReputationConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let target = bot_probability.clamp(0.0, 1.0);
        let score = self.bot_score + config.learning_rate * (target - self.bot_score);
        let mut next = self.clone();
        next.support += 1.0;
        next.last_seen = now;
        next.with_score(score, config, now)
    }

    /// Pull the score toward neutral for the time elapsed since `since`.
    pub fn decayed(
        &self,
        since: DateTime<Utc>,
        config: &ReputationConfig,
        now: DateTime<Utc>,
    ) -> Self {
        if self.is_manual || config.decay_half_life_secs == 0 {
            return self.clone();
        }
        let elapsed = (now - since).num_milliseconds().max(0) as f64 / 1000.0;
        if elapsed <= 0.0 {
            return self.clone();
        }
        let factor = 0.5f64.powf(elapsed / config.decay_half_life_secs as f64);
        let score = NEUTRAL_SCORE + (self.bot_score - NEUTRAL_SCORE) * factor;
        self.with_score(score, config, now)
    }

    /// Pin the pattern to a manual state.
    pub fn manual(&self, state: ReputationState, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.is_manual = true;
        next.bot_score = match state {
            ReputationState::ManuallyBlocked => 1.0,
            ReputationState::ManuallyAllowed => 0.0,
            _ => next.bot_score,
        };
        next.set_state(state, now);
        next
    }

    fn set_state(&mut self, state: ReputationState, now: DateTime<Utc>) {
        if self.state != state {
            self.state = state;
            self.state_changed_at = now;
        }
    }
}

/// Source of "now" for reputation bookkeeping.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Identity of a pattern derived from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternKey {
    pub id: String,
    pub pattern_type: PatternType,
    pub pattern: String,
}

/// Reputation keys for a request: its IP range and, when present, its user agent.
pub fn pattern_keys(ctx: &DetectionContext) -> Vec<PatternKey> {
    let mut keys = vec![ip_range_key(ctx.client_ip)];
    if let Some(ua) = ctx.user_agent().filter(|ua| !ua.trim().is_empty()) {
        keys.push(user_agent_key(ua));
    }
    keys
}

pub fn ip_range_key(ip: IpAddr) -> PatternKey {
    let range = match ip {
        IpAddr::V4(v4) => Ipv4Net::new(v4, 24)
            .map(|net| net.trunc().to_string())
            .unwrap_or_else(|_| v4.to_string()),
        IpAddr::V6(v6) => Ipv6Net::new(v6, 64)
            .map(|net| net.trunc().to_string())
            .unwrap_or_else(|_| v6.to_string()),
    };
    PatternKey {
        id: format!("ip:{range}"),
        pattern_type: PatternType::IpRange,
        pattern: range,
    }
}

pub fn user_agent_key(user_agent: &str) -> PatternKey {
    let digest = Sha256::digest(user_agent.trim().as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    PatternKey {
        id: format!("ua:{hex}"),
        pattern_type: PatternType::UserAgent,
        pattern: user_agent.trim().to_string(),
    }
}
