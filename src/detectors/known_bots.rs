//! Known bot database detector.
//!
//! Matches the User-Agent against known crawlers and verifies the claim by IP
//! range or forward-confirmed reverse DNS. A verified crawler or a known bad
//! tool ends the pipeline with a verdict. Runs once `ua.present` is true.

use super::{user_agent, BlackboardState, DetectionContext, Detector};
use crate::config::DetectorConfig;
use crate::error::{ConfigError, DetectorError};
use crate::evidence::{Contribution, EarlyExitVerdict};
use crate::score::BotCategory;
use crate::signals::TriggerCondition;
use async_trait::async_trait;
use ipnet::IpNet;
use moka::future::Cache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

pub const NAME: &str = "known_bots";
const CATEGORY: &str = "known_bots";

pub const SIGNAL_VERIFIED: &str = "known_bots.verified";
pub const SIGNAL_FAKE: &str = "known_bots.fake";

/// A known bot definition as stored in a bot list file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownBot {
    /// Bot name (e.g., "Googlebot")
    pub name: String,

    /// Bot category label (`search_engine`, `monitoring`, ...)
    pub category: String,

    /// Case-insensitive User-Agent substrings
    pub ua_patterns: Vec<String>,

    /// IP ranges (CIDR notation)
    #[serde(default)]
    pub ip_ranges: Vec<String>,

    /// Reverse DNS suffix for verification
    #[serde(default)]
    pub verify_dns: Option<String>,

    /// False for bots that should be blocked once identified
    #[serde(default = "default_true")]
    pub is_good: bool,
}

fn default_true() -> bool {
    true
}

/// Bad User-Agent pattern as stored in a pattern file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadPattern {
    pub pattern: String,
    pub reason: String,
}

struct CompiledBot {
    name: String,
    category: BotCategory,
    ua_patterns: Vec<Regex>,
    ip_ranges: Vec<IpNet>,
    verify_dns: Option<String>,
    is_good: bool,
}

struct CompiledPattern {
    pattern: Regex,
    reason: String,
}

/// Outcome of identity verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// UA claim confirmed
    Verified { name: String, category: BotCategory, is_good: bool },
    /// UA claims a known bot but the source does not match
    Fake { name: String },
    /// Not in the database
    Unknown,
}

/// Known bot database.
pub struct KnownBotDatabase {
    enabled: bool,
    bots: Vec<CompiledBot>,
    bad_patterns: Vec<CompiledPattern>,
    verification_cache: Cache<(IpAddr, String), Verification>,
    resolver: TokioAsyncResolver,
    verify_identity: bool,
}

impl KnownBotDatabase {
    /// Built-in database with a default verification cache.
    pub fn with_defaults(verify_identity: bool) -> Self {
        Self::build(
            default_bots(),
            default_bad_patterns(),
            verify_identity,
            10_000,
            Duration::from_secs(3600),
        )
    }

    /// Database from detector configuration, reading bot lists from files
    /// when configured.
    pub fn from_config(config: &DetectorConfig) -> Result<Self, ConfigError> {
        let bots = match &config.good_bots_path {
            Some(path) => load_json::<KnownBot>(path)?
                .into_iter()
                .filter_map(compile_bot)
                .collect(),
            None => default_bots(),
        };
        let bad_patterns = match &config.bad_patterns_path {
            Some(path) => load_json::<BadPattern>(path)?
                .into_iter()
                .filter_map(|p| {
                    Regex::new(&p.pattern).ok().map(|pattern| CompiledPattern {
                        pattern,
                        reason: p.reason,
                    })
                })
                .collect(),
            None => default_bad_patterns(),
        };

        let mut db = Self::build(
            bots,
            bad_patterns,
            config.verify_identity,
            config.verification_cache_size,
            Duration::from_secs(config.verification_cache_ttl_seconds),
        );
        db.enabled = config.known_bot_lookup;
        Ok(db)
    }

    fn build(
        bots: Vec<CompiledBot>,
        bad_patterns: Vec<CompiledPattern>,
        verify_identity: bool,
        cache_size: u64,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            enabled: true,
            bots,
            bad_patterns,
            verification_cache: Cache::builder()
                .max_capacity(cache_size)
                .time_to_live(cache_ttl)
                .build(),
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            verify_identity,
        }
    }

    /// Identify and verify the bot a request claims to be.
    pub async fn check(&self, ctx: &DetectionContext) -> Verification {
        let Some(ua) = ctx.user_agent() else {
            return Verification::Unknown;
        };

        let cache_key = (ctx.client_ip, ua.to_string());
        if let Some(cached) = self.verification_cache.get(&cache_key).await {
            return cached;
        }

        let result = match self.bots.iter().find(|b| b.ua_patterns.iter().any(|p| p.is_match(ua))) {
            Some(bot) if self.verify_identity => self.verify(bot, ctx.client_ip).await,
            Some(bot) => verified(bot),
            None => Verification::Unknown,
        };
        self.verification_cache.insert(cache_key, result.clone()).await;
        result
    }

    async fn verify(&self, bot: &CompiledBot, ip: IpAddr) -> Verification {
        if bot.ip_ranges.iter().any(|range| range.contains(&ip)) {
            return verified(bot);
        }

        let Some(suffix) = &bot.verify_dns else {
            // Ranges are authoritative when no DNS suffix is published
            return if bot.ip_ranges.is_empty() {
                verified(bot)
            } else {
                Verification::Fake { name: bot.name.clone() }
            };
        };

        if let Ok(hostnames) = self.resolver.reverse_lookup(ip).await {
            for hostname in hostnames.iter() {
                let host = hostname.to_string();
                let host = host.trim_end_matches('.');
                if !host.ends_with(suffix.as_str()) {
                    continue;
                }
                // Forward-confirm: the hostname must resolve back to the IP
                if let Ok(ips) = self.resolver.lookup_ip(host).await {
                    if ips.iter().any(|resolved| resolved == ip) {
                        return verified(bot);
                    }
                }
            }
        }
        debug!(bot = %bot.name, ip = %ip, "Bot identity verification failed");
        Verification::Fake { name: bot.name.clone() }
    }

    /// First bad pattern matching the User-Agent.
    pub fn check_bad_patterns(&self, ua: &str) -> Option<&str> {
        self.bad_patterns
            .iter()
            .find(|p| p.pattern.is_match(ua))
            .map(|p| p.reason.as_str())
    }
}

fn verified(bot: &CompiledBot) -> Verification {
    Verification::Verified {
        name: bot.name.clone(),
        category: bot.category,
        is_good: bot.is_good,
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn compile_bot(bot: KnownBot) -> Option<CompiledBot> {
    let ua_patterns: Vec<Regex> = bot
        .ua_patterns
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){}", regex::escape(p))).ok())
        .collect();
    if ua_patterns.is_empty() {
        return None;
    }
    Some(CompiledBot {
        category: BotCategory::from_label(&bot.category),
        ip_ranges: bot.ip_ranges.iter().filter_map(|r| r.parse().ok()).collect(),
        name: bot.name,
        ua_patterns,
        verify_dns: bot.verify_dns,
        is_good: bot.is_good,
    })
}

fn known(
    name: &str,
    category: &str,
    patterns: &[&str],
    ranges: &[&str],
    dns: Option<&str>,
) -> KnownBot {
    KnownBot {
        name: name.to_string(),
        category: category.to_string(),
        ua_patterns: patterns.iter().map(|p| p.to_string()).collect(),
        ip_ranges: ranges.iter().map(|r| r.to_string()).collect(),
        verify_dns: dns.map(str::to_string),
        is_good: true,
    }
}

fn default_bots() -> Vec<CompiledBot> {
    [
        known(
            "Googlebot",
            "search_engine",
            &["googlebot", "google-inspectiontool", "googleother"],
            &[
                "66.249.64.0/19",
                "64.233.160.0/19",
                "66.102.0.0/20",
                "72.14.192.0/18",
                "74.125.0.0/16",
                "209.85.128.0/17",
                "216.239.32.0/19",
            ],
            Some(".googlebot.com"),
        ),
        known(
            "Bingbot",
            "search_engine",
            &["bingbot", "msnbot"],
            &[
                "40.77.167.0/24",
                "207.46.0.0/16",
                "65.52.0.0/14",
                "157.55.0.0/16",
                "157.56.0.0/16",
            ],
            Some(".search.msn.com"),
        ),
        known(
            "DuckDuckBot",
            "search_engine",
            &["duckduckbot"],
            &[
                "20.191.45.212/32",
                "40.88.21.235/32",
                "40.76.173.151/32",
                "40.76.163.7/32",
                "20.185.79.47/32",
            ],
            None,
        ),
        known("Facebookbot", "social_media", &["facebookexternalhit", "facebot"], &[], None),
        known("Twitterbot", "social_media", &["twitterbot"], &[], None),
        known("UptimeRobot", "monitoring", &["uptimerobot"], &[], None),
        known("Pingdom", "monitoring", &["pingdom"], &[], None),
    ]
    .into_iter()
    .filter_map(compile_bot)
    .collect()
}

fn default_bad_patterns() -> Vec<CompiledPattern> {
    [
        (r"(?i)sqlmap", "Security scanner sqlmap"),
        (r"(?i)nikto", "Security scanner Nikto"),
        (r"(?i)nessus", "Security scanner Nessus"),
        (r"(?i)masscan", "Port scanner masscan"),
        (r"(?i)zgrab", "Security scanner zgrab"),
        (r"(?i)gobuster", "Directory scanner gobuster"),
        (r"(?i)nuclei", "Vulnerability scanner nuclei"),
    ]
    .into_iter()
    .map(|(pattern, reason)| CompiledPattern {
        pattern: Regex::new(pattern).expect("valid regex: bad pattern"),
        reason: reason.to_string(),
    })
    .collect()
}

#[async_trait]
impl Detector for KnownBotDatabase {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        5
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn execution_timeout(&self) -> Duration {
        if self.verify_identity {
            Duration::from_millis(250)
        } else {
            super::DEFAULT_DETECTOR_TIMEOUT
        }
    }

    fn trigger_conditions(&self) -> Vec<TriggerCondition> {
        vec![TriggerCondition::equals(user_agent::SIGNAL_PRESENT, true)]
    }

    async fn contribute(
        &self,
        state: &BlackboardState,
    ) -> Result<Vec<Contribution>, DetectorError> {
        let ctx = state.request.as_ref();
        let Some(ua) = ctx.user_agent() else {
            return Ok(vec![]);
        };

        if let Some(reason) = self.check_bad_patterns(ua) {
            return Ok(vec![Contribution::verdict(
                NAME,
                CATEGORY,
                EarlyExitVerdict::VerifiedBadBot,
                reason,
            )
            .with_bot(BotCategory::SecurityScanner, None)]);
        }

        let contribution = match self.check(ctx).await {
            Verification::Verified { name, category, is_good } => {
                let verdict = if is_good {
                    EarlyExitVerdict::VerifiedGoodBot
                } else {
                    EarlyExitVerdict::VerifiedBadBot
                };
                Contribution::verdict(NAME, CATEGORY, verdict, format!("Verified {name}"))
                    .with_bot(category, Some(name.clone()))
                    .with_signal(SIGNAL_VERIFIED, name)
            }
            Verification::Fake { name } => Contribution::verdict(
                NAME,
                CATEGORY,
                EarlyExitVerdict::VerifiedBadBot,
                format!("Fake {name}: source verification failed"),
            )
            .with_bot(BotCategory::Malicious, Some(name.clone()))
            .with_signal(SIGNAL_FAKE, name),
            Verification::Unknown => Contribution::info(NAME, CATEGORY, "Not a known bot"),
        };
        Ok(vec![contribution])
    }
}
