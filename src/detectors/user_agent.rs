//! User-Agent analysis detector.
//!
//! Looks for bot keywords, automation tool signatures, outdated browser
//! versions and impossible platform combinations. Runs in wave 0 and publishes
//! `ua.*` signals for later detectors.

use super::{BlackboardState, Detector};
use crate::error::DetectorError;
use crate::evidence::Contribution;
use crate::score::BotCategory;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

pub const NAME: &str = "user_agent";
const CATEGORY: &str = "user_agent";

pub const SIGNAL_PRESENT: &str = "ua.present";
pub const SIGNAL_BOT_KEYWORD: &str = "ua.bot_keyword";
pub const SIGNAL_AUTOMATION: &str = "ua.automation";

/// Bot keywords with a suspicion score (0-100) and the category they imply.
static BOT_KEYWORDS: LazyLock<Vec<(&'static str, u8, BotCategory)>> = LazyLock::new(|| {
    use BotCategory::*;
    vec![
        ("bot", 40, Unknown),
        ("crawler", 40, Unknown),
        ("spider", 40, Unknown),
        ("scraper", 50, Malicious),
        ("curl", 50, Automation),
        ("wget", 50, Automation),
        ("httpie", 50, Automation),
        ("postman", 30, Automation),
        ("python-requests", 45, Automation),
        ("python-urllib", 45, Automation),
        ("go-http-client", 45, Automation),
        ("java/", 40, Automation),
        ("axios", 35, Automation),
        ("node-fetch", 40, Automation),
        ("okhttp", 35, Automation),
        ("sqlmap", 90, SecurityScanner),
        ("nikto", 90, SecurityScanner),
        ("nessus", 90, SecurityScanner),
        ("nmap", 90, SecurityScanner),
        ("masscan", 90, SecurityScanner),
        ("zgrab", 85, SecurityScanner),
        ("gobuster", 85, SecurityScanner),
        ("dirbuster", 85, SecurityScanner),
        ("nuclei", 85, SecurityScanner),
        ("headless", 60, HeadlessBrowser),
        ("phantomjs", 70, HeadlessBrowser),
        ("puppeteer", 60, HeadlessBrowser),
        ("playwright", 60, HeadlessBrowser),
        ("selenium", 60, HeadlessBrowser),
        ("gptbot", 45, AiAgent),
        ("claudebot", 45, AiAgent),
        ("ccbot", 45, AiAgent),
        ("bytespider", 55, AiAgent),
        ("ahrefsbot", 45, SeoTool),
        ("semrushbot", 45, SeoTool),
        ("mj12bot", 50, SeoTool),
        ("dotbot", 45, SeoTool),
        ("blexbot", 50, SeoTool),
    ]
});

static LEGACY_BROWSER: LazyLock<Vec<(Regex, &'static str, u8)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"MSIE|Trident").expect("valid regex: internet explorer"),
            "Internet Explorer User-Agent",
            40,
        ),
    ]
});

static IMPOSSIBLE_PATTERNS: LazyLock<Vec<(Regex, &'static str, u8)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)android.*windows|windows.*android")
                .expect("valid regex: android/windows"),
            "User-Agent claims Android and Windows",
            70,
        ),
        (
            Regex::new(r"(?i)iphone.*android|android.*iphone")
                .expect("valid regex: iphone/android"),
            "User-Agent claims iPhone and Android",
            70,
        ),
        (
            Regex::new(r"(?i)macintosh.*windows nt|windows nt.*macintosh")
                .expect("valid regex: mac/windows"),
            "User-Agent claims macOS and Windows",
            70,
        ),
        (
            Regex::new(r"Chrome.*Firefox.*Safari.*Edge").expect("valid regex: engines"),
            "User-Agent names too many browser engines",
            60,
        ),
    ]
});

/// Score from one check: suspicion (0-100), reason, implied bot type.
type Finding = (u8, String, Option<BotCategory>);

/// User-Agent analyzer detector.
pub struct UserAgentAnalyzer {
    enabled: bool,
    min_chrome_version: u32,
    min_firefox_version: u32,
}

impl UserAgentAnalyzer {
    pub fn new() -> Self {
        Self {
            enabled: true,
            min_chrome_version: 90,
            min_firefox_version: 90,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Strongest keyword match, plus whether an automation tool was named.
    fn check_keywords(&self, ua: &str) -> Option<(Finding, &'static str)> {
        let ua_lower = ua.to_lowercase();
        BOT_KEYWORDS
            .iter()
            .filter(|(keyword, _, _)| ua_lower.contains(keyword))
            .max_by_key(|(_, score, _)| *score)
            .map(|(keyword, score, category)| {
                (
                    (*score, format!("User-Agent contains '{keyword}'"), Some(*category)),
                    *keyword,
                )
            })
    }

    fn check_outdated(&self, ua: &str) -> Vec<Finding> {
        let mut findings: Vec<Finding> = LEGACY_BROWSER
            .iter()
            .filter(|(pattern, _, _)| pattern.is_match(ua))
            .map(|(_, reason, score)| (*score, reason.to_string(), None))
            .collect();

        let outdated = [
            ("Chrome/", self.min_chrome_version),
            ("Firefox/", self.min_firefox_version),
        ];
        for (prefix, minimum) in outdated {
            if let Some(version) = extract_version(ua, prefix) {
                if version > 0 && version < minimum {
                    findings.push((
                        30,
                        format!("Outdated browser {}{version}", prefix),
                        None,
                    ));
                }
            }
        }
        findings
    }

    fn check_impossible(&self, ua: &str) -> Vec<Finding> {
        IMPOSSIBLE_PATTERNS
            .iter()
            .filter(|(pattern, _, _)| pattern.is_match(ua))
            .map(|(_, reason, score)| (*score, reason.to_string(), None))
            .collect()
    }

    fn is_automation(keyword: &str) -> bool {
        matches!(
            keyword,
            "headless" | "phantomjs" | "puppeteer" | "playwright" | "selenium"
        )
    }
}

impl Default for UserAgentAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the major version following `prefix`.
fn extract_version(ua: &str, prefix: &str) -> Option<u32> {
    let idx = ua.find(prefix)?;
    let rest = &ua[idx + prefix.len()..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn contribution(finding: Finding) -> Contribution {
    let (score, reason, bot_type) = finding;
    let c = Contribution::new(NAME, CATEGORY, f64::from(score) / 100.0, 1.0, reason);
    match bot_type {
        Some(category) => c.with_bot(category, None),
        None => c,
    }
}

#[async_trait]
impl Detector for UserAgentAnalyzer {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn contribute(
        &self,
        state: &BlackboardState,
    ) -> Result<Vec<Contribution>, DetectorError> {
        let ua = match state.request.user_agent().map(str::trim) {
            Some(ua) if !ua.is_empty() => ua,
            Some(_) => {
                return Ok(vec![Contribution::new(NAME, CATEGORY, 0.75, 1.0, "Empty User-Agent")
                    .with_signal(SIGNAL_PRESENT, false)]);
            }
            None => {
                return Ok(vec![Contribution::new(NAME, CATEGORY, 0.8, 1.0, "Missing User-Agent")
                    .with_signal(SIGNAL_PRESENT, false)]);
            }
        };

        let mut findings = Vec::new();
        let mut signals = Contribution::info(NAME, CATEGORY, "User-Agent signals")
            .with_signal(SIGNAL_PRESENT, true);

        if let Some((finding, keyword)) = self.check_keywords(ua) {
            signals = signals
                .with_signal(SIGNAL_BOT_KEYWORD, keyword)
                .with_signal(SIGNAL_AUTOMATION, Self::is_automation(keyword));
            findings.push(finding);
        }
        findings.extend(self.check_outdated(ua));
        findings.extend(self.check_impossible(ua));
        if ua.len() < 20 {
            findings.push((20, "Very short User-Agent".to_string(), None));
        }

        let mut contributions = vec![signals];
        if findings.is_empty() {
            contributions.push(Contribution::new(
                NAME,
                CATEGORY,
                -0.4,
                0.8,
                "Browser-like User-Agent",
            ));
        } else {
            contributions.extend(findings.into_iter().map(contribution));
        }
        Ok(contributions)
    }
}
