//! Header analysis detector.
//!
//! Flags missing browser headers, automation tool markers and header sets
//! that contradict the claimed browser.

use super::{BlackboardState, DetectionContext, Detector};
use crate::error::DetectorError;
use crate::evidence::Contribution;
use crate::score::BotCategory;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

pub const NAME: &str = "headers";
const CATEGORY: &str = "headers";

pub const SIGNAL_MISSING_COUNT: &str = "headers.missing_count";
pub const SIGNAL_AUTOMATION: &str = "headers.automation";

/// Headers that real browsers send on page loads.
const BROWSER_HEADERS: [&str; 3] = ["accept", "accept-language", "accept-encoding"];

/// Headers injected by automation frameworks.
const AUTOMATION_HEADERS: [&str; 6] = [
    "x-selenium",
    "x-puppeteer",
    "x-playwright",
    "x-automation",
    "x-headless",
    "x-requested-with",
];

static SUSPICIOUS_VALUES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)^selenium").expect("valid regex: selenium"),
            "Selenium marker in header value",
        ),
        (
            Regex::new(r"(?i)^puppeteer").expect("valid regex: puppeteer"),
            "Puppeteer marker in header value",
        ),
        (
            Regex::new(r"(?i)^playwright").expect("valid regex: playwright"),
            "Playwright marker in header value",
        ),
        (
            Regex::new(r"(?i)headless").expect("valid regex: headless"),
            "Headless marker in header value",
        ),
    ]
});

/// Header analyzer detector.
pub struct HeaderAnalyzer {
    enabled: bool,
}

impl HeaderAnalyzer {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn missing_headers(ctx: &DetectionContext) -> Vec<&'static str> {
        BROWSER_HEADERS
            .iter()
            .copied()
            .filter(|h| !ctx.headers.contains_key(*h))
            .collect()
    }

    /// Automation header names and suspicious header values.
    fn automation_markers(ctx: &DetectionContext) -> Vec<String> {
        let mut markers: Vec<String> = AUTOMATION_HEADERS
            .iter()
            .filter(|h| ctx.headers.contains_key(**h))
            .map(|h| format!("Automation header {h}"))
            .collect();

        for values in ctx.headers.values() {
            for value in values {
                for (pattern, reason) in SUSPICIOUS_VALUES.iter() {
                    if pattern.is_match(value) {
                        markers.push(reason.to_string());
                    }
                }
            }
        }
        markers.sort();
        markers.dedup();
        markers
    }

    /// Smaller inconsistencies: generic Accept, tiny Accept-Language, modern
    /// Chrome without client hints.
    fn inconsistencies(ctx: &DetectionContext) -> Vec<(f64, &'static str)> {
        let mut found = Vec::new();

        if let Some(accept) = ctx.header("accept") {
            if accept.is_empty() || accept == "*/*" {
                found.push((0.1, "Generic Accept header"));
            }
        }
        if let Some(lang) = ctx.header("accept-language") {
            if lang.len() < 2 {
                found.push((0.1, "Suspicious Accept-Language"));
            }
        }

        let ua = ctx.user_agent().unwrap_or("");
        let claims_chrome = ua.contains("Chrome/") && !ua.contains("Chromium/");
        if claims_chrome && !ctx.headers.contains_key("sec-ch-ua") {
            if extract_chrome_version(ua).is_some_and(|v| v >= 89) {
                found.push((0.2, "Modern Chrome without sec-ch-ua"));
            }
        }
        found
    }
}

impl Default for HeaderAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Detector for HeaderAnalyzer {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        20
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn contribute(
        &self,
        state: &BlackboardState,
    ) -> Result<Vec<Contribution>, DetectorError> {
        let ctx = state.request.as_ref();
        let missing = Self::missing_headers(ctx);
        let markers = Self::automation_markers(ctx);

        let mut contributions = vec![Contribution::info(NAME, CATEGORY, "Header signals")
            .with_signal(SIGNAL_MISSING_COUNT, missing.len() as u64)
            .with_signal(SIGNAL_AUTOMATION, !markers.is_empty())];

        if !missing.is_empty() {
            // 0.15 per missing header, capped at 0.45
            let delta = (0.15 * missing.len() as f64).min(0.45);
            contributions.push(Contribution::new(
                NAME,
                CATEGORY,
                delta,
                1.0,
                format!("Missing browser headers: {}", missing.join(", ")),
            ));
        }

        for marker in markers {
            contributions.push(
                Contribution::new(NAME, CATEGORY, 0.6, 1.0, marker)
                    .with_bot(BotCategory::HeadlessBrowser, None),
            );
        }

        for (delta, reason) in Self::inconsistencies(ctx) {
            contributions.push(Contribution::new(NAME, CATEGORY, delta, 0.5, reason));
        }

        if contributions.len() == 1 {
            contributions.push(Contribution::new(
                NAME,
                CATEGORY,
                -0.3,
                0.8,
                "Complete browser header set",
            ));
        }
        Ok(contributions)
    }
}

fn extract_chrome_version(ua: &str) -> Option<u32> {
    let rest = &ua[ua.find("Chrome/")? + "Chrome/".len()..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn state(headers: &[(&str, &str)]) -> BlackboardState {
        let ctx = headers.iter().fold(
            DetectionContext::new("127.0.0.1".parse().unwrap(), "/"),
            |ctx, (k, v)| ctx.with_header(k, *v),
        );
        BlackboardState::initial(Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_browser_headers() {
        let analyzer = HeaderAnalyzer::new();
        let result = analyzer
            .contribute(&state(&[
                ("accept", "text/html,application/xhtml+xml"),
                ("accept-language", "en-US,en;q=0.9"),
                ("accept-encoding", "gzip, deflate, br"),
                ("user-agent", "Mozilla/5.0 Chrome/120"),
                ("sec-ch-ua", "\"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\""),
            ]))
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert!(result[1].confidence_delta < 0.0);
        assert_eq!(result[0].signals[SIGNAL_MISSING_COUNT], 0);
        assert_eq!(result[0].signals[SIGNAL_AUTOMATION], false);
    }

    #[tokio::test]
    async fn test_missing_headers() {
        let analyzer = HeaderAnalyzer::new();
        let result = analyzer
            .contribute(&state(&[("user-agent", "curl/7.88.0")]))
            .await
            .unwrap();

        assert_eq!(result[0].signals[SIGNAL_MISSING_COUNT], 3);
        let missing = result.iter().find(|c| c.reason.starts_with("Missing")).unwrap();
        assert!((missing.confidence_delta - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_automation_headers() {
        let analyzer = HeaderAnalyzer::new();
        let result = analyzer
            .contribute(&state(&[
                ("x-selenium", "true"),
                ("accept", "text/html"),
                ("accept-language", "en"),
                ("accept-encoding", "gzip"),
            ]))
            .await
            .unwrap();

        assert_eq!(result[0].signals[SIGNAL_AUTOMATION], true);
        assert!(result.iter().any(|c| c.reason.contains("x-selenium")
            && c.bot_type == Some(BotCategory::HeadlessBrowser)));
    }

    #[tokio::test]
    async fn test_chrome_without_client_hints() {
        let analyzer = HeaderAnalyzer::new();
        let result = analyzer
            .contribute(&state(&[
                ("accept", "text/html"),
                ("accept-language", "en-US"),
                ("accept-encoding", "gzip"),
                ("user-agent", "Mozilla/5.0 Chrome/120.0.0.0"),
            ]))
            .await
            .unwrap();
        assert!(result.iter().any(|c| c.reason.contains("sec-ch-ua")));
    }

    #[test]
    fn test_chrome_version_extraction() {
        assert_eq!(extract_chrome_version("Mozilla/5.0 Chrome/120.0.0.0"), Some(120));
        assert_eq!(extract_chrome_version("Mozilla/5.0 Chrome/89"), Some(89));
        assert_eq!(extract_chrome_version("Mozilla/5.0 Firefox/120"), None);
    }
}
