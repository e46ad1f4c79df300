//! Bot type classification carried by contributions and evidence.

use serde::{Deserialize, Serialize};

/// Bot category classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotCategory {
    /// Likely a human user
    Human,
    /// Search engine crawler (Google, Bing, etc.)
    SearchEngine,
    /// Social media crawler (Facebook, Twitter, etc.)
    SocialMedia,
    /// Monitoring service (Pingdom, UptimeRobot, etc.)
    Monitoring,
    /// SEO tool (Ahrefs, Semrush, etc.)
    SeoTool,
    /// Security scanner
    SecurityScanner,
    /// Known malicious bot
    Malicious,
    /// Automation tool (curl, wget, scripts)
    Automation,
    /// Headless browser (Puppeteer, Selenium, etc.)
    HeadlessBrowser,
    /// AI crawler or LLM-driven agent
    AiAgent,
    /// Unknown/unclassified
    #[default]
    Unknown,
}

impl BotCategory {
    /// Returns the category as a string for headers and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BotCategory::Human => "human",
            BotCategory::SearchEngine => "search_engine",
            BotCategory::SocialMedia => "social_media",
            BotCategory::Monitoring => "monitoring",
            BotCategory::SeoTool => "seo_tool",
            BotCategory::SecurityScanner => "security_scanner",
            BotCategory::Malicious => "malicious",
            BotCategory::Automation => "automation",
            BotCategory::HeadlessBrowser => "headless_browser",
            BotCategory::AiAgent => "ai_agent",
            BotCategory::Unknown => "unknown",
        }
    }

    /// Parse a category label from a bot list. Unrecognised labels map to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "human" => BotCategory::Human,
            "search_engine" => BotCategory::SearchEngine,
            "social_media" => BotCategory::SocialMedia,
            "monitoring" => BotCategory::Monitoring,
            "seo_tool" => BotCategory::SeoTool,
            "security_scanner" => BotCategory::SecurityScanner,
            "malicious" => BotCategory::Malicious,
            "automation" => BotCategory::Automation,
            "headless_browser" => BotCategory::HeadlessBrowser,
            "ai_agent" => BotCategory::AiAgent,
            _ => BotCategory::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_category_as_str() {
        assert_eq!(BotCategory::Human.as_str(), "human");
        assert_eq!(BotCategory::SearchEngine.as_str(), "search_engine");
        assert_eq!(BotCategory::Malicious.as_str(), "malicious");
    }

    #[test]
    fn test_from_label_round_trips_as_str() {
        for category in [
            BotCategory::SearchEngine,
            BotCategory::SecurityScanner,
            BotCategory::HeadlessBrowser,
            BotCategory::AiAgent,
        ] {
            assert_eq!(BotCategory::from_label(category.as_str()), category);
        }
        assert_eq!(BotCategory::from_label("Search_Engine"), BotCategory::SearchEngine);
        assert_eq!(BotCategory::from_label("toaster"), BotCategory::Unknown);
    }
}
