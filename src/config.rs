use crate::error::Result;
use crate::scrapers::extract::MAX_PER_PAGE;
use crate::store::SettingsStore;
use ::config::Config;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Prefix shared by every scraper key in the settings table
pub const SETTING_PREFIX: &str = "lbc_";

/// Settings key holding the persisted anti-bot cookie value
pub const TOKEN_SETTING: &str = "lbc_datadome";

/// Every key the scraper understands. Keys without a default are optional.
pub const KNOWN_KEYS: &[&str] = &[
    "lbc_search_url",
    "lbc_headless",
    "lbc_max_listings",
    "lbc_per_page",
    "lbc_fetch_details",
    "lbc_details_limit",
    "lbc_details_sleep_ms",
    "lbc_cooldown_hours",
    TOKEN_SETTING,
    "lbc_debug",
    "lbc_driver",
    "lbc_max_attempts",
    "lbc_retry_delay_secs",
    "lbc_nav_timeout_secs",
    "lbc_captcha_resolver",
    "lbc_captcha_notification_path",
    "lbc_block_phrases",
    "lbc_captcha_phrases",
];

/// Hard-coded fallbacks for keys absent from the settings table
pub fn default_settings() -> BTreeMap<String, String> {
    [
        ("lbc_search_url", "https://www.leboncoin.fr/recherche?category=11"),
        ("lbc_headless", "true"),
        ("lbc_max_listings", "10"),
        ("lbc_per_page", "10"),
        ("lbc_fetch_details", "false"),
        ("lbc_details_limit", "5"),
        ("lbc_details_sleep_ms", "1500"),
        ("lbc_cooldown_hours", "0"),
        ("lbc_debug", "false"),
        ("lbc_driver", "chrome"),
        ("lbc_max_attempts", "3"),
        ("lbc_retry_delay_secs", "10"),
        ("lbc_nav_timeout_secs", "30"),
        ("lbc_captcha_resolver", "terminal"),
        ("lbc_captcha_notification_path", "debug/captcha-notification.json"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Environment variable consulted for a settings key
pub fn env_name(key: &str) -> String {
    key.to_uppercase()
}

/// Layer defaults, environment and stored overrides into one map.
///
/// Stored overrides win over the environment, which wins over defaults.
/// Blank values count as absent.
pub fn merge(
    defaults: &BTreeMap<String, String>,
    overrides: &HashMap<String, String>,
    env: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = defaults.clone();

    for key in KNOWN_KEYS {
        if let Some(value) = env.get(&env_name(key)).filter(|v| !v.trim().is_empty()) {
            merged.insert(key.to_string(), value.clone());
        }
    }

    for (key, value) in overrides {
        if !value.trim().is_empty() {
            merged.insert(key.clone(), value.clone());
        }
    }

    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Chrome,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    Terminal,
    File,
    None,
}

/// Effective configuration for one scraper run
#[derive(Debug, Clone, Deserialize)]
pub struct ScraperConfig {
    pub search_url: String,
    pub headless: bool,
    pub max_listings: u32,
    pub per_page: u32,
    pub fetch_details: bool,
    pub details_limit: u32,
    pub details_sleep_ms: u64,
    pub cooldown_hours: u32,
    #[serde(default)]
    pub datadome: Option<String>,
    pub debug: bool,
    pub driver: String,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub nav_timeout_secs: u64,
    pub captcha_resolver: String,
    pub captcha_notification_path: String,
    #[serde(default)]
    pub block_phrases: Option<String>,
    #[serde(default)]
    pub captcha_phrases: Option<String>,
}

impl ScraperConfig {
    /// Deserialize a merged settings map into typed configuration
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Result<Self> {
        let mut builder = Config::builder();
        for (key, value) in settings {
            let Some(field) = key.strip_prefix(SETTING_PREFIX) else {
                continue;
            };
            if value.trim().is_empty() {
                continue;
            }
            builder = builder.set_override(field, value.as_str())?;
        }

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn driver_kind(&self) -> DriverKind {
        match self.driver.trim().to_lowercase().as_str() {
            "http" => DriverKind::Http,
            _ => DriverKind::Chrome,
        }
    }

    pub fn resolver_kind(&self) -> ResolverKind {
        match self.captcha_resolver.trim().to_lowercase().as_str() {
            "file" => ResolverKind::File,
            "none" => ResolverKind::None,
            _ => ResolverKind::Terminal,
        }
    }

    /// Cards taken from one index page, never more than the extractor keeps
    pub fn page_size(&self) -> u32 {
        self.per_page.clamp(1, MAX_PER_PAGE as u32)
    }

    /// Number of index pages needed to reach `max_listings`
    pub fn total_pages(&self) -> u32 {
        self.max_listings.max(1).div_ceil(self.page_size())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn nav_timeout(&self) -> Duration {
        Duration::from_secs(self.nav_timeout_secs.max(1))
    }

    pub fn details_sleep(&self) -> Duration {
        Duration::from_millis(self.details_sleep_ms)
    }
}

#[cfg(test)]
impl ScraperConfig {
    /// Built-in defaults with no sleeping between attempts
    pub fn for_tests() -> Self {
        let mut config = Self::from_settings(&default_settings()).unwrap();
        config.retry_delay_secs = 0;
        config.details_sleep_ms = 0;
        config.captcha_resolver = "none".to_string();
        config
    }
}

/// Splits a comma separated override list, if one was configured
pub fn phrase_list(raw: Option<&str>) -> Option<Vec<String>> {
    let phrases: Vec<String> = raw?
        .split(',')
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();
    (!phrases.is_empty()).then_some(phrases)
}

/// Builds the effective configuration from defaults, environment and the settings store
pub struct ConfigLoader {
    defaults: BTreeMap<String, String>,
    env: HashMap<String, String>,
}

impl ConfigLoader {
    /// Loader layered over the current process environment
    pub fn new() -> Self {
        Self::with_env(std::env::vars().collect())
    }

    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self {
            defaults: default_settings(),
            env,
        }
    }

    /// Merge stored overrides; an unreadable store falls back to defaults and environment
    pub fn load<S: SettingsStore + ?Sized>(&self, store: &S) -> Result<ScraperConfig> {
        let overrides = match store.load_settings() {
            Ok(settings) => settings
                .into_iter()
                .filter(|(key, _)| key.starts_with(SETTING_PREFIX))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not read scraper settings, using defaults");
                HashMap::new()
            }
        };

        let merged = merge(&self.defaults, &overrides, &self.env);
        debug!(keys = merged.len(), "Effective scraper settings resolved");
        ScraperConfig::from_settings(&merged)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
