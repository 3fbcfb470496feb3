use crate::config::TOKEN_SETTING;
use crate::scrapers::traits::PageDriver;
use crate::store::SettingsStore;
use rand::Rng;
use tracing::{debug, info, warn};

/// Cookie the anti-bot service uses to remember a cleared visitor
pub const TOKEN_COOKIE: &str = "datadome";
pub const TOKEN_DOMAIN: &str = ".leboncoin.fr";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.2420.81",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

pub const ACCEPT_LANGUAGE: &str = "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7";

const HEADERS: &[(&str, &str)] = &[
    ("Accept-Language", ACCEPT_LANGUAGE),
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    ),
    ("Accept-Encoding", "gzip, deflate, br"),
    ("Upgrade-Insecure-Requests", "1"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
];

/// Injected before any page script runs
pub const EVASION_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'languages', { get: () => ['fr-FR', 'fr', 'en-US', 'en'] });
window.chrome = window.chrome || { runtime: {} };
"#;

/// Browsing identity kept for the whole run
#[derive(Debug, Clone)]
pub struct SessionFingerprint {
    user_agent: String,
    token: Option<String>,
}

impl SessionFingerprint {
    /// Pick a user agent at random and carry the persisted anti-bot token, if any
    pub fn new(persisted_token: Option<String>) -> Self {
        let index = rand::rng().random_range(0..USER_AGENTS.len());
        Self::with_user_agent(USER_AGENTS[index], persisted_token)
    }

    pub fn with_user_agent(user_agent: &str, persisted_token: Option<String>) -> Self {
        let token = persisted_token.filter(|t| !t.trim().is_empty());
        Self {
            user_agent: user_agent.to_string(),
            token,
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Fixed request headers sent with every navigation
    pub fn headers(&self) -> &'static [(&'static str, &'static str)] {
        HEADERS
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Adopt a token seen in the cookie jar and persist it for later runs.
    /// Returns true when the token changed. Persistence failures are only logged.
    pub fn record_token<S: SettingsStore + ?Sized>(
        &mut self,
        observed: Option<String>,
        store: &S,
    ) -> bool {
        let Some(observed) = observed.filter(|t| !t.trim().is_empty()) else {
            return false;
        };
        if self.token.as_deref() == Some(observed.as_str()) {
            return false;
        }

        info!("Anti-bot token rotated by the site, persisting new value");
        if let Err(e) = store.put_setting(TOKEN_SETTING, &observed) {
            warn!(error = %e, "Failed to persist anti-bot token");
        }
        self.token = Some(observed);
        true
    }

    /// Look for a new token after a navigation
    pub async fn refresh_token<S: SettingsStore + ?Sized>(
        &mut self,
        driver: &dyn PageDriver,
        store: &S,
    ) -> bool {
        match driver.cookie(TOKEN_COOKIE).await {
            Ok(observed) => self.record_token(observed, store),
            Err(e) => {
                debug!(error = %e, "Could not read cookie jar");
                false
            }
        }
    }
}
