use crate::config::ScraperConfig;
use crate::scrapers::fingerprint::{SessionFingerprint, ACCEPT_LANGUAGE, EVASION_SCRIPT, TOKEN_COOKIE, TOKEN_DOMAIN};
use crate::scrapers::traits::PageDriver;
use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::{Network, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::json;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const WINDOW_SIZE: (u32, u32) = (1366, 900);

/// Page driver backed by a real Chrome instance.
///
/// headless_chrome is synchronous, so every call runs on the blocking pool.
pub struct ChromeDriver {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeDriver {
    /// Launch Chrome with the session fingerprint applied to a fresh tab
    pub fn launch(config: &ScraperConfig, fingerprint: &SessionFingerprint) -> Result<Self> {
        info!(headless = config.headless, "Launching Chrome...");

        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .window_size(Some(WINDOW_SIZE))
            .idle_browser_timeout(Duration::from_secs(60 * 60))
            .args(vec![
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--lang=fr-FR"),
                OsStr::new("--no-first-run"),
            ])
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;
        let tab = browser.new_tab().context("Failed to open browser tab")?;
        tab.set_default_timeout(config.nav_timeout());

        tab.set_user_agent(fingerprint.user_agent(), Some(ACCEPT_LANGUAGE), None)
            .context("Failed to set user agent")?;

        let headers: HashMap<&str, &str> = fingerprint
            .headers()
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("Accept-Encoding"))
            .copied()
            .collect();
        tab.set_extra_http_headers(headers)
            .context("Failed to set request headers")?;

        let evasion: Page::AddScriptToEvaluateOnNewDocument =
            serde_json::from_value(json!({ "source": EVASION_SCRIPT }))?;
        tab.call_method(evasion)
            .context("Failed to install evasion script")?;

        if let Some(token) = fingerprint.token() {
            let cookie: Network::CookieParam = serde_json::from_value(json!({
                "name": TOKEN_COOKIE,
                "value": token,
                "domain": TOKEN_DOMAIN,
                "path": "/",
            }))?;
            tab.set_cookies(vec![cookie])
                .context("Failed to seed anti-bot cookie")?;
            debug!("Seeded persisted anti-bot token");
        }

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    async fn on_tab<T, F>(&self, action: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || action(&tab))
            .await
            .context("Browser task panicked")?
    }
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.on_tab(move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
        .context("Navigation failed")
    }

    async fn reload(&self) -> Result<()> {
        self.on_tab(|tab| {
            tab.reload(false, None)?.wait_until_navigated()?;
            Ok(())
        })
        .await
        .context("Reload failed")
    }

    async fn html(&self) -> Result<String> {
        self.on_tab(|tab| tab.get_content()).await
    }

    async fn body_text(&self) -> Result<String> {
        self.on_tab(|tab| {
            let result = tab.evaluate("document.body ? document.body.innerText : ''", false)?;
            Ok(result
                .value
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default())
        })
        .await
    }

    async fn current_url(&self) -> String {
        self.tab.get_url()
    }

    async fn cookie(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        self.on_tab(move |tab| {
            Ok(tab
                .get_cookies()?
                .into_iter()
                .find(|c| c.name == name)
                .map(|c| c.value))
        })
        .await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.on_tab(|tab| {
            tab.capture_screenshot(
                Page::CaptureScreenshotFormatOption::Png,
                None,
                None,
                true,
            )
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.on_tab(|tab| tab.close(false).map(|_| ())).await
    }

    fn engine_name(&self) -> &'static str {
        "chrome"
    }
}
