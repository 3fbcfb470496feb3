use crate::config::ScraperConfig;
use crate::scrapers::fingerprint::{SessionFingerprint, TOKEN_COOKIE, TOKEN_DOMAIN};
use crate::scrapers::html::visible_text;
use crate::scrapers::traits::PageDriver;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Default)]
struct PageState {
    url: Option<Url>,
    html: String,
}

/// Plain HTTP page driver. Cheaper than Chrome but cannot run page
/// scripts, so some challenges can never be cleared through it.
pub struct HttpDriver {
    client: Client,
    jar: Arc<Jar>,
    origin: Url,
    state: Mutex<PageState>,
}

impl HttpDriver {
    pub fn new(config: &ScraperConfig, fingerprint: &SessionFingerprint) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in fingerprint.headers() {
            // reqwest negotiates compression itself and only decodes what it asked for
            if name.eq_ignore_ascii_case("Accept-Encoding") {
                continue;
            }
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("Invalid header name: {name}"))?,
                HeaderValue::from_str(value)
                    .with_context(|| format!("Invalid value for header {name}"))?,
            );
        }

        let origin = Url::parse(&config.search_url)
            .with_context(|| format!("Invalid search URL: {}", config.search_url))?;
        let jar = Arc::new(Jar::default());
        if let Some(token) = fingerprint.token() {
            let cookie = format!("{TOKEN_COOKIE}={token}; Domain={TOKEN_DOMAIN}; Path=/");
            jar.add_cookie_str(&cookie, &origin);
        }

        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(config.nav_timeout())
            .user_agent(fingerprint.user_agent())
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        info!("HTTP driver ready");
        Ok(Self {
            client,
            jar,
            origin,
            state: Mutex::new(PageState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Value of `name` in a `Cookie` header the jar would send
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

#[async_trait]
impl PageDriver for HttpDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;

        let status = response.status();
        if !status.is_success() {
            // Challenge and block pages come back as 403/429; keep the body for inspection
            warn!(%status, url, "Non-success response");
        }

        let final_url = response.url().clone();
        let html = response.text().await.context("Failed to read response body")?;
        debug!(bytes = html.len(), url = %final_url, "Page fetched");

        let mut state = self.state();
        state.url = Some(final_url);
        state.html = html;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let Some(url) = self.state().url.clone() else {
            bail!("Nothing to reload");
        };
        self.navigate(url.as_str()).await
    }

    async fn html(&self) -> Result<String> {
        Ok(self.state().html.clone())
    }

    async fn body_text(&self) -> Result<String> {
        let html = self.state().html.clone();
        Ok(visible_text(&html))
    }

    async fn current_url(&self) -> String {
        self.state().url.as_ref().map(Url::to_string).unwrap_or_default()
    }

    async fn cookie(&self, name: &str) -> Result<Option<String>> {
        let url = self.state().url.clone().unwrap_or_else(|| self.origin.clone());
        let Some(header) = self.jar.cookies(&url) else {
            return Ok(None);
        };
        let header = header.to_str().context("Cookie header is not valid text")?;
        Ok(cookie_value(header, name))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        bail!("The HTTP driver cannot take screenshots")
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(token: Option<&str>) -> HttpDriver {
        let config = ScraperConfig::for_tests();
        let fingerprint = SessionFingerprint::with_user_agent("ua", token.map(String::from));
        HttpDriver::new(&config, &fingerprint).unwrap()
    }

    #[test]
    fn test_cookie_value() {
        assert_eq!(cookie_value("a=1; datadome=abc", "datadome").as_deref(), Some("abc"));
        assert_eq!(cookie_value("a=1", "datadome"), None);
        assert_eq!(cookie_value("", "datadome"), None);
    }

    #[tokio::test]
    async fn test_seeded_token_is_in_jar() {
        let driver = driver(Some("tok"));

        assert_eq!(driver.cookie(TOKEN_COOKIE).await.unwrap().as_deref(), Some("tok"));
        assert!(driver.screenshot().await.is_err());
        assert!(driver.reload().await.is_err());
    }

    #[tokio::test]
    async fn test_no_token_means_empty_jar() {
        let driver = driver(None);
        assert_eq!(driver.cookie(TOKEN_COOKIE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_foreign_domain_cookie_is_not_sent() {
        let driver = driver(Some("tok"));
        let origin = driver.origin.clone();
        driver
            .jar
            .add_cookie_str("datadome=stale; Domain=.other.example; Path=/", &origin);

        assert_eq!(driver.cookie(TOKEN_COOKIE).await.unwrap().as_deref(), Some("tok"));
        let foreign = Url::parse("https://www.other.example/").unwrap();
        assert!(driver.jar.cookies(&foreign).is_none());
    }

    #[tokio::test]
    async fn test_expired_cookie_is_not_sent() {
        let driver = driver(Some("tok"));
        let origin = driver.origin.clone();
        driver.jar.add_cookie_str(
            "datadome=stale; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Domain=.leboncoin.fr; Path=/",
            &origin,
        );

        let observed = driver.cookie(TOKEN_COOKIE).await.unwrap();
        assert_ne!(observed.as_deref(), Some("stale"));
    }
}
