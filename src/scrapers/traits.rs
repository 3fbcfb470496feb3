use anyhow::Result;
use async_trait::async_trait;

/// Common interface over the engines that load listing pages.
/// The pipeline only sees rendered HTML, visible text and cookies, so a
/// headless browser, a plain HTTP client or a test double can stand behind it.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Load `url` and wait until the document is ready or the navigation timeout hits
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Reload the current page
    async fn reload(&self) -> Result<()>;

    /// Full HTML of the current document
    async fn html(&self) -> Result<String>;

    /// Text a visitor would see, without script or style sources
    async fn body_text(&self) -> Result<String>;

    async fn current_url(&self) -> String;

    async fn cookie(&self, name: &str) -> Result<Option<String>>;

    /// PNG of the visible viewport
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;

    /// Get the name of the engine behind the driver
    fn engine_name(&self) -> &'static str;
}
