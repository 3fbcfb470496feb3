use crate::scrapers::html::visible_text;
use crate::scrapers::traits::PageDriver;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// 1x1 transparent PNG
const PIXEL_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89,
];

#[derive(Default)]
struct Script {
    pages: HashMap<String, VecDeque<String>>,
    cookies: HashMap<String, String>,
    navigations: Vec<String>,
    current_url: String,
    current_html: String,
}

/// Driver that serves canned HTML per URL.
///
/// Each visit to a URL consumes the next queued page; the last one stays.
#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<Script>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, html: &str) -> Self {
        self.pages(url, &[html])
    }

    pub fn pages(self, url: &str, pages: &[&str]) -> Self {
        self.lock()
            .pages
            .entry(url.to_string())
            .or_default()
            .extend(pages.iter().map(|p| p.to_string()));
        self
    }

    pub fn with_cookie(self, name: &str, value: &str) -> Self {
        self.lock().cookies.insert(name.to_string(), value.to_string());
        self
    }

    /// Every URL loaded so far, reloads included
    pub fn navigations(&self) -> Vec<String> {
        self.lock().navigations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self, url: &str) -> Result<()> {
        let mut script = self.lock();
        script.navigations.push(url.to_string());

        let queue = script
            .pages
            .get_mut(url)
            .ok_or_else(|| anyhow!("No scripted page for {url}"))?;
        let html = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
        .ok_or_else(|| anyhow!("Empty script for {url}"))?;

        script.current_url = url.to_string();
        script.current_html = html;
        Ok(())
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.load(url)
    }

    async fn reload(&self) -> Result<()> {
        let url = self.lock().current_url.clone();
        self.load(&url)
    }

    async fn html(&self) -> Result<String> {
        Ok(self.lock().current_html.clone())
    }

    async fn body_text(&self) -> Result<String> {
        Ok(visible_text(&self.lock().current_html))
    }

    async fn current_url(&self) -> String {
        self.lock().current_url.clone()
    }

    async fn cookie(&self, name: &str) -> Result<Option<String>> {
        Ok(self.lock().cookies.get(name).cloned())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(PIXEL_PNG.to_vec())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "scripted"
    }
}
