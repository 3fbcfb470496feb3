use crate::config::ScraperConfig;
use anyhow::{Context, Result};
use url::Url;

/// Search pages to walk during one attempt
#[derive(Debug, Clone)]
pub struct ScrapePlan {
    /// Index page the search starts from
    pub search_url: String,
    /// Number of index pages to visit at most
    pub total_pages: u32,
    /// Candidates kept per index page
    pub per_page: usize,
    /// Candidates kept over the whole run
    pub max_listings: usize,
}

impl ScrapePlan {
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self {
            search_url: config.search_url.clone(),
            total_pages: config.total_pages(),
            per_page: config.page_size() as usize,
            max_listings: config.max_listings.max(1) as usize,
        }
    }

    /// URL of the `page`-th index page (1-based); page 1 is the search URL itself
    pub fn page_url(&self, page: u32) -> Result<String> {
        if page <= 1 {
            return Ok(self.search_url.clone());
        }

        let mut url = Url::parse(&self.search_url)
            .with_context(|| format!("Invalid search URL: {}", self.search_url))?;
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "page")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair("page", &page.to_string());

        Ok(url.to_string())
    }
}

impl Default for ScrapePlan {
    fn default() -> Self {
        Self {
            search_url: "https://www.leboncoin.fr/recherche?category=11".to_string(),
            total_pages: 1,
            per_page: 10,
            max_listings: 10,
        }
    }
}
