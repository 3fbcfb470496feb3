/// Phrases that mean the site is throttling us rather than challenging us
pub const DEFAULT_BLOCK_PHRASES: &[&str] = &[
    "access denied",
    "accès refusé",
    "blocked",
    "rate limit",
    "too many requests",
    "trop de requêtes",
    "unusual traffic",
    "trafic inhabituel",
    "automated requests",
    "requêtes automatisées",
];

/// Recognises soft blocks from the visible text of a page
#[derive(Debug, Clone)]
pub struct BlockDetector {
    phrases: Vec<String>,
}

impl BlockDetector {
    pub fn new() -> Self {
        Self::with_phrases(DEFAULT_BLOCK_PHRASES.iter().map(|p| p.to_string()).collect())
    }

    pub fn with_phrases(phrases: Vec<String>) -> Self {
        Self {
            phrases: phrases.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// First block phrase found in the text
    pub fn matched(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.phrases
            .iter()
            .find(|phrase| text.contains(phrase.as_str()))
            .map(String::as_str)
    }
}

impl Default for BlockDetector {
    fn default() -> Self {
        Self::new()
    }
}
