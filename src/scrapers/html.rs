use scraper::{ElementRef, Html, Selector};
use tracing::warn;
use url::Url;

/// Parse a list of CSS selectors, skipping (and logging) any that do not parse
pub fn compile_selectors(patterns: &[&str]) -> Vec<Selector> {
    patterns
        .iter()
        .filter_map(|pattern| match Selector::parse(pattern) {
            Ok(selector) => Some(selector),
            Err(e) => {
                warn!(pattern, error = ?e, "Ignoring invalid selector");
                None
            }
        })
        .collect()
}

/// Collapse whitespace; `None` when nothing is left
pub fn clean_text(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

pub fn element_text(element: ElementRef) -> Option<String> {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Absolute http(s) URL for a link found on `base`
pub fn resolve_link(href: &str, base: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
    {
        return None;
    }

    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Text a visitor would see: everything under <body> except script-like elements
pub fn visible_text(html: &str) -> String {
    const HIDDEN: &[&str] = &["script", "style", "noscript", "template"];

    let document = Html::parse_document(html);
    let root = match Selector::parse("body") {
        Ok(body) => document.select(&body).next(),
        Err(_) => None,
    }
    .unwrap_or_else(|| document.root_element());

    let mut pieces = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| HIDDEN.contains(&el.name())))
            .unwrap_or(false);
        if !hidden {
            pieces.push(&**text);
        }
    }

    clean_text(&pieces.join(" ")).unwrap_or_default()
}
