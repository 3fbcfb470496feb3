//! Listing extraction from search result pages.
//!
//! Strategies are tried in order and the first one that yields candidates
//! wins: structured listing cards first, bare detail links as a fallback when
//! the card markup changes.

use crate::models::ListingCandidate;
use crate::scrapers::html::{clean_text, compile_selectors, element_text, resolve_link, truncate_chars};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use url::Url;

/// Upper bound on candidates kept from one index page
pub const MAX_PER_PAGE: usize = 10;

const FALLBACK_BASE: &str = "https://www.leboncoin.fr/";
const TITLE_MAX_CHARS: usize = 200;
const DESCRIPTION_MAX_CHARS: usize = 4000;

const CARD_SELECTORS: &[&str] = &[
    r#"[data-qa-id="aditem_container"]"#,
    r#"article[data-test-id="ad"]"#,
    r#"[data-test-id="ad"]"#,
    r#"li[data-qa-id="aditem_container"]"#,
];

const LINK_FIELDS: &[FieldSpec] = &[
    FieldSpec::Attr(r#"a[href*="/ad/"]"#, "href"),
    FieldSpec::Attr(r#"a[href$=".htm"]"#, "href"),
    FieldSpec::Attr("a[href]", "href"),
];

const TITLE_FIELDS: &[FieldSpec] = &[
    FieldSpec::Text(r#"[data-qa-id="aditem_title"]"#),
    FieldSpec::Text(r#"[data-test-id="adcard-title"]"#),
    FieldSpec::Attr("p[title]", "title"),
    FieldSpec::Text("h2"),
    FieldSpec::Text("h3"),
];

const PRICE_FIELDS: &[FieldSpec] = &[
    FieldSpec::Text(r#"[data-qa-id="aditem_price"]"#),
    FieldSpec::Text(r#"[data-test-id="price"]"#),
    FieldSpec::Text(r#"[aria-label*="Prix"]"#),
    FieldSpec::Text(r#"[class*="price"]"#),
];

const LOCATION_FIELDS: &[FieldSpec] = &[
    FieldSpec::Text(r#"[data-qa-id="aditem_location"]"#),
    FieldSpec::Text(r#"[data-test-id="adcard-location"]"#),
    FieldSpec::Text(r#"[aria-label*="Située à"]"#),
    FieldSpec::Text(r#"[class*="location"]"#),
];

const DETAIL_ANCHORS: &[&str] = &[
    r#"a[href*="/ad/"]"#,
    r#"a[href*="/colocations/"]"#,
    r#"a[href$=".htm"]"#,
];

const DESCRIPTION_FIELDS: &[FieldSpec] = &[
    FieldSpec::Text(r#"[data-qa-id="adview_description_container"]"#),
    FieldSpec::Text(r#"[data-test-id="description"]"#),
    FieldSpec::Text(r#"div[class*="description"]"#),
    FieldSpec::Attr(r#"meta[name="description"]"#, "content"),
];

const BLOCK_ELEMENTS: &[&str] = &["article", "li", "div", "section"];

/// Where to read one field from, relative to a scope element
#[derive(Debug, Clone, Copy)]
pub enum FieldSpec {
    Text(&'static str),
    Attr(&'static str, &'static str),
}

enum Field {
    Text(Selector),
    Attr(Selector, &'static str),
}

/// Alternatives for one field; the first non-empty match wins
struct FieldRule {
    alternatives: Vec<Field>,
}

impl FieldRule {
    fn new(specs: &[FieldSpec]) -> Self {
        let alternatives = specs
            .iter()
            .filter_map(|spec| match *spec {
                FieldSpec::Text(css) => compile_selectors(&[css]).pop().map(Field::Text),
                FieldSpec::Attr(css, attr) => {
                    compile_selectors(&[css]).pop().map(|sel| Field::Attr(sel, attr))
                }
            })
            .collect();
        Self { alternatives }
    }

    fn first_match(&self, scope: ElementRef) -> Option<String> {
        self.alternatives.iter().find_map(|field| match field {
            Field::Text(selector) => scope.select(selector).find_map(element_text),
            Field::Attr(selector, attr) => scope
                .select(selector)
                .find_map(|el| el.value().attr(attr).and_then(clean_text)),
        })
    }
}

/// Result of running one strategy over a page
#[derive(Debug, Default)]
pub struct Extraction {
    pub candidates: Vec<ListingCandidate>,
    /// Elements that looked like listings but had no usable link
    pub dropped: usize,
}

/// One way of turning a listing index page into candidates
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, document: &Html, base: &Url) -> Extraction;
}

/// Reads structured listing cards
pub struct CardStrategy {
    cards: Vec<Selector>,
    link: FieldRule,
    title: FieldRule,
    price: FieldRule,
    location: FieldRule,
}

impl CardStrategy {
    pub fn new() -> Self {
        Self {
            cards: compile_selectors(CARD_SELECTORS),
            link: FieldRule::new(LINK_FIELDS),
            title: FieldRule::new(TITLE_FIELDS),
            price: FieldRule::new(PRICE_FIELDS),
            location: FieldRule::new(LOCATION_FIELDS),
        }
    }

    fn card_link(&self, card: ElementRef, base: &Url) -> Option<String> {
        // Cards are often the anchor themselves
        let own = (card.value().name() == "a")
            .then(|| card.value().attr("href"))
            .flatten()
            .map(str::to_string);

        own.or_else(|| self.link.first_match(card))
            .and_then(|href| resolve_link(&href, base))
    }
}

impl Default for CardStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionStrategy for CardStrategy {
    fn name(&self) -> &'static str {
        "cards"
    }

    fn extract(&self, document: &Html, base: &Url) -> Extraction {
        let mut extraction = Extraction::default();

        // The first card marker present on the page defines the cards
        let Some(cards) = self
            .cards
            .iter()
            .map(|selector| document.select(selector).collect::<Vec<_>>())
            .find(|cards| !cards.is_empty())
        else {
            return extraction;
        };

        debug!(count = cards.len(), "Found listing cards");

        for (idx, card) in cards.into_iter().enumerate() {
            let Some(url) = self.card_link(card, base) else {
                warn!(card = idx, "Listing card has no resolvable link, skipping");
                extraction.dropped += 1;
                continue;
            };

            let title = self
                .title
                .first_match(card)
                .or_else(|| card.value().attr("aria-label").and_then(clean_text))
                .map(|t| truncate_chars(&t, TITLE_MAX_CHARS));

            extraction.candidates.push(ListingCandidate {
                url,
                title,
                price_text: self.price.first_match(card),
                location: self.location.first_match(card),
                description: None,
            });
        }

        extraction
    }
}

/// Falls back to every detail-page link, titled from the surrounding block
pub struct AnchorStrategy {
    anchors: Vec<Selector>,
}

impl AnchorStrategy {
    pub fn new() -> Self {
        Self {
            anchors: compile_selectors(DETAIL_ANCHORS),
        }
    }

    fn block_title(anchor: ElementRef) -> Option<String> {
        anchor
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| BLOCK_ELEMENTS.contains(&el.value().name()))
            .and_then(element_text)
            .or_else(|| element_text(anchor))
            .map(|t| truncate_chars(&t, TITLE_MAX_CHARS))
    }
}

impl Default for AnchorStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionStrategy for AnchorStrategy {
    fn name(&self) -> &'static str {
        "detail-links"
    }

    fn extract(&self, document: &Html, base: &Url) -> Extraction {
        let mut extraction = Extraction::default();

        for selector in &self.anchors {
            for anchor in document.select(selector) {
                let Some(url) = anchor
                    .value()
                    .attr("href")
                    .and_then(|href| resolve_link(href, base))
                else {
                    extraction.dropped += 1;
                    continue;
                };

                extraction.candidates.push(ListingCandidate {
                    url,
                    title: Self::block_title(anchor),
                    ..ListingCandidate::default()
                });
            }
        }

        extraction
    }
}

/// Runs the strategies in order over a listing index page
pub struct ListingExtractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
    per_page: usize,
}

impl ListingExtractor {
    /// Cards first, then bare detail links; at most `per_page` candidates (capped at 10)
    pub fn new(per_page: usize) -> Self {
        Self::with_strategies(
            vec![Box::new(CardStrategy::new()), Box::new(AnchorStrategy::new())],
            per_page,
        )
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ExtractionStrategy>>, per_page: usize) -> Self {
        Self {
            strategies,
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    /// Candidates found on the page; empty when every strategy comes up dry
    pub fn extract(&self, html: &str, page_url: &str) -> Vec<ListingCandidate> {
        let Ok(base) = Url::parse(page_url).or_else(|_| Url::parse(FALLBACK_BASE)) else {
            return Vec::new();
        };
        let document = Html::parse_document(html);

        for strategy in &self.strategies {
            let extraction = strategy.extract(&document, &base);
            if extraction.candidates.is_empty() {
                debug!(strategy = strategy.name(), "Strategy found no listing");
                continue;
            }

            let mut seen = HashSet::new();
            let candidates: Vec<ListingCandidate> = extraction
                .candidates
                .into_iter()
                .filter(|c| seen.insert(c.url.clone()))
                .take(self.per_page)
                .collect();

            info!(
                strategy = strategy.name(),
                found = candidates.len(),
                skipped = extraction.dropped,
                "Extracted listings from page"
            );
            return candidates;
        }

        warn!(url = page_url, "No listing could be extracted from page");
        Vec::new()
    }
}

/// Description text of a listing detail page
pub fn extract_description(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    FieldRule::new(DESCRIPTION_FIELDS)
        .first_match(document.root_element())
        .map(|d| truncate_chars(&d, DESCRIPTION_MAX_CHARS))
}
