//! Create/update/skip decisions for scraped candidates against the listing store.

use crate::error::{Result, ScoutError};
use crate::models::{Account, ListingCandidate, Source, StoredListing};
use crate::store::{AccountStore, ListingStore};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use url::Url;

/// Role of the account that owns scraped listings
pub const OWNER_ROLE: &str = "admin";

const MIN_ID_DIGITS: usize = 6;

/// Listing identifier: the first whole path segment made of at least six
/// digits, optionally followed by `.htm`
pub fn external_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.path_segments()?.find_map(|segment| {
        let digits = segment.strip_suffix(".htm").unwrap_or(segment);
        (digits.len() >= MIN_ID_DIGITS && digits.bytes().all(|b| b.is_ascii_digit()))
            .then(|| digits.to_string())
    })
}

fn price_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Digit groups split by (narrow) spaces are one number: "1 200 €"
    RE.get_or_init(|| Regex::new(r"\d+(?:\s+\d+)*").expect("static pattern"))
}

/// First number in a price label; `None` when there is no digit at all
pub fn parse_price(text: &str) -> Option<i64> {
    let run = price_regex().find(text)?;
    let digits: String = run.as_str().chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Default owner for new listings; its absence stops the run before any write
pub fn resolve_owner<S: AccountStore + ?Sized>(store: &S) -> Result<Account> {
    store
        .find_account_by_role(OWNER_ROLE)?
        .ok_or_else(|| ScoutError::NoOwnerAccount(OWNER_ROLE.to_string()))
}

/// What happened to one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Created,
    Updated,
    /// Touched within the cooldown window
    SkippedRecent,
    /// No identifier in the URL
    SkippedNoId,
    /// Persistence failed for this candidate only
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileTally {
    pub created: u32,
    pub updated: u32,
    pub skipped_recent: u32,
    pub skipped_no_id: u32,
    pub failed: u32,
}

impl ReconcileTally {
    pub fn record(&mut self, result: Reconciled) {
        match result {
            Reconciled::Created => self.created += 1,
            Reconciled::Updated => self.updated += 1,
            Reconciled::SkippedRecent => self.skipped_recent += 1,
            Reconciled::SkippedNoId => self.skipped_no_id += 1,
            Reconciled::Failed => self.failed += 1,
        }
    }
}

pub struct ReconciliationEngine<'a, S: ListingStore + ?Sized> {
    store: &'a S,
    owner_id: String,
    cooldown: Option<Duration>,
}

impl<'a, S: ListingStore + ?Sized> ReconciliationEngine<'a, S> {
    pub fn new(store: &'a S, owner_id: impl Into<String>) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            cooldown: None,
        }
    }

    /// Leave listings alone when they were updated less than `hours` ago; 0 disables
    pub fn with_cooldown_hours(mut self, hours: u32) -> Self {
        self.cooldown = (hours > 0).then(|| Duration::hours(i64::from(hours)));
        self
    }

    fn description(candidate: &ListingCandidate) -> String {
        let source = format!("Source: {}", candidate.url);
        match candidate.description.as_deref().or(candidate.title.as_deref()) {
            Some(text) => format!("{text}\n\n{source}"),
            None => source,
        }
    }

    pub fn reconcile_one(&self, candidate: &ListingCandidate, now: DateTime<Utc>) -> Reconciled {
        let Some(id) = external_id(&candidate.url) else {
            warn!(url = %candidate.url, "No listing id in URL, skipping");
            return Reconciled::SkippedNoId;
        };

        match self.upsert(&id, candidate, now) {
            Ok(result) => {
                debug!(id, ?result, "Listing reconciled");
                result
            }
            Err(e) => {
                error!(id, error = %e, "Failed to persist listing");
                Reconciled::Failed
            }
        }
    }

    fn upsert(&self, id: &str, candidate: &ListingCandidate, now: DateTime<Utc>) -> Result<Reconciled> {
        let price = candidate.price_text.as_deref().and_then(parse_price);

        match self.store.find_listing(id)? {
            Some(existing) => {
                if let Some(cooldown) = self.cooldown {
                    if now - existing.updated_at < cooldown {
                        return Ok(Reconciled::SkippedRecent);
                    }
                }

                let listing = StoredListing {
                    title: candidate.title.clone(),
                    description: Self::description(candidate),
                    location: candidate.location.clone(),
                    price,
                    source_url: candidate.url.clone(),
                    updated_at: now,
                    ..existing
                };
                self.store.update_listing(&listing)?;
                Ok(Reconciled::Updated)
            }
            None => {
                let listing = StoredListing {
                    external_id: id.to_string(),
                    title: candidate.title.clone(),
                    description: Self::description(candidate),
                    location: candidate.location.clone(),
                    price,
                    source: Source::Leboncoin,
                    source_url: candidate.url.clone(),
                    owner_id: self.owner_id.clone(),
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_listing(&listing)?;
                Ok(Reconciled::Created)
            }
        }
    }

    /// Reconcile every candidate; one failure never stops the batch
    pub fn reconcile_batch(&self, candidates: &[ListingCandidate], now: DateTime<Utc>) -> ReconcileTally {
        let mut tally = ReconcileTally::default();
        for candidate in candidates {
            tally.record(self.reconcile_one(candidate, now));
        }

        info!(
            created = tally.created,
            updated = tally.updated,
            skipped_recent = tally.skipped_recent,
            skipped_no_id = tally.skipped_no_id,
            failed = tally.failed,
            "Reconciliation finished"
        );
        tally
    }
}
