//! Outer retry loop of one scraper run.
//!
//! Each attempt walks the search pages, checking every page for a soft block
//! and for a captcha before extracting listings. A soft block or an empty
//! first page burns the attempt; a captcha is handed to the escalation, and
//! an unresolvable one ends the run paused. Whatever was collected before a
//! pause is still reconciled.

use crate::config::{phrase_list, ScraperConfig};
use crate::models::ListingCandidate;
use crate::pipeline::progress::ProgressBoard;
use crate::pipeline::reconcile::{resolve_owner, ReconcileTally, ReconciliationEngine};
use crate::protocol::{ProgressEvent, RunOutcome};
use crate::scrapers::captcha::{CaptchaEscalation, EscalationOutcome};
use crate::scrapers::extract::{extract_description, ListingExtractor};
use crate::scrapers::{BlockDetector, PageDriver, ScrapePlan, SessionFingerprint};
use crate::store::Store;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Final state of a run, as reported to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub collected: u32,
    pub tally: ReconcileTally,
}

/// Why an attempt ended without a usable batch
#[derive(Debug)]
enum AttemptEnd {
    Collected(Vec<ListingCandidate>),
    Retry { reason: String, captcha: bool },
    Paused { kept: Vec<ListingCandidate>, reason: String },
}

/// What a page looks like once blocks and challenges have been dealt with
enum PageCheck {
    Clear(String),
    Blocked(String),
    ChallengeRemains,
    Paused(String),
}

pub struct RunController<S: Store + ?Sized> {
    config: ScraperConfig,
    plan: ScrapePlan,
    store: Arc<S>,
    driver: Arc<dyn PageDriver>,
    fingerprint: SessionFingerprint,
    blocks: BlockDetector,
    escalation: CaptchaEscalation,
    extractor: ListingExtractor,
    board: ProgressBoard,
    snapshot_dir: PathBuf,
}

impl<S: Store + ?Sized> RunController<S> {
    pub fn new(
        config: ScraperConfig,
        store: Arc<S>,
        driver: Arc<dyn PageDriver>,
        fingerprint: SessionFingerprint,
        board: ProgressBoard,
    ) -> Self {
        let blocks = match phrase_list(config.block_phrases.as_deref()) {
            Some(phrases) => BlockDetector::with_phrases(phrases),
            None => BlockDetector::new(),
        };
        let plan = ScrapePlan::from_config(&config);

        Self {
            escalation: CaptchaEscalation::from_config(&config),
            extractor: ListingExtractor::new(plan.per_page),
            plan,
            blocks,
            store,
            driver,
            fingerprint,
            board,
            snapshot_dir: PathBuf::from("debug"),
            config,
        }
    }

    pub fn with_escalation(mut self, escalation: CaptchaEscalation) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_snapshot_dir(mut self, dir: PathBuf) -> Self {
        self.snapshot_dir = dir;
        self
    }

    pub async fn run(mut self) -> RunReport {
        self.board.set_cooldown(self.config.cooldown_hours);

        let owner = match resolve_owner(&*self.store) {
            Ok(owner) => owner,
            Err(e) => {
                error!(error = %e, "Cannot persist listings without a default owner");
                return self.report(RunOutcome::Failed, 0, ReconcileTally::default());
            }
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_failure_was_captcha = false;

        for attempt in 1..=max_attempts {
            info!(attempt, max_attempts, engine = self.driver.engine_name(), "Starting attempt");

            match self.attempt().await {
                AttemptEnd::Collected(candidates) => {
                    return match self.fetch_details(candidates).await {
                        Ok(candidates) => {
                            self.board.publish(ProgressEvent::step(1, 1, "Saving listings"));
                            let tally = self.reconcile(&owner.id, &candidates);
                            self.report(RunOutcome::Success, candidates.len() as u32, tally)
                        }
                        Err((candidates, reason)) => self.pause(&owner.id, candidates, &reason),
                    };
                }
                AttemptEnd::Paused { kept, reason } => {
                    return self.pause(&owner.id, kept, &reason);
                }
                AttemptEnd::Retry { reason, captcha } => {
                    last_failure_was_captcha = captcha;
                    warn!(attempt, %reason, "Attempt failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        if last_failure_was_captcha {
            error!("Captcha kept coming back after resolution, leaving the run paused");
            return self.report(RunOutcome::PausedForCaptcha, 0, ReconcileTally::default());
        }

        error!(
            max_attempts,
            "All attempts exhausted. Try again later, refresh the anti-bot token \
             (lbc_datadome) or run non-headless to clear a challenge by hand"
        );
        self.report(RunOutcome::Failed, 0, ReconcileTally::default())
    }

    fn report(&self, outcome: RunOutcome, collected: u32, tally: ReconcileTally) -> RunReport {
        self.board.set_collected(collected);
        self.board.record_metrics(&tally);
        info!(?outcome, collected, "Run finished");
        RunReport {
            outcome,
            collected,
            tally,
        }
    }

    fn reconcile(&self, owner_id: &str, candidates: &[ListingCandidate]) -> ReconcileTally {
        ReconciliationEngine::new(&*self.store, owner_id)
            .with_cooldown_hours(self.config.cooldown_hours)
            .reconcile_batch(candidates, Utc::now())
    }

    fn pause(&self, owner_id: &str, kept: Vec<ListingCandidate>, reason: &str) -> RunReport {
        warn!(reason, kept = kept.len(), "Run paused on captcha");
        let tally = if kept.is_empty() {
            ReconcileTally::default()
        } else {
            self.reconcile(owner_id, &kept)
        };
        self.report(RunOutcome::PausedForCaptcha, kept.len() as u32, tally)
    }

    /// Load `url` and make sure the page is usable
    async fn load(&mut self, url: &str) -> anyhow::Result<PageCheck> {
        self.driver.navigate(url).await?;
        self.fingerprint.refresh_token(&*self.driver, &*self.store).await;
        self.inspect().await
    }

    async fn inspect(&mut self) -> anyhow::Result<PageCheck> {
        let html = self.driver.html().await?;
        let text = self.driver.body_text().await?;

        if let Some(phrase) = self.blocks.matched(&text) {
            return Ok(PageCheck::Blocked(phrase.to_string()));
        }

        let Some(detection) = self.escalation.detect(&html, &text) else {
            return Ok(PageCheck::Clear(html));
        };

        match self
            .escalation
            .escalate(&*self.driver, &*self.store, &detection)
            .await
        {
            EscalationOutcome::Resolved => {
                self.fingerprint.refresh_token(&*self.driver, &*self.store).await;
                Ok(PageCheck::Clear(self.driver.html().await?))
            }
            EscalationOutcome::StillPresent => Ok(PageCheck::ChallengeRemains),
            EscalationOutcome::Aborted(reason) => Ok(PageCheck::Paused(reason)),
        }
    }

    async fn snapshot(&self, page: u32, html: &str) {
        let path = self.snapshot_dir.join(format!("page-{page}.html"));
        let written = async {
            tokio::fs::create_dir_all(&self.snapshot_dir).await?;
            tokio::fs::write(&path, html).await
        };
        match written.await {
            Ok(()) => debug!(path = %path.display(), "Saved page snapshot"),
            Err(e) => warn!(error = %e, "Could not save page snapshot"),
        }
    }

    async fn attempt(&mut self) -> AttemptEnd {
        let total_pages = self.plan.total_pages.max(1);
        let mut found: Vec<ListingCandidate> = Vec::new();
        let mut seen = HashSet::new();

        for page in 1..=total_pages {
            self.board.publish(ProgressEvent::list(page - 1, total_pages));

            let url = match self.plan.page_url(page) {
                Ok(url) => url,
                Err(e) => {
                    return AttemptEnd::Retry {
                        reason: e.to_string(),
                        captcha: false,
                    }
                }
            };
            debug!(page, %url, "Loading search page");

            let html = match self.load(&url).await {
                Ok(PageCheck::Clear(html)) => html,
                Ok(PageCheck::Paused(reason)) => {
                    return AttemptEnd::Paused { kept: found, reason };
                }
                Ok(PageCheck::ChallengeRemains) => {
                    return AttemptEnd::Retry {
                        reason: "captcha still present after resolution".into(),
                        captcha: true,
                    };
                }
                Ok(PageCheck::Blocked(phrase)) if page == 1 => {
                    return AttemptEnd::Retry {
                        reason: format!("soft block detected ({phrase})"),
                        captcha: false,
                    };
                }
                Ok(PageCheck::Blocked(phrase)) => {
                    warn!(page, %phrase, "Soft block on a later page, keeping what was collected");
                    break;
                }
                Err(e) if page == 1 => {
                    return AttemptEnd::Retry {
                        reason: format!("navigation failed: {e:#}"),
                        captcha: false,
                    };
                }
                Err(e) => {
                    warn!(page, error = %e, "Navigation failed, stopping pagination");
                    break;
                }
            };

            if self.config.debug {
                self.snapshot(page, &html).await;
            }

            let current_url = self.driver.current_url().await;
            let candidates = self.extractor.extract(&html, &current_url);
            self.board.publish(ProgressEvent::list(page, total_pages));

            if candidates.is_empty() {
                if page == 1 {
                    return AttemptEnd::Retry {
                        reason: "no listing found on the search page".into(),
                        captcha: false,
                    };
                }
                info!(page, "Empty search page, stopping pagination");
                break;
            }

            found.extend(candidates.into_iter().filter(|c| seen.insert(c.url.clone())));
            if found.len() >= self.plan.max_listings {
                found.truncate(self.plan.max_listings);
                break;
            }
        }

        info!(collected = found.len(), "Search pages walked");
        AttemptEnd::Collected(found)
    }

    /// Fill descriptions from detail pages. On a pause, hands back what it has.
    async fn fetch_details(
        &mut self,
        mut candidates: Vec<ListingCandidate>,
    ) -> Result<Vec<ListingCandidate>, (Vec<ListingCandidate>, String)> {
        if !self.config.fetch_details {
            return Ok(candidates);
        }

        let total = candidates.len().min(self.config.details_limit as usize);
        for index in 0..total {
            if index > 0 {
                tokio::time::sleep(self.config.details_sleep()).await;
            }
            self.board
                .publish(ProgressEvent::detail(index as u32 + 1, total as u32));

            let url = candidates[index].url.clone();
            match self.load(&url).await {
                Ok(PageCheck::Clear(html)) => {
                    candidates[index].description = extract_description(&html);
                }
                Ok(PageCheck::Blocked(phrase)) => {
                    warn!(%phrase, "Soft block on detail pages, stopping detail phase");
                    break;
                }
                Ok(PageCheck::ChallengeRemains) => {
                    warn!("Captcha persists on detail pages, stopping detail phase");
                    break;
                }
                Ok(PageCheck::Paused(reason)) => return Err((candidates, reason)),
                Err(e) => warn!(%url, error = %e, "Could not load detail page"),
            }
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TOKEN_SETTING;
    use crate::error::ScoutError;
    use crate::models::{CaptchaNotification, RunRecord, RunStatus};
    use crate::scrapers::captcha::CaptchaDetector;
    use crate::scrapers::fake::ScriptedDriver;
    use crate::scrapers::resolution::{NoSignal, ResolutionSignal};
    use crate::store::{ListingStore, MemoryStore, RunStore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    const SEARCH: &str = "https://www.leboncoin.fr/recherche?category=11";
    const CAPTCHA_PAGE: &str =
        r#"<html><body><iframe src="https://geo.captcha-delivery.com/captcha/?x=1"></iframe></body></html>"#;

    struct Operator;

    #[async_trait]
    impl ResolutionSignal for Operator {
        async fn wait(&self, _notification: &CaptchaNotification) -> Result<(), ScoutError> {
            Ok(())
        }
    }

    fn card(id: &str) -> String {
        format!(
            r#"<li data-qa-id="aditem_container">
                 <a href="/ad/colocations/{id}">
                   <p data-qa-id="aditem_title">Chambre {id}</p>
                   <span data-qa-id="aditem_price">500 €</span>
                   <p data-qa-id="aditem_location">Lyon</p>
                 </a>
               </li>"#
        )
    }

    fn index_page(ids: &[&str]) -> String {
        let cards: String = ids.iter().map(|id| card(id)).collect();
        format!("<html><body><ul>{cards}</ul></body></html>")
    }

    fn controller(
        config: ScraperConfig,
        store: &Arc<MemoryStore>,
        driver: &Arc<ScriptedDriver>,
        dir: &TempDir,
        signal: Box<dyn ResolutionSignal>,
    ) -> RunController<MemoryStore> {
        let driver: Arc<dyn PageDriver> = driver.clone();
        let escalation = CaptchaEscalation::new(
            CaptchaDetector::new(),
            dir.path().join("captcha.json"),
            signal,
            false,
        );
        RunController::new(
            config,
            Arc::clone(store),
            driver,
            SessionFingerprint::with_user_agent("test-agent", None),
            ProgressBoard::new(),
        )
        .with_escalation(escalation)
        .with_snapshot_dir(dir.path().join("debug"))
    }

    #[tokio::test]
    async fn test_persistent_soft_block_exhausts_attempts() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_owner());
        let driver = Arc::new(
            ScriptedDriver::new().page(SEARCH, "<html><body>Access denied</body></html>"),
        );

        let report = controller(ScraperConfig::for_tests(), &store, &driver, &dir, Box::new(NoSignal))
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(driver.navigations().len(), 3);
        assert_eq!(store.listing_count(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_captcha_pauses_run() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_owner());
        let run = RunRecord::start(Utc::now());
        store.insert_run(&run).unwrap();
        let driver = Arc::new(ScriptedDriver::new().page(SEARCH, CAPTCHA_PAGE));

        let report = controller(ScraperConfig::for_tests(), &store, &driver, &dir, Box::new(NoSignal))
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::PausedForCaptcha);
        assert_eq!(report.outcome.code(), 2);
        assert_eq!(driver.navigations().len(), 1);
        assert_eq!(store.get_run(&run.id).unwrap().unwrap().status, RunStatus::Paused);
        assert!(dir.path().join("captcha.json").exists());
    }

    #[tokio::test]
    async fn test_resolved_captcha_resumes_on_same_page() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_owner());
        let listing_page = index_page(&["2711111111"]);
        let driver = Arc::new(
            ScriptedDriver::new().pages(SEARCH, &[CAPTCHA_PAGE, listing_page.as_str()]),
        );

        let report = controller(ScraperConfig::for_tests(), &store, &driver, &dir, Box::new(Operator))
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.tally.created, 1);
        assert_eq!(driver.navigations().len(), 2);
    }

    #[tokio::test]
    async fn test_well_formed_cards_are_reconciled_and_malformed_skipped() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_owner());
        let page = format!(
            r#"<html><body><ul>{}{}{}<li data-qa-id="aditem_container"><a><p data-qa-id="aditem_title">Sans lien</p></a></li></ul></body></html>"#,
            card("2710000001"),
            card("2710000002"),
            card("2710000003"),
        );
        let driver = Arc::new(ScriptedDriver::new().page(SEARCH, &page));

        let ctl = controller(ScraperConfig::for_tests(), &store, &driver, &dir, Box::new(NoSignal));
        let board = ctl.board.clone();
        let report = ctl.run().await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.collected, 3);
        assert_eq!((report.tally.created, report.tally.updated), (3, 0));
        assert_eq!(store.listing_count(), 3);
        assert_eq!(board.metrics().created, 3);
        assert!(board
            .final_lines()
            .contains(&"Scraping completed: 3 listings collected".to_string()));
    }

    #[tokio::test]
    async fn test_rotated_token_is_persisted_after_navigation() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_owner());
        let driver = Arc::new(
            ScriptedDriver::new()
                .page(SEARCH, &index_page(&["2712222222"]))
                .with_cookie("datadome", "rotated"),
        );

        let report = controller(ScraperConfig::for_tests(), &store, &driver, &dir, Box::new(NoSignal))
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(store.setting(TOKEN_SETTING).as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn test_missing_owner_fails_before_navigation() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let driver = Arc::new(ScriptedDriver::new().page(SEARCH, &index_page(&["2711111111"])));

        let report = controller(ScraperConfig::for_tests(), &store, &driver, &dir, Box::new(NoSignal))
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(driver.navigations().is_empty());
    }

    #[tokio::test]
    async fn test_pagination_caps_at_max_listings() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_owner());
        let first: Vec<String> = (0..10).map(|i| format!("27200000{i:02}")).collect();
        let second: Vec<String> = (10..20).map(|i| format!("27200000{i:02}")).collect();
        let first: Vec<&str> = first.iter().map(String::as_str).collect();
        let second: Vec<&str> = second.iter().map(String::as_str).collect();

        let driver = Arc::new(
            ScriptedDriver::new()
                .page(SEARCH, &index_page(&first))
                .page(&format!("{SEARCH}&page=2"), &index_page(&second)),
        );

        let mut config = ScraperConfig::for_tests();
        config.max_listings = 15;
        config.debug = true;

        let report = controller(config, &store, &driver, &dir, Box::new(NoSignal))
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.collected, 15);
        assert_eq!(driver.navigations().len(), 2);
        assert!(dir.path().join("debug/page-2.html").exists());
    }

    #[tokio::test]
    async fn test_detail_pages_fill_descriptions() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_owner());
        let detail_url = "https://www.leboncoin.fr/ad/colocations/2711111111";
        let driver = Arc::new(
            ScriptedDriver::new()
                .page(SEARCH, &index_page(&["2711111111"]))
                .page(
                    detail_url,
                    r#"<html><body><div data-qa-id="adview_description_container">Grande chambre lumineuse</div></body></html>"#,
                ),
        );

        let mut config = ScraperConfig::for_tests();
        config.fetch_details = true;

        let report = controller(config, &store, &driver, &dir, Box::new(NoSignal))
            .run()
            .await;

        assert_eq!(report.outcome, RunOutcome::Success);
        let stored = store.find_listing("2711111111").unwrap().unwrap();
        assert!(stored.description.starts_with("Grande chambre lumineuse"));
    }
}
