//! Captcha detection and the human escalation around it.
//!
//! A challenge moves through `Detected -> EvidenceCaptured -> Paused` and ends
//! `Resolved` (scraping resumes on the same page) or `Aborted` (the process
//! exits with the paused exit code). Evidence capture, the operator
//! notification and the run bookkeeping are each best effort: one failing
//! does not stop the others.

use crate::config::{phrase_list, ResolverKind, ScraperConfig};
use crate::models::{CaptchaDiagnostics, CaptchaNotification, ChallengeType, RunStatus};
use crate::scrapers::html::{compile_selectors, truncate_chars};
use crate::scrapers::resolution::{open_in_browser, signal_for, ResolutionSignal};
use crate::scrapers::traits::PageDriver;
use crate::store::RunStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use regex::Regex;
use scraper::{Html, Selector};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};

const DOM_SIGNATURES: &[(&str, ChallengeType)] = &[
    (r#"iframe[src*="recaptcha"]"#, ChallengeType::Recaptcha),
    (".g-recaptcha", ChallengeType::Recaptcha),
    (r#"iframe[src*="hcaptcha"]"#, ChallengeType::Hcaptcha),
    (".h-captcha", ChallengeType::Hcaptcha),
    ("[data-hcaptcha-widget-id]", ChallengeType::Hcaptcha),
    (r#"iframe[src*="captcha-delivery"]"#, ChallengeType::Other),
    (r#"iframe[src*="captcha"]"#, ChallengeType::Other),
    (r#"[id*="captcha"]"#, ChallengeType::Other),
    (r#"[class*="captcha"]"#, ChallengeType::Other),
];

const IMAGE_SELECTORS: &[&str] = &[
    r#"img[src*="captcha"]"#,
    r#"img[alt*="captcha"]"#,
    r#"img[alt*="Captcha"]"#,
    "#captcha img",
    ".captcha img",
    r#"canvas[id*="captcha"]"#,
];

pub const DEFAULT_CAPTCHA_PHRASES: &[&str] = &[
    "captcha",
    "je ne suis pas un robot",
    "i'm not a robot",
    "vérifiez que vous êtes humain",
    "confirmez que vous êtes humain",
    "verify you are human",
];

const SNIPPET_MAX_CHARS: usize = 2000;
const EXCERPT_MAX_CHARS: usize = 1000;

fn script_markers() -> &'static [Regex] {
    static MARKERS: OnceLock<Vec<Regex>> = OnceLock::new();
    MARKERS.get_or_init(|| {
        [
            r"\b(?:var|let|const)\s+[A-Za-z_$][\w$]*\s*=",
            r"\bfunction\s*[A-Za-z_$]*\s*\(",
            r"\b(?:window|document|navigator)\.[A-Za-z_$]",
            r"=>\s*\{",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Whether the text reads like JavaScript source rather than prose
pub fn looks_like_script(text: &str) -> bool {
    script_markers().iter().any(|re| re.is_match(text))
}

/// What a positive detection found
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub challenge_type: ChallengeType,
    /// Outer HTML of the matched challenge element
    pub html_snippet: Option<String>,
    pub dom_found: bool,
    pub text_found: bool,
    pub image_found: bool,
}

/// Looks for challenge widgets in the DOM and challenge wording in the text
pub struct CaptchaDetector {
    signatures: Vec<(Selector, ChallengeType)>,
    images: Vec<Selector>,
    phrases: Vec<String>,
}

impl CaptchaDetector {
    pub fn new() -> Self {
        Self::with_phrases(DEFAULT_CAPTCHA_PHRASES.iter().map(|p| p.to_string()).collect())
    }

    pub fn with_phrases(phrases: Vec<String>) -> Self {
        let signatures = DOM_SIGNATURES
            .iter()
            .filter_map(|(css, kind)| compile_selectors(&[*css]).pop().map(|sel| (sel, *kind)))
            .collect();

        Self {
            signatures,
            images: compile_selectors(IMAGE_SELECTORS),
            phrases: phrases.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Challenge wording in prose; script-shaped text never counts
    pub fn text_signal(&self, text: &str) -> bool {
        if looks_like_script(text) {
            return false;
        }
        let text = text.to_lowercase();
        self.phrases.iter().any(|p| text.contains(p.as_str()))
    }

    pub fn detect(&self, html: &str, body_text: &str) -> Option<Detection> {
        let document = Html::parse_document(html);

        let dom_match = self.signatures.iter().find_map(|(selector, kind)| {
            document
                .select(selector)
                .next()
                .map(|el| (*kind, truncate_chars(&el.html(), SNIPPET_MAX_CHARS)))
        });
        let image = self
            .images
            .iter()
            .find_map(|selector| document.select(selector).next())
            .map(|el| truncate_chars(&el.html(), SNIPPET_MAX_CHARS));
        let text_found = self.text_signal(body_text);
        let dom_found = dom_match.is_some();

        if !dom_found && !text_found {
            return None;
        }

        let challenge_type = match (&dom_match, &image) {
            (Some((ChallengeType::Other, _)), Some(_)) => ChallengeType::Image,
            (Some((kind, _)), _) => *kind,
            (None, Some(_)) => ChallengeType::Image,
            (None, None) => ChallengeType::Unknown,
        };

        Some(Detection {
            challenge_type,
            html_snippet: dom_match.map(|(_, snippet)| snippet).or_else(|| image.clone()),
            dom_found,
            text_found,
            image_found: image.is_some(),
        })
    }
}

impl Default for CaptchaDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationStage {
    Detected,
    EvidenceCaptured,
    Paused,
    Resolved,
    Aborted,
}

impl fmt::Display for EscalationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EscalationStage::Detected => "detected",
            EscalationStage::EvidenceCaptured => "evidence-captured",
            EscalationStage::Paused => "paused",
            EscalationStage::Resolved => "resolved",
            EscalationStage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How an escalation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// The challenge is gone; scraping continues on the reloaded page
    Resolved,
    /// The operator answered but the challenge is still there
    StillPresent,
    /// No operator resolution is possible; the run stays paused
    Aborted(String),
}

/// Runs the detect / capture / notify / pause / wait protocol
pub struct CaptchaEscalation {
    detector: CaptchaDetector,
    notification_path: PathBuf,
    signal: Box<dyn ResolutionSignal>,
    open_browser: bool,
}

impl CaptchaEscalation {
    pub fn new(
        detector: CaptchaDetector,
        notification_path: PathBuf,
        signal: Box<dyn ResolutionSignal>,
        open_browser: bool,
    ) -> Self {
        Self {
            detector,
            notification_path,
            signal,
            open_browser,
        }
    }

    pub fn from_config(config: &ScraperConfig) -> Self {
        let detector = match phrase_list(config.captcha_phrases.as_deref()) {
            Some(phrases) => CaptchaDetector::with_phrases(phrases),
            None => CaptchaDetector::new(),
        };
        let path = PathBuf::from(&config.captcha_notification_path);
        let kind = config.resolver_kind();

        Self::new(
            detector,
            path.clone(),
            signal_for(kind, &path),
            kind == ResolverKind::Terminal,
        )
    }

    pub fn detect(&self, html: &str, body_text: &str) -> Option<Detection> {
        self.detector.detect(html, body_text)
    }

    /// Re-read the current page and look for a challenge
    pub async fn check(&self, driver: &dyn PageDriver) -> anyhow::Result<Option<Detection>> {
        let html = driver.html().await?;
        let text = driver.body_text().await?;
        Ok(self.detect(&html, &text))
    }

    /// Build the notification, with a screenshot when a challenge image is on screen
    pub async fn capture_evidence(
        &self,
        driver: &dyn PageDriver,
        detection: &Detection,
    ) -> CaptchaNotification {
        let url = driver.current_url().await;

        let screenshot = if detection.image_found {
            match driver.screenshot().await {
                Ok(png) => Some(STANDARD.encode(png)),
                Err(e) => {
                    warn!(error = %e, "Could not capture captcha screenshot");
                    None
                }
            }
        } else {
            None
        };

        let body_excerpt = match driver.body_text().await {
            Ok(text) => Some(truncate_chars(&text, EXCERPT_MAX_CHARS)),
            Err(e) => {
                debug!(error = %e, "Could not read page text for evidence");
                None
            }
        };

        CaptchaNotification {
            detected: true,
            challenge_type: detection.challenge_type,
            url: url.clone(),
            diagnostics: CaptchaDiagnostics {
                html_snippet: detection.html_snippet.clone(),
                screenshot,
                text_found: detection.text_found,
                body_excerpt,
            },
            timestamp: Utc::now(),
            message: format!(
                "Captcha ({:?}) detected on {url}. Solve it in a browser, then confirm to resume the scraper.",
                detection.challenge_type
            ),
        }
    }

    /// Write the notification file for out-of-band alerting
    pub fn notify(&self, notification: &CaptchaNotification) -> anyhow::Result<()> {
        if let Some(parent) = self.notification_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(notification)?;
        std::fs::write(&self.notification_path, json)?;
        info!(path = %self.notification_path.display(), "Captcha notification written");
        Ok(())
    }

    fn clear_notification(&self) {
        if let Err(e) = std::fs::remove_file(&self.notification_path) {
            debug!(error = %e, "Captcha notification not removed");
        }
    }

    /// Detect, capture, notify, pause, wait for the operator, then re-check the page
    pub async fn escalate<S: RunStore + ?Sized>(
        &self,
        driver: &dyn PageDriver,
        store: &S,
        detection: &Detection,
    ) -> EscalationOutcome {
        let mut stage = EscalationStage::Detected;
        warn!(
            challenge = ?detection.challenge_type,
            dom = detection.dom_found,
            text = detection.text_found,
            %stage,
            "Captcha challenge detected"
        );

        let notification = self.capture_evidence(driver, detection).await;
        stage = EscalationStage::EvidenceCaptured;
        debug!(%stage, url = %notification.url, "Captcha evidence captured");

        if let Err(e) = self.signal.arm().await {
            warn!(error = %e, "Could not clear earlier captcha confirmation");
        }
        if let Err(e) = self.notify(&notification) {
            error!(error = %e, "Failed to write captcha notification");
        }
        pause_running(store, &notification.message);
        stage = EscalationStage::Paused;
        info!(%stage, "Run paused until the captcha is solved");

        if self.open_browser {
            if let Err(e) = open_in_browser(&notification.url) {
                warn!(error = %e, "Could not open the system browser");
            }
        }

        if let Err(e) = self.signal.wait(&notification).await {
            stage = EscalationStage::Aborted;
            error!(%stage, error = %e, "Captcha resolution unavailable");
            return EscalationOutcome::Aborted(e.to_string());
        }

        if let Err(e) = driver.reload().await {
            warn!(error = %e, "Reload after captcha resolution failed");
            return EscalationOutcome::StillPresent;
        }

        match self.check(driver).await {
            Ok(None) => {
                stage = EscalationStage::Resolved;
                info!(%stage, "Captcha cleared, resuming");
                resume_paused(store);
                self.clear_notification();
                EscalationOutcome::Resolved
            }
            Ok(Some(_)) => {
                warn!("Captcha still present after resolution");
                EscalationOutcome::StillPresent
            }
            Err(e) => {
                warn!(error = %e, "Could not re-check page after resolution");
                EscalationOutcome::StillPresent
            }
        }
    }
}

#[cfg(test)]
impl CaptchaEscalation {
    pub fn notification_path(&self) -> &std::path::Path {
        &self.notification_path
    }
}

/// Flag the running record as paused; failures are only logged
fn pause_running<S: RunStore + ?Sized>(store: &S, message: &str) {
    match store.find_running() {
        Ok(Some(mut run)) => {
            run.finish(RunStatus::Paused, Utc::now(), Some(message.to_string()));
            run.message = Some("Paused: waiting for captcha resolution".to_string());
            if let Err(e) = store.update_run(&run) {
                error!(error = %e, "Failed to mark run as paused");
            }
        }
        Ok(None) => debug!("No running record to pause"),
        Err(e) => error!(error = %e, "Failed to look up running record"),
    }
}

/// Put the paused record back in `running` once the operator cleared the challenge
fn resume_paused<S: RunStore + ?Sized>(store: &S) {
    let paused = match store.recent_runs(1) {
        Ok(runs) => runs.into_iter().find(|r| r.status == RunStatus::Paused),
        Err(e) => {
            warn!(error = %e, "Failed to look up paused record");
            None
        }
    };

    if let Some(mut run) = paused {
        run.status = RunStatus::Running;
        run.ended_at = None;
        run.error = None;
        run.message = Some("Captcha solved, resuming".to_string());
        if let Err(e) = store.update_run(&run) {
            warn!(error = %e, "Failed to resume paused record");
        }
    }
}
