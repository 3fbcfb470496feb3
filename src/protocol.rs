//! Line protocol and exit codes shared by the scraper process and its orchestrator.
//!
//! The two processes share no memory: the scraper prints sentinel-prefixed
//! JSON lines on stdout, the orchestrator greps them out of the captured
//! output and maps the exit code to a run status.

use crate::models::RunStatus;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::ExitCode;
use std::sync::OnceLock;

pub const PROGRESS_PREFIX: &str = "[[LBC_PROGRESS]]";
pub const METRICS_PREFIX: &str = "[[LBC_METRICS]]";

/// Terminal outcome of a scraper process, carried as its exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// At least one listing was reconciled
    Success,
    /// Attempts exhausted or a fatal precondition failed
    Failed,
    /// A captcha needs a human before the run can continue
    PausedForCaptcha,
}

impl RunOutcome {
    pub const fn code(self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failed => 1,
            RunOutcome::PausedForCaptcha => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RunOutcome::Success),
            1 => Some(RunOutcome::Failed),
            2 => Some(RunOutcome::PausedForCaptcha),
            _ => None,
        }
    }

    pub fn run_status(self) -> RunStatus {
        match self {
            RunOutcome::Success => RunStatus::Success,
            RunOutcome::Failed => RunStatus::Error,
            RunOutcome::PausedForCaptcha => RunStatus::Paused,
        }
    }
}

impl From<RunOutcome> for ExitCode {
    fn from(outcome: RunOutcome) -> Self {
        ExitCode::from(outcome.code())
    }
}

/// Progress update, either step based or in the older phase based shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProgressEvent {
    Step {
        step: u32,
        #[serde(rename = "totalSteps")]
        total_steps: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Phase(PhaseProgress),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum PhaseProgress {
    List {
        page: u32,
        #[serde(rename = "totalPages")]
        total_pages: u32,
    },
    Detail {
        index: u32,
        total: u32,
    },
}

fn ratio(done: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0)
}

impl ProgressEvent {
    pub fn step(step: u32, total_steps: u32, message: impl Into<String>) -> Self {
        ProgressEvent::Step {
            step,
            total_steps,
            message: Some(message.into()),
        }
    }

    pub fn list(page: u32, total_pages: u32) -> Self {
        ProgressEvent::Phase(PhaseProgress::List { page, total_pages })
    }

    pub fn detail(index: u32, total: u32) -> Self {
        ProgressEvent::Phase(PhaseProgress::Detail { index, total })
    }

    /// Completion in [0, 1]. Listing pages cover the first half, detail pages the second.
    pub fn fraction(&self) -> f64 {
        match self {
            ProgressEvent::Step {
                step, total_steps, ..
            } => ratio(*step, *total_steps),
            ProgressEvent::Phase(PhaseProgress::List { page, total_pages }) => {
                0.5 * ratio(*page, *total_pages)
            }
            ProgressEvent::Phase(PhaseProgress::Detail { index, total }) => {
                0.5 + 0.5 * ratio(*index, *total)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ProgressEvent::Step {
                message: Some(message),
                ..
            } => message.clone(),
            ProgressEvent::Step {
                step, total_steps, ..
            } => format!("Step {step}/{total_steps}"),
            ProgressEvent::Phase(PhaseProgress::List { page, total_pages }) => {
                format!("Listing page {page}/{total_pages}")
            }
            ProgressEvent::Phase(PhaseProgress::Detail { index, total }) => {
                format!("Detail page {index}/{total}")
            }
        }
    }
}

/// Final reconciliation counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEvent {
    pub created: u32,
    pub updated: u32,
    pub skipped_recent: u32,
    pub cooldown_hours: u32,
}

pub fn progress_line(event: &ProgressEvent) -> String {
    // Serializing these plain structs cannot fail
    let json = serde_json::to_string(event).unwrap_or_default();
    format!("{PROGRESS_PREFIX} {json}")
}

pub fn metrics_line(metrics: &MetricsEvent) -> String {
    let json = serde_json::to_string(metrics).unwrap_or_default();
    format!("{METRICS_PREFIX} {json}")
}

/// The orchestrator matches this phrasing literally
pub fn collected_line(collected: u32) -> String {
    format!("Scraping completed: {collected} listings collected")
}

fn collected_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Scraping completed: (\d+) listings collected").expect("static pattern")
    })
}

/// One recognised protocol line
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolLine {
    Progress(ProgressEvent),
    Metrics(MetricsEvent),
    Collected(u32),
}

/// Recognise a protocol line anywhere in a captured output line
pub fn parse_line(line: &str) -> Option<ProtocolLine> {
    if let Some(pos) = line.find(PROGRESS_PREFIX) {
        let json = line[pos + PROGRESS_PREFIX.len()..].trim();
        return serde_json::from_str(json).ok().map(ProtocolLine::Progress);
    }
    if let Some(pos) = line.find(METRICS_PREFIX) {
        let json = line[pos + METRICS_PREFIX.len()..].trim();
        return serde_json::from_str(json).ok().map(ProtocolLine::Metrics);
    }
    collected_regex()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .map(ProtocolLine::Collected)
}

/// Print a line on stdout for the orchestrator
pub fn emit(line: &str) {
    println!("{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(RunOutcome::Success.code(), 0);
        assert_eq!(RunOutcome::Failed.code(), 1);
        assert_eq!(RunOutcome::PausedForCaptcha.code(), 2);
        assert_eq!(RunOutcome::from_code(2), Some(RunOutcome::PausedForCaptcha));
        assert_eq!(RunOutcome::from_code(137), None);
        assert_eq!(RunOutcome::PausedForCaptcha.run_status(), RunStatus::Paused);
    }

    #[test]
    fn test_parse_step_progress() {
        let line = r#"[[LBC_PROGRESS]] {"step":2,"totalSteps":4,"message":"Extracting"}"#;
        let Some(ProtocolLine::Progress(event)) = parse_line(line) else {
            panic!("progress line not recognised");
        };
        assert_eq!(event.fraction(), 0.5);
        assert_eq!(event.describe(), "Extracting");
    }

    #[test]
    fn test_parse_legacy_phase_progress() {
        let list = parse_line(r#"[[LBC_PROGRESS]] {"phase":"list","page":1,"totalPages":2}"#);
        assert_eq!(list, Some(ProtocolLine::Progress(ProgressEvent::list(1, 2))));

        let detail = parse_line(r#"[[LBC_PROGRESS]] {"phase":"detail","index":5,"total":10}"#);
        let Some(ProtocolLine::Progress(event)) = detail else {
            panic!("detail line not recognised");
        };
        assert_eq!(event.fraction(), 0.75);
    }

    #[test]
    fn test_metrics_line_uses_camel_case() {
        let metrics = MetricsEvent {
            created: 3,
            updated: 1,
            skipped_recent: 2,
            cooldown_hours: 6,
        };
        let line = metrics_line(&metrics);
        assert!(line.contains(r#""skippedRecent":2"#));
        assert!(line.contains(r#""cooldownHours":6"#));
        assert_eq!(parse_line(&line), Some(ProtocolLine::Metrics(metrics)));
    }

    #[test]
    fn test_collected_line_inside_log_prefix() {
        let line = format!("2026-10-19T10:00:00Z INFO {}", collected_line(7));
        assert_eq!(parse_line(&line), Some(ProtocolLine::Collected(7)));
        assert_eq!(parse_line("nothing to see"), None);
    }
}
