use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Source of a stored listing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Leboncoin,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Leboncoin => "leboncoin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "leboncoin" => Some(Source::Leboncoin),
            _ => None,
        }
    }
}

/// Listing card scraped from an index page, before reconciliation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListingCandidate {
    pub url: String,
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub location: Option<String>,
    /// Filled from the detail page when detail fetching is enabled
    pub description: Option<String>,
}

/// Persisted listing, keyed by the identifier taken from the source URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredListing {
    pub external_id: String,
    pub title: Option<String>,
    pub description: String,
    pub location: Option<String>,
    pub price: Option<i64>,
    pub source: Source,
    pub source_url: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account that scraped listings are attributed to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(email: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            role: role.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Aborted,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Aborted => "aborted",
            RunStatus::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "error" => Some(RunStatus::Error),
            "aborted" => Some(RunStatus::Aborted),
            "paused" => Some(RunStatus::Paused),
            _ => None,
        }
    }
}

/// Status and progress of one scraper invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub collected: u32,
    pub created: u32,
    pub updated: u32,
    pub skipped_recent: u32,
    pub progress: f64,
    pub message: Option<String>,
    pub pid: Option<u32>,
    pub log_tail: String,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
            collected: 0,
            created: 0,
            updated: 0,
            skipped_recent: 0,
            progress: 0.0,
            message: Some("Starting".to_string()),
            pid: None,
            log_tail: String::new(),
            error: None,
        }
    }

    /// Move the record into a terminal state
    pub fn finish(&mut self, status: RunStatus, now: DateTime<Utc>, error: Option<String>) {
        self.status = status;
        self.ended_at = Some(now);
        if status == RunStatus::Success {
            self.progress = 1.0;
        }
        if error.is_some() {
            self.error = error;
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    Recaptcha,
    Hcaptcha,
    Image,
    Other,
    Unknown,
}

/// Evidence captured when a challenge is detected
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptchaDiagnostics {
    pub html_snippet: Option<String>,
    /// Base64 encoded PNG
    pub screenshot: Option<String>,
    pub text_found: bool,
    pub body_excerpt: Option<String>,
}

/// Alert written for the operator when a run is paused on a challenge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptchaNotification {
    pub detected: bool,
    pub challenge_type: ChallengeType,
    pub url: String,
    pub diagnostics: CaptchaDiagnostics,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}
