use thiserror::Error;

/// Errors raised by the scraping pipeline and its stores
#[derive(Error, Debug)]
pub enum ScoutError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("A scraper run is already in progress ({id}); use --force to abort it")]
    RunInProgress { id: String },

    #[error("No account with role '{0}' available to own scraped listings")]
    NoOwnerAccount(String),

    #[error("Captcha left unresolved: {0}")]
    CaptchaUnresolved(String),
}

pub type Result<T> = std::result::Result<T, ScoutError>;
