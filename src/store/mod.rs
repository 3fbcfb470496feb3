//! Persistence seams used by the scraper.
//!
//! The pipeline only talks to these traits; `SqliteStore` backs them in
//! production and `MemoryStore` in tests.

#[cfg(test)]
pub mod memory;
pub mod sqlite;

use crate::error::Result;
use crate::models::{Account, RunRecord, StoredListing};
use std::collections::HashMap;

#[cfg(test)]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Key/value settings shared with the admin side
pub trait SettingsStore {
    fn load_settings(&self) -> Result<HashMap<String, String>>;

    fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

pub trait AccountStore {
    /// First account carrying the given role, oldest first
    fn find_account_by_role(&self, role: &str) -> Result<Option<Account>>;

    fn insert_account(&self, account: &Account) -> Result<()>;
}

pub trait ListingStore {
    fn find_listing(&self, external_id: &str) -> Result<Option<StoredListing>>;

    fn insert_listing(&self, listing: &StoredListing) -> Result<()>;

    fn update_listing(&self, listing: &StoredListing) -> Result<()>;
}

pub trait RunStore {
    fn insert_run(&self, run: &RunRecord) -> Result<()>;

    fn update_run(&self, run: &RunRecord) -> Result<()>;

    fn get_run(&self, id: &str) -> Result<Option<RunRecord>>;

    /// The record currently in `running` state, if any
    fn find_running(&self) -> Result<Option<RunRecord>>;

    /// Most recent runs first
    fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>>;
}

/// Everything the scraper and its orchestrator persist
pub trait Store: SettingsStore + AccountStore + ListingStore + RunStore + Send + Sync {}

impl<T> Store for T where T: SettingsStore + AccountStore + ListingStore + RunStore + Send + Sync {}
