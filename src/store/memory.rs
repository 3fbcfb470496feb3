use super::{AccountStore, ListingStore, RunStore, SettingsStore};
use crate::error::{Result, ScoutError};
use crate::models::{Account, RunRecord, RunStatus, StoredListing};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    settings: HashMap<String, String>,
    accounts: Vec<Account>,
    listings: HashMap<String, StoredListing>,
    runs: Vec<RunRecord>,
    failing_listings: HashSet<String>,
    settings_unavailable: bool,
}

/// In-memory store for tests
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a single admin account, ready to own listings
    pub fn with_owner() -> Self {
        let store = Self::new();
        store.lock().accounts.push(Account::new("admin@example.com", "admin"));
        store
    }

    /// Make every write of this listing fail
    pub fn fail_writes_for(&self, external_id: &str) {
        self.lock().failing_listings.insert(external_id.to_string());
    }

    pub fn make_settings_unavailable(&self) {
        self.lock().settings_unavailable = true;
    }

    pub fn listing_count(&self) -> usize {
        self.lock().listings.len()
    }

    pub fn setting(&self, key: &str) -> Option<String> {
        self.lock().settings.get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(inner: &Inner, external_id: &str) -> Result<()> {
        if inner.failing_listings.contains(external_id) {
            return Err(ScoutError::Io(std::io::Error::other(format!("write rejected for {external_id}"))));
        }
        Ok(())
    }
}

impl SettingsStore for MemoryStore {
    fn load_settings(&self) -> Result<HashMap<String, String>> {
        let inner = self.lock();
        if inner.settings_unavailable {
            return Err(ScoutError::Io(std::io::Error::other("settings unavailable")));
        }
        Ok(inner.settings.clone())
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.settings_unavailable {
            return Err(ScoutError::Io(std::io::Error::other("settings unavailable")));
        }
        inner.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl AccountStore for MemoryStore {
    fn find_account_by_role(&self, role: &str) -> Result<Option<Account>> {
        Ok(self.lock().accounts.iter().find(|a| a.role == role).cloned())
    }

    fn insert_account(&self, account: &Account) -> Result<()> {
        self.lock().accounts.push(account.clone());
        Ok(())
    }
}

impl ListingStore for MemoryStore {
    fn find_listing(&self, external_id: &str) -> Result<Option<StoredListing>> {
        Ok(self.lock().listings.get(external_id).cloned())
    }

    fn insert_listing(&self, listing: &StoredListing) -> Result<()> {
        let mut inner = self.lock();
        Self::check_writable(&inner, &listing.external_id)?;
        inner
            .listings
            .insert(listing.external_id.clone(), listing.clone());
        Ok(())
    }

    fn update_listing(&self, listing: &StoredListing) -> Result<()> {
        let mut inner = self.lock();
        Self::check_writable(&inner, &listing.external_id)?;
        inner
            .listings
            .insert(listing.external_id.clone(), listing.clone());
        Ok(())
    }
}

impl RunStore for MemoryStore {
    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let mut inner = self.lock();
        if run.status == RunStatus::Running {
            if let Some(existing) = inner.runs.iter().find(|r| r.status == RunStatus::Running) {
                return Err(ScoutError::RunInProgress { id: existing.id.clone() });
            }
        }
        inner.runs.push(run.clone());
        Ok(())
    }

    fn update_run(&self, run: &RunRecord) -> Result<()> {
        let mut inner = self.lock();
        match inner.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(ScoutError::Io(std::io::Error::other(format!("unknown run {}", run.id)))),
        }
    }

    fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        Ok(self.lock().runs.iter().find(|r| r.id == id).cloned())
    }

    fn find_running(&self) -> Result<Option<RunRecord>> {
        Ok(self
            .lock()
            .runs
            .iter()
            .find(|r| r.status == RunStatus::Running)
            .cloned())
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut runs = self.lock().runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}
