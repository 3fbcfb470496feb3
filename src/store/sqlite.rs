use super::{AccountStore, ListingStore, RunStore, SettingsStore};
use crate::error::{Result, ScoutError};
use crate::models::{Account, RunRecord, RunStatus, Source, StoredListing};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS listings (
    external_id TEXT PRIMARY KEY,
    title TEXT,
    description TEXT NOT NULL,
    location TEXT,
    price INTEGER,
    source TEXT NOT NULL,
    source_url TEXT NOT NULL,
    owner_id TEXT NOT NULL REFERENCES accounts(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scraper_runs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    collected INTEGER NOT NULL DEFAULT 0,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    skipped_recent INTEGER NOT NULL DEFAULT 0,
    progress REAL NOT NULL DEFAULT 0,
    message TEXT,
    pid INTEGER,
    log_tail TEXT NOT NULL DEFAULT '',
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_scraper_runs_status ON scraper_runs(status);

CREATE UNIQUE INDEX IF NOT EXISTS idx_scraper_runs_single_running
    ON scraper_runs(status) WHERE status = 'running';
"#;

const RUN_COLUMNS: &str = "id, status, started_at, ended_at, collected, created, updated, \
     skipped_recent, progress, message, pid, log_tail, error";

const LISTING_COLUMNS: &str = "external_id, title, description, location, price, source, \
     source_url, owner_id, created_at, updated_at";

/// SQLite-backed store shared by the orchestrator and the scraper process
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.connect()?.execute_batch(SCHEMA)?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        // Orchestrator and scraper write concurrently
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time_opt(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(idx, v)).transpose()
}

fn run_from_row(row: &Row) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(1)?;
    Ok(RunRecord {
        id: row.get(0)?,
        // Unknown statuses come from a newer writer; treat them as failed runs
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Error),
        started_at: parse_time(2, row.get(2)?)?,
        ended_at: parse_time_opt(3, row.get(3)?)?,
        collected: row.get(4)?,
        created: row.get(5)?,
        updated: row.get(6)?,
        skipped_recent: row.get(7)?,
        progress: row.get(8)?,
        message: row.get(9)?,
        pid: row.get(10)?,
        log_tail: row.get(11)?,
        error: row.get(12)?,
    })
}

fn listing_from_row(row: &Row) -> rusqlite::Result<StoredListing> {
    let source: String = row.get(5)?;
    Ok(StoredListing {
        external_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        location: row.get(3)?,
        price: row.get(4)?,
        source: Source::parse(&source).unwrap_or(Source::Leboncoin),
        source_url: row.get(6)?,
        owner_id: row.get(7)?,
        created_at: parse_time(8, row.get(8)?)?,
        updated_at: parse_time(9, row.get(9)?)?,
    })
}

impl SettingsStore for SqliteStore {
    fn load_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT key, value FROM settings WHERE value IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<HashMap<String, String>>>()?)
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.connect()?.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl AccountStore for SqliteStore {
    fn find_account_by_role(&self, role: &str) -> Result<Option<Account>> {
        let conn = self.connect()?;
        let account = conn
            .query_row(
                "SELECT id, email, role, created_at FROM accounts
                 WHERE role = ?1 ORDER BY created_at ASC LIMIT 1",
                params![role],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        role: row.get(2)?,
                        created_at: parse_time(3, row.get(3)?)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    fn insert_account(&self, account: &Account) -> Result<()> {
        self.connect()?.execute(
            "INSERT INTO accounts (id, email, role, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                account.id,
                account.email,
                account.role,
                account.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

impl ListingStore for SqliteStore {
    fn find_listing(&self, external_id: &str) -> Result<Option<StoredListing>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE external_id = ?1");
        Ok(conn
            .query_row(&sql, params![external_id], listing_from_row)
            .optional()?)
    }

    fn insert_listing(&self, listing: &StoredListing) -> Result<()> {
        let sql = format!(
            "INSERT INTO listings ({LISTING_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        );
        self.connect()?.execute(
            &sql,
            params![
                listing.external_id,
                listing.title,
                listing.description,
                listing.location,
                listing.price,
                listing.source.as_str(),
                listing.source_url,
                listing.owner_id,
                listing.created_at.to_rfc3339(),
                listing.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update_listing(&self, listing: &StoredListing) -> Result<()> {
        // created_at is never rewritten
        self.connect()?.execute(
            "UPDATE listings SET title = ?2, description = ?3, location = ?4, price = ?5,
                 source = ?6, source_url = ?7, owner_id = ?8, updated_at = ?9
             WHERE external_id = ?1",
            params![
                listing.external_id,
                listing.title,
                listing.description,
                listing.location,
                listing.price,
                listing.source.as_str(),
                listing.source_url,
                listing.owner_id,
                listing.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl RunStore for SqliteStore {
    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO scraper_runs ({RUN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        );
        let inserted = self.connect()?.execute(
            &sql,
            params![
                run.id,
                run.status.as_str(),
                run.started_at.to_rfc3339(),
                run.ended_at.map(|t| t.to_rfc3339()),
                run.collected,
                run.created,
                run.updated,
                run.skipped_recent,
                run.progress,
                run.message,
                run.pid,
                run.log_tail,
                run.error,
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            // At most one row may be `running`; a concurrent start lost the race
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    && run.status == RunStatus::Running =>
            {
                let id = self.find_running()?.map(|r| r.id).unwrap_or_default();
                Err(ScoutError::RunInProgress { id })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_run(&self, run: &RunRecord) -> Result<()> {
        self.connect()?.execute(
            "UPDATE scraper_runs SET status = ?2, started_at = ?3, ended_at = ?4,
                 collected = ?5, created = ?6, updated = ?7, skipped_recent = ?8,
                 progress = ?9, message = ?10, pid = ?11, log_tail = ?12, error = ?13
             WHERE id = ?1",
            params![
                run.id,
                run.status.as_str(),
                run.started_at.to_rfc3339(),
                run.ended_at.map(|t| t.to_rfc3339()),
                run.collected,
                run.created,
                run.updated,
                run.skipped_recent,
                run.progress,
                run.message,
                run.pid,
                run.log_tail,
                run.error,
            ],
        )?;
        Ok(())
    }

    fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {RUN_COLUMNS} FROM scraper_runs WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], run_from_row).optional()?)
    }

    fn find_running(&self) -> Result<Option<RunRecord>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM scraper_runs WHERE status = 'running'
             ORDER BY started_at DESC LIMIT 1"
        );
        Ok(conn.query_row(&sql, [], run_from_row).optional()?)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.connect()?;
        let sql = format!("SELECT {RUN_COLUMNS} FROM scraper_runs ORDER BY started_at DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
