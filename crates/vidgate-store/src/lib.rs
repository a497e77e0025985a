//! # Vidgate Store
//!
//! DuckDB-backed persistence for the gateway.
//!
//! The quota ledger is the only piece of gateway state that must survive a
//! restart: a process that forgets how many units it spent today will happily
//! overspend the daily allowance. Job outcomes are appended to an audit log so
//! the CLI can show recent history.
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `quota_state` | One row per ledger, guarded by a version column |
//! | `job_log` | Terminal job outcomes, newest last |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vidgate_store::{LedgerStore, QuotaRecord};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = LedgerStore::open_default()?;
//!     let current = store.load_quota("default")?;
//!     let next = QuotaRecord {
//!         used_units: 100,
//!         daily_budget: 10_000,
//!         reset_at_unix: 1_700_000_000,
//!         version: 0,
//!     };
//!     let applied = store.compare_and_swap_quota("default", current.map(|r| r.version), &next)?;
//!     println!("applied: {applied:?}");
//!     Ok(())
//! }
//! ```

pub mod duckdb;
pub mod migrations;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{Connection, ToSql};
use serde::Serialize;
use thiserror::Error;

pub use duckdb::{AccessMode, ConnectionPool, PooledConnection};

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Location and pool sizing for the gateway database.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for vidgate state.
    pub home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept per access mode.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::for_home(resolve_vidgate_home())
    }
}

impl StoreConfig {
    /// Lay out the database under the given home directory.
    #[must_use]
    pub fn for_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let db_path = home.join("state").join("gateway.duckdb");
        Self {
            home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// Persisted quota ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaRecord {
    pub used_units: i64,
    pub daily_budget: i64,
    /// Next reset instant as unix seconds.
    pub reset_at_unix: i64,
    /// Incremented by every successful write.
    pub version: i64,
}

/// One terminal job outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLogRecord {
    pub job_id: String,
    pub operation_type: String,
    pub owner_id: Option<String>,
    pub status: String,
    pub attempts: i64,
    pub error_code: Option<String>,
    pub finished_at_unix: i64,
}

/// Handle to the gateway database.
#[derive(Clone)]
pub struct LedgerStore {
    config: StoreConfig,
    pool: ConnectionPool,
}

impl LedgerStore {
    /// Open the store under `$VIDGATE_HOME` (or `~/.vidgate`).
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the schema
    /// cannot be applied.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(StoreConfig::default())
    }

    /// Open the store with an explicit configuration.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the schema
    /// cannot be applied.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pool = ConnectionPool::open(config.db_path.clone(), config.max_pool_size)?;
        let store = Self { config, pool };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.pool.acquire(AccessMode::ReadWrite)?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Load the ledger row, if one has been written.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn load_quota(&self, ledger_id: &str) -> Result<Option<QuotaRecord>, StoreError> {
        let connection = self.pool.acquire(AccessMode::ReadOnly)?;
        select_quota(&connection, ledger_id)
    }

    /// Write `next` only if the stored version still equals `expected_version`.
    ///
    /// `None` means "no row yet". Returns the new version when the write was
    /// applied and `None` when another writer got there first. The `version`
    /// field of `next` is ignored.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub fn compare_and_swap_quota(
        &self,
        ledger_id: &str,
        expected_version: Option<i64>,
        next: &QuotaRecord,
    ) -> Result<Option<i64>, StoreError> {
        let connection = self.pool.acquire(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<Option<i64>, StoreError> {
            let current = select_quota(&connection, ledger_id)?.map(|record| record.version);
            if current != expected_version {
                return Ok(None);
            }

            match current {
                None => {
                    let params: [&dyn ToSql; 4] = [
                        &ledger_id,
                        &next.used_units,
                        &next.daily_budget,
                        &next.reset_at_unix,
                    ];
                    connection.execute(
                        "INSERT INTO quota_state \
                         (ledger_id, used_units, daily_budget, reset_at_unix, version, updated_at) \
                         VALUES (?, ?, ?, ?, 1, CURRENT_TIMESTAMP)",
                        params.as_slice(),
                    )?;
                    Ok(Some(1))
                }
                Some(version) => {
                    let next_version = version + 1;
                    let params: [&dyn ToSql; 6] = [
                        &next.used_units,
                        &next.daily_budget,
                        &next.reset_at_unix,
                        &next_version,
                        &ledger_id,
                        &version,
                    ];
                    let changed = connection.execute(
                        "UPDATE quota_state \
                         SET used_units = ?, daily_budget = ?, reset_at_unix = ?, version = ?, \
                             updated_at = CURRENT_TIMESTAMP \
                         WHERE ledger_id = ? AND version = ?",
                        params.as_slice(),
                    )?;
                    Ok((changed == 1).then_some(next_version))
                }
            }
        })();

        finalize_transaction(&connection, result)
    }

    /// Append one terminal job outcome.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub fn append_job_log(&self, record: &JobLogRecord) -> Result<(), StoreError> {
        let connection = self.pool.acquire(AccessMode::ReadWrite)?;
        let params: [&dyn ToSql; 7] = [
            &record.job_id,
            &record.operation_type,
            &record.owner_id,
            &record.status,
            &record.attempts,
            &record.error_code,
            &record.finished_at_unix,
        ];
        connection.execute(
            "INSERT INTO job_log \
             (job_id, operation_type, owner_id, status, attempts, error_code, finished_at_unix) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Most recent job outcomes, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn recent_job_log(&self, limit: usize) -> Result<Vec<JobLogRecord>, StoreError> {
        let connection = self.pool.acquire(AccessMode::ReadOnly)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut statement = connection.prepare(
            "SELECT job_id, operation_type, owner_id, status, attempts, error_code, \
             finished_at_unix FROM job_log ORDER BY finished_at_unix DESC, rowid DESC LIMIT ?",
        )?;
        let rows = statement.query_map([limit], |row| {
            Ok(JobLogRecord {
                job_id: row.get(0)?,
                operation_type: row.get(1)?,
                owner_id: row.get(2)?,
                status: row.get(3)?,
                attempts: row.get(4)?,
                error_code: row.get(5)?,
                finished_at_unix: row.get(6)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn select_quota(
    connection: &Connection,
    ledger_id: &str,
) -> Result<Option<QuotaRecord>, StoreError> {
    let mut statement = connection.prepare(
        "SELECT used_units, daily_budget, reset_at_unix, version \
         FROM quota_state WHERE ledger_id = ?",
    )?;
    let mut rows = statement.query_map([ledger_id], |row| {
        Ok(QuotaRecord {
            used_units: row.get(0)?,
            daily_budget: row.get(1)?,
            reset_at_unix: row.get(2)?,
            version: row.get(3)?,
        })
    })?;

    let record = rows.next().transpose()?;
    Ok(record)
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn resolve_vidgate_home() -> PathBuf {
    if let Some(path) = env::var_os("VIDGATE_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".vidgate");
    }

    PathBuf::from(".vidgate")
}
