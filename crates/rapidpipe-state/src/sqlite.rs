//! `SQLite`-backed implementation of [`QuarantineStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDateTime;
use rapidpipe_types::error::FailureCategory;
use rapidpipe_types::ids::{PipeId, QuarantineLocation};
use rapidpipe_types::quarantine::{QuarantineRecord, Timestamp};
use rusqlite::Connection;

use crate::backend::QuarantineStore;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for the quarantine table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS quarantine_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipe TEXT NOT NULL,
    location TEXT NOT NULL,
    partition_index INTEGER NOT NULL,
    record_index INTEGER NOT NULL,
    record_json TEXT NOT NULL,
    exit_code INTEGER NOT NULL,
    error_message TEXT NOT NULL,
    error_category TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_quarantine_location ON quarantine_records (location, id);
";

/// `SQLite`-backed quarantine storage.
///
/// Create with [`SqliteQuarantineStore::open`] for file-backed persistence
/// or [`SqliteQuarantineStore::in_memory`] for tests.
pub struct SqliteQuarantineStore {
    conn: Mutex<Connection>,
}

impl SqliteQuarantineStore {
    /// Open or create a `SQLite` quarantine database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| StateError::backend_context("open", e))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StateError::backend_context("open in-memory", e))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    /// Convert an ISO-8601 string to `SQLite` datetime format.
    fn iso8601_to_sqlite(iso: &str) -> String {
        chrono::DateTime::parse_from_rfc3339(iso).map_or_else(
            |_| iso.to_string(),
            |dt| dt.naive_utc().format(SQLITE_DATETIME_FMT).to_string(),
        )
    }

    #[cfg(test)]
    fn count_for_pipe(&self, pipe: &PipeId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM quarantine_records WHERE pipe = ?1",
            [pipe.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| StateError::backend_context("count_for_pipe", e))
    }
}

impl QuarantineStore for SqliteQuarantineStore {
    fn append(&self, pipe: &PipeId, records: &[QuarantineRecord]) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("append: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO quarantine_records \
                 (pipe, location, partition_index, record_index, record_json, exit_code, \
                  error_message, error_category, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .map_err(|e| StateError::backend_context("append: prepare", e))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                pipe.as_str(),
                record.location.as_str(),
                record.partition_index,
                record.record_index,
                record.record_json,
                record.exit_code,
                record.error_message,
                record.error_category.as_str(),
                Self::iso8601_to_sqlite(record.failed_at.as_str()),
            ])
            .map_err(|e| StateError::backend_context("append: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("append: commit", e))?;

        Ok(count)
    }

    fn load(&self, location: &QuarantineLocation) -> error::Result<Vec<QuarantineRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT partition_index, record_index, record_json, exit_code, \
                        error_message, error_category, failed_at \
                 FROM quarantine_records WHERE location = ?1 ORDER BY id",
            )
            .map_err(|e| StateError::backend_context("load: prepare", e))?;

        let rows = stmt
            .query_map([location.as_str()], |row| {
                let category: String = row.get(5)?;
                let failed_at: String = row.get(6)?;
                Ok(QuarantineRecord {
                    location: location.clone(),
                    partition_index: row.get(0)?,
                    record_index: row.get(1)?,
                    record_json: row.get(2)?,
                    exit_code: row.get(3)?,
                    error_message: row.get(4)?,
                    error_category: FailureCategory::parse(&category)
                        .unwrap_or(FailureCategory::Internal),
                    failed_at: Timestamp::new(Self::sqlite_to_iso8601(&failed_at)),
                })
            })
            .map_err(|e| StateError::backend_context("load: query", e))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("load: read row", e))
    }
}
