use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};

use crate::db::schema::{init_db, open_connection};
use crate::error::{Error, Result};
use crate::models::{DownloadRecord, DownloadStatus, NewDownload};

const RECORD_COLUMNS: &str = "id, file_name, file_type, url, date_str, file_path, status, progress, \
     error_message, retry_count, created_at, updated_at, completed_at";

/// Durable record of every download attempt, backed by SQLite.
///
/// Each operation opens its own connection, so the store can be cloned
/// into worker threads freely. Writes to a record happen inside a single
/// statement or an immediate transaction.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    db_path: PathBuf,
}

impl DownloadStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_connection(&db_path)?;
        init_db(&conn)?;
        Ok(Self { db_path })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connection(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    pub fn create(&self, download: &NewDownload<'_>) -> Result<i64> {
        let now = Utc::now().timestamp();
        let conn = self.connection()?;

        conn.execute(
            "INSERT INTO downloads
             (file_name, file_type, url, date_str, file_path, status, progress, retry_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0.0, 0, ?7, ?7)",
            params![
                download.file_name,
                download.file_type,
                download.url,
                download.date,
                download.file_path,
                DownloadStatus::Pending,
                now
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Moves a record to `status`. `None` for `progress` or `error_message`
    /// keeps the stored value. Progress never moves backwards while a
    /// record stays in `downloading`.
    pub fn update_status(
        &self,
        id: i64,
        status: DownloadStatus,
        progress: Option<f64>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (current, current_progress): (DownloadStatus, f64) = tx
            .query_row(
                "SELECT status, progress FROM downloads WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(Error::NotFound(id))?;

        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition { id, from: current, to: status });
        }

        let progress = match (current, status) {
            (DownloadStatus::Downloading, DownloadStatus::Downloading) => {
                progress.map(|p| p.max(current_progress))
            }
            _ => progress,
        }
        .map(|p| p.clamp(0.0, 100.0));

        tx.execute(
            "UPDATE downloads
             SET status = ?1,
                 updated_at = ?2,
                 progress = COALESCE(?3, progress),
                 error_message = COALESCE(?4, error_message),
                 completed_at = CASE WHEN ?5 THEN ?2 ELSE completed_at END
             WHERE id = ?6",
            params![status, now, progress, error_message, status.is_terminal_success(), id],
        )?;
        tx.commit()?;

        Ok(())
    }

    pub fn increment_retry(&self, id: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        let updated = self.connection()?.execute(
            "UPDATE downloads SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    /// Puts a record back to `pending` for another attempt. The retry
    /// count is left alone; see [`DownloadStore::increment_retry`].
    pub fn reset(&self, id: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        let updated = self.connection()?.execute(
            "UPDATE downloads
             SET status = ?1,
                 progress = 0.0,
                 error_message = NULL,
                 completed_at = NULL,
                 updated_at = ?2
             WHERE id = ?3",
            params![DownloadStatus::Pending, now, id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<DownloadRecord>> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM downloads WHERE id = ?1"),
                [id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadRecord>> {
        self.query(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM downloads
                 WHERE status = ?1
                 ORDER BY created_at DESC, id DESC"
            ),
            params![status],
        )
    }

    /// Records whose trading day falls in `[start, end]`, newest day first,
    /// then by file type, newest attempt first.
    pub fn list_by_date_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DownloadRecord>> {
        self.query(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM downloads
                 WHERE date_str BETWEEN ?1 AND ?2
                 ORDER BY date_str DESC, file_type, id DESC"
            ),
            params![start, end],
        )
    }

    pub fn list_failed(&self) -> Result<Vec<DownloadRecord>> {
        self.query(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM downloads
                 WHERE status = ?1
                 ORDER BY updated_at DESC, id DESC"
            ),
            params![DownloadStatus::Failed],
        )
    }

    /// Everything not yet completed: pending, then downloading, then failed.
    pub fn list_active(&self) -> Result<Vec<DownloadRecord>> {
        let mut records = Vec::new();
        for status in [DownloadStatus::Pending, DownloadStatus::Downloading, DownloadStatus::Failed] {
            records.extend(self.list_by_status(status)?);
        }
        Ok(records)
    }

    /// Latest completed record for a local file name, if any.
    pub fn find_completed(&self, file_name: &str) -> Result<Option<DownloadRecord>> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM downloads
                     WHERE file_name = ?1 AND status = ?2
                     ORDER BY id DESC LIMIT 1"
                ),
                params![file_name, DownloadStatus::Completed],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Whether any attempt, in any state, was ever recorded for `file_name`.
    pub fn has_record(&self, file_name: &str) -> Result<bool> {
        let conn = self.connection()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM downloads WHERE file_name = ?1 LIMIT 1",
                [file_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<DownloadRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(params, record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    Ok(DownloadRecord {
        id: row.get(0)?,
        file_name: row.get(1)?,
        file_type: row.get(2)?,
        url: row.get(3)?,
        date: row.get(4)?,
        file_path: row.get(5)?,
        status: row.get(6)?,
        progress: row.get(7)?,
        error_message: row.get(8)?,
        retry_count: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}
