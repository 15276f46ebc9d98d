use std::io;

use chrono::NaiveDate;

use crate::models::DownloadStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Download not found: {0}")]
    NotFound(i64),

    #[error("Download already completed: {0}")]
    AlreadyCompleted(i64),

    #[error("download {id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: DownloadStatus,
        to: DownloadStatus,
    },

    #[error("setting '{0}' is not configured")]
    MissingSetting(&'static str),

    #[error("start date {start} is after end date {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("Unknown file type: {0}")]
    UnknownFileType(String),

    #[error("Unknown download status: {0}")]
    UnknownStatus(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("workbook service failed: {0}")]
    Workbook(String),

    #[error("unable to determine the user config directory")]
    NoConfigDir,
}

pub type Result<T> = std::result::Result<T, Error>;
