use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle state of a tracked download.
///
/// `pending -> downloading -> {completed | failed}`, with `pending -> failed`
/// allowed for failures detected before any byte is written. Leaving
/// `failed` or `completed` requires an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub const ALL: [DownloadStatus; 4] = [
        DownloadStatus::Pending,
        DownloadStatus::Downloading,
        DownloadStatus::Completed,
        DownloadStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    /// Whether `update_status` may move a record from `self` to `next`.
    /// Resets bypass this check.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match self {
            Pending => matches!(next, Downloading | Failed),
            // progress updates keep the record in `downloading`
            Downloading => matches!(next, Downloading | Completed | Failed),
            Completed | Failed => false,
        }
    }

    pub fn is_terminal_success(self) -> bool {
        matches!(self, DownloadStatus::Completed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DownloadStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::UnknownStatus(s.to_string()))
    }
}

/// Kind of exchange file fetched for each trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Combined open-interest report.
    FoUdiff,
    FoParticipantOi,
    /// Security-wise delivery report (MTO).
    CmDelivery,
    CmUdiff,
    /// Cash-market bhavcopy.
    CmBhavcopy,
    /// Derivatives bhavcopy.
    FoBhavcopy,
}

impl FileType {
    /// Every file type, in the order downloads are issued for a day.
    pub const ALL: [FileType; 6] = [
        FileType::FoUdiff,
        FileType::FoParticipantOi,
        FileType::CmDelivery,
        FileType::CmUdiff,
        FileType::CmBhavcopy,
        FileType::FoBhavcopy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::FoUdiff => "fo_udiff",
            FileType::FoParticipantOi => "fo_participant_oi",
            FileType::CmDelivery => "cm_delivery",
            FileType::CmUdiff => "cm_udiff",
            FileType::CmBhavcopy => "cm_bhavcopy",
            FileType::FoBhavcopy => "fo_bhavcopy",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileType::ALL
            .into_iter()
            .find(|file_type| file_type.as_str() == s)
            .ok_or_else(|| Error::UnknownFileType(s.to_string()))
    }
}

impl ToSql for DownloadStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DownloadStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for FileType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FileType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One tracked download. A retry resets this row in place rather than
/// inserting a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: i64,
    pub file_name: String,
    pub file_type: FileType,
    pub url: String,
    /// Trading day the file covers.
    pub date: NaiveDate,
    pub file_path: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// Fields supplied when a download is first recorded.
#[derive(Debug, Clone)]
pub struct NewDownload<'a> {
    pub file_name: &'a str,
    pub file_type: FileType,
    pub url: &'a str,
    pub date: NaiveDate,
    pub file_path: &'a str,
}
