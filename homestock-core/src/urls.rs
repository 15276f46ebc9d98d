//! Exchange archive URLs and local file naming.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::models::FileType;

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Date parts as they appear in archive names, e.g. `(15, "DEC", 2023, 12)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateParts {
    pub day: u32,
    pub month: &'static str,
    pub year: i32,
    pub month_num: u32,
}

impl From<NaiveDate> for DateParts {
    fn from(date: NaiveDate) -> Self {
        Self {
            day: date.day(),
            month: MONTHS[date.month0() as usize],
            year: date.year(),
            month_num: date.month(),
        }
    }
}

/// Caller-supplied URLs that replace the generated default for a file type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlOverrides {
    pub fo_udiff: Option<String>,
    pub fo_participant_oi: Option<String>,
    pub cm_delivery: Option<String>,
    pub cm_udiff: Option<String>,
    pub cm_bhavcopy: Option<String>,
    pub fo_bhavcopy: Option<String>,
}

impl UrlOverrides {
    pub fn get(&self, file_type: FileType) -> Option<&str> {
        let url = match file_type {
            FileType::FoUdiff => &self.fo_udiff,
            FileType::FoParticipantOi => &self.fo_participant_oi,
            FileType::CmDelivery => &self.cm_delivery,
            FileType::CmUdiff => &self.cm_udiff,
            FileType::CmBhavcopy => &self.cm_bhavcopy,
            FileType::FoBhavcopy => &self.fo_bhavcopy,
        };
        url.as_deref().filter(|url| !url.is_empty())
    }

    pub fn set(&mut self, file_type: FileType, url: impl Into<String>) {
        let slot = match file_type {
            FileType::FoUdiff => &mut self.fo_udiff,
            FileType::FoParticipantOi => &mut self.fo_participant_oi,
            FileType::CmDelivery => &mut self.cm_delivery,
            FileType::CmUdiff => &mut self.cm_udiff,
            FileType::CmBhavcopy => &mut self.cm_bhavcopy,
            FileType::FoBhavcopy => &mut self.fo_bhavcopy,
        };
        *slot = Some(url.into());
    }

    /// Same override for every file type.
    pub fn all(url: impl Into<String>) -> Self {
        let url = url.into();
        let mut overrides = Self::default();
        for file_type in FileType::ALL {
            overrides.set(file_type, url.clone());
        }
        overrides
    }
}

/// Default archive URL for one file type on one day.
pub fn default_url(file_type: FileType, date: NaiveDate) -> String {
    let DateParts { day, month, year, month_num } = DateParts::from(date);
    match file_type {
        FileType::FoUdiff | FileType::FoParticipantOi => format!(
            "https://www.nseindia.com/archives/nsccl/mwpl/combineoi_{:02}{:02}{}.zip",
            day, month_num, year
        ),
        FileType::CmDelivery => format!(
            "https://www.nseindia.com/archives/equities/mto/MTO_{:02}{:02}{}.DAT",
            day, month_num, year
        ),
        FileType::CmUdiff | FileType::CmBhavcopy => format!(
            "https://www.nseindia.com/content/historical/EQUITIES/{}/{}/cm{:02}{}{}bhav.csv.zip",
            year, month, day, month, year
        ),
        FileType::FoBhavcopy => format!(
            "https://www.nseindia.com/content/historical/DERIVATIVES/{}/{}/fo{:02}{}{}bhav.csv.zip",
            year, month, day, month, year
        ),
    }
}

/// URL for one file type, preferring an override. The participant OI file
/// follows the combined OI URL (overridden or not) unless it has its own.
pub fn resolve_url(file_type: FileType, date: NaiveDate, overrides: &UrlOverrides) -> String {
    if let Some(url) = overrides.get(file_type) {
        return url.to_string();
    }
    match file_type {
        FileType::FoParticipantOi => resolve_url(FileType::FoUdiff, date, overrides),
        _ => default_url(file_type, date),
    }
}

/// Every file type's URL for one day, in download order.
pub fn generate_urls(date: NaiveDate, overrides: &UrlOverrides) -> Vec<(FileType, String)> {
    FileType::ALL
        .into_iter()
        .map(|file_type| (file_type, resolve_url(file_type, date, overrides)))
        .collect()
}

/// Local name for a downloaded file: `{file_type}_{YYYY-MM-DD}{ext}`.
pub fn local_file_name(file_type: FileType, date: NaiveDate, url: &str) -> String {
    let ext = if url.ends_with(".zip") {
        ".zip"
    } else if url.ends_with(".DAT") {
        ".DAT"
    } else {
        ".csv"
    };
    format!("{}_{}{}", file_type, date.format("%Y-%m-%d"), ext)
}

/// Inverse of [`local_file_name`], for files found on disk without a record.
pub fn parse_local_file_name(file_name: &str) -> Option<(FileType, NaiveDate)> {
    let stem = file_name.split('.').next()?;
    let (file_type, date) = stem.rsplit_once('_')?;
    let file_type = file_type.parse().ok()?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some((file_type, date))
}
