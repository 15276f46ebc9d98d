//! Flat key-value settings shared by the CLI and the scheduler.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::FileType;

const DEFAULT_RUN_TIME: (u32, u32) = (7, 0);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where downloaded files land.
    pub raw_path: Option<PathBuf>,
    /// Where the intermediate workbook (and parsed files) go.
    pub processed_path: Option<PathBuf>,
    /// Final workbook location.
    pub output_path: Option<PathBuf>,
    pub scheduler: Option<String>,
    pub custom_cron: Option<String>,
    pub template_path: Option<PathBuf>,
    /// Program implementing the workbook service.
    pub workbook_command: Option<PathBuf>,
    pub workbook_args: Option<Vec<String>>,
    pub worksheet_mapping: Option<BTreeMap<FileType, String>>,
    pub worksheets_to_output: Option<Vec<String>>,
}

impl Settings {
    /// Reads settings from `path`. A missing file means nothing is configured.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn require_raw_path(&self) -> Result<&Path> {
        non_empty(&self.raw_path).ok_or(Error::MissingSetting("raw_path"))
    }

    /// `processed_path`, else `<raw_path parent>/intermediate`.
    pub fn intermediate_path(&self) -> Result<PathBuf> {
        if let Some(path) = non_empty(&self.processed_path) {
            return Ok(path.to_path_buf());
        }
        Ok(sibling_of(self.require_raw_path()?, "intermediate"))
    }

    /// `output_path`, else `<raw_path parent>/output`.
    pub fn output_path_or_default(&self) -> Result<PathBuf> {
        if let Some(path) = non_empty(&self.output_path) {
            return Ok(path.to_path_buf());
        }
        Ok(sibling_of(self.require_raw_path()?, "output"))
    }

    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::parse(
            self.scheduler.as_deref().unwrap_or("off"),
            self.custom_cron.as_deref(),
        )
    }

    /// Configured mapping layered over [`default_worksheet_mapping`].
    pub fn worksheet_mapping(&self) -> BTreeMap<FileType, String> {
        let mut mapping = default_worksheet_mapping();
        if let Some(custom) = &self.worksheet_mapping {
            mapping.extend(custom.iter().map(|(k, v)| (*k, v.clone())));
        }
        mapping
    }
}

fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

fn sibling_of(raw_path: &Path, name: &str) -> PathBuf {
    raw_path
        .parent()
        .map(|parent| parent.join(name))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Worksheet each file type is copied into by default.
pub fn default_worksheet_mapping() -> BTreeMap<FileType, String> {
    [
        (FileType::CmBhavcopy, "Eq Bhav"),
        (FileType::FoBhavcopy, "FU Data final"),
        (FileType::CmDelivery, "Eq Del"),
        (FileType::FoUdiff, "Daily OP Data"),
        (FileType::FoParticipantOi, "Daily OP Data"),
    ]
    .into_iter()
    .map(|(file_type, sheet)| (file_type, sheet.to_string()))
    .collect()
}

/// When scheduled automation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Off,
    Daily(NaiveTime),
    /// A custom expression and the daily time it resolved to.
    Custom { expression: String, at: NaiveTime },
}

impl Schedule {
    /// Accepts `off`, `daily-7am`, a clock time `HH:MM`, or `custom` (which
    /// reads `custom_cron`). Only daily cron expressions (`M H * * *`) are
    /// honoured; anything else runs at 07:00.
    pub fn parse(scheduler: &str, custom_cron: Option<&str>) -> Result<Self> {
        let scheduler = scheduler.trim();
        match scheduler {
            "" | "off" => Ok(Schedule::Off),
            "daily-7am" => Ok(Schedule::Daily(default_run_time())),
            "custom" => {
                let expression = custom_cron
                    .map(str::trim)
                    .filter(|expr| !expr.is_empty())
                    .ok_or_else(|| Error::InvalidSchedule("custom schedule without custom_cron".to_string()))?;
                let at = daily_time_from_cron(expression).unwrap_or_else(|| {
                    warn!("Unsupported cron expression '{}', running daily at 07:00", expression);
                    default_run_time()
                });
                Ok(Schedule::Custom { expression: expression.to_string(), at })
            }
            other => NaiveTime::parse_from_str(other, "%H:%M")
                .map(Schedule::Daily)
                .map_err(|_| Error::InvalidSchedule(other.to_string())),
        }
    }

    pub fn run_time(&self) -> Option<NaiveTime> {
        match self {
            Schedule::Off => None,
            Schedule::Daily(at) | Schedule::Custom { at, .. } => Some(*at),
        }
    }
}

fn default_run_time() -> NaiveTime {
    let (hour, minute) = DEFAULT_RUN_TIME;
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn daily_time_from_cron(expression: &str) -> Option<NaiveTime> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, "*", "*", "*"] => {
            NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)
        }
        _ => None,
    }
}
