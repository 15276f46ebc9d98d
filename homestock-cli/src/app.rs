use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use homestock_core::db::schema::{get_db_path, get_logs_path, get_settings_path};
use homestock_core::parse::parse_files;
use homestock_core::pipeline::ConfirmationRequest;
use homestock_core::verify::verify_downloads;
use homestock_core::{
    CommandWorkbookService, DownloadStatus, DownloadStore, Error, Fetcher, FileType,
    PipelineOrchestrator, PipelineReport, RateLimiter, RunParams, Settings, UrlOverrides,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::scheduler;

/// Program run for workbook operations when `workbook_command` is unset.
const DEFAULT_WORKBOOK_COMMAND: &str = "homestock-workbook";
pub const LOG_FILE: &str = "app.log";
/// Scratch file written and removed by the path check.
const WRITE_CHECK_FILE: &str = ".homestock_write_check";

/// Which downloads `status` lists.
pub enum StatusFilter {
    /// Pending, downloading or failed.
    Active,
    Failed,
    Status(DownloadStatus),
    Range(NaiveDate, NaiveDate),
    Id(i64),
}

#[derive(Debug, Serialize)]
pub struct PathCheck {
    pub path: PathBuf,
    pub accessible: bool,
    pub error: Option<String>,
}

pub struct App {
    pub settings: Settings,
    settings_path: PathBuf,
    store: DownloadStore,
    limiter: Arc<RateLimiter>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_phases(report: &PipelineReport) {
    for phase in &report.phases {
        let mark = if phase.success() { "ok" } else { "FAILED" };
        println!("[{}] {}", mark, phase.message());
    }
}

/// The last `count` lines of `content`, each with its line break.
pub fn tail_lines(content: &str, count: usize) -> String {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    lines[lines.len().saturating_sub(count)..].concat()
}

/// Whether `path` is an existing directory that accepts new files.
pub fn check_writable(path: &Path) -> PathCheck {
    let error = if !path.is_dir() {
        Some(format!("{} is not a directory", path.display()))
    } else {
        let scratch = path.join(WRITE_CHECK_FILE);
        fs::write(&scratch, b"")
            .and_then(|_| fs::remove_file(&scratch))
            .err()
            .map(|e| e.to_string())
    };
    PathCheck {
        path: path.to_path_buf(),
        accessible: error.is_none(),
        error,
    }
}

impl App {
    pub fn open(settings_path: Option<PathBuf>, db_path: Option<PathBuf>) -> Result<Self> {
        let settings_path = match settings_path {
            Some(path) => path,
            None => get_settings_path()?,
        };
        let settings = Settings::load(&settings_path)
            .with_context(|| format!("loading settings from {}", settings_path.display()))?;

        let db_path = match db_path {
            Some(path) => path,
            None => get_db_path()?,
        };
        let store = DownloadStore::open(&db_path)
            .with_context(|| format!("opening download database {}", db_path.display()))?;
        info!("Using download database {}", store.db_path().display());

        Ok(Self {
            settings,
            settings_path,
            store,
            limiter: Arc::new(RateLimiter::nse()),
        })
    }

    fn raw_path(&self, raw: Option<PathBuf>) -> Result<PathBuf> {
        match raw {
            Some(path) => Ok(path),
            None => Ok(self.settings.require_raw_path()?.to_path_buf()),
        }
    }

    pub fn orchestrator(&self) -> Result<PipelineOrchestrator<CommandWorkbookService>> {
        let fetcher = Fetcher::new(self.limiter.clone(), self.store.clone())?;
        let program = self
            .settings
            .workbook_command
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKBOOK_COMMAND));
        let workbook = CommandWorkbookService::new(program)
            .with_args(self.settings.workbook_args.clone().unwrap_or_default());
        Ok(PipelineOrchestrator::new(fetcher, workbook))
    }

    pub fn run_params(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        types: Vec<FileType>,
        overrides: UrlOverrides,
        raw: Option<PathBuf>,
    ) -> Result<RunParams> {
        let mut params = RunParams::new(start, end, self.raw_path(raw)?);
        if !types.is_empty() {
            params.file_types = types;
        }
        params.overrides = overrides;
        Ok(params)
    }

    pub fn download(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        types: Vec<FileType>,
        overrides: UrlOverrides,
        raw: Option<PathBuf>,
    ) -> Result<()> {
        let params = self.run_params(start, end, types, overrides, raw)?;
        let phase = self.orchestrator()?.run_download_phase(&params)?;
        print_json(&phase)
    }

    pub fn download_file(
        &self,
        file_type: FileType,
        date: NaiveDate,
        url: Option<&str>,
        raw: Option<PathBuf>,
    ) -> Result<()> {
        let raw_path = self.raw_path(raw)?;
        let outcome = self.orchestrator()?.download_file(
            file_type,
            date,
            url,
            &raw_path,
            &UrlOverrides::default(),
        )?;
        print_json(&outcome)
    }

    pub fn retry(&self, id: i64) -> Result<()> {
        let outcome = self.orchestrator()?.retry_download(id)?;
        print_json(&outcome)
    }

    pub fn status(&self, filter: StatusFilter) -> Result<()> {
        let records = match filter {
            StatusFilter::Active => self.store.list_active()?,
            StatusFilter::Failed => self.store.list_failed()?,
            StatusFilter::Status(status) => self.store.list_by_status(status)?,
            StatusFilter::Range(start, end) => self.store.list_by_date_range(start, end)?,
            StatusFilter::Id(id) => {
                let record = self.store.get(id)?.ok_or(Error::NotFound(id))?;
                return print_json(&record);
            }
        };
        print_json(&records)
    }

    pub fn verify(&self, start: NaiveDate, end: NaiveDate, raw: Option<PathBuf>) -> Result<()> {
        let raw_path = self.raw_path(raw)?;
        let summary = verify_downloads(&self.store, start, end, &raw_path)?;
        print_json(&summary)
    }

    pub fn run(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        types: Vec<FileType>,
        overrides: UrlOverrides,
        raw: Option<PathBuf>,
    ) -> Result<()> {
        let params = self.run_params(start, end, types, overrides, raw)?;
        let report = self.orchestrator()?.run_until_confirmation(&params)?;
        print_json(&report)?;
        print_phases(&report);
        if report.requires_confirmation {
            println!(
                "Review the results, then run `homestock confirm --start {} --end {}` (or add --no to cancel).",
                start, end
            );
        }
        Ok(())
    }

    /// A denied confirmation needs no paths, so none are resolved for it.
    pub fn confirmation_request(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        raw: Option<PathBuf>,
        confirmed: bool,
    ) -> Result<ConfirmationRequest> {
        let mut request = ConfirmationRequest {
            confirmed,
            start_date: start,
            end_date: end,
            raw_path: PathBuf::new(),
            template_path: self.settings.template_path.clone(),
            intermediate_path: PathBuf::new(),
            output_path: PathBuf::new(),
            worksheet_mapping: self.settings.worksheet_mapping(),
            worksheets_to_output: self.settings.worksheets_to_output.clone(),
        };
        if confirmed {
            request.raw_path = self.raw_path(raw)?;
            request.intermediate_path = self.settings.intermediate_path()?;
            request.output_path = self.settings.output_path_or_default()?;
        }
        Ok(request)
    }

    pub fn confirm(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        raw: Option<PathBuf>,
        confirmed: bool,
    ) -> Result<()> {
        let request = self.confirmation_request(start, end, raw, confirmed)?;
        let report = self.orchestrator()?.continue_after_confirmation(&request)?;
        print_json(&report)?;
        print_phases(&report);
        Ok(())
    }

    pub fn parse(&self, raw: Option<PathBuf>, out: Option<PathBuf>) -> Result<()> {
        let raw_path = self.raw_path(raw)?;
        let output_path = match out {
            Some(path) => path,
            None => self.settings.intermediate_path()?,
        };
        let results = parse_files(&raw_path, &output_path)?;
        print_json(&results)
    }

    /// Downloads yesterday and today, then parses, once.
    pub fn run_full(&self) -> Result<()> {
        scheduler::run_once(self)?;
        println!("Full run completed");
        Ok(())
    }

    pub fn logs(&self, lines: usize) -> Result<()> {
        let path = get_logs_path()?.join(LOG_FILE);
        if !path.exists() {
            println!("No logs available yet.");
            return Ok(());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        print!("{}", tail_lines(&content, lines));
        Ok(())
    }

    pub fn test_path(&self, path: &Path) -> Result<()> {
        print_json(&check_writable(path))
    }

    /// With no key prints all settings; with a key and value stores it. The
    /// value is read as JSON when it parses, else as a plain string.
    pub fn settings_command(&self, key: Option<String>, value: Option<String>) -> Result<()> {
        let (key, value) = match (key, value) {
            (None, _) => return print_json(&self.settings),
            (Some(key), None) => {
                let all = serde_json::to_value(&self.settings)?;
                return print_json(all.get(&key).unwrap_or(&Value::Null));
            }
            (Some(key), Some(value)) => (key, value),
        };

        let mut map: Map<String, Value> = match serde_json::to_value(&self.settings)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if !map.contains_key(&key) {
            bail!("unknown setting '{}'", key);
        }
        let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
        map.insert(key.clone(), value);

        let updated: Settings = serde_json::from_value(Value::Object(map))
            .with_context(|| format!("invalid value for '{}'", key))?;
        updated.schedule()?;
        updated.save(&self.settings_path)?;
        info!("Updated setting {} in {}", key, self.settings_path.display());
        print_json(&updated)
    }
}
