//! Phased run over a date range: download, verify, wait for the caller to
//! confirm, then publish through the workbook service.
//!
//! The confirmation barrier is two separate calls. Nothing is kept in memory
//! between [`PipelineOrchestrator::run_until_confirmation`] and
//! [`PipelineOrchestrator::continue_after_confirmation`]; the caller sends the
//! run parameters again when confirming.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{error, info, warn};

use crate::db::downloads::{DownloadOutcome, Fetcher};
use crate::db::operations::DownloadStore;
use crate::error::{Error, Result};
use crate::models::FileType;
use crate::urls::{generate_urls, UrlOverrides};
use crate::verify::{verify_downloads, VerificationSummary, VerifiedFile};
use crate::workbook::{
    CopyDataRequest, CopyToOutputRequest, RunFormulasRequest, SourceFile, WorkbookService,
};

/// Worksheet used for file types the mapping does not name.
pub const DEFAULT_WORKSHEET: &str = "Data";

/// A file the download phase could not fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingFile {
    pub file_type: FileType,
    pub date: NaiveDate,
    pub url: String,
}

impl fmt::Display for MissingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{} ({})", self.file_type, self.date.format("%Y-%m-%d"), self.url)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadPhase {
    pub success: bool,
    pub downloaded: Vec<String>,
    pub missing: Vec<MissingFile>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationPhase {
    /// False when any file is invalid. The run itself carries on.
    pub success: bool,
    pub verified_count: usize,
    pub invalid_count: usize,
    #[serde(flatten)]
    pub summary: VerificationSummary,
    pub requires_confirmation: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishPhase {
    pub success: bool,
    pub intermediate_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub worksheets: Vec<String>,
    pub formulas_executed: u64,
    pub error: Option<String>,
    pub message: String,
}

/// Outcome of one phase, tagged by phase name when serialized.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseResult {
    Download(DownloadPhase),
    Verification(VerificationPhase),
    TransformAndPublish(PublishPhase),
}

impl PhaseResult {
    pub fn success(&self) -> bool {
        match self {
            PhaseResult::Download(phase) => phase.success,
            PhaseResult::Verification(phase) => phase.success,
            PhaseResult::TransformAndPublish(phase) => phase.success,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PhaseResult::Download(phase) => &phase.message,
            PhaseResult::Verification(phase) => &phase.message,
            PhaseResult::TransformAndPublish(phase) => &phase.message,
        }
    }
}

/// Parameters of a run. Sent again, unchanged, when confirming.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub raw_path: PathBuf,
    pub overrides: UrlOverrides,
    pub file_types: Vec<FileType>,
}

impl RunParams {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate, raw_path: impl Into<PathBuf>) -> Self {
        Self {
            start_date,
            end_date,
            raw_path: raw_path.into(),
            overrides: UrlOverrides::default(),
            file_types: FileType::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub confirmed: bool,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub raw_path: PathBuf,
    pub template_path: Option<PathBuf>,
    /// Intermediate workbook written by the copy step.
    pub intermediate_path: PathBuf,
    /// Final workbook.
    pub output_path: PathBuf,
    pub worksheet_mapping: BTreeMap<FileType, String>,
    pub worksheets_to_output: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub success: bool,
    pub requires_confirmation: bool,
    pub phases: Vec<PhaseResult>,
    pub output_path: Option<PathBuf>,
    pub message: String,
}

/// Drives download, verification and publishing. Holds no per-run state.
pub struct PipelineOrchestrator<W> {
    fetcher: Fetcher,
    workbook: W,
}

impl<W: WorkbookService> PipelineOrchestrator<W> {
    pub fn new(fetcher: Fetcher, workbook: W) -> Self {
        Self { fetcher, workbook }
    }

    pub fn store(&self) -> &DownloadStore {
        self.fetcher.store()
    }

    pub fn workbook(&self) -> &W {
        &self.workbook
    }

    pub fn download_file(
        &self,
        file_type: FileType,
        date: NaiveDate,
        url: Option<&str>,
        raw_path: &Path,
        overrides: &UrlOverrides,
    ) -> Result<DownloadOutcome> {
        self.fetcher.download_file(file_type, date, url, raw_path, overrides)
    }

    pub fn retry_download(&self, download_id: i64) -> Result<DownloadOutcome> {
        self.fetcher.retry_download(download_id)
    }

    /// Phase 1. Every file type of every date is attempted; a file that
    /// cannot be fetched ends up in `missing` and never stops the range.
    /// The file types of one date are fetched in parallel.
    pub fn run_download_phase(&self, params: &RunParams) -> Result<DownloadPhase> {
        check_range(params.start_date, params.end_date)?;
        info!("=== Phase 1: Downloading files ===");
        fs::create_dir_all(&params.raw_path)?;

        let mut downloaded = Vec::new();
        let mut missing = Vec::new();

        for date in params.start_date.iter_days().take_while(|d| *d <= params.end_date) {
            info!("Downloading files for {}", date);
            let jobs: Vec<(FileType, String)> = generate_urls(date, &params.overrides)
                .into_iter()
                .filter(|(file_type, _)| params.file_types.contains(file_type))
                .collect();

            let results = thread::scope(|scope| {
                let handles: Vec<_> = jobs
                    .iter()
                    .map(|(file_type, url)| {
                        let fetcher = &self.fetcher;
                        let raw_path = params.raw_path.as_path();
                        let overrides = &params.overrides;
                        scope.spawn(move || {
                            fetcher.download_file(*file_type, date, Some(url.as_str()), raw_path, overrides)
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(Error::Io(std::io::Error::other("download worker panicked")))
                        })
                    })
                    .collect::<Vec<_>>()
            });

            for ((file_type, url), result) in jobs.into_iter().zip(results) {
                match result {
                    Ok(outcome) if outcome.success => {
                        let name = outcome
                            .file_path
                            .file_name()
                            .map(|name| name.to_string_lossy().to_string())
                            .unwrap_or_default();
                        downloaded.push(name);
                    }
                    Ok(_) => missing.push(MissingFile { file_type, date, url }),
                    Err(e) => {
                        error!("Error downloading {} for {}: {}", file_type, date, e);
                        missing.push(MissingFile { file_type, date, url });
                    }
                }
            }
        }

        for file in &missing {
            warn!("Missing: {}", file);
        }

        Ok(DownloadPhase {
            success: true,
            message: format!("Downloaded {} files", downloaded.len()),
            downloaded,
            missing,
        })
    }

    /// Phase 2. Always asks for confirmation, whatever the outcome.
    pub fn run_verification_phase(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        raw_path: &Path,
    ) -> Result<VerificationPhase> {
        check_range(start_date, end_date)?;
        info!("=== Phase 2: Verifying downloads ===");

        let summary = verify_downloads(self.store(), start_date, end_date, raw_path)?;
        let verified_count = summary.verified_count();
        let invalid_count = summary.invalid_count();
        let all_valid = summary.all_valid();

        let message = if all_valid {
            format!("All {} files verified successfully", verified_count)
        } else {
            format!("Found {} invalid files. Please review before proceeding.", invalid_count)
        };
        info!("{}", message);

        Ok(VerificationPhase {
            success: all_valid,
            verified_count,
            invalid_count,
            summary,
            requires_confirmation: true,
            message,
        })
    }

    /// Runs phases 1 and 2 and stops at the confirmation barrier.
    pub fn run_until_confirmation(&self, params: &RunParams) -> Result<PipelineReport> {
        let download = self.run_download_phase(params)?;
        let verification =
            self.run_verification_phase(params.start_date, params.end_date, &params.raw_path)?;

        Ok(PipelineReport {
            success: true,
            requires_confirmation: verification.requires_confirmation,
            phases: vec![
                PhaseResult::Download(download),
                PhaseResult::Verification(verification),
            ],
            output_path: None,
            message: "Download and verification completed. Ready for user confirmation."
                .to_string(),
        })
    }

    /// Second half of the barrier. A denied confirmation does no work at all.
    pub fn continue_after_confirmation(&self, request: &ConfirmationRequest) -> Result<PipelineReport> {
        if !request.confirmed {
            info!("Pipeline cancelled by user");
            return Ok(PipelineReport {
                success: false,
                requires_confirmation: false,
                phases: Vec::new(),
                output_path: None,
                message: "User did not confirm. Pipeline cancelled.".to_string(),
            });
        }

        let publish = self.run_publish_phase(request)?;
        Ok(PipelineReport {
            success: publish.success,
            requires_confirmation: false,
            output_path: publish.output_path.clone(),
            message: publish.message.clone(),
            phases: vec![PhaseResult::TransformAndPublish(publish)],
        })
    }

    /// Phase 3. Verification runs again so files changed since phase 2 are
    /// seen. A step reporting failure ends the phase with its error; an
    /// unreachable service is returned as `Err`.
    pub fn run_publish_phase(&self, request: &ConfirmationRequest) -> Result<PublishPhase> {
        check_range(request.start_date, request.end_date)?;
        info!("=== Phase 3: Processing workbook ===");

        let summary =
            verify_downloads(self.store(), request.start_date, request.end_date, &request.raw_path)?;
        let source_files: Vec<SourceFile> = summary
            .verified_files
            .iter()
            .map(|file| source_file(file, &request.worksheet_mapping))
            .collect();
        info!("Publishing {} verified files", source_files.len());

        if let Some(parent) = request.intermediate_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let copied = self.workbook.copy_data_to_excel(&CopyDataRequest {
            source_files,
            template_path: request.template_path.clone(),
            output_path: request.intermediate_path.clone(),
            worksheet_mapping: Some(request.worksheet_mapping.clone()),
        })?;
        if !copied.success {
            return Ok(failed_publish(format!("Failed to copy data: {}", reported(copied.error))));
        }

        let formulas = self.workbook.run_formulas(&RunFormulasRequest {
            path: request.intermediate_path.clone(),
        })?;
        if !formulas.success {
            return Ok(failed_publish(format!("Failed to run formulas: {}", reported(formulas.error))));
        }

        let output = self.workbook.copy_to_output(&CopyToOutputRequest {
            source_path: request.intermediate_path.clone(),
            output_path: request.output_path.clone(),
            worksheets_to_copy: request.worksheets_to_output.clone(),
        })?;
        if !output.success {
            return Ok(failed_publish(format!("Failed to create output: {}", reported(output.error))));
        }

        let output_path = output.output_path.unwrap_or_else(|| request.output_path.clone());
        let name = output_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let message = format!("Successfully created output file: {}", name);
        info!("{}", message);

        Ok(PublishPhase {
            success: true,
            intermediate_path: Some(request.intermediate_path.clone()),
            output_path: Some(output_path),
            worksheets: output.worksheets_copied,
            formulas_executed: formulas.formulas_executed,
            error: None,
            message,
        })
    }
}

fn check_range(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start > end {
        return Err(Error::InvalidDateRange { start, end });
    }
    Ok(())
}

fn source_file(file: &VerifiedFile, mapping: &BTreeMap<FileType, String>) -> SourceFile {
    let worksheet_name = file.file_type.map(|file_type| {
        mapping
            .get(&file_type)
            .cloned()
            .unwrap_or_else(|| DEFAULT_WORKSHEET.to_string())
    });
    SourceFile {
        file_path: PathBuf::from(&file.file_path),
        file_type: file.file_type,
        worksheet_name,
    }
}

fn reported(error: Option<String>) -> String {
    error.unwrap_or_else(|| "Unknown error".to_string())
}

fn failed_publish(error: String) -> PublishPhase {
    warn!("{}", error);
    PublishPhase {
        success: false,
        message: format!("Failed to process workbook: {}", error),
        error: Some(error),
        ..PublishPhase::default()
    }
}
