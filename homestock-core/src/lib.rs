pub mod db;
pub mod error;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod rate_limiter;
pub mod settings;
pub mod urls;
pub mod verify;
pub mod workbook;

pub use db::*;
pub use error::{Error, Result};
pub use models::{DownloadRecord, DownloadStatus, FileType, NewDownload};
pub use pipeline::{ConfirmationRequest, PipelineOrchestrator, PipelineReport, PhaseResult, RunParams};
pub use rate_limiter::RateLimiter;
pub use settings::{Schedule, Settings};
pub use urls::UrlOverrides;
pub use workbook::{CommandWorkbookService, WorkbookService};
