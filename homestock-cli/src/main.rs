mod app;
mod scheduler;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use homestock_core::db::schema::get_logs_path;
use homestock_core::{DownloadStatus, FileType, UrlOverrides};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use app::{App, StatusFilter, LOG_FILE};

#[derive(Parser)]
#[command(name = "homestock")]
#[command(about = "Exchange market-data downloader and workbook pipeline", long_about = None)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Download database (defaults to the per-user config directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every selected file type for each day in a range
    Download {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        sources: SourceArgs,
    },
    /// Download a single file
    DownloadFile {
        file_type: FileType,
        date: NaiveDate,
        /// Explicit URL instead of the generated one
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        raw: Option<PathBuf>,
    },
    /// Retry a failed download by id
    Retry { id: i64 },
    /// Show downloads; by default those pending, in progress or failed
    Status {
        /// Only failed downloads
        #[arg(long, conflicts_with_all = ["status", "start", "id"])]
        failed: bool,
        /// Only downloads in this state
        #[arg(long, conflicts_with_all = ["start", "id"])]
        status: Option<DownloadStatus>,
        /// Downloads for days from --start to --end
        #[arg(long, requires = "end", conflicts_with = "id")]
        start: Option<NaiveDate>,
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
        /// One download by id
        #[arg(long)]
        id: Option<i64>,
    },
    /// Verify downloaded files in a date range
    Verify {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        raw: Option<PathBuf>,
    },
    /// Download and verify, then stop for confirmation
    Run {
        #[command(flatten)]
        range: RangeArgs,
        #[command(flatten)]
        sources: SourceArgs,
    },
    /// Confirm (or with --no, cancel) a verified run and publish the workbook
    Confirm {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        raw: Option<PathBuf>,
        /// Deny the confirmation
        #[arg(long)]
        no: bool,
    },
    /// Extract and normalize downloaded files
    Parse {
        #[arg(long)]
        raw: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Download yesterday and today, then parse, once
    RunFull,
    /// Run the download and parse steps on the configured schedule
    Schedule,
    /// Print the end of the log file
    Logs {
        #[arg(long, default_value_t = 200)]
        lines: usize,
    },
    /// Show settings, or change one with KEY VALUE
    #[command(args_conflicts_with_subcommands = true)]
    Settings {
        key: Option<String>,
        value: Option<String>,
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Check that a folder exists and accepts new files
    TestPath { path: PathBuf },
}

#[derive(clap::Args)]
struct RangeArgs {
    /// First day (YYYY-MM-DD)
    #[arg(long)]
    start: NaiveDate,
    /// Last day, inclusive (defaults to --start)
    #[arg(long)]
    end: Option<NaiveDate>,
}

impl RangeArgs {
    fn bounds(&self) -> (NaiveDate, NaiveDate) {
        (self.start, self.end.unwrap_or(self.start))
    }
}

#[derive(clap::Args)]
struct SourceArgs {
    /// Restrict to these file types (repeatable)
    #[arg(long = "type")]
    types: Vec<FileType>,
    /// Override a URL, e.g. --url cm_bhavcopy=https://mirror/cm.zip
    #[arg(long = "url", value_parser = parse_override)]
    urls: Vec<(FileType, String)>,
    /// One URL for every file type; --url entries still win
    #[arg(long)]
    url_all: Option<String>,
    #[arg(long)]
    raw: Option<PathBuf>,
}

impl SourceArgs {
    fn overrides(&self) -> UrlOverrides {
        let mut overrides = match &self.url_all {
            Some(url) => UrlOverrides::all(url.clone()),
            None => UrlOverrides::default(),
        };
        for (file_type, url) in &self.urls {
            overrides.set(*file_type, url.clone());
        }
        overrides
    }
}

fn parse_override(s: &str) -> std::result::Result<(FileType, String), String> {
    let (file_type, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected FILE_TYPE=URL, got '{}'", s))?;
    let file_type = file_type.trim().parse::<FileType>().map_err(|e| e.to_string())?;
    Ok((file_type, url.trim().to_string()))
}

fn init_logging(logs_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("creating {}", logs_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(logs_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("homestock=info,homestock_core=info"));

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&get_logs_path()?)?;

    let app = App::open(cli.settings, cli.db)?;

    match cli.command {
        Commands::Download { range, sources } => {
            let (start, end) = range.bounds();
            let overrides = sources.overrides();
            app.download(start, end, sources.types, overrides, sources.raw)
        }
        Commands::DownloadFile { file_type, date, url, raw } => {
            app.download_file(file_type, date, url.as_deref(), raw)
        }
        Commands::Retry { id } => app.retry(id),
        Commands::Status { failed, status, start, end, id } => {
            let filter = match (id, status, start.zip(end)) {
                (Some(id), _, _) => StatusFilter::Id(id),
                (None, Some(status), _) => StatusFilter::Status(status),
                (None, None, Some((start, end))) => StatusFilter::Range(start, end),
                (None, None, None) if failed => StatusFilter::Failed,
                (None, None, None) => StatusFilter::Active,
            };
            app.status(filter)
        }
        Commands::Verify { range, raw } => {
            let (start, end) = range.bounds();
            app.verify(start, end, raw)
        }
        Commands::Run { range, sources } => {
            let (start, end) = range.bounds();
            let overrides = sources.overrides();
            app.run(start, end, sources.types, overrides, sources.raw)
        }
        Commands::Confirm { range, raw, no } => {
            let (start, end) = range.bounds();
            app.confirm(start, end, raw, !no)
        }
        Commands::Parse { raw, out } => app.parse(raw, out),
        Commands::RunFull => app.run_full(),
        Commands::Schedule => scheduler::run(&app),
        Commands::Logs { lines } => app.logs(lines),
        Commands::Settings { action: Some(SettingsAction::TestPath { path }), .. } => {
            app.test_path(&path)
        }
        Commands::Settings { key, value, action: None } => app.settings_command(key, value),
    }
}
