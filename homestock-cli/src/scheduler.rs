use anyhow::Result;
use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use homestock_core::parse::parse_files;
use homestock_core::{FileType, Schedule, UrlOverrides};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

use crate::app::App;

/// Time left until the next `at` strictly after `now`.
fn until_next(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let mut next = now.date().and_time(at);
    if next <= now {
        next += TimeDelta::days(1);
    }
    (next - now).to_std().unwrap_or_default()
}

/// Sleeps until each scheduled time and runs one automated pass. Never
/// returns unless the schedule is off.
pub fn run(app: &App) -> Result<()> {
    let schedule = app.settings.schedule()?;
    let Some(at) = schedule.run_time() else {
        println!("Scheduler is off. Set `scheduler` to daily-7am, HH:MM or custom to enable it.");
        return Ok(());
    };
    if let Schedule::Custom { expression, .. } = &schedule {
        info!("Custom schedule '{}' runs daily at {}", expression, at.format("%H:%M"));
    }

    loop {
        let wait = until_next(Local::now().naive_local(), at);
        info!("Next scheduled run in {} minutes", wait.as_secs() / 60);
        thread::sleep(wait);

        if let Err(e) = run_once(app) {
            error!("Scheduled run failed: {:#}", e);
        }
    }
}

/// Downloads yesterday and today, then parses the raw directory.
pub fn run_once(app: &App) -> Result<()> {
    info!("Running scheduled download");
    let today = Local::now().date_naive();
    let yesterday = today.pred_opt().unwrap_or(today);

    let params = app.run_params(yesterday, today, FileType::ALL.to_vec(), UrlOverrides::default(), None)?;
    let phase = app.orchestrator()?.run_download_phase(&params)?;
    info!("{} ({} missing)", phase.message, phase.missing.len());

    let processed = app.settings.intermediate_path()?;
    let tables = parse_files(&params.raw_path, &processed)?;
    info!("Parsed {} tables into {}", tables.len(), processed.display());
    Ok(())
}
