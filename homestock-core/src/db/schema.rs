use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use directories::ProjectDirs;

use crate::error::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "", "HomeStock").ok_or(Error::NoConfigDir)?;
    let config_dir = proj_dirs.config_dir().to_path_buf();
    fs::create_dir_all(&config_dir)?;
    Ok(config_dir)
}

pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("homestock.db"))
}

pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("settings.json"))
}

pub fn get_logs_path() -> Result<PathBuf> {
    let logs_dir = get_config_dir()?.join("logs");
    fs::create_dir_all(&logs_dir)?;
    Ok(logs_dir)
}

/// Opens a connection to the download database with WAL journaling so
/// readers never see a half-applied update.
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS downloads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_name TEXT NOT NULL,
            file_type TEXT NOT NULL,
            url TEXT NOT NULL,
            date_str TEXT NOT NULL,
            file_path TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            progress REAL NOT NULL DEFAULT 0.0,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            completed_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_downloads_file_name ON downloads(file_name);
        CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
        CREATE INDEX IF NOT EXISTS idx_downloads_date ON downloads(date_str);
        "
    )?;

    Ok(())
}
