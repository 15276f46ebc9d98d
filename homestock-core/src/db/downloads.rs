use reqwest::blocking::Client;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_CHARSET, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION,
};
use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::operations::DownloadStore;
use crate::error::{Error, Result};
use crate::models::{DownloadStatus, FileType, NewDownload};
use crate::rate_limiter::RateLimiter;
use crate::urls::{local_file_name, resolve_url, UrlOverrides};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.11 (KHTML, like Gecko) Chrome/23.0.1271.64 Safari/537.11";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 8192;
/// Progress shown while the server does not advertise a length.
const UNKNOWN_SIZE_PROGRESS: f64 = 50.0;
/// Smallest progress change worth a database write.
const PROGRESS_STEP: f64 = 1.0;

/// The exchange rejects requests that do not look like a browser.
pub fn create_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_CHARSET, HeaderValue::from_static("ISO-8859-1,utf-8;q=0.7,*;q=0.3"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("none"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.8"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

    let client = Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(REQUEST_TIMEOUT)
        .cookie_store(true)
        .gzip(true)
        .build()?;
    Ok(client)
}

/// Result of downloading (or skipping) one file.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    pub download_id: i64,
    pub file_path: PathBuf,
    pub skipped: bool,
    pub message: String,
}

/// Performs rate-limited downloads and records their progress.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
    store: DownloadStore,
}

impl Fetcher {
    pub fn new(limiter: Arc<RateLimiter>, store: DownloadStore) -> Result<Self> {
        Ok(Self::with_client(create_http_client()?, limiter, store))
    }

    pub fn with_client(client: Client, limiter: Arc<RateLimiter>, store: DownloadStore) -> Self {
        Self { client, limiter, store }
    }

    pub fn store(&self) -> &DownloadStore {
        &self.store
    }

    /// Downloads `url` into `destination`.
    ///
    /// Returns `Ok(false)` on transport or disk failures, after marking the
    /// record failed; a partial file is left in place. `Err` is reserved
    /// for failures of the download store itself, after which the record
    /// is still marked failed if the store accepts the write.
    pub fn fetch(&self, url: &str, destination: &Path, record_id: Option<i64>) -> Result<bool> {
        self.limiter.acquire();

        info!("Downloading: {}", url);
        if let Some(id) = record_id {
            self.store.update_status(id, DownloadStatus::Downloading, Some(0.0), None)?;
        }

        let streamed = self.stream_to_file(url, destination, record_id);
        self.settle(url, destination, record_id, streamed)
    }

    /// Records how a fetch ended. Any error leaves the record `failed`;
    /// only transport and disk errors are turned into `Ok(false)`.
    fn settle(
        &self,
        url: &str,
        destination: &Path,
        record_id: Option<i64>,
        streamed: Result<u64>,
    ) -> Result<bool> {
        match streamed {
            Ok(bytes) => {
                info!("Downloaded: {} ({} bytes)", destination.display(), bytes);
                if let Some(id) = record_id {
                    if let Err(err) =
                        self.store.update_status(id, DownloadStatus::Completed, Some(100.0), None)
                    {
                        return self.settle(url, destination, record_id, Err(err));
                    }
                }
                Ok(true)
            }
            Err(err @ (Error::Http(_) | Error::Io(_))) => {
                let message = err.to_string();
                warn!("Failed to download {}: {}", url, message);
                if let Some(id) = record_id {
                    self.store
                        .update_status(id, DownloadStatus::Failed, Some(0.0), Some(&message))?;
                }
                Ok(false)
            }
            Err(err) => {
                error!("Download of {} aborted: {}", url, err);
                if let Some(id) = record_id {
                    let message = err.to_string();
                    if let Err(mark_err) =
                        self.store
                            .update_status(id, DownloadStatus::Failed, Some(0.0), Some(&message))
                    {
                        error!("Could not mark download {} failed: {}", id, mark_err);
                    }
                }
                Err(err)
            }
        }
    }

    fn stream_to_file(&self, url: &str, destination: &Path, record_id: Option<i64>) -> Result<u64> {
        let mut response = self.client.get(url).send()?.error_for_status()?;
        let total_size = response.content_length().filter(|&len| len > 0);

        let mut file = fs::File::create(destination)?;
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        let mut reported = 0.0;

        loop {
            let read = response.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
            received += read as u64;

            let progress = match total_size {
                Some(total) => (received as f64 / total as f64 * 100.0).min(100.0),
                None => UNKNOWN_SIZE_PROGRESS,
            };
            if let Some(id) = record_id {
                if progress >= reported + PROGRESS_STEP {
                    self.store
                        .update_status(id, DownloadStatus::Downloading, Some(progress), None)?;
                    reported = progress;
                }
            }
        }

        file.flush()?;
        Ok(received)
    }

    /// Downloads one file type for one day into `raw_path`, skipping the
    /// request when the file is on disk and a completed record exists for
    /// the same file name.
    pub fn download_file(
        &self,
        file_type: FileType,
        date: NaiveDate,
        url: Option<&str>,
        raw_path: &Path,
        overrides: &UrlOverrides,
    ) -> Result<DownloadOutcome> {
        let url = match url.filter(|url| !url.is_empty()) {
            Some(url) => url.to_string(),
            None => resolve_url(file_type, date, overrides),
        };

        let file_name = local_file_name(file_type, date, &url);
        fs::create_dir_all(raw_path)?;
        let output_file = raw_path.join(&file_name);

        if output_file.exists() {
            if let Some(existing) = self.store.find_completed(&file_name)? {
                info!("Skipping {}: already downloaded", file_name);
                return Ok(DownloadOutcome {
                    success: true,
                    download_id: existing.id,
                    file_path: output_file,
                    skipped: true,
                    message: "File already exists".to_string(),
                });
            }
        }

        let file_path = output_file.to_string_lossy();
        let download_id = self.store.create(&NewDownload {
            file_name: &file_name,
            file_type,
            url: &url,
            date,
            file_path: &file_path,
        })?;

        let success = self.fetch(&url, &output_file, Some(download_id))?;
        Ok(DownloadOutcome {
            success,
            download_id,
            file_path: output_file,
            skipped: false,
            message: if success { "Download completed" } else { "Download failed" }.to_string(),
        })
    }

    /// Re-attempts a failed download in place. Completed downloads are refused.
    pub fn retry_download(&self, download_id: i64) -> Result<DownloadOutcome> {
        let record = self
            .store
            .get(download_id)?
            .ok_or(Error::NotFound(download_id))?;

        if record.status.is_terminal_success() {
            return Err(Error::AlreadyCompleted(download_id));
        }

        self.store.reset(download_id)?;
        self.store.increment_retry(download_id)?;

        let output_file = PathBuf::from(&record.file_path);
        if let Some(parent) = output_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let success = self.fetch(&record.url, &output_file, Some(download_id))?;
        Ok(DownloadOutcome {
            success,
            download_id,
            file_path: output_file,
            skipped: false,
            message: if success { "Retry successful" } else { "Retry failed" }.to_string(),
        })
    }
}
