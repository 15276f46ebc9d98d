//! Structural checks for downloaded files.
//!
//! The exchange sometimes answers with an HTML error page or a truncated
//! body under a `.zip` or `.csv` name, so a file that exists is not
//! necessarily usable. Checks are picked by extension and never trust the
//! declared type.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::db::operations::DownloadStore;
use crate::error::Result;
use crate::models::FileType;
use crate::urls::parse_local_file_name;

const ARCHIVE_PREVIEW: usize = 10;
const TEXT_PREVIEW: usize = 5;

/// Type-specific findings of a verification pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileMetrics {
    Archive { file_count: usize, files: Vec<String> },
    Delimited { line_count: usize, preview: Vec<String> },
    Tabular { row_count: usize, header: Vec<String> },
    Generic,
}

/// Outcome of checking one file. Always computed fresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub error: Option<String>,
    pub size: u64,
    pub metrics: FileMetrics,
}

impl VerificationResult {
    fn ok(size: u64, metrics: FileMetrics) -> Self {
        Self { valid: true, error: None, size, metrics }
    }

    fn invalid(error: impl Into<String>, size: u64, metrics: FileMetrics) -> Self {
        Self { valid: false, error: Some(error.into()), size, metrics }
    }

    pub fn file_count(&self) -> usize {
        match &self.metrics {
            FileMetrics::Archive { file_count, .. } => *file_count,
            _ => 0,
        }
    }

    pub fn line_count(&self) -> usize {
        match &self.metrics {
            FileMetrics::Delimited { line_count, .. } => *line_count,
            _ => 0,
        }
    }

    /// Data rows of a tabular file, header excluded.
    pub fn row_count(&self) -> usize {
        match &self.metrics {
            FileMetrics::Tabular { row_count, .. } => *row_count,
            _ => 0,
        }
    }
}

/// Size of a file that exists and is non-empty, or the failed result.
fn non_empty_size(path: &Path, empty_metrics: &FileMetrics) -> std::result::Result<u64, VerificationResult> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => {
            Err(VerificationResult::invalid("File is empty", 0, empty_metrics.clone()))
        }
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(VerificationResult::invalid("File does not exist", 0, empty_metrics.clone()))
        }
        Err(e) => Err(VerificationResult::invalid(
            format!("Verification error: {}", e),
            0,
            empty_metrics.clone(),
        )),
    }
}

pub fn verify_zip_file(path: &Path) -> VerificationResult {
    let empty = FileMetrics::Archive { file_count: 0, files: Vec::new() };
    let size = match non_empty_size(path, &empty) {
        Ok(size) => size,
        Err(result) => return result,
    };

    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) => return VerificationResult::invalid(format!("Read error: {}", e), size, empty),
    };

    let mut archive = match ZipArchive::new(file) {
        Ok(archive) => archive,
        Err(ZipError::InvalidArchive(_) | ZipError::UnsupportedArchive(_)) => {
            return VerificationResult::invalid("Invalid ZIP file format", size, empty);
        }
        Err(e) => return VerificationResult::invalid(format!("ZIP error: {}", e), size, empty),
    };

    if archive.len() == 0 {
        return VerificationResult::invalid("Archive contains no entries", size, empty);
    }

    // Read every entry through so CRC mismatches in truncated bodies surface.
    let mut files = Vec::with_capacity(archive.len().min(ARCHIVE_PREVIEW));
    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(entry) => entry,
            Err(e) => return VerificationResult::invalid(format!("ZIP error: {}", e), size, empty),
        };
        if files.len() < ARCHIVE_PREVIEW {
            files.push(entry.name().to_string());
        }
        if let Err(e) = io::copy(&mut entry, &mut io::sink()) {
            return VerificationResult::invalid(format!("ZIP error: {}", e), size, empty);
        }
    }

    VerificationResult::ok(size, FileMetrics::Archive { file_count: archive.len(), files })
}

/// Pipe/tab separated positional files (`.DAT`). Columns are not checked.
pub fn verify_dat_file(path: &Path) -> VerificationResult {
    let empty = FileMetrics::Delimited { line_count: 0, preview: Vec::new() };
    let size = match non_empty_size(path, &empty) {
        Ok(size) => size,
        Err(result) => return result,
    };

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => return VerificationResult::invalid(format!("Read error: {}", e), size, empty),
    };
    let text = String::from_utf8_lossy(&bytes);
    let line_count = text.lines().count();
    let preview = text.lines().take(TEXT_PREVIEW).map(str::to_string).collect();

    VerificationResult::ok(size, FileMetrics::Delimited { line_count, preview })
}

/// Comma separated files with a header row.
pub fn verify_csv_file(path: &Path) -> VerificationResult {
    let empty = FileMetrics::Tabular { row_count: 0, header: Vec::new() };
    let size = match non_empty_size(path, &empty) {
        Ok(size) => size,
        Err(result) => return result,
    };

    let mut reader = match csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
    {
        Ok(reader) => reader,
        Err(e) => return VerificationResult::invalid(format!("CSV parse error: {}", e), size, empty),
    };

    let mut header = Vec::new();
    let mut rows = 0usize;
    for record in reader.records() {
        match record {
            Ok(record) => {
                if rows == 0 {
                    header = record.iter().map(str::to_string).collect();
                }
                rows += 1;
            }
            Err(e) => {
                return VerificationResult::invalid(format!("CSV parse error: {}", e), size, empty)
            }
        }
    }

    VerificationResult::ok(
        size,
        FileMetrics::Tabular { row_count: rows.saturating_sub(1), header },
    )
}

/// Checks a file according to its extension. Unknown extensions only need
/// to exist.
pub fn verify_file(path: &Path) -> VerificationResult {
    let extension = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("zip") => verify_zip_file(path),
        Some("dat") => verify_dat_file(path),
        Some("csv") => verify_csv_file(path),
        _ => match fs::metadata(path) {
            Ok(meta) => VerificationResult::ok(meta.len(), FileMetrics::Generic),
            Err(_) => VerificationResult::invalid("File does not exist", 0, FileMetrics::Generic),
        },
    }
}

/// One file examined during a verification pass.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedFile {
    /// `None` for files found on disk without a download record.
    pub download_id: Option<i64>,
    pub file_name: String,
    pub file_type: Option<FileType>,
    pub date: Option<NaiveDate>,
    pub file_path: String,
    pub verification: VerificationResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationSummary {
    pub verified_files: Vec<VerifiedFile>,
    pub invalid_files: Vec<VerifiedFile>,
}

impl VerificationSummary {
    pub fn verified_count(&self) -> usize {
        self.verified_files.len()
    }

    pub fn invalid_count(&self) -> usize {
        self.invalid_files.len()
    }

    pub fn all_valid(&self) -> bool {
        self.invalid_files.is_empty()
    }

    fn push(&mut self, file: VerifiedFile) {
        if file.verification.valid {
            self.verified_files.push(file);
        } else {
            debug!(
                "Invalid file {}: {}",
                file.file_path,
                file.verification.error.as_deref().unwrap_or("unknown error")
            );
            self.invalid_files.push(file);
        }
    }
}

/// Re-checks every tracked download in `[start, end]` plus any file lying in
/// `raw_path` that has no record at all and is not named for a day outside
/// the range. Each path is verified once; among several records for the
/// same path the newest attempt is reported.
pub fn verify_downloads(
    store: &DownloadStore,
    start: NaiveDate,
    end: NaiveDate,
    raw_path: &Path,
) -> Result<VerificationSummary> {
    let mut summary = VerificationSummary::default();
    let mut seen = HashSet::new();

    for record in store.list_by_date_range(start, end)? {
        if !seen.insert(record.file_path.clone()) {
            continue;
        }
        let verification = verify_file(Path::new(&record.file_path));
        summary.push(VerifiedFile {
            download_id: Some(record.id),
            file_name: record.file_name,
            file_type: Some(record.file_type),
            date: Some(record.date),
            file_path: record.file_path,
            verification,
        });
    }

    if raw_path.is_dir() {
        let mut on_disk = Vec::new();
        for entry in fs::read_dir(raw_path)? {
            match entry {
                Ok(entry) if entry.path().is_file() => on_disk.push(entry.path()),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable entry in {}: {}", raw_path.display(), e),
            }
        }
        on_disk.sort();

        for path in on_disk {
            let file_path = path.to_string_lossy().to_string();
            if !seen.insert(file_path.clone()) {
                continue;
            }
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let parsed = parse_local_file_name(&file_name);
            // tracked files are only reported through their record
            if parsed.is_some_and(|(_, date)| date < start || date > end)
                || store.has_record(&file_name)?
            {
                continue;
            }
            summary.push(VerifiedFile {
                download_id: None,
                file_type: parsed.map(|(file_type, _)| file_type),
                date: parsed.map(|(_, date)| date),
                file_name,
                verification: verify_file(&path),
                file_path,
            });
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(fs::File::create(path).unwrap());
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn empty_files_fail_distinctly_from_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.zip", "b.DAT", "c.csv"] {
            let path = dir.path().join(name);
            fs::File::create(&path).unwrap();

            let result = verify_file(&path);
            assert!(!result.valid);
            assert_eq!(result.error.as_deref(), Some("File is empty"));

            let missing = verify_file(&dir.path().join(format!("missing-{}", name)));
            assert!(!missing.valid);
            assert_eq!(missing.error.as_deref(), Some("File does not exist"));
        }
    }

    #[test]
    fn well_formed_archive_with_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm01DEC2023bhav.csv.zip");
        write_zip(&path, &[("cm01DEC2023bhav.csv", "SYMBOL,CLOSE\nTCS,3500\n")]);

        let result = verify_file(&path);
        assert!(result.valid, "{:?}", result.error);
        assert_eq!(result.file_count(), 1);
        assert_eq!(
            result.metrics,
            FileMetrics::Archive { file_count: 1, files: vec!["cm01DEC2023bhav.csv".to_string()] }
        );
    }

    #[test]
    fn html_page_named_zip_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fo01DEC2023bhav.csv.zip");
        fs::write(&path, "<html><body>Resource not found</body></html>").unwrap();

        let result = verify_file(&path);
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("Invalid ZIP file format"));
    }

    #[test]
    fn archive_without_entries_is_flagged_separately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.zip");
        write_zip(&path, &[]);

        let result = verify_file(&path);
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("Archive contains no entries"));
    }

    #[test]
    fn dat_file_counts_lines_without_checking_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MTO_01122023.DAT");
        let body: String = (0..8).map(|i| format!("20|{}|RELIANCE|EQ\n", i)).collect();
        fs::write(&path, format!("Security Wise Delivery Position\nragged line\n{}", body)).unwrap();

        let result = verify_file(&path);
        assert!(result.valid);
        assert_eq!(result.line_count(), 10);
        match result.metrics {
            FileMetrics::Delimited { preview, .. } => {
                assert_eq!(preview.len(), 5);
                assert_eq!(preview[0], "Security Wise Delivery Position");
            }
            other => panic!("unexpected metrics {:?}", other),
        }
    }

    #[test]
    fn csv_row_count_excludes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        fs::write(&path, "a,b\n1,2\n3,4\n").unwrap();

        let result = verify_file(&path);
        assert!(result.valid);
        assert_eq!(result.row_count(), 2);
        assert_eq!(
            result.metrics,
            FileMetrics::Tabular { row_count: 2, header: vec!["a".to_string(), "b".to_string()] }
        );
    }

    #[test]
    fn csv_with_invalid_utf8_is_unparsable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary.csv");
        fs::write(&path, [0x61, 0x2c, 0x62, 0x0a, 0xff, 0xfe, 0x2c, 0x01, 0x0a]).unwrap();

        let result = verify_file(&path);
        assert!(!result.valid);
        assert!(result.error.unwrap().starts_with("CSV parse error"));
    }

    #[test]
    fn other_days_stay_out_of_a_range() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        let store = DownloadStore::open(dir.path().join("downloads.db")).unwrap();
        let dec = |d| NaiveDate::from_ymd_opt(2023, 12, d).unwrap();

        let tracked = raw.join("cm_delivery_2023-12-01.DAT");
        fs::write(&tracked, "10|MTO|01122023\n").unwrap();
        let id = store
            .create(&crate::models::NewDownload {
                file_name: "cm_delivery_2023-12-01.DAT",
                file_type: FileType::CmDelivery,
                url: "https://x/MTO_01122023.DAT",
                date: dec(1),
                file_path: &tracked.to_string_lossy(),
            })
            .unwrap();
        store
            .update_status(id, crate::models::DownloadStatus::Downloading, Some(0.0), None)
            .unwrap();
        store
            .update_status(id, crate::models::DownloadStatus::Completed, Some(100.0), None)
            .unwrap();

        fs::write(raw.join("cm_delivery_2023-11-30.DAT"), "10|MTO|30112023\n").unwrap();
        fs::write(raw.join("cm_delivery_2023-12-02.DAT"), "10|MTO|02122023\n").unwrap();

        let summary = verify_downloads(&store, dec(2), dec(2), &raw).unwrap();
        let names: Vec<_> = summary.verified_files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["cm_delivery_2023-12-02.DAT"]);
        assert!(summary.invalid_files.is_empty());

        let summary = verify_downloads(&store, dec(1), dec(1), &raw).unwrap();
        assert_eq!(summary.verified_count(), 1);
        assert_eq!(summary.verified_files[0].download_id, Some(id));
    }

    #[test]
    fn unknown_extension_only_needs_to_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readme.txt");
        fs::write(&path, "hello").unwrap();

        let result = verify_file(&path);
        assert!(result.valid);
        assert_eq!(result.size, 5);
        assert_eq!(result.metrics, FileMetrics::Generic);
        assert!(!verify_file(&dir.path().join("gone.txt")).valid);
    }
}
