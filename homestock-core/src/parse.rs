//! Extracts downloaded archives and normalizes their CSV tables.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::Result;

const TEMP_EXTRACT_DIR: &str = "temp_extract";

pub fn extract_zip(file_path: &Path, extract_to: &Path) -> Result<()> {
    let file = fs::File::open(file_path)?;
    let mut archive = ZipArchive::new(file).map_err(std::io::Error::from)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(std::io::Error::from)?;
        // entries escaping the target directory are dropped
        let Some(relative) = file.enclosed_name() else {
            warn!("Skipping unsafe entry {} in {}", file.name(), file_path.display());
            continue;
        };
        let outpath = extract_to.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(p) = outpath.parent() {
                fs::create_dir_all(p)?;
            }
            let mut outfile = fs::File::create(&outpath)?;
            std::io::copy(&mut file, &mut outfile)?;
        }
    }
    Ok(())
}

/// Copies `input` to `output` with every data cell trimmed. Returns the
/// number of data rows written.
pub fn normalize_csv(input: &Path, output: &Path) -> Result<usize> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(input)?;
    let mut writer = csv::WriterBuilder::new().flexible(true).from_path(output)?;

    writer.write_record(reader.headers()?)?;

    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        writer.write_record(record.iter().map(str::trim))?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(OsStr::to_str) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Extracts every archive in `raw_path`, writes normalized CSVs as
/// `<archive stem>_<csv name>` into `output_path` and copies `.DAT` files
/// across. Returns table name -> data row count (1 for copied DAT files).
pub fn parse_files(raw_path: &Path, output_path: &Path) -> Result<BTreeMap<String, usize>> {
    let mut results = BTreeMap::new();
    fs::create_dir_all(output_path)?;

    let temp_extract = output_path.join(TEMP_EXTRACT_DIR);
    fs::create_dir_all(&temp_extract)?;

    let zip_files = files_with_extension(raw_path, "zip")?;
    info!("Found {} zip files to process", zip_files.len());

    for zip_file in zip_files {
        let zip_stem = stem(&zip_file);
        let extract_dir = temp_extract.join(&zip_stem);
        fs::create_dir_all(&extract_dir)?;

        if let Err(e) = extract_zip(&zip_file, &extract_dir) {
            warn!("Error extracting {}: {}", zip_file.display(), e);
            continue;
        }
        info!("Extracted: {}", zip_file.display());

        for csv_file in files_with_extension(&extract_dir, "csv")? {
            let csv_name = csv_file
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let normalized_name = format!("{}_{}", zip_stem, csv_name);
            let table_name = normalized_name.trim_end_matches(".csv").to_string();

            match normalize_csv(&csv_file, &output_path.join(&normalized_name)) {
                Ok(rows) => {
                    info!("Normalized {}: {} rows", table_name, rows);
                    results.insert(table_name, rows);
                }
                Err(e) => warn!("Error normalizing CSV {}: {}", csv_file.display(), e),
            }
        }
    }

    let dat_files = files_with_extension(raw_path, "DAT")?;
    info!("Found {} DAT files to process", dat_files.len());

    for dat_file in dat_files {
        let Some(name) = dat_file.file_name() else { continue };
        match fs::copy(&dat_file, output_path.join(name)) {
            Ok(_) => {
                info!("Copied DAT file: {}", dat_file.display());
                results.insert(stem(&dat_file), 1);
            }
            Err(e) => warn!("Error copying DAT file {}: {}", dat_file.display(), e),
        }
    }

    if let Err(e) = fs::remove_dir_all(&temp_extract) {
        warn!("Could not remove {}: {}", temp_extract.display(), e);
    }

    info!("Parsing completed. Processed {} files.", results.len());
    Ok(results)
}
