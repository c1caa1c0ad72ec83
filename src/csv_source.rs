//! Model lists on disk
//!
//! A model list is a CSV file with the columns `SrNo, Model_ID, Model_Name, Model_URL`, or a
//! plain text file with one URL, ID or name per line. This module reads both into
//! [`RawEntry`] values and writes CSVs back: rewritten lists after preprocessing, and the
//! failed subset of a batch for re-running.

use crate::error::{Error, ResolveFailure, Result};
use crate::types::{EntryId, RawEntry, Resolution};
use crate::utils::part_path;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Column names written to every CSV
pub const CSV_HEADER: [&str; 4] = ["SrNo", "Model_ID", "Model_Name", "Model_URL"];

/// Position of `Model_URL` in a row
const URL_COLUMN: usize = 3;

/// First-column values that mark a header row
const HEADER_MARKERS: &[&str] = &["srno", "sr no", "index"];

/// File in the CSV directory that is never treated as a model list
const TEMPLATE_FILE: &str = "template.csv";

fn csv_error(path: &Path, source: csv::Error) -> Error {
    Error::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Why a CSV record is not a model entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Skip {
    InvalidUtf8,
    Short,
    Header,
    Blank,
}

/// ID, name and URL columns of an accepted row
struct Row {
    label: String,
    model_id: Option<String>,
    name: Option<String>,
    url: Option<String>,
}

fn accept_row(record: &csv::ByteRecord) -> std::result::Result<Row, Skip> {
    let record =
        csv::StringRecord::from_byte_record(record.clone()).map_err(|_| Skip::InvalidUtf8)?;
    if record.len() < CSV_HEADER.len() {
        return Err(Skip::Short);
    }

    let label = record.get(0).unwrap_or_default().trim();
    if HEADER_MARKERS.contains(&label.to_ascii_lowercase().as_str()) {
        return Err(Skip::Header);
    }

    let row = Row {
        label: label.to_string(),
        model_id: non_blank(record.get(1)),
        name: non_blank(record.get(2)),
        url: non_blank(record.get(URL_COLUMN)),
    };
    if row.model_id.is_none() && row.name.is_none() && row.url.is_none() {
        return Err(Skip::Blank);
    }
    Ok(row)
}

fn open_reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(path, e))
}

fn is_missing_or_empty(path: &Path) -> Result<bool> {
    Ok(!path.exists() || std::fs::metadata(path)?.len() == 0)
}

/// Read the entries of a CSV model list
///
/// Rows with fewer than four columns, rows that are not valid UTF-8, header rows, and rows
/// whose ID, name and URL are all blank are skipped. Entry IDs are the 1-based positions of
/// the accepted rows. A missing or empty file yields no entries.
pub fn read_csv_entries(path: &Path) -> Result<Vec<RawEntry>> {
    if is_missing_or_empty(path)? {
        tracing::debug!(path = %path.display(), "CSV file missing or empty");
        return Ok(Vec::new());
    }

    let mut reader = open_reader(path)?;
    let mut entries = Vec::new();
    for (index, record) in reader.byte_records().enumerate() {
        let record = record.map_err(|e| csv_error(path, e))?;
        let line = index + 1;
        let row = match accept_row(&record) {
            Ok(row) => row,
            Err(Skip::InvalidUtf8) => {
                tracing::warn!(path = %path.display(), line, "Row is not valid UTF-8, skipping");
                continue;
            }
            Err(Skip::Short) => {
                tracing::warn!(
                    path = %path.display(),
                    line,
                    "Row has fewer than 4 columns, skipping"
                );
                continue;
            }
            Err(Skip::Header | Skip::Blank) => continue,
        };

        entries.push(RawEntry {
            id: EntryId(entries.len() as u64 + 1),
            label: row.label,
            model_id: row.model_id,
            name: row.name,
            url: row.url,
        });
    }

    tracing::debug!(path = %path.display(), entries = entries.len(), "Read CSV model list");
    Ok(entries)
}

/// Read a plain text model list: one identifier per non-blank line
///
/// Each line becomes both the identifier and the entry name. Invalid UTF-8 is replaced
/// rather than rejected.
pub fn read_text_entries(path: &Path) -> Result<Vec<RawEntry>> {
    let bytes = std::fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    let entries = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| RawEntry {
            name: Some(line.to_string()),
            ..RawEntry::from_identifier(i as u64 + 1, line)
        })
        .collect();
    Ok(entries)
}

/// Point the URL column of resolved rows at their canonical download URL, in place
///
/// `rows` are the entries [`read_csv_entries`] returned for `path`, paired with their
/// resolution. Only the URL field of resolved rows changes; every other record, column and
/// header is written back as read. Returns the number of rewritten rows. The file is left
/// untouched when nothing resolved.
pub fn rewrite_csv_urls(
    path: &Path,
    rows: &[(RawEntry, std::result::Result<Resolution, ResolveFailure>)],
) -> Result<usize> {
    let urls: HashMap<EntryId, &str> = rows
        .iter()
        .filter_map(|(entry, result)| {
            let resolution = result.as_ref().ok()?;
            Some((entry.id, resolution.download_url.as_str()))
        })
        .collect();
    if urls.is_empty() || is_missing_or_empty(path)? {
        return Ok(0);
    }

    let mut records = Vec::new();
    let mut accepted = 0;
    let mut rewritten = 0;
    for record in open_reader(path)?.byte_records() {
        let record = record.map_err(|e| csv_error(path, e))?;
        if accept_row(&record).is_ok() {
            accepted += 1;
            if let Some(url) = urls.get(&EntryId(accepted)) {
                rewritten += 1;
                records.push(with_url(&record, url));
                continue;
            }
        }
        records.push(record);
    }

    let staging = part_path(path);
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(&staging)
        .map_err(|e| csv_error(path, e))?;
    for record in &records {
        writer
            .write_byte_record(record)
            .map_err(|e| csv_error(path, e))?;
    }
    writer.flush()?;
    drop(writer);
    std::fs::rename(&staging, path)?;

    tracing::debug!(path = %path.display(), rewritten, "Rewrote model list URLs");
    Ok(rewritten)
}

fn with_url(record: &csv::ByteRecord, url: &str) -> csv::ByteRecord {
    record
        .iter()
        .enumerate()
        .map(|(i, field)| if i == URL_COLUMN { url.as_bytes() } else { field })
        .collect()
}

/// Write a new model list from resolved entries (used when converting text lists)
///
/// Resolved rows carry the canonical download URL, the catalog model ID and the catalog model
/// name (or the file name without extension when the catalog reported no name). Unresolved
/// rows keep their original content so they can be fixed by hand.
pub fn write_resolved_csv(
    path: &Path,
    rows: &[(RawEntry, std::result::Result<Resolution, ResolveFailure>)],
) -> Result<()> {
    let mut writer = open_writer(path)?;
    for (entry, result) in rows {
        let record = match result {
            Ok(resolution) => {
                let model_id = resolution
                    .model_id
                    .map(|id| id.to_string())
                    .or_else(|| entry.model_id.clone())
                    .unwrap_or_default();
                let name = catalog_name(resolution)
                    .or_else(|| entry.name.clone())
                    .unwrap_or_default();
                [
                    entry.label.clone(),
                    model_id,
                    name,
                    resolution.download_url.clone(),
                ]
            }
            Err(_) => entry_record(entry),
        };
        writer.write_record(&record).map_err(|e| csv_error(path, e))?;
    }
    writer.flush()?;
    Ok(())
}

fn catalog_name(resolution: &Resolution) -> Option<String> {
    resolution.model_name.clone().or_else(|| {
        let file_name = resolution.file_name.as_deref()?;
        let stem = Path::new(file_name).file_stem()?.to_string_lossy();
        Some(stem.into_owned())
    })
}

/// Write raw entries as a model list (used for the failed subset of a batch)
pub fn write_entries_csv(path: &Path, entries: &[RawEntry]) -> Result<()> {
    let mut writer = open_writer(path)?;
    for entry in entries {
        writer
            .write_record(&entry_record(entry))
            .map_err(|e| csv_error(path, e))?;
    }
    writer.flush()?;
    Ok(())
}

/// CSV model lists in `dir`, sorted by name, excluding `template.csv`
pub fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    list_files(dir, "csv")
}

/// Plain text model lists in `dir`, sorted by name
pub fn list_text_files(dir: &Path) -> Result<Vec<PathBuf>> {
    list_files(dir, "txt")
}

fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches_extension = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        let is_template = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().eq_ignore_ascii_case(TEMPLATE_FILE));
        if matches_extension && !is_template {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn open_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    writer
        .write_record(CSV_HEADER)
        .map_err(|e| csv_error(path, e))?;
    Ok(writer)
}

fn entry_record(entry: &RawEntry) -> [String; 4] {
    [
        entry.label.clone(),
        entry.model_id.clone().unwrap_or_default(),
        entry.name.clone().unwrap_or_default(),
        entry.url.clone().unwrap_or_default(),
    ]
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
