//! Delimited-file row parser.
//!
//! Turns one semicolon-separated claims file into a lazy sequence of
//! [`Document`]s, one per data row. The first row supplies the column
//! names; every following row is flattened to `"COLUMN: value"` pairs.
//!
//! Columns whose name starts with the date prefix (default `DATE_`) are
//! normalized to ISO dates when they match one of the known export
//! formats. Values that match none are kept as-is.
//!
//! A row the reader cannot decode is logged and skipped; the rest of the
//! file is still parsed.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use encoding_rs::Encoding;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::config::CorpusConfig;
use crate::models::{Document, Record};

/// Timestamp layouts tried first, e.g. `01jan23:10:00:00`.
const DATETIME_FORMATS: &[&str] = &["%d%b%y:%H:%M:%S", "%d%b%Y:%H:%M:%S"];
/// Date-only layouts tried when no timestamp layout matches, e.g. `31/12/2023`.
const DATE_FORMATS: &[&str] = &["%d/%m/%Y"];

/// Reads delimited files with a fixed delimiter, encoding, and date prefix.
#[derive(Debug, Clone)]
pub struct CsvRowReader {
    delimiter: u8,
    encoding: &'static Encoding,
    date_prefix: String,
}

impl CsvRowReader {
    /// Build a reader. `encoding` is a WHATWG label such as `latin1` or `utf-8`.
    pub fn new(delimiter: u8, encoding: &str, date_prefix: &str) -> Result<Self> {
        let encoding = Encoding::for_label(encoding.as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding label: '{}'", encoding))?;
        Ok(Self {
            delimiter,
            encoding,
            date_prefix: date_prefix.to_string(),
        })
    }

    pub fn from_config(config: &CorpusConfig) -> Result<Self> {
        Self::new(
            config.delimiter_byte(),
            &config.encoding,
            &config.date_prefix,
        )
    }

    /// Open a file and return its rows as documents.
    ///
    /// Fails only if the file cannot be read. Row-level problems are
    /// logged and skipped while iterating.
    pub fn read_file(&self, path: &Path) -> Result<RowDocuments> {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(self.read_bytes(&source_file, &bytes))
    }

    /// Decode raw bytes with the configured encoding and parse them.
    pub fn read_bytes(&self, source_file: &str, bytes: &[u8]) -> RowDocuments {
        let (text, used, had_errors) = self.encoding.decode(bytes);
        if had_errors {
            tracing::warn!(
                file = source_file,
                encoding = used.name(),
                "replacement characters inserted while decoding"
            );
        }
        self.read_str(source_file, text.into_owned())
    }

    /// Parse already-decoded text.
    pub fn read_str(&self, source_file: &str, text: String) -> RowDocuments {
        let source: Arc<[u8]> = Arc::from(text.into_bytes());
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(Cursor::new(Arc::clone(&source)));

        let headers: Vec<String> = match reader.headers() {
            Ok(h) => h.iter().map(|s| s.to_string()).collect(),
            Err(e) => {
                tracing::warn!(file = source_file, error = %e, "could not read header row");
                Vec::new()
            }
        };

        RowDocuments {
            source_file: source_file.to_string(),
            date_prefix: self.date_prefix.clone(),
            headers,
            records: reader.into_records(),
            lines: LineCounter::new(source),
        }
    }
}

/// Maps byte offsets to 1-based physical line numbers. Offsets must be
/// queried in increasing order.
struct LineCounter {
    source: Arc<[u8]>,
    scanned: usize,
    line: usize,
}

impl LineCounter {
    fn new(source: Arc<[u8]>) -> Self {
        Self {
            source,
            scanned: 0,
            line: 1,
        }
    }

    /// Line of the first content byte at or after `offset`. Blank lines
    /// the parser skipped before a record are not part of it.
    fn record_line(&mut self, offset: u64) -> usize {
        let mut start = (offset as usize).min(self.source.len());
        while start < self.source.len() && matches!(self.source[start], b'\r' | b'\n') {
            start += 1;
        }
        if start > self.scanned {
            self.line += self.source[self.scanned..start]
                .iter()
                .filter(|&&b| b == b'\n')
                .count();
            self.scanned = start;
        }
        self.line
    }
}

/// Lazy iterator over the documents of one file.
pub struct RowDocuments {
    source_file: String,
    date_prefix: String,
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<Cursor<Arc<[u8]>>>,
    lines: LineCounter,
}

impl RowDocuments {
    /// Pair cells with headers. A repeated header keeps its first position
    /// and takes the value of its last cell.
    fn to_record(&self, cells: &csv::StringRecord) -> Record {
        let mut fields: Vec<(String, String)> = Vec::with_capacity(self.headers.len());
        for (cell, header) in cells.iter().zip(self.headers.iter()) {
            let value = if header.starts_with(&self.date_prefix) {
                normalize_date(cell).unwrap_or_else(|| {
                    tracing::debug!(column = %header, value = cell, "unrecognized date");
                    cell.to_string()
                })
            } else {
                cell.to_string()
            };
            match fields.iter_mut().find(|(k, _)| k == header) {
                Some(existing) => existing.1 = value,
                None => fields.push((header.clone(), value)),
            }
        }
        Record { fields }
    }
}

impl Iterator for RowDocuments {
    type Item = Document;

    fn next(&mut self) -> Option<Document> {
        if self.headers.is_empty() {
            return None;
        }
        loop {
            match self.records.next()? {
                Ok(cells) => {
                    let offset = cells.position().map(|p| p.byte()).unwrap_or(0);
                    let row = self.lines.record_line(offset);
                    let record = self.to_record(&cells);
                    return Some(Document {
                        source_file: self.source_file.clone(),
                        row,
                        text: record.to_text(),
                        metadata: BTreeMap::new(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        file = %self.source_file,
                        line = e.position().map(|p| p.line()),
                        error = %e,
                        "skipping malformed row"
                    );
                }
            }
        }
    }
}

/// Normalize a date-like cell to `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`.
///
/// Returns `None` when the value matches none of the known layouts.
pub fn normalize_date(value: &str) -> Option<String> {
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.format("%Y-%m-%d %H:%M:%S").to_string());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
            return Some(d.format("%Y-%m-%d").to_string());
        }
    }
    None
}
