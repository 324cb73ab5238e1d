//! JSON Lines reading and writing.
//!
//! One JSON object per line, UTF-8, non-ASCII characters written as-is.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Streams records to a JSONL file.
pub struct JsonlWriter {
    out: BufWriter<File>,
    written: u64,
}

impl JsonlWriter {
    /// Create (or truncate) `path`, creating parent directories.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.out.flush()?;
        Ok(self.written)
    }
}

/// Write all `records` to `path`.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<u64> {
    let mut writer = JsonlWriter::create(path)?;
    for record in records {
        writer.write(record)?;
    }
    writer.finish()
}

/// Read every line of `path`. Blank lines are ignored.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON line", path.display(), i + 1))?;
        out.push(record);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CorpusEntry;
    use tempfile::TempDir;

    #[test]
    fn round_trip_preserves_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("corpus.jsonl");
        let entries = vec![
            CorpusEntry {
                file_name: "loi.txt".to_string(),
                text: "Article 1 : l'assureur est tenu…\nligne deux".to_string(),
            },
            CorpusEntry {
                file_name: "b.pdf".to_string(),
                text: String::new(),
            },
        ];
        assert_eq!(write_jsonl(&path, &entries).unwrap(), 2);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("l'assureur est tenu…"));

        let back: Vec<CorpusEntry> = read_jsonl(&path).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn bad_line_reports_position() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.jsonl");
        std::fs::write(&path, "{\"file_name\":\"a\",\"text\":\"b\"}\n\nnot json\n").unwrap();
        let err = read_jsonl::<CorpusEntry>(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(":3:"));
    }
}
