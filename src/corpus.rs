//! Corpus loader: every matching file in a folder, parsed in name order.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobMatcher};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::csv_reader::CsvRowReader;
use crate::models::Document;

/// Load every file in `dir` matching `pattern` (e.g. `*.csv`).
///
/// Files are visited in lexical name order and rows keep their file order,
/// so the result is deterministic. The directory itself must exist; a file
/// that cannot be read is logged and contributes no documents.
pub fn load_directory(reader: &CsvRowReader, dir: &Path, pattern: &str) -> Result<Vec<Document>> {
    let files = list_files(dir, pattern)?;

    let mut documents = Vec::new();
    for path in &files {
        match reader.read_file(path) {
            Ok(rows) => {
                let before = documents.len();
                documents.extend(rows);
                tracing::info!(
                    file = %path.display(),
                    rows = documents.len() - before,
                    "parsed file"
                );
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping unreadable file");
            }
        }
    }

    Ok(documents)
}

/// Load the folder named in `[corpus]`.
pub fn load_from_config(config: &CorpusConfig) -> Result<Vec<Document>> {
    let reader = CsvRowReader::from_config(config)?;
    load_directory(&reader, &config.folder, &config.pattern)
}

/// Matching files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("Corpus folder does not exist: {}", dir.display());
    }

    let matcher = build_matcher(pattern)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry =
            entry.with_context(|| format!("Failed to list corpus folder {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if matcher.is_match(entry.file_name()) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

fn build_matcher(pattern: &str) -> Result<GlobMatcher> {
    let glob = Glob::new(pattern).with_context(|| format!("Invalid file pattern: {}", pattern))?;
    Ok(glob.compile_matcher())
}
