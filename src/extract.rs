//! PDF/TXT folder → JSONL training corpus.
//!
//! Legal texts arrive as PDFs and as plain-text files saved by various
//! Windows tools, so TXT decoding tries several encodings and accepts the
//! first one that yields recognisable French accented characters.

use anyhow::Result;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::jsonl::JsonlWriter;
use crate::models::CorpusEntry;

/// Labels tried in order when decoding a TXT file.
pub const TXT_ENCODINGS: [&str; 4] = ["cp1252", "iso-8859-1", "utf-8", "latin1"];

const FRENCH_CHARS: &str = "éèêëàâäôöûüçîï";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("PDF extraction failed for {path}: {message}")]
    Pdf { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub processed: u64,
    pub failed: u64,
}

fn read(path: &Path) -> Result<Vec<u8>, ExtractError> {
    std::fs::read(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Text of every page of a PDF.
pub fn extract_pdf(path: &Path) -> Result<String, ExtractError> {
    let bytes = read(path)?;
    pdf_extract::extract_text_from_mem(&bytes).map_err(|e| ExtractError::Pdf {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn extract_txt(path: &Path) -> Result<String, ExtractError> {
    Ok(decode_txt(&read(path)?))
}

/// Decode with the first encoding in [`TXT_ENCODINGS`] that decodes without
/// errors and produces a French accented character; otherwise windows-1252
/// with replacement.
pub fn decode_txt(bytes: &[u8]) -> String {
    for encoding in candidate_encodings() {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            if text.chars().any(|c| FRENCH_CHARS.contains(c)) {
                tracing::debug!(encoding = encoding.name(), "decoded text file");
                return text.into_owned();
            }
        }
    }
    let (text, _, _) = WINDOWS_1252.decode(bytes);
    text.into_owned()
}

/// [`TXT_ENCODINGS`] resolved through WHATWG labels, duplicates removed.
/// `iso-8859-1` and `latin1` both resolve to windows-1252.
fn candidate_encodings() -> Vec<&'static Encoding> {
    let mut out: Vec<&'static Encoding> = Vec::new();
    for label in TXT_ENCODINGS {
        let encoding = Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8);
        if !out.contains(&encoding) {
            out.push(encoding);
        }
    }
    out
}

enum Kind {
    Pdf,
    Txt,
}

fn kind_of(path: &Path) -> Option<Kind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(Kind::Pdf),
        "txt" => Some(Kind::Txt),
        _ => None,
    }
}

/// Write one `{file_name, text}` line per PDF/TXT file in `folder`.
///
/// Files are visited in name order. A file that yields no text is counted
/// as failed; other files are ignored.
pub fn folder_to_jsonl(folder: &Path, output: &Path) -> Result<ExtractStats> {
    if !folder.is_dir() {
        anyhow::bail!("Input folder does not exist: {}", folder.display());
    }

    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut writer = JsonlWriter::create(output)?;
    let mut stats = ExtractStats::default();

    for path in &files {
        let Some(kind) = kind_of(path) else {
            continue;
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let extracted = match kind {
            Kind::Pdf => extract_pdf(path),
            Kind::Txt => extract_txt(path),
        };
        let text = match extracted {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "extraction failed");
                String::new()
            }
        };

        if text.is_empty() {
            tracing::warn!(file = %file_name, "no text extracted");
            stats.failed += 1;
            continue;
        }

        writer.write(&CorpusEntry {
            file_name: file_name.clone(),
            text,
        })?;
        tracing::info!(file = %file_name, "extracted");
        stats.processed += 1;
    }

    writer.finish()?;
    Ok(stats)
}

/// `cqa extract`
pub fn run_extract(folder: &Path, output: &Path) -> Result<()> {
    let stats = folder_to_jsonl(folder, output)?;
    println!("extract {}", folder.display());
    println!("  output: {}", output.display());
    println!("  processed: {}", stats.processed);
    println!("  failed: {}", stats.failed);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::read_jsonl;
    use tempfile::TempDir;

    #[test]
    fn cp1252_french_text() {
        // "Théâtre" in windows-1252
        let bytes = b"Th\xe9\xe2tre";
        assert_eq!(decode_txt(bytes), "Théâtre");
    }

    #[test]
    fn utf8_french_text_is_not_mojibake() {
        let text = "Réponse : l'assuré doit déclarer le sinistre.";
        assert_eq!(decode_txt(text.as_bytes()), text);
    }

    #[test]
    fn plain_ascii_falls_back_unchanged() {
        assert_eq!(decode_txt(b"Article 12"), "Article 12");
    }

    #[test]
    fn candidates_are_deduplicated() {
        let names: Vec<&str> = candidate_encodings().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["windows-1252", "UTF-8"]);
    }

    #[test]
    fn invalid_pdf_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        assert!(matches!(extract_pdf(&path), Err(ExtractError::Pdf { .. })));
    }

    #[test]
    fn folder_extraction_counts_and_orders() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in");
        std::fs::create_dir(&input).unwrap();
        std::fs::write(input.join("b.TXT"), b"Code des assurances, \xe9dition 2020").unwrap();
        std::fs::write(input.join("a.txt"), "Prime d'assurance").unwrap();
        std::fs::write(input.join("empty.txt"), "").unwrap();
        std::fs::write(input.join("broken.pdf"), b"not a pdf").unwrap();
        std::fs::write(input.join("notes.md"), "ignored").unwrap();

        let output = tmp.path().join("out.jsonl");
        let stats = folder_to_jsonl(&input, &output).unwrap();
        assert_eq!(stats, ExtractStats { processed: 2, failed: 2 });

        let entries: Vec<CorpusEntry> = read_jsonl(&output).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.TXT"]);
        assert_eq!(entries[1].text, "Code des assurances, édition 2020");
    }
}
