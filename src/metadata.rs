//! File and column descriptions for the claims corpus.
//!
//! The sidecar `metadata.json` lives next to the CSV files and is keyed by
//! file name:
//!
//! ```json
//! {
//!   "AA.csv": {
//!     "file_description": "Automobile claims, one row per settlement",
//!     "columns": {
//!       "ID": { "description": "Claim identifier", "type": "integer" },
//!       "DATE_EXECUTION": { "description": "Settlement time", "type": "datetime" }
//!     }
//!   }
//! }
//! ```
//!
//! The file is validated when loaded. Column order is the order of the
//! JSON object and is kept when the descriptions are rendered.
//!
//! [`enrich_documents`] prefixes each document's text with the description
//! of its own source file. Documents whose file has no entry pass through
//! unchanged.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::{Document, EnrichedDocument};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to read metadata file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("metadata root must be an object keyed by file name")]
    NotAnObject,
    #[error("metadata for '{file}': {reason}")]
    InvalidFile { file: String, reason: String },
    #[error("metadata for '{file}', column '{column}': {reason}")]
    InvalidColumn {
        file: String,
        column: String,
        reason: String,
    },
}

/// Description of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub description: String,
    /// Declared data type, e.g. `integer` or `date`.
    pub kind: String,
}

/// Description of one source file and its columns, in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileMetadata {
    pub file_description: String,
    pub columns: Vec<ColumnInfo>,
}

impl FileMetadata {
    /// One `name: description (type)` line per column.
    pub fn columns_info(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{}: {} ({})", c.name, c.description, c.kind))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Prefix `text` with the file and column descriptions.
    pub fn render(&self, text: &str) -> String {
        format!(
            "File Description: {}\n\nColumns Information:\n{}\n\nData:\n{}",
            self.file_description,
            self.columns_info(),
            text
        )
    }
}

/// All file descriptions for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTable {
    files: BTreeMap<String, FileMetadata>,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file_name: impl Into<String>, metadata: FileMetadata) {
        self.files.insert(file_name.into(), metadata);
    }

    pub fn get(&self, file_name: &str) -> Option<&FileMetadata> {
        self.files.get(file_name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Parse and validate the sidecar JSON text.
    pub fn from_json(json: &str) -> Result<Self, MetadataError> {
        let value: Value = serde_json::from_str(json).map_err(|source| MetadataError::Json {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, MetadataError> {
        let root = match value {
            Value::Object(map) => map,
            _ => return Err(MetadataError::NotAnObject),
        };

        let mut table = Self::new();
        for (file, entry) in root {
            let parsed = parse_file_entry(&file, entry)?;
            table.insert(file, parsed);
        }
        Ok(table)
    }
}

fn parse_file_entry(file: &str, entry: Value) -> Result<FileMetadata, MetadataError> {
    let invalid = |reason: &str| MetadataError::InvalidFile {
        file: file.to_string(),
        reason: reason.to_string(),
    };

    let mut obj = match entry {
        Value::Object(obj) => obj,
        _ => return Err(invalid("entry must be an object")),
    };

    let file_description = match obj.remove("file_description") {
        None => String::new(),
        Some(Value::String(s)) => s,
        Some(_) => return Err(invalid("file_description must be a string")),
    };

    let columns = match obj.remove("columns") {
        None => Vec::new(),
        Some(Value::Object(cols)) => parse_columns(file, cols)?,
        Some(_) => return Err(invalid("columns must be an object keyed by column name")),
    };

    Ok(FileMetadata {
        file_description,
        columns,
    })
}

fn parse_columns(file: &str, cols: Map<String, Value>) -> Result<Vec<ColumnInfo>, MetadataError> {
    let mut out = Vec::with_capacity(cols.len());
    for (name, info) in cols {
        let invalid = |reason: &str| MetadataError::InvalidColumn {
            file: file.to_string(),
            column: name.clone(),
            reason: reason.to_string(),
        };
        let info = info
            .as_object()
            .ok_or_else(|| invalid("must be an object with description and type"))?;
        let description = info
            .get("description")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing string field 'description'"))?;
        let kind = info
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing string field 'type'"))?;
        out.push(ColumnInfo {
            name: name.clone(),
            description: description.to_string(),
            kind: kind.to_string(),
        });
    }
    Ok(out)
}

/// Load the sidecar file. A missing file yields an empty table.
pub fn load_metadata(path: &Path) -> Result<MetadataTable, MetadataError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no metadata file, documents will not be enriched");
        return Ok(MetadataTable::new());
    }
    let content = std::fs::read_to_string(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| MetadataError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    MetadataTable::from_value(value)
}

/// Apply `metadata` to one document, returning a new value.
pub fn enrich_document(doc: &Document, metadata: &FileMetadata) -> Document {
    let mut enriched = doc.clone();
    enriched.text = metadata.render(&doc.text);
    enriched.metadata.insert(
        "file_description".to_string(),
        metadata.file_description.clone(),
    );
    enriched
        .metadata
        .insert("columns_info".to_string(), metadata.columns_info());
    enriched
}

/// Enrich every document with the metadata of its own source file.
///
/// Output has the same length and order as the input.
pub fn enrich_documents(documents: Vec<Document>, table: &MetadataTable) -> Vec<EnrichedDocument> {
    documents
        .into_iter()
        .map(|doc| match table.get(&doc.source_file) {
            Some(meta) => EnrichedDocument {
                document: enrich_document(&doc, meta),
                enriched: true,
            },
            None => EnrichedDocument {
                document: doc,
                enriched: false,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(file: &str, text: &str) -> Document {
        Document {
            source_file: file.to_string(),
            row: 2,
            text: text.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    const SAMPLE: &str = r#"{
        "AA.csv": {
            "file_description": "Automobile claims",
            "columns": {
                "ID": {"description": "Claim identifier", "type": "integer"},
                "AMOUNT": {"description": "Paid amount", "type": "float"},
                "DATE_EXECUTION": {"description": "Settlement time", "type": "datetime"}
            }
        }
    }"#;

    #[test]
    fn columns_keep_declared_order() {
        let table = MetadataTable::from_json(SAMPLE).unwrap();
        let meta = table.get("AA.csv").unwrap();
        let names: Vec<&str> = meta.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ID", "AMOUNT", "DATE_EXECUTION"]);
    }

    #[test]
    fn enrichment_prefixes_text() {
        let table = MetadataTable::from_json(SAMPLE).unwrap();
        let out = enrich_documents(vec![doc("AA.csv", "ID: 1, AMOUNT: 100")], &table);
        assert!(out[0].enriched);
        assert_eq!(
            out[0].document.text,
            "File Description: Automobile claims\n\n\
             Columns Information:\n\
             ID: Claim identifier (integer)\n\
             AMOUNT: Paid amount (float)\n\
             DATE_EXECUTION: Settlement time (datetime)\n\n\
             Data:\nID: 1, AMOUNT: 100"
        );
        assert_eq!(
            out[0].document.metadata.get("file_description").map(String::as_str),
            Some("Automobile claims")
        );
    }

    #[test]
    fn lookup_uses_each_documents_own_file() {
        let table = MetadataTable::from_json(SAMPLE).unwrap();
        let out = enrich_documents(
            vec![doc("AA.csv", "a"), doc("BB.csv", "b"), doc("AA.csv", "c")],
            &table,
        );
        assert_eq!(out.len(), 3);
        assert!(out[0].enriched);
        assert!(!out[1].enriched);
        assert_eq!(out[1].document.text, "b");
        assert!(out[2].document.text.ends_with("Data:\nc"));
    }

    #[test]
    fn empty_table_is_a_no_op() {
        let docs = vec![doc("AA.csv", "x"), doc("BB.csv", "y")];
        let out = enrich_documents(docs.clone(), &MetadataTable::new());
        let texts: Vec<&str> = out.iter().map(|e| e.document.text.as_str()).collect();
        assert_eq!(texts, vec!["x", "y"]);
        assert_eq!(out[0].document, docs[0]);
    }

    #[test]
    fn missing_description_defaults_to_empty() {
        let table = MetadataTable::from_json(r#"{"AA.csv": {}}"#).unwrap();
        let meta = table.get("AA.csv").unwrap();
        assert_eq!(meta.render("t"), "File Description: \n\nColumns Information:\n\n\nData:\nt");
    }

    #[test]
    fn malformed_column_names_file_and_column() {
        let err = MetadataTable::from_json(
            r#"{"AA.csv": {"columns": {"ID": {"description": "x"}}}}"#,
        )
        .unwrap_err();
        match err {
            MetadataError::InvalidColumn { file, column, .. } => {
                assert_eq!(file, "AA.csv");
                assert_eq!(column, "ID");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_object_root_is_rejected() {
        assert!(matches!(
            MetadataTable::from_json("[1, 2]"),
            Err(MetadataError::NotAnObject)
        ));
        assert!(matches!(
            MetadataTable::from_json(r#"{"AA.csv": {"file_description": 3}}"#),
            Err(MetadataError::InvalidFile { .. })
        ));
    }

    #[test]
    fn missing_file_yields_empty_table() {
        let tmp = tempfile::TempDir::new().unwrap();
        let table = load_metadata(&tmp.path().join("metadata.json")).unwrap();
        assert!(table.is_empty());
    }
}
