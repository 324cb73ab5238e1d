//! Core data models used throughout claimsqa.
//!
//! These types represent the rows, documents, chunks, and generated examples
//! that flow through the ingestion, retrieval, and dataset pipelines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One parsed row of a delimited file, in header order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub fields: Vec<(String, String)>,
}

impl Record {
    /// Flatten into `"key: value"` pairs joined by `", "`.
    pub fn to_text(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A unit of retrievable text derived from one CSV row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// File name (not path) of the CSV this row came from.
    pub source_file: String,
    /// Physical line of the row; the header is line 1.
    pub row: usize,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    /// Stable identity used as the store key.
    pub fn id(&self) -> String {
        format!("{}#{}", self.source_file, self.row)
    }
}

/// A document after metadata enrichment, ready for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedDocument {
    pub document: Document,
    /// False when no metadata entry matched the source file.
    pub enriched: bool,
}

/// A chunk of an enriched document's text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// One line of the extracted text corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub file_name: String,
    #[serde(alias = "messages")]
    pub text: String,
}

/// One line of the generated instruction dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionExample {
    pub instruction: String,
    pub input: String,
    pub output: String,
    pub source_document: String,
}

impl InstructionExample {
    pub fn new(question: String, answer: String, source_document: &str) -> Self {
        Self {
            instruction: question,
            input: String::new(),
            output: answer,
            source_document: source_document.to_string(),
        }
    }
}

/// A retrieved chunk with its similarity score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub source_file: String,
    pub row: i64,
    pub score: f64,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_flattens_in_header_order() {
        let record = Record {
            fields: vec![
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "1".to_string()),
            ],
        };
        assert_eq!(record.to_text(), "B: 2, A: 1");
    }

    #[test]
    fn corpus_entry_accepts_legacy_messages_field() {
        let entry: CorpusEntry =
            serde_json::from_str(r#"{"file_name":"a.txt","messages":"bonjour"}"#).unwrap();
        assert_eq!(entry.text, "bonjour");
    }

    #[test]
    fn document_id_combines_file_and_row() {
        let doc = Document {
            source_file: "AA.csv".to_string(),
            row: 7,
            text: String::new(),
            metadata: BTreeMap::new(),
        };
        assert_eq!(doc.id(), "AA.csv#7");
    }
}
