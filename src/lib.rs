//! # claimsqa
//!
//! Retrieval-augmented question answering over insurance-claim CSV exports,
//! and the tooling that turns legal texts into an instruction dataset.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐
//! │ CSV rows  │──▶│ Corpus   │──▶│ Metadata │──▶│ Index        │
//! │ (;/latin1)│   │ loader   │   │ enricher │   │ chunk+embed  │
//! └───────────┘   └──────────┘   └──────────┘   └──────┬───────┘
//!                                                      ▼
//!                              ┌──────────┐     ┌──────────────┐
//!                              │ Ollama   │◀────│ Query engine │
//!                              └──────────┘     └──────────────┘
//!
//! PDF/TXT ──▶ extract ──▶ corpus.jsonl ──▶ instruct ──▶ dataset.jsonl
//!                                            ▲
//!                                   cloud_job (Azure ML)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`csv_reader`] | One document per CSV row, date normalization |
//! | [`corpus`] | Folder enumeration |
//! | [`metadata`] | `metadata.json` loading and enrichment |
//! | [`chunk`] | Paragraph chunking |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | SQLite vector store |
//! | [`index`] | Indexing pipeline |
//! | [`llm`] | Language model client |
//! | [`query`] | Retrieval, prompting, interactive loop |
//! | [`extract`] | PDF/TXT → JSONL corpus |
//! | [`instruct`] | Corpus → instruction dataset |
//! | [`cloud_job`] | Azure ML job submission |

pub mod chunk;
pub mod cloud_job;
pub mod config;
pub mod corpus;
pub mod csv_reader;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod instruct;
pub mod jsonl;
pub mod llm;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod store;
