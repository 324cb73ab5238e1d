//! End-to-end pipeline through the library API with in-process providers.

use anyhow::Result;
use async_trait::async_trait;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use claimsqa::config::Config;
use claimsqa::embedding::Embedder;
use claimsqa::index::{index, load_enriched};
use claimsqa::llm::{ChatMessage, GenerationOptions, LanguageModel};
use claimsqa::progress::NoProgress;
use claimsqa::query::{run_loop, QueryEngine, DEFAULT_PROMPT_TEMPLATE};
use claimsqa::store::VectorStore;

/// Bag-of-keywords vectors so retrieval is predictable.
struct KeywordEmbedder;

const KEYWORDS: [&str; 3] = ["ID: 1", "ID: 2", "ID: 3"];

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keywords"
    }
    fn dims(&self) -> usize {
        KEYWORDS.len()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                KEYWORDS
                    .iter()
                    .map(|k| if t.contains(k) { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect())
    }
}

/// Records prompts and answers with a fixed string.
struct RecordingModel {
    prompts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LanguageModel for RecordingModel {
    fn model_name(&self) -> &str {
        "recording"
    }
    async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok("  Claim 2 was paid 200 TND.  ".to_string())
    }
    async fn chat(&self, _m: &[ChatMessage], _o: &GenerationOptions) -> Result<String> {
        anyhow::bail!("not used")
    }
}

fn write_corpus(tmp: &TempDir, with_metadata: bool) -> std::path::PathBuf {
    let folder = tmp.path().join("csv");
    fs::create_dir_all(&folder).unwrap();
    fs::write(
        folder.join("AA.csv"),
        "ID;DATE_EXECUTION;AMOUNT\n1;01jan23:10:00:00;100\n2;02jan23:11:30:00;200\n3;bad-date;300\n",
    )
    .unwrap();
    if with_metadata {
        fs::write(
            folder.join("metadata.json"),
            r#"{"AA.csv": {"file_description": "Automobile claims",
                "columns": {"ID": {"description": "Claim identifier", "type": "integer"}}}}"#,
        )
        .unwrap();
    }
    folder
}

fn config(tmp: &TempDir) -> Config {
    let mut config = Config::minimal();
    config.store.path = tmp.path().join("store");
    config.corpus.encoding = "utf-8".to_string();
    config.retrieval.top_k = 1;
    config
}

#[test]
fn rows_become_normalized_documents_without_metadata() {
    let tmp = TempDir::new().unwrap();
    let folder = write_corpus(&tmp, false);

    let docs = load_enriched(&config(&tmp), &folder).unwrap();
    let texts: Vec<&str> = docs.iter().map(|d| d.document.text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "ID: 1, DATE_EXECUTION: 2023-01-01 10:00:00, AMOUNT: 100",
            "ID: 2, DATE_EXECUTION: 2023-01-02 11:30:00, AMOUNT: 200",
            "ID: 3, DATE_EXECUTION: bad-date, AMOUNT: 300",
        ]
    );
    assert!(docs.iter().all(|d| !d.enriched));
    let rows: Vec<usize> = docs.iter().map(|d| d.document.row).collect();
    assert_eq!(rows, vec![2, 3, 4]);
}

#[tokio::test]
async fn index_then_answer_from_retrieved_row() {
    let tmp = TempDir::new().unwrap();
    let folder = write_corpus(&tmp, true);
    let config = config(&tmp);

    let docs = load_enriched(&config, &folder).unwrap();
    assert!(docs.iter().all(|d| d.enriched));

    let store = VectorStore::open(&config.store).await.unwrap();
    let handle = index(&store, Some(&KeywordEmbedder), &config, &docs, &NoProgress)
        .await
        .unwrap();
    assert_eq!(handle.documents, 3);
    assert_eq!(handle.embedded, 3);
    assert_eq!(handle.pending, 0);

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let model = RecordingModel {
        prompts: Arc::clone(&prompts),
    };

    let engine = QueryEngine::new(
        store,
        Box::new(KeywordEmbedder),
        Box::new(model),
        handle.collection_id.clone(),
        config.retrieval.top_k,
        DEFAULT_PROMPT_TEMPLATE.to_string(),
    );

    let answer = engine.query("What was paid for ID: 2?").await.unwrap();
    assert_eq!(answer.response, "Claim 2 was paid 200 TND.");
    assert_eq!(answer.hits.len(), 1);
    assert_eq!(answer.hits[0].document_id, "AA.csv#3");

    let prompts = prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].starts_with("You are an AI assistant specialized in analyzing"));
    assert!(prompts[0].contains("File Description: Automobile claims"));
    assert!(prompts[0].contains("ID: 2, DATE_EXECUTION: 2023-01-02 11:30:00, AMOUNT: 200"));
    assert!(prompts[0].ends_with("Human: What was paid for ID: 2?\nAI: "));

    let results = tmp.path().join("query_results.csv");
    let mut output = Vec::new();
    let stats = run_loop(&engine, &b"ID: 1 please\nexit\n"[..], &mut output, &results)
        .await
        .unwrap();
    assert_eq!(stats.answered, 1);

    let mut reader = csv::Reader::from_path(&results).unwrap();
    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0][1], "ID: 1 please");
    assert_eq!(&records[0][2], "Claim 2 was paid 200 TND.");
}
