//! Query pipeline: retrieve the closest claim rows, prompt the language
//! model with them, log the exchange.

use anyhow::{anyhow, bail, Context, Result};
use std::io::{BufRead, Write};
use std::path::Path;

use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::llm::{GenerationOptions, LanguageModel, OllamaModel};
use crate::models::SearchHit;
use crate::store::VectorStore;

pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are an AI assistant specialized in analyzing \
automobile insurance claims data. Use the following metadata and column information to provide \
accurate and detailed responses:\n{metadata_and_columns}\n\nHuman: {query_str}\nAI: ";

pub const LOOP_PROMPT: &str = "Enter your query (or 'exit' to quit): ";

const CONTEXT_PLACEHOLDER: &str = "{metadata_and_columns}";
const QUERY_PLACEHOLDER: &str = "{query_str}";

/// An answer and the chunks it was grounded on.
#[derive(Debug, Clone)]
pub struct QueryAnswer {
    pub response: String,
    pub hits: Vec<SearchHit>,
}

pub struct QueryEngine {
    store: VectorStore,
    embedder: Box<dyn Embedder>,
    llm: Box<dyn LanguageModel>,
    collection_id: String,
    top_k: usize,
    template: String,
}

impl QueryEngine {
    pub fn new(
        store: VectorStore,
        embedder: Box<dyn Embedder>,
        llm: Box<dyn LanguageModel>,
        collection_id: String,
        top_k: usize,
        template: String,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            collection_id,
            top_k,
            template,
        }
    }

    /// Open the configured collection with the configured providers.
    pub async fn from_config(config: &Config) -> Result<Self> {
        if !config.embedding.is_enabled() {
            bail!("Queries need an embedding provider. Set [embedding] provider in config.");
        }
        let embedder = embedding::create_embedder(&config.embedding)?;
        let llm = OllamaModel::new(&config.llm.url, &config.llm.model, config.llm.timeout_secs)?;

        let store = VectorStore::open(&config.store).await?;
        let collection_id = store
            .find_collection(&config.store.collection)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "Collection '{}' not found. Run `cqa index` first.",
                    config.store.collection
                )
            })?;

        let template = config
            .query
            .prompt_template
            .clone()
            .unwrap_or_else(|| DEFAULT_PROMPT_TEMPLATE.to_string());

        Ok(Self::new(
            store,
            embedder,
            Box::new(llm),
            collection_id,
            config.retrieval.top_k,
            template,
        ))
    }

    /// The `top_k` chunks closest to `query`.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<SearchHit>> {
        let query_vec = embedding::embed_query(self.embedder.as_ref(), query).await?;
        self.store
            .search(
                &self.collection_id,
                self.embedder.model_name(),
                &query_vec,
                self.top_k,
            )
            .await
    }

    pub async fn query(&self, query: &str) -> Result<QueryAnswer> {
        let hits = self.retrieve(query).await?;
        tracing::debug!(hits = hits.len(), "retrieved context");
        let prompt = build_prompt(&self.template, &hits, query);
        let response = self
            .llm
            .generate(&prompt, &GenerationOptions::default())
            .await?;
        Ok(QueryAnswer {
            response: response.trim().to_string(),
            hits,
        })
    }

    pub async fn close(self) {
        self.store.close().await;
    }
}

/// Fill the template's `{metadata_and_columns}` with the retrieved chunk
/// texts and `{query_str}` with the question. Substituted values are not
/// scanned again.
pub fn build_prompt(template: &str, hits: &[SearchHit], query: &str) -> String {
    let context = hits
        .iter()
        .map(|h| h.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut out = String::with_capacity(template.len() + context.len() + query.len());
    let mut rest = template;
    loop {
        let next = [
            (rest.find(CONTEXT_PLACEHOLDER), CONTEXT_PLACEHOLDER, context.as_str()),
            (rest.find(QUERY_PLACEHOLDER), QUERY_PLACEHOLDER, query),
        ]
        .into_iter()
        .filter_map(|(pos, ph, value)| pos.map(|p| (p, ph, value)))
        .min_by_key(|(p, _, _)| *p);

        match next {
            Some((pos, placeholder, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + placeholder.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

/// Append one exchange to the results CSV, writing the header first when
/// the file is new or empty.
pub fn append_result(path: &Path, query: &str, response: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open results file {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    if is_new {
        writer.write_record(["timestamp", "query", "response"])?;
    }
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    writer.write_record([timestamp.as_str(), query, response])?;
    writer.flush()?;
    Ok(())
}

/// Counts for one interactive session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub answered: u64,
    pub failed: u64,
}

/// Read questions from `input` until `exit` or end of input, answering each.
///
/// Blank lines are ignored. A failed query is reported on `output` and the
/// loop continues.
pub async fn run_loop<R: BufRead, W: Write>(
    engine: &QueryEngine,
    mut input: R,
    mut output: W,
    results_file: &Path,
) -> Result<SessionStats> {
    let mut stats = SessionStats::default();
    let mut line = String::new();

    loop {
        write!(output, "{}", LOOP_PROMPT)?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            break;
        }
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query.eq_ignore_ascii_case("exit") {
            break;
        }

        match engine.query(query).await {
            Ok(answer) => {
                writeln!(output, "{}", answer.response)?;
                if let Err(e) = append_result(results_file, query, &answer.response) {
                    tracing::warn!(error = %e, "could not record query result");
                }
                stats.answered += 1;
            }
            Err(e) => {
                tracing::error!(error = %e, "query failed");
                writeln!(output, "Error: {:#}", e)?;
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

/// `cqa ask`: answer one question against the existing index.
pub async fn run_ask(config: &Config, question: &str) -> Result<()> {
    let engine = QueryEngine::from_config(config).await?;
    let answer = engine.query(question).await?;
    println!("{}", answer.response);
    if !answer.hits.is_empty() {
        println!();
        println!("sources:");
        for hit in &answer.hits {
            println!("  {}  {:.3}", hit.document_id, hit.score);
        }
    }
    append_result(&config.query.results_file, question, &answer.response)?;
    engine.close().await;
    Ok(())
}

/// `cqa chat`: optionally (re)index, then answer questions from stdin.
pub async fn run_chat(config: &Config, skip_index: bool) -> Result<()> {
    if !skip_index {
        crate::index::run_index(config, None, false).await?;
    }
    let engine = QueryEngine::from_config(config).await?;
    let stdin = std::io::stdin();
    let stats = run_loop(
        &engine,
        stdin.lock(),
        std::io::stdout(),
        &config.query.results_file,
    )
    .await?;
    tracing::info!(
        answered = stats.answered,
        failed = stats.failed,
        "session ended"
    );
    engine.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::config::StoreConfig;
    use crate::llm::ChatMessage;
    use crate::models::Document;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn hit(text: &str) -> SearchHit {
        SearchHit {
            chunk_id: "c".to_string(),
            document_id: "d".to_string(),
            source_file: "AA.csv".to_string(),
            row: 2,
            score: 1.0,
            text: text.to_string(),
        }
    }

    #[test]
    fn prompt_fills_both_placeholders() {
        let prompt = build_prompt(
            DEFAULT_PROMPT_TEMPLATE,
            &[hit("ID: 1"), hit("ID: 2")],
            "total amount?",
        );
        assert!(prompt.contains("responses:\nID: 1\n\nID: 2\n\nHuman: total amount?\nAI: "));
        assert!(!prompt.contains('{'));
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let prompt = build_prompt("{query_str}|{metadata_and_columns}", &[hit("x")], "{metadata_and_columns}");
        assert_eq!(prompt, "{metadata_and_columns}|x");
    }

    #[test]
    fn results_file_gets_header_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("results.csv");
        append_result(&path, "q1", "a1").unwrap();
        append_result(&path, "q2, with comma", "line1\nline2").unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, vec!["timestamp", "query", "response"]);
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][1], "q2, with comma");
        assert_eq!(&rows[1][2], "line1\nline2");
    }

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("moto") {
                        vec![0.0, 1.0]
                    } else {
                        vec![1.0, 0.0]
                    }
                })
                .collect())
        }
    }

    /// Echoes the prompt; fails on "boom".
    struct EchoModel;

    #[async_trait]
    impl LanguageModel for EchoModel {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Result<String> {
            if prompt.contains("boom") {
                bail!("model crashed");
            }
            Ok(format!("ANSWER<{}>", prompt))
        }
        async fn chat(&self, _m: &[ChatMessage], _o: &GenerationOptions) -> Result<String> {
            unreachable!()
        }
    }

    async fn engine(tmp: &TempDir) -> QueryEngine {
        let store = VectorStore::open(&StoreConfig {
            path: tmp.path().join("store"),
            collection: "claims".to_string(),
        })
        .await
        .unwrap();
        let coll = store.get_or_create_collection("claims").await.unwrap();
        for (row, text) in [(2, "auto claim"), (3, "moto claim")] {
            let doc = Document {
                source_file: "AA.csv".to_string(),
                row,
                text: text.to_string(),
                metadata: BTreeMap::new(),
            };
            let id = store.upsert_document(&coll, &doc).await.unwrap();
            let chunks = chunk_text(&id, text, 1024);
            store.replace_chunks(&coll, &id, &chunks).await.unwrap();
            let v = AxisEmbedder.embed(&[text.to_string()]).await.unwrap();
            store
                .upsert_embedding(&coll, &chunks[0], "axis", &v[0])
                .await
                .unwrap();
        }
        QueryEngine::new(
            store,
            Box::new(AxisEmbedder),
            Box::new(EchoModel),
            coll,
            1,
            "{metadata_and_columns} :: {query_str}".to_string(),
        )
    }

    #[tokio::test]
    async fn query_uses_nearest_chunk_as_context() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let answer = engine.query("any moto?").await.unwrap();
        assert_eq!(answer.hits.len(), 1);
        assert_eq!(answer.hits[0].document_id, "AA.csv#3");
        assert_eq!(answer.response, "ANSWER<moto claim :: any moto?>");
    }

    #[tokio::test]
    async fn loop_skips_blanks_survives_errors_and_stops_on_exit() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let results = tmp.path().join("results.csv");
        let input = b"\nfirst\nboom\n  EXIT \nnever asked\n";
        let mut output = Vec::new();

        let stats = run_loop(&engine, &input[..], &mut output, &results)
            .await
            .unwrap();
        assert_eq!(stats, SessionStats { answered: 1, failed: 1 });

        let shown = String::from_utf8(output).unwrap();
        assert!(shown.starts_with(LOOP_PROMPT));
        assert!(shown.contains("ANSWER<auto claim :: first>"));
        assert!(shown.contains("Error: model crashed"));
        assert!(!shown.contains("never asked"));

        let logged = std::fs::read_to_string(&results).unwrap();
        assert_eq!(logged.lines().count(), 2);
    }

    #[tokio::test]
    async fn loop_ends_on_eof() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp).await;
        let mut output = Vec::new();
        let stats = run_loop(&engine, &b""[..], &mut output, &tmp.path().join("r.csv"))
            .await
            .unwrap();
        assert_eq!(stats, SessionStats::default());
    }
}
