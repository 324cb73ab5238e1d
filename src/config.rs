use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub instruct: InstructConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
}

/// Location of the persistent vector store.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory holding the store's database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            collection: default_collection(),
        }
    }
}

impl StoreConfig {
    /// Path of the SQLite file inside the store directory.
    pub fn db_file(&self) -> PathBuf {
        self.path.join("vectors.sqlite")
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/chroma_db")
}
fn default_collection() -> String {
    "insurance_claims".to_string()
}

/// Where the claim CSV files live and how to read them.
#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_csv_folder")]
    pub folder: PathBuf,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_date_prefix")]
    pub date_prefix: String,
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            folder: default_csv_folder(),
            pattern: default_pattern(),
            delimiter: default_delimiter(),
            encoding: default_encoding(),
            date_prefix: default_date_prefix(),
            metadata_file: default_metadata_file(),
        }
    }
}

impl CorpusConfig {
    /// The delimiter as a single byte. Validated by [`load_config`].
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.as_bytes().first().copied().unwrap_or(b';')
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.folder.join(&self.metadata_file)
    }
}

fn default_csv_folder() -> PathBuf {
    PathBuf::from("./data/csv")
}
fn default_pattern() -> String {
    "*.csv".to_string()
}
fn default_delimiter() -> String {
    ";".to_string()
}
fn default_encoding() -> String {
    "latin1".to_string()
}
fn default_date_prefix() -> String {
    "DATE_".to_string()
}
fn default_metadata_file() -> String {
    "metadata.json".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Language model used to answer questions.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3.1".to_string()
}
fn default_llm_timeout() -> u64 {
    420
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_results_file")]
    pub results_file: PathBuf,
    /// Prompt with `{metadata_and_columns}` and `{query_str}` placeholders.
    #[serde(default)]
    pub prompt_template: Option<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            results_file: default_results_file(),
            prompt_template: None,
        }
    }
}

fn default_results_file() -> PathBuf {
    PathBuf::from("./data/query_results.csv")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_extract_input")]
    pub input: PathBuf,
    #[serde(default = "default_extract_output")]
    pub output: PathBuf,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            input: default_extract_input(),
            output: default_extract_output(),
        }
    }
}

fn default_extract_input() -> PathBuf {
    PathBuf::from("./data/texts")
}
fn default_extract_output() -> PathBuf {
    PathBuf::from("training_text.jsonl")
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstructConfig {
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default = "default_instruct_model")]
    pub model: String,
    #[serde(default = "default_instruct_input")]
    pub input: PathBuf,
    #[serde(default = "default_instruct_output")]
    pub output: PathBuf,
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    #[serde(default = "default_instruct_batch")]
    pub batch_size: usize,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// `placeholder` writes error strings for unparseable responses, `skip` drops them.
    #[serde(default = "default_on_unparsed")]
    pub on_unparsed: String,
}

impl Default for InstructConfig {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            model: default_instruct_model(),
            input: default_instruct_input(),
            output: default_instruct_output(),
            max_words: default_max_words(),
            batch_size: default_instruct_batch(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
            on_unparsed: default_on_unparsed(),
        }
    }
}

fn default_instruct_model() -> String {
    "qwen2.5:1.5b-instruct".to_string()
}
fn default_instruct_input() -> PathBuf {
    PathBuf::from("trainingtext__.jsonl")
}
fn default_instruct_output() -> PathBuf {
    PathBuf::from("instruction_qwen.jsonl")
}
fn default_max_words() -> usize {
    200
}
fn default_instruct_batch() -> usize {
    5
}
fn default_max_new_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_on_unparsed() -> String {
    "placeholder".to_string()
}

/// Azure Machine Learning workspace targeted by `cqa submit`.
#[derive(Debug, Deserialize, Clone)]
pub struct CloudConfig {
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default = "default_compute_name")]
    pub compute_name: String,
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default = "default_input_data_path")]
    pub input_data_path: String,
    #[serde(default = "default_output_path")]
    pub output_path: String,
    #[serde(default = "default_environment_name")]
    pub environment_name: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_vm_size")]
    pub vm_size: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            workspace_name: None,
            subscription_id: None,
            resource_group: None,
            compute_name: default_compute_name(),
            experiment_name: default_experiment_name(),
            input_data_path: default_input_data_path(),
            output_path: default_output_path(),
            environment_name: default_environment_name(),
            image: default_image(),
            vm_size: default_vm_size(),
            api_version: default_api_version(),
        }
    }
}

fn default_compute_name() -> String {
    "llama-compute".to_string()
}
fn default_experiment_name() -> String {
    "tunisian-insurance-qa-generation".to_string()
}
fn default_input_data_path() -> String {
    "azureml://datastores/workspaceblobstore/paths/data/trainingtext__.jsonl".to_string()
}
fn default_output_path() -> String {
    "azureml://datastores/workspaceblobstore/paths/outputs/instruction_qwen.jsonl".to_string()
}
fn default_environment_name() -> String {
    "qa-generation-env".to_string()
}
fn default_image() -> String {
    "ghcr.io/claimsqa/cqa:latest".to_string()
}
fn default_vm_size() -> String {
    "medium".to_string()
}
fn default_api_version() -> String {
    "2024-04-01".to_string()
}

impl Config {
    /// All defaults. Used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }

    if config.corpus.delimiter.len() != 1 {
        bail!(
            "corpus.delimiter must be a single ASCII character, got '{}'",
            config.corpus.delimiter
        );
    }

    if encoding_rs::Encoding::for_label(config.corpus.encoding.as_bytes()).is_none() {
        bail!("Unknown corpus.encoding: '{}'", config.corpus.encoding);
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, ollama, or openai.",
            other
        ),
    }

    if config.instruct.max_words == 0 {
        bail!("instruct.max_words must be > 0");
    }
    if config.instruct.batch_size == 0 {
        bail!("instruct.batch_size must be > 0");
    }
    match config.instruct.on_unparsed.as_str() {
        "placeholder" | "skip" => {}
        other => bail!(
            "instruct.on_unparsed must be 'placeholder' or 'skip', got '{}'",
            other
        ),
    }

    if crate::cloud_job::VmSize::parse(&config.cloud.vm_size).is_none() {
        bail!(
            "cloud.vm_size must be small, medium, large, or xlarge, got '{}'",
            config.cloud.vm_size
        );
    }
    for (key, path) in [
        ("input_data_path", &config.cloud.input_data_path),
        ("output_path", &config.cloud.output_path),
    ] {
        if !crate::cloud_job::is_remote_uri(path) {
            bail!(
                "cloud.{} must be a datastore URI (azureml://, https://, wasbs:// or abfss://), got '{}'",
                key,
                path
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.corpus.delimiter_byte(), b';');
        assert_eq!(config.corpus.date_prefix, "DATE_");
        assert_eq!(config.llm.model, "llama3.1");
        assert_eq!(config.llm.timeout_secs, 420);
        assert_eq!(config.retrieval.top_k, 2);
        assert!(!config.embedding.is_enabled());
        assert_eq!(
            config.store.db_file(),
            PathBuf::from("./data/chroma_db/vectors.sqlite")
        );
    }

    #[test]
    fn defaults_and_example_file_validate() {
        validate(&Config::minimal()).unwrap();
        let config = parse(include_str!("../config/cqa.example.toml")).unwrap();
        assert_eq!(config.corpus.encoding, "latin1");
        assert!(encoding_rs::Encoding::for_label(b"latin1").is_some());
    }

    #[test]
    fn rejects_multi_char_delimiter() {
        let err = parse("[corpus]\ndelimiter = \";;\"").unwrap_err();
        assert!(err.to_string().contains("corpus.delimiter"));
    }

    #[test]
    fn rejects_unknown_encoding() {
        let err = parse("[corpus]\nencoding = \"klingon\"").unwrap_err();
        assert!(err.to_string().contains("corpus.encoding"));
    }

    #[test]
    fn ollama_embeddings_need_dims_and_model() {
        let err = parse("[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));

        let config = parse(
            "[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768",
        )
        .unwrap();
        assert!(config.embedding.is_enabled());
    }

    #[test]
    fn rejects_unknown_unparsed_policy() {
        let err = parse("[instruct]\non_unparsed = \"retry\"").unwrap_err();
        assert!(err.to_string().contains("on_unparsed"));
    }

    #[test]
    fn rejects_local_job_input() {
        let err = parse("[cloud]\ninput_data_path = \"data/trainingtext__.jsonl\"").unwrap_err();
        assert!(err.to_string().contains("cloud.input_data_path"));
        let err = parse("[cloud]\noutput_path = \"/tmp/out.jsonl\"").unwrap_err();
        assert!(err.to_string().contains("cloud.output_path"));
        assert!(parse(
            "[cloud]\ninput_data_path = \"https://acct.blob.core.windows.net/c/corpus.jsonl\""
        )
        .is_ok());
    }

    #[test]
    fn rejects_unknown_vm_size() {
        let err = parse("[cloud]\nvm_size = \"huge\"").unwrap_err();
        assert!(err.to_string().contains("cloud.vm_size"));
        assert!(parse("[cloud]\nvm_size = \"xlarge\"").is_ok());
    }

    #[test]
    fn rejects_zero_top_k() {
        assert!(parse("[retrieval]\ntop_k = 0").is_err());
    }
}
