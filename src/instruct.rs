//! Instruction dataset generation.
//!
//! Each corpus document is split into sections of whole sentences, and the
//! language model writes one question/answer pair per section. The model is
//! prompted in French as a Tunisian insurance-law expert.
//!
//! Generation never aborts a run: a failed model call is recorded as
//! `("ERROR", <message>)` and an unparseable reply is either recorded with
//! placeholder text or skipped, depending on `instruct.on_unparsed`.

use anyhow::{bail, Context, Result};
use std::path::Path;
use unicode_segmentation::UnicodeSegmentation;

use crate::config::InstructConfig;
use crate::jsonl::{read_jsonl, JsonlWriter};
use crate::llm::{ChatMessage, GenerationOptions, LanguageModel, OllamaModel};
use crate::models::{CorpusEntry, InstructionExample};

pub const SYSTEM_PROMPT: &str = "Vous êtes un expert spécialisé en droit et réglementation des \
assurances en Tunisie.
Votre tâche est de générer des questions perspicaces et des réponses détaillées basées sur les \
sections du texte juridique fourni.

Lignes directrices pour la génération :
1. Concentrez-vous sur les concepts juridiques clés, les exigences réglementaires et les \
implications pratiques.
2. Tenez compte du contexte spécifique du marché tunisien de l'assurance.
3. Mettez en évidence les définitions légales importantes, les obligations et les exigences de \
conformité.
4. Incluez des références pertinentes aux codes et réglementations des assurances en Tunisie \
lorsque cela est applicable.
5. Assurez-vous que la réponse offre une compréhension complète tout en restant fidèle au texte \
source.

Générez votre réponse en français, en maintenant la précision et la clarté juridiques.
Formatez votre réponse exactement comme suit :
Question : [Votre question]
Réponse : [Votre réponse détaillée]
";

pub const PLACEHOLDER_QUESTION: &str = "ERROR: Could not generate question";
pub const PLACEHOLDER_ANSWER: &str = "ERROR: Could not generate answer";

const QUESTION_MARKERS: &[&str] = &["Question"];
const ANSWER_MARKERS: &[&str] = &["Réponse", "Reponse", "Answer"];

/// What to record when a reply has no recognisable question/answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnparsedPolicy {
    Placeholder,
    Skip,
}

impl UnparsedPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "placeholder" => Ok(Self::Placeholder),
            "skip" => Ok(Self::Skip),
            other => bail!(
                "Unknown instruct.on_unparsed '{}'. Expected placeholder or skip",
                other
            ),
        }
    }
}

/// Model client and prompt settings shared by every generation call.
pub struct GenerationContext {
    pub llm: Box<dyn LanguageModel>,
    pub system_prompt: String,
    pub options: GenerationOptions,
    pub max_words: usize,
    pub on_unparsed: UnparsedPolicy,
}

impl GenerationContext {
    pub fn from_config(config: &InstructConfig) -> Result<Self> {
        let llm = OllamaModel::new(&config.url, &config.model, config.timeout_secs)?;
        Ok(Self {
            llm: Box::new(llm),
            system_prompt: SYSTEM_PROMPT.to_string(),
            options: GenerationOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_new_tokens),
            },
            max_words: config.max_words,
            on_unparsed: UnparsedPolicy::parse(&config.on_unparsed)?,
        })
    }
}

/// Result of reading a model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QaParse {
    Pair { question: String, answer: String },
    Unparsed { raw: String },
}

/// Group whole sentences into sections of at most `max_words` words.
///
/// A section only exceeds the budget when a single sentence does.
pub fn split_into_sections(text: &str, max_words: usize) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_words = 0usize;

    for sentence in text.unicode_sentences() {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let words = sentence.split_whitespace().count();
        if current_words + words > max_words && !current.is_empty() {
            sections.push(current.join(" "));
            current.clear();
            current_words = 0;
        }
        current.push(sentence);
        current_words += words;
    }
    if !current.is_empty() {
        sections.push(current.join(" "));
    }
    sections
}

/// Position just past `<marker> :` for the earliest marker at or after `from`.
/// Returns `(marker_start, content_start)`.
fn find_marker(text: &str, markers: &[&str], from: usize) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for marker in markers {
        let mut search = from;
        while let Some(rel) = text[search..].find(marker) {
            let start = search + rel;
            let after = start + marker.len();
            let rest = &text[after..];
            let gap = rest.len()
                - rest
                    .trim_start_matches(|c: char| c.is_whitespace() || c == '*')
                    .len();
            if rest[gap..].starts_with(':') {
                let content = after + gap + 1;
                if best.map_or(true, |(s, _)| start < s) {
                    best = Some((start, content));
                }
                break;
            }
            search = after;
        }
    }
    best
}

fn clean(s: &str) -> String {
    s.trim_matches(|c: char| c.is_whitespace() || c == '*')
        .to_string()
}

/// Extract the question and answer from a `Question : … Réponse : …` reply.
/// English `Answer:` and unaccented `Reponse:` are accepted too.
pub fn parse_qa_response(text: &str) -> QaParse {
    let unparsed = || QaParse::Unparsed {
        raw: text.to_string(),
    };

    let Some((_, q_start)) = find_marker(text, QUESTION_MARKERS, 0) else {
        return unparsed();
    };
    let Some((a_marker, a_start)) = find_marker(text, ANSWER_MARKERS, q_start) else {
        return unparsed();
    };

    let question = clean(&text[q_start..a_marker]);
    let answer = clean(&text[a_start..]);
    if question.is_empty() || answer.is_empty() {
        return unparsed();
    }
    QaParse::Pair { question, answer }
}

/// Ask the model for one pair. `None` means the section is skipped.
pub async fn generate_qa_pair(ctx: &GenerationContext, section: &str) -> Option<(String, String)> {
    let messages = [
        ChatMessage::system(ctx.system_prompt.as_str()),
        ChatMessage::user(section),
    ];

    let reply = match ctx.llm.chat(&messages, &ctx.options).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!(error = %e, "error generating QA pair");
            return Some(("ERROR".to_string(), format!("{:#}", e)));
        }
    };

    match parse_qa_response(&reply) {
        QaParse::Pair { question, answer } => Some((question, answer)),
        QaParse::Unparsed { raw } => {
            tracing::warn!(response = %raw, "could not parse QA pair from response");
            match ctx.on_unparsed {
                UnparsedPolicy::Placeholder => Some((
                    PLACEHOLDER_QUESTION.to_string(),
                    PLACEHOLDER_ANSWER.to_string(),
                )),
                UnparsedPolicy::Skip => None,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructStats {
    pub documents: u64,
    pub sections: u64,
    pub written: u64,
}

/// Generate an instruction dataset from the corpus at `input`.
pub async fn process_documents(
    ctx: &GenerationContext,
    input: &Path,
    output: &Path,
    batch_size: usize,
) -> Result<InstructStats> {
    let documents: Vec<CorpusEntry> = read_jsonl(input)
        .with_context(|| format!("Failed to read corpus {}", input.display()))?;
    tracing::info!(documents = documents.len(), input = %input.display(), "read corpus");

    let batch_size = batch_size.max(1);
    let batches = documents.len().div_ceil(batch_size);
    let mut writer = JsonlWriter::create(output)?;
    let mut stats = InstructStats::default();

    for (i, batch) in documents.chunks(batch_size).enumerate() {
        tracing::info!("Processing batch {}/{}", i + 1, batches);
        for doc in batch {
            tracing::info!(document = %doc.file_name, "processing document");
            for section in split_into_sections(&doc.text, ctx.max_words) {
                stats.sections += 1;
                if let Some((question, answer)) = generate_qa_pair(ctx, &section).await {
                    writer.write(&InstructionExample::new(question, answer, &doc.file_name))?;
                    stats.written += 1;
                }
            }
            stats.documents += 1;
        }
    }

    writer.finish()?;
    tracing::info!(output = %output.display(), "instruction dataset written");
    Ok(stats)
}

/// `cqa instruct`
pub async fn run_instruct(
    config: &InstructConfig,
    input: Option<&Path>,
    output: Option<&Path>,
    batch_size: Option<usize>,
) -> Result<()> {
    let input = input.unwrap_or(&config.input);
    let output = output.unwrap_or(&config.output);
    let ctx = GenerationContext::from_config(config)?;

    let stats = process_documents(
        &ctx,
        input,
        output,
        batch_size.unwrap_or(config.batch_size),
    )
    .await?;

    println!("instruct {}", input.display());
    println!("  model: {}", ctx.llm.model_name());
    println!("  documents: {}", stats.documents);
    println!("  sections: {}", stats.sections);
    println!("  examples written: {}", stats.written);
    println!("  output: {}", output.display());
    println!("ok");
    Ok(())
}
