//! Indexing pipeline: CSV folder → documents → enrichment → chunks →
//! embeddings → vector store.
//!
//! Embedding is inline and non-fatal: a failed batch is logged and its
//! chunks are reported as pending. Chunks whose stored embedding was
//! computed from identical text are not re-embedded.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::corpus;
use crate::csv_reader::CsvRowReader;
use crate::embedding::{self, Embedder};
use crate::metadata;
use crate::models::{Chunk, EnrichedDocument};
use crate::progress::{should_report, IndexProgressEvent, IndexProgressReporter, ProgressMode};
use crate::store::VectorStore;

/// Identifies a populated collection, plus what the run wrote to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
    pub collection: String,
    pub collection_id: String,
    pub documents: u64,
    pub chunks: u64,
    pub embedded: u64,
    pub pending: u64,
    /// Documents from earlier runs that are no longer in the corpus.
    pub removed: u64,
}

/// Parse every CSV in `folder` and enrich it with the folder's metadata file.
pub fn load_enriched(config: &Config, folder: &Path) -> Result<Vec<EnrichedDocument>> {
    let reader = CsvRowReader::from_config(&config.corpus)?;
    let documents = corpus::load_directory(&reader, folder, &config.corpus.pattern)?;
    let table = metadata::load_metadata(&folder.join(&config.corpus.metadata_file))?;
    tracing::info!(
        documents = documents.len(),
        described_files = table.len(),
        "loaded corpus"
    );
    Ok(metadata::enrich_documents(documents, &table))
}

/// Make the configured collection hold exactly `documents` and embed their
/// chunks.
///
/// Documents stored by an earlier run that are not in `documents` are
/// deleted. With `embedder = None` documents and chunks are stored without
/// vectors.
pub async fn index(
    store: &VectorStore,
    embedder: Option<&dyn Embedder>,
    config: &Config,
    documents: &[EnrichedDocument],
    progress: &dyn IndexProgressReporter,
) -> Result<IndexHandle> {
    let collection = config.store.collection.clone();
    let collection_id = store.get_or_create_collection(&collection).await?;

    let total = documents.len() as u64;
    progress.report(IndexProgressEvent::Loaded { documents: total });

    let mut counts = EmbedCounts::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(documents.len());
    let mut chunk_count = 0u64;
    let mut to_embed: Vec<Chunk> = Vec::new();

    for (n, enriched) in documents.iter().enumerate() {
        let doc = &enriched.document;
        let doc_id = store.upsert_document(&collection_id, doc).await?;
        let chunks = chunk_text(&doc_id, &doc.text, config.chunking.max_tokens);
        store
            .replace_chunks(&collection_id, &doc_id, &chunks)
            .await?;
        seen.insert(doc_id);

        chunk_count += chunks.len() as u64;
        to_embed.extend(chunks);

        if to_embed.len() >= config.embedding.batch_size {
            let batch = std::mem::take(&mut to_embed);
            counts.add(embed_batch(store, embedder, &collection_id, &batch).await);
        }

        let done = n as u64 + 1;
        if should_report(done, total) {
            progress.report(IndexProgressEvent::Indexing { n: done, total });
        }
    }
    if !to_embed.is_empty() {
        counts.add(embed_batch(store, embedder, &collection_id, &to_embed).await);
    }

    let removed = store.prune_documents(&collection_id, &seen).await?;
    if removed > 0 {
        tracing::info!(removed, "removed documents no longer in the corpus");
    }

    Ok(IndexHandle {
        collection,
        collection_id,
        documents: seen.len() as u64,
        chunks: chunk_count,
        embedded: counts.embedded,
        pending: counts.pending,
        removed,
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct EmbedCounts {
    embedded: u64,
    pending: u64,
}

impl EmbedCounts {
    fn add(&mut self, other: EmbedCounts) {
        self.embedded += other.embedded;
        self.pending += other.pending;
    }
}

/// Embed one batch, skipping up-to-date chunks. Never fails; counts instead.
async fn embed_batch(
    store: &VectorStore,
    embedder: Option<&dyn Embedder>,
    collection_id: &str,
    chunks: &[Chunk],
) -> EmbedCounts {
    let mut counts = EmbedCounts::default();
    let Some(embedder) = embedder else {
        return counts;
    };
    let model = embedder.model_name().to_string();

    let mut need: Vec<&Chunk> = Vec::new();
    for chunk in chunks {
        let existing = store
            .embedding_hash(collection_id, &chunk.id, &model)
            .await
            .unwrap_or(None);
        if existing.as_deref() == Some(chunk.hash.as_str()) {
            counts.embedded += 1;
        } else {
            need.push(chunk);
        }
    }
    if need.is_empty() {
        return counts;
    }

    let texts: Vec<String> = need.iter().map(|c| c.text.clone()).collect();
    let vectors = match embedder.embed(&texts).await {
        Ok(vectors) => vectors,
        Err(e) => {
            tracing::warn!(chunks = need.len(), error = %e, "embedding batch failed");
            counts.pending += need.len() as u64;
            return counts;
        }
    };
    if vectors.len() != need.len() {
        tracing::warn!(
            expected = need.len(),
            got = vectors.len(),
            "embedding batch returned wrong number of vectors"
        );
        counts.pending += need.len() as u64;
        return counts;
    }

    let dims = embedder.dims();
    for (chunk, vector) in need.iter().zip(vectors.iter()) {
        if vector.len() != dims {
            tracing::warn!(
                chunk = %chunk.id,
                expected = dims,
                got = vector.len(),
                "embedding has wrong dimensions"
            );
            counts.pending += 1;
            continue;
        }
        match store
            .upsert_embedding(collection_id, chunk, &model, vector)
            .await
        {
            Ok(()) => counts.embedded += 1,
            Err(e) => {
                tracing::warn!(chunk = %chunk.id, error = %e, "failed to store embedding");
                counts.pending += 1;
            }
        }
    }
    counts
}

/// `cqa index`: load, enrich, store, embed, print a summary.
///
/// Returns `None` for a dry run.
pub async fn run_index(
    config: &Config,
    folder: Option<&Path>,
    dry_run: bool,
) -> Result<Option<IndexHandle>> {
    let folder = folder.unwrap_or(&config.corpus.folder);
    let documents = load_enriched(config, folder)
        .with_context(|| format!("Failed to load corpus from {}", folder.display()))?;
    let enriched = documents.iter().filter(|d| d.enriched).count();

    if dry_run {
        let chunks: usize = documents
            .iter()
            .map(|d| chunk_text("tmp", &d.document.text, config.chunking.max_tokens).len())
            .sum();
        println!("index {} (dry-run)", folder.display());
        println!("  documents found: {}", documents.len());
        println!("  enriched: {}", enriched);
        println!("  estimated chunks: {}", chunks);
        return Ok(None);
    }

    let embedder = if config.embedding.is_enabled() {
        Some(embedding::create_embedder(&config.embedding)?)
    } else {
        None
    };

    let store = VectorStore::open(&config.store).await?;
    let progress = ProgressMode::default_for_tty().reporter();
    let handle = index(
        &store,
        embedder.as_deref(),
        config,
        &documents,
        progress.as_ref(),
    )
    .await?;
    store.close().await;

    println!("index {}", folder.display());
    println!("  collection: {}", handle.collection);
    println!("  upserted documents: {}", handle.documents);
    println!("  enriched: {}", enriched);
    println!("  chunks written: {}", handle.chunks);
    println!("  removed documents: {}", handle.removed);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", handle.embedded);
        println!("  embeddings pending: {}", handle.pending);
    }
    println!("ok");

    Ok(Some(handle))
}
