//! SQLite-backed vector store.
//!
//! A store holds named collections. Each collection owns its documents,
//! their chunks, and one embedding per chunk and model. Vectors are stored
//! as little-endian `f32` BLOBs and searched by brute-force cosine
//! similarity, which is plenty for a few hundred thousand claim rows.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::migrate;
use crate::models::{Chunk, Document, SearchHit};

/// Row counts for one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub documents: i64,
    pub chunks: i64,
    pub embeddings: i64,
}

pub struct VectorStore {
    pool: SqlitePool,
}

impl VectorStore {
    /// Open the store directory, creating the database and schema if needed.
    pub async fn open(store: &StoreConfig) -> Result<Self> {
        let pool = db::connect(store).await?;
        migrate::ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Id of the collection called `name`, creating it on first use.
    pub async fn get_or_create_collection(&self, name: &str) -> Result<String> {
        if let Some(id) = self.find_collection(name).await? {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO collections (id, name, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(&id)
        .bind(name)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        tracing::debug!(collection = name, "created collection");
        self.find_collection(name)
            .await?
            .with_context(|| format!("Collection '{}' missing after insert", name))
    }

    pub async fn find_collection(&self, name: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar("SELECT id FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Insert or replace a document. Returns its id.
    pub async fn upsert_document(&self, collection_id: &str, doc: &Document) -> Result<String> {
        let id = doc.id();
        let metadata_json = serde_json::to_string(&doc.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection_id, id, source_file, row_num, text, metadata_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection_id, id) DO UPDATE SET
                source_file = excluded.source_file,
                row_num = excluded.row_num,
                text = excluded.text,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection_id)
        .bind(&id)
        .bind(&doc.source_file)
        .bind(doc.row as i64)
        .bind(&doc.text)
        .bind(&metadata_json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Make `chunks` the full chunk list of `document_id`.
    ///
    /// Embeddings survive only for chunks whose text hash is unchanged, so
    /// re-indexing an unchanged folder re-embeds nothing.
    pub async fn replace_chunks(
        &self,
        collection_id: &str,
        document_id: &str,
        chunks: &[Chunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let keep = chunks.len() as i64;

        for chunk in chunks {
            sqlx::query(
                "DELETE FROM embeddings WHERE collection_id = ? AND chunk_id = ? AND hash != ?",
            )
            .bind(collection_id)
            .bind(&chunk.id)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            DELETE FROM embeddings WHERE collection_id = ?1 AND chunk_id IN (
                SELECT id FROM chunks
                WHERE collection_id = ?1 AND document_id = ?2 AND chunk_index >= ?3
            )
            "#,
        )
        .bind(collection_id)
        .bind(document_id)
        .bind(keep)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM chunks WHERE collection_id = ? AND document_id = ? AND chunk_index >= ?",
        )
        .bind(collection_id)
        .bind(document_id)
        .bind(keep)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (collection_id, id, document_id, chunk_index, text, hash)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection_id, id) DO UPDATE SET
                    text = excluded.text,
                    hash = excluded.hash
                "#,
            )
            .bind(collection_id)
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete every document of the collection whose id is not in `keep`,
    /// with its chunks and embeddings. Returns the number removed.
    pub async fn prune_documents(&self, collection_id: &str, keep: &HashSet<String>) -> Result<u64> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE collection_id = ?")
                .bind(collection_id)
                .fetch_all(&self.pool)
                .await?;
        let stale: Vec<String> = ids.into_iter().filter(|id| !keep.contains(id)).collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in &stale {
            for sql in [
                "DELETE FROM embeddings WHERE collection_id = ? AND document_id = ?",
                "DELETE FROM chunks WHERE collection_id = ? AND document_id = ?",
                "DELETE FROM documents WHERE collection_id = ? AND id = ?",
            ] {
                sqlx::query(sql)
                    .bind(collection_id)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        tracing::debug!(removed = stale.len(), "pruned stale documents");
        Ok(stale.len() as u64)
    }

    /// Chunk hash the stored embedding was computed from, if any.
    pub async fn embedding_hash(
        &self,
        collection_id: &str,
        chunk_id: &str,
        model: &str,
    ) -> Result<Option<String>> {
        let hash = sqlx::query_scalar(
            "SELECT hash FROM embeddings WHERE collection_id = ? AND chunk_id = ? AND model = ?",
        )
        .bind(collection_id)
        .bind(chunk_id)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hash)
    }

    pub async fn upsert_embedding(
        &self,
        collection_id: &str,
        chunk: &Chunk,
        model: &str,
        vector: &[f32],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (collection_id, chunk_id, document_id, model, dims, hash, vector, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection_id, chunk_id, model) DO UPDATE SET
                dims = excluded.dims,
                hash = excluded.hash,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(collection_id)
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(&chunk.hash)
        .bind(vec_to_blob(vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The `top_k` chunks most similar to `query_vec`, best first.
    ///
    /// Only embeddings computed with `model` are compared.
    pub async fn search(
        &self,
        collection_id: &str,
        model: &str,
        query_vec: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query(
            r#"
            SELECT e.chunk_id, e.document_id, e.vector, c.text, d.source_file, d.row_num
            FROM embeddings e
            JOIN chunks c ON c.collection_id = e.collection_id AND c.id = e.chunk_id
            JOIN documents d ON d.collection_id = e.collection_id AND d.id = e.document_id
            WHERE e.collection_id = ? AND e.model = ?
            "#,
        )
        .bind(collection_id)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let score = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                SearchHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    source_file: row.get("source_file"),
                    row: row.get("row_num"),
                    score,
                    text: row.get("text"),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    pub async fn stats(&self, collection_id: &str) -> Result<CollectionStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM documents WHERE collection_id = ?1) AS documents,
                (SELECT COUNT(*) FROM chunks WHERE collection_id = ?1) AS chunks,
                (SELECT COUNT(*) FROM embeddings WHERE collection_id = ?1) AS embeddings
            "#,
        )
        .bind(collection_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(CollectionStats {
            documents: row.get("documents"),
            chunks: row.get("chunks"),
            embeddings: row.get("embeddings"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store_config(tmp: &TempDir) -> StoreConfig {
        StoreConfig {
            path: tmp.path().join("db"),
            collection: "test".to_string(),
        }
    }

    fn doc(row: usize, text: &str) -> Document {
        Document {
            source_file: "AA.csv".to_string(),
            row,
            text: text.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn collection_is_get_or_create() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&store_config(&tmp)).await.unwrap();
        let a = store.get_or_create_collection("claims").await.unwrap();
        let b = store.get_or_create_collection("claims").await.unwrap();
        let c = store.get_or_create_collection("other").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(tmp.path().join("db").join("vectors.sqlite").exists());
    }

    #[tokio::test]
    async fn reindexing_replaces_rather_than_duplicates() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&store_config(&tmp)).await.unwrap();
        let coll = store.get_or_create_collection("claims").await.unwrap();

        for _ in 0..2 {
            let d = doc(2, "ID: 1");
            let id = store.upsert_document(&coll, &d).await.unwrap();
            let chunks = chunk_text(&id, &d.text, 1024);
            store.replace_chunks(&coll, &id, &chunks).await.unwrap();
            store
                .upsert_embedding(&coll, &chunks[0], "m", &[1.0, 0.0])
                .await
                .unwrap();
        }

        let stats = store.stats(&coll).await.unwrap();
        assert_eq!(
            stats,
            CollectionStats {
                documents: 1,
                chunks: 1,
                embeddings: 1
            }
        );
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_and_respects_top_k() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&store_config(&tmp)).await.unwrap();
        let coll = store.get_or_create_collection("claims").await.unwrap();

        let vectors = [[1.0, 0.0], [0.7, 0.7], [0.0, 1.0]];
        for (i, v) in vectors.iter().enumerate() {
            let d = doc(i + 2, &format!("row {}", i + 2));
            let id = store.upsert_document(&coll, &d).await.unwrap();
            let chunks = chunk_text(&id, &d.text, 1024);
            store.replace_chunks(&coll, &id, &chunks).await.unwrap();
            store.upsert_embedding(&coll, &chunks[0], "m", v).await.unwrap();
        }

        let hits = store.search(&coll, "m", &[0.0, 1.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, "AA.csv#4");
        assert_eq!(hits[0].row, 4);
        assert_eq!(hits[1].document_id, "AA.csv#3");
        assert!(hits[0].score > hits[1].score);

        let other_model = store.search(&coll, "other", &[0.0, 1.0], 2).await.unwrap();
        assert!(other_model.is_empty());
    }

    #[tokio::test]
    async fn prune_removes_documents_missing_from_the_run() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&store_config(&tmp)).await.unwrap();
        let coll = store.get_or_create_collection("claims").await.unwrap();
        let other = store.get_or_create_collection("other").await.unwrap();

        for c in [&coll, &other] {
            for row in 2..5 {
                let d = doc(row, &format!("ID: {}", row - 1));
                let id = store.upsert_document(c, &d).await.unwrap();
                let chunks = chunk_text(&id, &d.text, 1024);
                store.replace_chunks(c, &id, &chunks).await.unwrap();
                store.upsert_embedding(c, &chunks[0], "m", &[1.0]).await.unwrap();
            }
        }

        let keep: HashSet<String> = ["AA.csv#2".to_string()].into_iter().collect();
        assert_eq!(store.prune_documents(&coll, &keep).await.unwrap(), 2);
        assert_eq!(
            store.stats(&coll).await.unwrap(),
            CollectionStats {
                documents: 1,
                chunks: 1,
                embeddings: 1
            }
        );
        let hits = store.search(&coll, "m", &[1.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "AA.csv#2");

        // Other collections are untouched; a second prune is a no-op.
        assert_eq!(store.stats(&other).await.unwrap().documents, 3);
        assert_eq!(store.prune_documents(&coll, &keep).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn embedding_hash_tracks_chunk_hash() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&store_config(&tmp)).await.unwrap();
        let coll = store.get_or_create_collection("claims").await.unwrap();
        let d = doc(2, "ID: 1");
        let id = store.upsert_document(&coll, &d).await.unwrap();
        let chunks = chunk_text(&id, &d.text, 1024);
        store.replace_chunks(&coll, &id, &chunks).await.unwrap();

        assert_eq!(store.embedding_hash(&coll, &chunks[0].id, "m").await.unwrap(), None);
        store.upsert_embedding(&coll, &chunks[0], "m", &[1.0]).await.unwrap();
        assert_eq!(
            store.embedding_hash(&coll, &chunks[0].id, "m").await.unwrap(),
            Some(chunks[0].hash.clone())
        );
    }

    #[tokio::test]
    async fn changed_text_drops_stale_embedding() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&store_config(&tmp)).await.unwrap();
        let coll = store.get_or_create_collection("claims").await.unwrap();

        let d = doc(2, "ID: 1");
        let id = store.upsert_document(&coll, &d).await.unwrap();
        let chunks = chunk_text(&id, &d.text, 1024);
        store.replace_chunks(&coll, &id, &chunks).await.unwrap();
        store.upsert_embedding(&coll, &chunks[0], "m", &[1.0]).await.unwrap();

        // Same text: embedding kept.
        store.replace_chunks(&coll, &id, &chunks).await.unwrap();
        assert_eq!(store.stats(&coll).await.unwrap().embeddings, 1);

        let changed = chunk_text(&id, "ID: 1, AMOUNT: 5", 1024);
        store.replace_chunks(&coll, &id, &changed).await.unwrap();
        let stats = store.stats(&coll).await.unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.embeddings, 0);
    }
}
