use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::StoreConfig;
use crate::db;

/// Create the vector-store schema on a fresh database file.
pub async fn run_migrations(store: &StoreConfig) -> Result<()> {
    let pool = db::connect(store).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent `CREATE ... IF NOT EXISTS` for every table and index.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Documents are keyed by "<source_file>#<row>" within a collection.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            collection_id TEXT NOT NULL,
            id TEXT NOT NULL,
            source_file TEXT NOT NULL,
            row_num INTEGER NOT NULL,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection_id, id),
            FOREIGN KEY (collection_id) REFERENCES collections(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            collection_id TEXT NOT NULL,
            id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            PRIMARY KEY (collection_id, id),
            UNIQUE (collection_id, document_id, chunk_index),
            FOREIGN KEY (collection_id, document_id) REFERENCES documents(collection_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            collection_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            hash TEXT NOT NULL,
            vector BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (collection_id, chunk_id, model),
            FOREIGN KEY (collection_id, chunk_id) REFERENCES chunks(collection_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(collection_id, document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(collection_id, model)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
