use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::StoreConfig;

/// Open (creating if needed) the vector-store database under `store.path`.
pub async fn connect(store: &StoreConfig) -> Result<SqlitePool> {
    std::fs::create_dir_all(&store.path).with_context(|| {
        format!(
            "Failed to create vector store directory {}",
            store.path.display()
        )
    })?;
    let db_path = store.db_file();

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
