use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::DbConfig;
use crate::error::{IngestError, Result};

/// Open the shared registry pool.
///
/// The pool is bounded by `db.max_connections` and owned by the caller,
/// which closes it on shutdown with [`SqlitePool::close`].
pub async fn connect(db: &DbConfig) -> Result<SqlitePool> {
    let db_path = &db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            IngestError::config(format!(
                "cannot create database directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}
