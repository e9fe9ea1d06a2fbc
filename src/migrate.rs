use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

/// Create the registry schema. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS configuration (
            name TEXT PRIMARY KEY,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source_system TEXT NOT NULL,
            source_path TEXT NOT NULL,
            raw_container TEXT NOT NULL,
            raw_file_name TEXT NOT NULL,
            raw_file_size INTEGER NOT NULL CHECK (raw_file_size >= 0),
            raw_etag TEXT NOT NULL,
            raw_file_type TEXT NOT NULL,
            raw_storage_path TEXT NOT NULL,
            raw_inserted_at INTEGER NOT NULL,
            processing_state TEXT NOT NULL DEFAULT 'raw',
            preprocessed_container TEXT,
            preprocessed_path TEXT,
            preprocessing_chunk_count INTEGER,
            preprocessing_messages TEXT,
            preprocessed_at INTEGER,
            qna_container TEXT,
            qna_path TEXT,
            qna_extracted_at INTEGER,
            qna_extracted_messages TEXT,
            evaluated_at INTEGER,
            evaluation_messages TEXT,
            failed_stage TEXT,
            failure_message TEXT,
            failed_at INTEGER,
            UNIQUE(source_system, source_path, raw_container, raw_file_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_state ON documents(processing_state, raw_inserted_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_failed_at ON documents(failed_at DESC)")
        .execute(pool)
        .await?;

    info!("registry schema is up to date");
    Ok(())
}
