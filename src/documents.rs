//! The document registry: one lifecycle row per raw object.
//!
//! Rows are keyed by a UUID and unique on the natural identity
//! `(source_system, source_path, raw_container, raw_file_name)`.
//! Registration is insert-or-ignore on that constraint, so two scanners
//! racing over the same container cannot double-register an object; the
//! loser simply sees [`RegisterOutcome::AlreadyRegistered`].
//!
//! `processing_state` only ever moves one step forward, via a
//! compare-and-swap on the predecessor state. Failures are recorded in
//! separate columns and never touch the state.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::models::{
    Document, DocumentIdentity, NewDocument, ProcessingState, StageFailure, StageFields,
};

const COLUMNS: &str = "id, source_system, source_path, raw_container, raw_file_name, \
    raw_file_size, raw_etag, raw_file_type, raw_storage_path, raw_inserted_at, \
    processing_state, preprocessed_container, preprocessed_path, \
    preprocessing_chunk_count, preprocessing_messages, preprocessed_at, \
    qna_container, qna_path, qna_extracted_at, qna_extracted_messages, \
    evaluated_at, evaluation_messages, failed_stage, failure_message, failed_at";

/// Result of [`DocumentRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new row was created with this id.
    Inserted(String),
    /// A row with the same natural identity already existed.
    AlreadyRegistered,
}

/// Number of documents in one state, and how many of them carry a
/// failure marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCount {
    pub state: ProcessingState,
    pub total: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct DocumentRegistry {
    pool: SqlitePool,
}

impl DocumentRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Point query on the natural identity.
    pub async fn lookup(&self, identity: &DocumentIdentity) -> Result<Option<Document>> {
        let sql = format!(
            "SELECT {} FROM documents \
             WHERE source_system = ? AND source_path = ? AND raw_container = ? AND raw_file_name = ?",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&identity.source_system)
            .bind(&identity.source_path)
            .bind(&identity.raw_container)
            .bind(&identity.raw_file_name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    /// Insert a new row in state `raw`, or do nothing if the identity is
    /// already registered.
    pub async fn register(&self, doc: &NewDocument) -> Result<RegisterOutcome> {
        let id = uuid::Uuid::new_v4().to_string();
        let size = i64::try_from(doc.raw_file_size).map_err(|_| {
            IngestError::stage(
                "register",
                format!("file size {} out of range", doc.raw_file_size),
            )
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO documents (
                id, source_system, source_path, raw_container, raw_file_name,
                raw_file_size, raw_etag, raw_file_type, raw_storage_path,
                raw_inserted_at, processing_state
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_system, source_path, raw_container, raw_file_name) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&doc.source_system)
        .bind(&doc.source_path)
        .bind(&doc.raw_container)
        .bind(&doc.raw_file_name)
        .bind(size)
        .bind(&doc.raw_etag)
        .bind(&doc.raw_file_type)
        .bind(&doc.raw_storage_path)
        .bind(Utc::now().timestamp())
        .bind(ProcessingState::Raw.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(RegisterOutcome::Inserted(id))
        } else {
            Ok(RegisterOutcome::AlreadyRegistered)
        }
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        let sql = format!("SELECT {} FROM documents WHERE id = ?", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| IngestError::DocumentNotFound {
                document_id: id.to_string(),
            })?;
        row_to_document(&row)
    }

    /// Documents currently in `state`, failed or not.
    ///
    /// Documents without a failure marker come first, oldest registration
    /// first; failed documents follow, least recently failed first. A
    /// limited run therefore never starves healthy documents behind ones
    /// that keep failing.
    pub async fn list_in_state(
        &self,
        state: ProcessingState,
        limit: Option<i64>,
    ) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE processing_state = ? \
             ORDER BY failed_stage IS NOT NULL, failed_at ASC, raw_inserted_at ASC, rowid ASC \
             LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_document).collect()
    }

    /// Move a document exactly one step forward and write the columns of
    /// the stage that produced `new_state`. Clears any failure marker.
    ///
    /// Errors, in the order they are checked:
    /// - [`IngestError::DocumentNotFound`] if no row has this id
    /// - [`IngestError::InvalidTransition`] if the document is not in the
    ///   predecessor of `new_state` (including any move back to `raw`)
    /// - [`IngestError::MismatchedStageFields`] if `fields` belong to a
    ///   different target state
    pub async fn advance_state(
        &self,
        id: &str,
        new_state: ProcessingState,
        fields: StageFields,
        messages: Option<serde_json::Value>,
    ) -> Result<()> {
        let current = self.get(id).await?.processing_state;
        let expected = match new_state.previous() {
            Some(prev) if prev == current => prev,
            _ => {
                return Err(IngestError::InvalidTransition {
                    document_id: id.to_string(),
                    from: current,
                    to: new_state,
                })
            }
        };

        if fields.target_state() != new_state {
            return Err(IngestError::MismatchedStageFields {
                fields: fields.target_state(),
                to: new_state,
            });
        }

        let messages = messages.map(|m| m.to_string());
        let now = Utc::now().timestamp();

        let query = match &fields {
            StageFields::Preprocessed {
                container,
                path,
                chunk_count,
            } => sqlx::query(
                r#"
                UPDATE documents SET
                    preprocessed_container = ?, preprocessed_path = ?,
                    preprocessing_chunk_count = ?, preprocessing_messages = ?,
                    preprocessed_at = ?, processing_state = ?,
                    failed_stage = NULL, failure_message = NULL, failed_at = NULL
                WHERE id = ? AND processing_state = ?
                "#,
            )
            .bind(container)
            .bind(path)
            .bind(*chunk_count as i64),
            StageFields::QnaExtracted { container, path } => sqlx::query(
                r#"
                UPDATE documents SET
                    qna_container = ?, qna_path = ?,
                    qna_extracted_messages = ?, qna_extracted_at = ?,
                    processing_state = ?,
                    failed_stage = NULL, failure_message = NULL, failed_at = NULL
                WHERE id = ? AND processing_state = ?
                "#,
            )
            .bind(container)
            .bind(path),
            StageFields::Evaluated => sqlx::query(
                r#"
                UPDATE documents SET
                    evaluation_messages = ?, evaluated_at = ?,
                    processing_state = ?,
                    failed_stage = NULL, failure_message = NULL, failed_at = NULL
                WHERE id = ? AND processing_state = ?
                "#,
            ),
        };

        let result = query
            .bind(messages)
            .bind(now)
            .bind(new_state.as_str())
            .bind(id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            // Another run advanced the document between the read and the update
            let current = self.get(id).await?.processing_state;
            return Err(IngestError::InvalidTransition {
                document_id: id.to_string(),
                from: current,
                to: new_state,
            });
        }

        debug!(document_id = id, state = %new_state, "document advanced");
        Ok(())
    }

    /// Record a stage failure. The processing state is left unchanged so
    /// the next run of the same stage selects the document again.
    pub async fn mark_failed(&self, id: &str, stage: &str, message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET failed_stage = ?, failure_message = ?, failed_at = ? WHERE id = ?",
        )
        .bind(stage)
        .bind(message)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::DocumentNotFound {
                document_id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Counts for every state, including states with no documents.
    pub async fn state_counts(&self) -> Result<Vec<StateCount>> {
        let rows = sqlx::query(
            r#"
            SELECT processing_state,
                   COUNT(*) AS total,
                   SUM(CASE WHEN failed_stage IS NOT NULL THEN 1 ELSE 0 END) AS failed
            FROM documents
            GROUP BY processing_state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts: Vec<StateCount> = ProcessingState::ALL
            .iter()
            .map(|&state| StateCount {
                state,
                total: 0,
                failed: 0,
            })
            .collect();

        for row in &rows {
            let state = parse_state(row.try_get("processing_state")?)?;
            if let Some(entry) = counts.iter_mut().find(|c| c.state == state) {
                entry.total = row.try_get("total")?;
                entry.failed = row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0);
            }
        }

        Ok(counts)
    }

    /// Documents carrying a failure marker, most recent first.
    pub async fn recent_failures(&self, limit: i64) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE failed_stage IS NOT NULL \
             ORDER BY failed_at DESC, rowid DESC LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }
}

fn parse_state(value: String) -> Result<ProcessingState> {
    value
        .parse()
        .map_err(|e: String| IngestError::Database(sqlx::Error::Decode(e.into())))
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn json_column(row: &SqliteRow, column: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.try_get(column)?;
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let failed_stage: Option<String> = row.try_get("failed_stage")?;
    let failure_message: Option<String> = row.try_get("failure_message")?;
    let failed_at: Option<i64> = row.try_get("failed_at")?;
    let failure = match (failed_stage, failed_at) {
        (Some(stage), Some(at)) => Some(StageFailure {
            stage,
            message: failure_message.unwrap_or_default(),
            failed_at: ts(at),
        }),
        _ => None,
    };

    Ok(Document {
        id: row.try_get("id")?,
        source_system: row.try_get("source_system")?,
        source_path: row.try_get("source_path")?,
        raw_container: row.try_get("raw_container")?,
        raw_file_name: row.try_get("raw_file_name")?,
        raw_file_size: row.try_get::<i64, _>("raw_file_size")?.max(0) as u64,
        raw_etag: row.try_get("raw_etag")?,
        raw_file_type: row.try_get("raw_file_type")?,
        raw_storage_path: row.try_get("raw_storage_path")?,
        raw_inserted_at: ts(row.try_get("raw_inserted_at")?),
        processing_state: parse_state(row.try_get("processing_state")?)?,
        preprocessed_container: row.try_get("preprocessed_container")?,
        preprocessed_path: row.try_get("preprocessed_path")?,
        preprocessing_chunk_count: row
            .try_get::<Option<i64>, _>("preprocessing_chunk_count")?
            .map(|c| c.max(0) as u32),
        preprocessing_messages: json_column(row, "preprocessing_messages")?,
        preprocessed_at: row.try_get::<Option<i64>, _>("preprocessed_at")?.map(ts),
        qna_container: row.try_get("qna_container")?,
        qna_path: row.try_get("qna_path")?,
        qna_extracted_at: row.try_get::<Option<i64>, _>("qna_extracted_at")?.map(ts),
        qna_extracted_messages: json_column(row, "qna_extracted_messages")?,
        evaluated_at: row.try_get::<Option<i64>, _>("evaluated_at")?.map(ts),
        evaluation_messages: json_column(row, "evaluation_messages")?,
        failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use tempfile::TempDir;

    async fn registry() -> (TempDir, DocumentRegistry) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&DbConfig {
            path: tmp.path().join("registry.sqlite"),
            max_connections: 2,
        })
        .await
        .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, DocumentRegistry::new(pool))
    }

    fn candidate(name: &str, size: u64) -> NewDocument {
        NewDocument {
            source_system: "object-storage".into(),
            source_path: name.into(),
            raw_container: "qna-raw".into(),
            raw_file_name: name.into(),
            raw_file_size: size,
            raw_etag: "abc".into(),
            raw_file_type: "pdf".into(),
            raw_storage_path: format!("memory://qna-raw/{}", name),
        }
    }

    fn preprocessed() -> StageFields {
        StageFields::Preprocessed {
            container: "qna-preprocessed".into(),
            path: "doc1.pdf.chunks.json".into(),
            chunk_count: 2,
        }
    }

    async fn registered(registry: &DocumentRegistry, name: &str) -> String {
        match registry.register(&candidate(name, 10)).await.unwrap() {
            RegisterOutcome::Inserted(id) => id,
            RegisterOutcome::AlreadyRegistered => panic!("{} already registered", name),
        }
    }

    #[tokio::test]
    async fn register_is_insert_or_ignore() {
        let (_tmp, registry) = registry().await;
        let id = registered(&registry, "doc1.pdf").await;

        let again = registry.register(&candidate("doc1.pdf", 2048)).await.unwrap();
        assert_eq!(again, RegisterOutcome::AlreadyRegistered);

        let doc = registry
            .lookup(&candidate("doc1.pdf", 0).identity())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.id, id);
        assert_eq!(doc.raw_file_size, 10);
        assert_eq!(doc.processing_state, ProcessingState::Raw);
    }

    #[tokio::test]
    async fn lookup_misses_other_identities() {
        let (_tmp, registry) = registry().await;
        registered(&registry, "doc1.pdf").await;
        let mut other = candidate("doc1.pdf", 10);
        other.source_system = "sharepoint".into();
        assert!(registry.lookup(&other.identity()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn advance_moves_one_step_and_writes_stage_columns() {
        let (_tmp, registry) = registry().await;
        let id = registered(&registry, "doc1.pdf").await;

        registry
            .advance_state(
                &id,
                ProcessingState::PreprocessingDone,
                preprocessed(),
                Some(serde_json::json!({"pages": 1})),
            )
            .await
            .unwrap();

        let doc = registry.get(&id).await.unwrap();
        assert_eq!(doc.processing_state, ProcessingState::PreprocessingDone);
        assert_eq!(doc.preprocessed_path.as_deref(), Some("doc1.pdf.chunks.json"));
        assert_eq!(doc.preprocessing_chunk_count, Some(2));
        assert_eq!(doc.preprocessing_messages.unwrap()["pages"], 1);
        assert!(doc.preprocessed_at.is_some());
    }

    #[tokio::test]
    async fn advance_rejects_skips_and_regressions() {
        let (_tmp, registry) = registry().await;
        let id = registered(&registry, "doc1.pdf").await;

        let skip = registry
            .advance_state(&id, ProcessingState::Evaluated, StageFields::Evaluated, None)
            .await
            .unwrap_err();
        assert!(matches!(skip, IngestError::InvalidTransition { .. }));

        registry
            .advance_state(&id, ProcessingState::PreprocessingDone, preprocessed(), None)
            .await
            .unwrap();
        let replay = registry
            .advance_state(&id, ProcessingState::PreprocessingDone, preprocessed(), None)
            .await
            .unwrap_err();
        assert!(matches!(replay, IngestError::InvalidTransition { .. }));

        let mismatch = registry
            .advance_state(&id, ProcessingState::QnaExtracted, StageFields::Evaluated, None)
            .await
            .unwrap_err();
        assert!(matches!(mismatch, IngestError::MismatchedStageFields { .. }));

        assert_eq!(
            registry.get(&id).await.unwrap().processing_state,
            ProcessingState::PreprocessingDone
        );
    }

    #[tokio::test]
    async fn failure_marker_keeps_state_and_is_cleared_on_success() {
        let (_tmp, registry) = registry().await;
        let id = registered(&registry, "doc1.pdf").await;

        registry
            .mark_failed(&id, "extract_text", "corrupt pdf")
            .await
            .unwrap();
        let doc = registry.get(&id).await.unwrap();
        assert_eq!(doc.processing_state, ProcessingState::Raw);
        assert_eq!(doc.status_label(), "failed");
        assert_eq!(doc.failure.as_ref().unwrap().message, "corrupt pdf");

        let raw = registry
            .list_in_state(ProcessingState::Raw, None)
            .await
            .unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(registry.recent_failures(10).await.unwrap().len(), 1);

        registry
            .advance_state(&id, ProcessingState::PreprocessingDone, preprocessed(), None)
            .await
            .unwrap();
        assert!(!registry.get(&id).await.unwrap().is_failed());
        assert!(registry.recent_failures(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let (_tmp, registry) = registry().await;
        assert!(matches!(
            registry.get("missing").await.unwrap_err(),
            IngestError::DocumentNotFound { .. }
        ));
        assert!(matches!(
            registry.mark_failed("missing", "evaluate", "x").await.unwrap_err(),
            IngestError::DocumentNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn counts_cover_every_state() {
        let (_tmp, registry) = registry().await;
        let a = registered(&registry, "a.pdf").await;
        registered(&registry, "b.pdf").await;
        registry.mark_failed(&a, "extract_text", "boom").await.unwrap();

        let counts = registry.state_counts().await.unwrap();
        assert_eq!(counts.len(), 4);
        assert_eq!(
            counts[0],
            StateCount {
                state: ProcessingState::Raw,
                total: 2,
                failed: 1
            }
        );
        assert!(counts[1..].iter().all(|c| c.total == 0));
    }

    #[tokio::test]
    async fn list_respects_limit_and_order() {
        let (_tmp, registry) = registry().await;
        for name in ["c.pdf", "a.pdf", "b.pdf"] {
            registered(&registry, name).await;
        }
        let docs = registry
            .list_in_state(ProcessingState::Raw, Some(2))
            .await
            .unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.raw_file_name.as_str()).collect();
        assert_eq!(names, vec!["c.pdf", "a.pdf"]);
    }

    #[tokio::test]
    async fn failed_documents_are_listed_after_healthy_ones() {
        let (_tmp, registry) = registry().await;
        let a = registered(&registry, "a.png").await;
        let b = registered(&registry, "b.png").await;
        registered(&registry, "c.pdf").await;
        registry.mark_failed(&b, "extract_text", "unsupported").await.unwrap();
        registry.mark_failed(&a, "extract_text", "unsupported").await.unwrap();

        let docs = registry
            .list_in_state(ProcessingState::Raw, Some(2))
            .await
            .unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.raw_file_name.as_str()).collect();
        assert_eq!(names[0], "c.pdf");

        let all = registry
            .list_in_state(ProcessingState::Raw, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(!all[0].is_failed());
        assert!(all[1..].iter().all(|d| d.is_failed()));
    }

    #[tokio::test]
    async fn evaluated_documents_cannot_go_back_to_raw() {
        let (_tmp, registry) = registry().await;
        let id = registered(&registry, "doc1.pdf").await;

        registry
            .advance_state(&id, ProcessingState::PreprocessingDone, preprocessed(), None)
            .await
            .unwrap();
        registry
            .advance_state(
                &id,
                ProcessingState::QnaExtracted,
                StageFields::QnaExtracted {
                    container: "qna-processed".into(),
                    path: "doc1.pdf.qna.json".into(),
                },
                None,
            )
            .await
            .unwrap();
        registry
            .advance_state(&id, ProcessingState::Evaluated, StageFields::Evaluated, None)
            .await
            .unwrap();

        for fields in [StageFields::Evaluated, preprocessed()] {
            let err = registry
                .advance_state(&id, ProcessingState::Raw, fields, None)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                IngestError::InvalidTransition {
                    from: ProcessingState::Evaluated,
                    to: ProcessingState::Raw,
                    ..
                }
            ));
        }

        let doc = registry.get(&id).await.unwrap();
        assert_eq!(doc.processing_state, ProcessingState::Evaluated);
        assert!(doc.evaluated_at.is_some());
    }
}
