//! The processing state machine.
//!
//! A [`Stage`] consumes documents in one [`ProcessingState`] and produces
//! the next. Stages know nothing about each other; [`run_stage`] drains the
//! registry for the stage's input state, runs the stage on each document
//! and commits the outcome:
//!
//! | Stage | Consumes | Produces | Collaborator |
//! |-------|----------|----------|--------------|
//! | [`ExtractTextStage`] | `raw` | `preprocessing_done` | [`TextExtractor`](crate::extract::TextExtractor) |
//! | [`AiProcessStage`] | `preprocessing_done` | `qna_extracted` | [`QnaGenerator`](crate::qna::QnaGenerator) |
//! | [`EvaluateStage`] | `qna_extracted` | `evaluated` | [`Evaluator`](crate::scoring::Evaluator) |
//!
//! A stage error for one document records a failure marker on that
//! document and the run continues. The document keeps its state, so the
//! next run of the same stage picks it up again.

mod ai_process;
mod evaluate;
mod extract_text;

pub use ai_process::AiProcessStage;
pub use evaluate::EvaluateStage;
pub use extract_text::ExtractTextStage;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::chunk::Chunk;
use crate::documents::DocumentRegistry;
use crate::error::{IngestError, Result};
use crate::models::{Document, ProcessingState, StageFields};
use crate::qna::QnaPair;
use crate::storage::{ObjectMetadata, ObjectStore};

/// What a successful stage run writes back to the registry.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub fields: StageFields,
    pub messages: Option<serde_json::Value>,
}

#[async_trait]
pub trait Stage: Send + Sync {
    /// Name recorded in failure markers and logs.
    fn name(&self) -> &str;
    fn consume_state(&self) -> ProcessingState;
    fn produce_state(&self) -> ProcessingState;

    /// Process one document. Must not touch the registry.
    async fn run(&self, document: &Document) -> Result<StageOutput>;
}

/// Counts for one stage run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub selected: usize,
    pub advanced: usize,
    pub failed: usize,
    /// Documents another run advanced first.
    pub skipped: usize,
}

/// Run `stage` over up to `limit` documents in its input state.
///
/// Configuration and connectivity errors stop the run and are returned;
/// documents already advanced stay advanced.
pub async fn run_stage(
    registry: &DocumentRegistry,
    stage: &dyn Stage,
    limit: Option<i64>,
) -> Result<StageReport> {
    let documents = registry.list_in_state(stage.consume_state(), limit).await?;
    let mut report = StageReport {
        stage: stage.name().to_string(),
        selected: documents.len(),
        ..Default::default()
    };

    for doc in &documents {
        let outcome = match stage.run(doc).await {
            Ok(output) => {
                registry
                    .advance_state(&doc.id, stage.produce_state(), output.fields, output.messages)
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(stage = stage.name(), document_id = %doc.id, "document advanced");
                report.advanced += 1;
            }
            Err(IngestError::InvalidTransition { .. }) => {
                info!(stage = stage.name(), document_id = %doc.id, "already advanced elsewhere");
                report.skipped += 1;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(stage = stage.name(), document_id = %doc.id, error = %e, "stage failed");
                registry
                    .mark_failed(&doc.id, stage.name(), &e.to_string())
                    .await?;
                report.failed += 1;
            }
        }
    }

    info!(
        stage = stage.name(),
        selected = report.selected,
        advanced = report.advanced,
        failed = report.failed,
        skipped = report.skipped,
        "stage finished"
    );
    Ok(report)
}

/// Body of the `<document_id>/<raw_file_name>.chunks.json` object written
/// by pre-processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedDocument {
    pub document_id: String,
    pub source: String,
    pub raw_etag: String,
    pub file_type: String,
    pub chunks: Vec<Chunk>,
}

/// Body of the `<document_id>/<raw_file_name>.qna.json` object written by
/// AI processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QnaDocument {
    pub document_id: String,
    pub source: String,
    pub model: String,
    pub generated_at: String,
    pub pairs: Vec<QnaPair>,
}

/// Download and parse a JSON object written by an earlier stage. A
/// missing or unreadable object fails the document, not the run.
pub(crate) async fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    stage: &str,
    container: &str,
    path: &str,
) -> Result<T> {
    let bytes = store
        .download(container, path)
        .await
        .map_err(|e| IngestError::stage(stage, e.to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) async fn write_json<T: Serialize>(
    store: &dyn ObjectStore,
    container: &str,
    path: &str,
    value: &T,
    metadata: &ObjectMetadata,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.upload(container, path, &bytes, metadata, true).await?;
    Ok(())
}

/// Name of a stage output object for `doc`. The document id prefix keeps
/// outputs of documents that share a file name (same name in another raw
/// container or source system) apart.
pub(crate) fn output_path(doc: &Document, suffix: &str) -> String {
    format!("{}/{}.{}", doc.id, doc.raw_file_name, suffix)
}

/// Value of an optional document column, or a stage error naming it.
pub(crate) fn require<'a>(stage: &str, value: Option<&'a String>, column: &str) -> Result<&'a str> {
    value
        .map(String::as_str)
        .ok_or_else(|| IngestError::stage(stage, format!("document has no {}", column)))
}
