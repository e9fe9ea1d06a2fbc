use std::sync::Arc;

use async_trait::async_trait;

use super::{output_path, write_json, PreprocessedDocument, Stage, StageOutput};
use crate::chunk::chunk_text;
use crate::configuration::{PipelineConfig, TIER_BRONZE};
use crate::error::{IngestError, Result};
use crate::extract::TextExtractor;
use crate::models::{Document, ProcessingState, StageFields};
use crate::storage::{ObjectMetadata, ObjectStore};

const NAME: &str = "extract_text";

/// `raw → preprocessing_done`: extract text from the raw object, chunk it
/// and write `<document_id>/<raw_file_name>.chunks.json` to the bronze
/// container.
pub struct ExtractTextStage {
    store: Arc<dyn ObjectStore>,
    extractor: Arc<dyn TextExtractor>,
    config: PipelineConfig,
    max_tokens: usize,
}

impl ExtractTextStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        extractor: Arc<dyn TextExtractor>,
        config: PipelineConfig,
        max_tokens: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            config,
            max_tokens,
        }
    }
}

#[async_trait]
impl Stage for ExtractTextStage {
    fn name(&self) -> &str {
        NAME
    }

    fn consume_state(&self) -> ProcessingState {
        ProcessingState::Raw
    }

    fn produce_state(&self) -> ProcessingState {
        ProcessingState::PreprocessingDone
    }

    async fn run(&self, doc: &Document) -> Result<StageOutput> {
        let bronze = self
            .config
            .container(TIER_BRONZE)
            .ok_or_else(|| IngestError::config("no 'bronze' container configured"))?;

        if !self.config.accepts_filetype(&doc.raw_file_type) {
            return Err(IngestError::stage(
                NAME,
                format!("unsupported file type '{}'", doc.raw_file_type),
            ));
        }

        let bytes = self
            .store
            .download(&doc.raw_container, &doc.raw_file_name)
            .await
            .map_err(|e| IngestError::stage(NAME, e.to_string()))?;

        let extractor = Arc::clone(&self.extractor);
        let file_type = doc.raw_file_type.clone();
        let text = tokio::task::spawn_blocking(move || extractor.extract(&bytes, &file_type))
            .await
            .map_err(|e| IngestError::stage(NAME, format!("extraction task failed: {}", e)))??;

        let chunks = chunk_text(&text, self.max_tokens);
        if chunks.is_empty() {
            return Err(IngestError::stage(NAME, "no text extracted"));
        }
        let chunk_count = chunks.len() as u32;

        let path = output_path(doc, "chunks.json");
        let output = PreprocessedDocument {
            document_id: doc.id.clone(),
            source: doc.raw_storage_path.clone(),
            raw_etag: doc.raw_etag.clone(),
            file_type: doc.raw_file_type.clone(),
            chunks,
        };
        let metadata = ObjectMetadata::from([
            ("document_id".to_string(), doc.id.clone()),
            ("raw_etag".to_string(), doc.raw_etag.clone()),
        ]);
        write_json(self.store.as_ref(), bronze, &path, &output, &metadata).await?;

        Ok(StageOutput {
            fields: StageFields::Preprocessed {
                container: bronze.to_string(),
                path,
                chunk_count,
            },
            messages: Some(serde_json::json!({
                "characters": text.chars().count(),
                "chunks": chunk_count,
                "max_tokens": self.max_tokens,
            })),
        })
    }
}
