use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    output_path, read_json, require, write_json, PreprocessedDocument, QnaDocument, Stage,
    StageOutput,
};
use crate::configuration::{PipelineConfig, TIER_BRONZE, TIER_SILVER};
use crate::error::{IngestError, Result};
use crate::models::{Document, ProcessingState, StageFields};
use crate::qna::QnaGenerator;
use crate::storage::{ObjectMetadata, ObjectStore};

const NAME: &str = "ai_process";

/// `preprocessing_done → qna_extracted`: generate question/answer pairs
/// from the chunks and write `<document_id>/<raw_file_name>.qna.json` to the silver
/// container, or to bronze when no silver tier is configured.
pub struct AiProcessStage {
    store: Arc<dyn ObjectStore>,
    generator: Arc<dyn QnaGenerator>,
    config: PipelineConfig,
}

impl AiProcessStage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        generator: Arc<dyn QnaGenerator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            generator,
            config,
        }
    }

    fn output_container(&self) -> Result<&str> {
        self.config
            .container(TIER_SILVER)
            .or_else(|| self.config.container(TIER_BRONZE))
            .ok_or_else(|| IngestError::config("no 'silver' or 'bronze' container configured"))
    }
}

#[async_trait]
impl Stage for AiProcessStage {
    fn name(&self) -> &str {
        NAME
    }

    fn consume_state(&self) -> ProcessingState {
        ProcessingState::PreprocessingDone
    }

    fn produce_state(&self) -> ProcessingState {
        ProcessingState::QnaExtracted
    }

    async fn run(&self, doc: &Document) -> Result<StageOutput> {
        let target = self.output_container()?;
        let container = require(NAME, doc.preprocessed_container.as_ref(), "preprocessed_container")?;
        let path = require(NAME, doc.preprocessed_path.as_ref(), "preprocessed_path")?;

        let preprocessed: PreprocessedDocument =
            read_json(self.store.as_ref(), NAME, container, path).await?;
        let pairs = self.generator.generate(&preprocessed.chunks).await?;
        let pair_count = pairs.len();

        let qna_path = output_path(doc, "qna.json");
        let output = QnaDocument {
            document_id: doc.id.clone(),
            source: doc.raw_storage_path.clone(),
            model: self.generator.model_name().to_string(),
            generated_at: Utc::now().to_rfc3339(),
            pairs,
        };
        let metadata = ObjectMetadata::from([
            ("document_id".to_string(), doc.id.clone()),
            ("model".to_string(), output.model.clone()),
        ]);
        write_json(self.store.as_ref(), target, &qna_path, &output, &metadata).await?;

        Ok(StageOutput {
            fields: StageFields::QnaExtracted {
                container: target.to_string(),
                path: qna_path,
            },
            messages: Some(serde_json::json!({
                "model": output.model,
                "pairs": pair_count,
                "chunks": preprocessed.chunks.len(),
            })),
        })
    }
}
