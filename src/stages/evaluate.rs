use std::sync::Arc;

use async_trait::async_trait;

use super::{read_json, require, PreprocessedDocument, QnaDocument, Stage, StageOutput};
use crate::error::Result;
use crate::models::{Document, ProcessingState, StageFields};
use crate::scoring::Evaluator;
use crate::storage::ObjectStore;

const NAME: &str = "evaluate";

/// `qna_extracted → evaluated`: score the generated pairs against the
/// pre-processed chunks. The evaluation is stored in
/// `evaluation_messages`; nothing is written to object storage.
pub struct EvaluateStage {
    store: Arc<dyn ObjectStore>,
    evaluator: Arc<dyn Evaluator>,
}

impl EvaluateStage {
    pub fn new(store: Arc<dyn ObjectStore>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { store, evaluator }
    }
}

#[async_trait]
impl Stage for EvaluateStage {
    fn name(&self) -> &str {
        NAME
    }

    fn consume_state(&self) -> ProcessingState {
        ProcessingState::QnaExtracted
    }

    fn produce_state(&self) -> ProcessingState {
        ProcessingState::Evaluated
    }

    async fn run(&self, doc: &Document) -> Result<StageOutput> {
        let qna: QnaDocument = read_json(
            self.store.as_ref(),
            NAME,
            require(NAME, doc.qna_container.as_ref(), "qna_container")?,
            require(NAME, doc.qna_path.as_ref(), "qna_path")?,
        )
        .await?;
        let source: PreprocessedDocument = read_json(
            self.store.as_ref(),
            NAME,
            require(NAME, doc.preprocessed_container.as_ref(), "preprocessed_container")?,
            require(NAME, doc.preprocessed_path.as_ref(), "preprocessed_path")?,
        )
        .await?;

        let evaluation = self.evaluator.evaluate(&source.chunks, &qna.pairs);

        Ok(StageOutput {
            fields: StageFields::Evaluated,
            messages: Some(serde_json::to_value(&evaluation)?),
        })
    }
}
