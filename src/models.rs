//! Core data models used throughout the pipeline.
//!
//! These types represent the document lifecycle records stored in the
//! `documents` table and the state machine they move through.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a document in the processing sequence.
///
/// The order of the variants is the order of the pipeline:
/// `raw → preprocessing_done → qna_extracted → evaluated`. Failure is not a
/// state; it is recorded next to the last successful state (see
/// [`StageFailure`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Raw,
    PreprocessingDone,
    QnaExtracted,
    Evaluated,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 4] = [
        ProcessingState::Raw,
        ProcessingState::PreprocessingDone,
        ProcessingState::QnaExtracted,
        ProcessingState::Evaluated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Raw => "raw",
            ProcessingState::PreprocessingDone => "preprocessing_done",
            ProcessingState::QnaExtracted => "qna_extracted",
            ProcessingState::Evaluated => "evaluated",
        }
    }

    /// The state a successful stage moves this state to.
    pub fn next(self) -> Option<ProcessingState> {
        match self {
            ProcessingState::Raw => Some(ProcessingState::PreprocessingDone),
            ProcessingState::PreprocessingDone => Some(ProcessingState::QnaExtracted),
            ProcessingState::QnaExtracted => Some(ProcessingState::Evaluated),
            ProcessingState::Evaluated => None,
        }
    }

    /// The only state from which this state may be entered.
    pub fn previous(self) -> Option<ProcessingState> {
        match self {
            ProcessingState::Raw => None,
            ProcessingState::PreprocessingDone => Some(ProcessingState::Raw),
            ProcessingState::QnaExtracted => Some(ProcessingState::PreprocessingDone),
            ProcessingState::Evaluated => Some(ProcessingState::QnaExtracted),
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ProcessingState::Raw),
            "preprocessing_done" => Ok(ProcessingState::PreprocessingDone),
            "qna_extracted" => Ok(ProcessingState::QnaExtracted),
            "evaluated" => Ok(ProcessingState::Evaluated),
            other => Err(format!("unknown processing state: '{}'", other)),
        }
    }
}

/// Composite natural identity of a document. Unique in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DocumentIdentity {
    pub source_system: String,
    pub source_path: String,
    pub raw_container: String,
    pub raw_file_name: String,
}

/// A candidate document built by the scanner, not yet registered.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub source_system: String,
    pub source_path: String,
    pub raw_container: String,
    pub raw_file_name: String,
    pub raw_file_size: u64,
    pub raw_etag: String,
    pub raw_file_type: String,
    pub raw_storage_path: String,
}

impl NewDocument {
    pub fn identity(&self) -> DocumentIdentity {
        DocumentIdentity {
            source_system: self.source_system.clone(),
            source_path: self.source_path.clone(),
            raw_container: self.raw_container.clone(),
            raw_file_name: self.raw_file_name.clone(),
        }
    }
}

/// Failure marker recorded by the most recent failed stage run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// A document lifecycle record as stored in the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub source_system: String,
    pub source_path: String,
    pub raw_container: String,
    pub raw_file_name: String,
    pub raw_file_size: u64,
    pub raw_etag: String,
    pub raw_file_type: String,
    pub raw_storage_path: String,
    pub raw_inserted_at: DateTime<Utc>,
    pub processing_state: ProcessingState,
    pub preprocessed_container: Option<String>,
    pub preprocessed_path: Option<String>,
    pub preprocessing_chunk_count: Option<u32>,
    pub preprocessing_messages: Option<serde_json::Value>,
    pub preprocessed_at: Option<DateTime<Utc>>,
    pub qna_container: Option<String>,
    pub qna_path: Option<String>,
    pub qna_extracted_at: Option<DateTime<Utc>>,
    pub qna_extracted_messages: Option<serde_json::Value>,
    pub evaluated_at: Option<DateTime<Utc>>,
    pub evaluation_messages: Option<serde_json::Value>,
    pub failure: Option<StageFailure>,
}

impl Document {
    pub fn identity(&self) -> DocumentIdentity {
        DocumentIdentity {
            source_system: self.source_system.clone(),
            source_path: self.source_path.clone(),
            raw_container: self.raw_container.clone(),
            raw_file_name: self.raw_file_name.clone(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// State label for display: `failed` while a failure marker is set.
    pub fn status_label(&self) -> &str {
        if self.is_failed() {
            "failed"
        } else {
            self.processing_state.as_str()
        }
    }
}

/// Stage-specific columns written together with a state advance.
///
/// Each variant belongs to exactly one target state, so a stage cannot
/// write pre-processing columns while claiming to finish evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum StageFields {
    Preprocessed {
        container: String,
        path: String,
        chunk_count: u32,
    },
    QnaExtracted {
        container: String,
        path: String,
    },
    Evaluated,
}

impl StageFields {
    pub fn target_state(&self) -> ProcessingState {
        match self {
            StageFields::Preprocessed { .. } => ProcessingState::PreprocessingDone,
            StageFields::QnaExtracted { .. } => ProcessingState::QnaExtracted,
            StageFields::Evaluated => ProcessingState::Evaluated,
        }
    }
}
