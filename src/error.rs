//! Error taxonomy for the ingestion pipeline.
//!
//! Every library operation returns `Result<T, IngestError>`. Callers use
//! [`IngestError::kind`] to tell apart errors that must abort the whole
//! invocation (configuration, connectivity) from errors that only affect a
//! single object or document.

use thiserror::Error;

use crate::extract::ExtractError;
use crate::models::ProcessingState;

/// Convenience alias used throughout the crate.
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Coarse classification of an [`IngestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed configuration. Nothing is applied.
    Configuration,
    /// Database or object storage unreachable. Retry the invocation later.
    Connectivity,
    /// A single object or document failed. The batch continues.
    Item,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration not found: {name}")]
    ConfigNotFound { name: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Malformed JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Text extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Invalid state transition for document {document_id}: {from} -> {to}")]
    InvalidTransition {
        document_id: String,
        from: ProcessingState,
        to: ProcessingState,
    },

    #[error("Stage fields for '{fields}' cannot advance a document to '{to}'")]
    MismatchedStageFields {
        fields: ProcessingState,
        to: ProcessingState,
    },

    #[error("{stage}: {message}")]
    Stage { stage: String, message: String },
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        IngestError::Config {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        IngestError::Storage {
            message: message.into(),
        }
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Config { .. } | IngestError::ConfigNotFound { .. } => {
                ErrorKind::Configuration
            }
            IngestError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
                | sqlx::Error::Configuration(_) => ErrorKind::Connectivity,
                _ => ErrorKind::Item,
            },
            IngestError::Storage { .. } => ErrorKind::Connectivity,
            IngestError::Serialization(_)
            | IngestError::Extraction(_)
            | IngestError::DocumentNotFound { .. }
            | IngestError::InvalidTransition { .. }
            | IngestError::MismatchedStageFields { .. }
            | IngestError::Stage { .. } => ErrorKind::Item,
        }
    }

    /// True when the current invocation should stop rather than move on to
    /// the next object.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Item
    }
}
