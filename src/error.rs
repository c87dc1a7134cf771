// src/error.rs

use thiserror::Error;

use crate::synthesizer::ModelAttempt;

/// Why a model response could not be turned into a structured update.
#[derive(Debug, Error)]
pub enum UpdateParseError {
    #[error("no JSON object found in response")]
    NoPayload,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("`{field}` {reason}")]
    Schema { field: String, reason: String },
}

impl UpdateParseError {
    pub(crate) fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        UpdateParseError::Schema {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateAiError {
    /// No credential configured. Never retried.
    #[error("AI-powered edits are not configured. Set GEMINI_API_KEY to enable them.")]
    MissingApiKey,

    /// Every candidate model failed; `message` describes the last failure.
    #[error("{message}")]
    ModelRequestFailed {
        message: String,
        attempts: Vec<ModelAttempt>,
    },
}

impl UpdateAiError {
    pub fn code(&self) -> &'static str {
        match self {
            UpdateAiError::MissingApiKey => "MISSING_API_KEY",
            UpdateAiError::ModelRequestFailed { .. } => "MODEL_REQUEST_FAILED",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invoice {0} not found")]
    NotFound(String),

    /// A uniqueness constraint rejected the write (invoice number or version).
    #[error("conflicting write: {0}")]
    Conflict(String),
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("`{field}` is not a valid amount: {value}")]
    InvalidAmount { field: &'static str, value: String },

    #[error("`{field}` is not a valid date: {value}")]
    InvalidDate { field: &'static str, value: String },

    #[error("date formatting failed: {0}")]
    Format(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not extract text from {path}: {reason}")]
    Pdf { path: String, reason: String },
}

/// Everything the generate/edit flows can fail with.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ai(#[from] UpdateAiError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error("could not encode audit snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}
