//! Error types for tracker-core operations.

use std::path::PathBuf;

use crate::classify::ClassifyError;

/// All errors that can occur in tracker-core operations.
///
/// Signal handlers catch these at their boundary and log them; nothing here
/// is allowed to take down the worker that processes signals.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    // ─────────────────────────────────────────────────────────────────────
    // Tracking Errors
    // ─────────────────────────────────────────────────────────────────────
    /// The persisted tracking slot no longer references the open session
    /// (cleared or overwritten externally). That interval's accounting is lost.
    #[error("Invalid session: tracking state does not reference {session_id}")]
    InvalidSession { session_id: String },

    #[error("Invalid domain id: {domain_id} does not end with category {category}")]
    InvalidDomainId { domain_id: String, category: String },

    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    /// Storage hiccup; retried at the next natural trigger.
    #[error("Storage failure: {message}")]
    Storage { message: String },

    // ─────────────────────────────────────────────────────────────────────
    // Collaborator Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Classification failed: {0}")]
    Classification(#[from] ClassifyError),

    #[error("Export failed during {stage}: {message}")]
    Export { stage: String, message: String },

    #[error("Signal worker is not running")]
    WorkerUnavailable,

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TrackerError {
    pub fn storage(message: impl Into<String>) -> Self {
        TrackerError::Storage {
            message: message.into(),
        }
    }

    pub fn export(stage: &str, message: impl Into<String>) -> Self {
        TrackerError::Export {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// True for failures that a later trigger may succeed at.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerError::Storage { .. } | TrackerError::Io { .. } | TrackerError::Export { .. }
        )
    }
}

/// Convenience type alias for Results using TrackerError.
pub type Result<T> = std::result::Result<T, TrackerError>;

// Conversion for string error compatibility
impl From<TrackerError> for String {
    fn from(err: TrackerError) -> String {
        err.to_string()
    }
}
