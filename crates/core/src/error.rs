//! Error types for kbqa.
//!
//! A single enum covers every failure category of the retrieval pipeline:
//! model loading, embedding, indexing, store access, synchronization and
//! generation. A low-confidence query is not represented here; it is a
//! regular outcome of the orchestrator.

use thiserror::Error;

/// Unified error type for kbqa.
///
/// All fallible functions return `Result<T, AppError>`.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O and filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedding or generation backend could not be loaded or reached
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Vector length disagrees with the index or embedder dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Text that cannot be turned into an embedding
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Rejected user input (question, feedback, entry fields)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Knowledge store or conversation log failures
    #[error("Store error: {0}")]
    Store(String),

    /// Index synchronization failures
    #[error("Index sync error: {0}")]
    Sync(String),

    /// Generation exceeded its time budget
    #[error("Generation timed out after {timeout_ms} ms")]
    GenerationTimeout { timeout_ms: u64 },

    /// Generator returned an error
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Stable identifier for this error category, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::ModelUnavailable(_) => "model_unavailable",
            AppError::DimensionMismatch { .. } => "dimension_mismatch",
            AppError::Encoding(_) => "encoding_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Store(_) => "store_error",
            AppError::Sync(_) => "index_sync",
            AppError::GenerationTimeout { .. } => "generation_timeout",
            AppError::Generation(_) => "generation_failure",
            AppError::NotFound(_) => "not_found",
            AppError::Serialization(_) => "serialization",
            AppError::Other(_) => "internal",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::ModelUnavailable(_)
                | AppError::Store(_)
                | AppError::Sync(_)
                | AppError::GenerationTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_message() {
        let err = AppError::DimensionMismatch {
            expected: 768,
            actual: 384,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 768, got 384");
        assert_eq!(err.kind(), "dimension_mismatch");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_errors() {
        assert!(AppError::ModelUnavailable("down".into()).is_transient());
        assert!(AppError::GenerationTimeout { timeout_ms: 10 }.is_transient());
        assert!(!AppError::InvalidInput("bad".into()).is_transient());
    }

    #[test]
    fn test_from_serde_json() {
        let err: AppError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind(), "serialization");
    }
}
