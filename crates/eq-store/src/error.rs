//! Store error type.
//!
//! Wraps the engine-level [`eq_common::Error`] and adds the storage
//! backends' own failures. Codes follow the same ranges as the engine error.

use eq_common::{ErrorCategory, StructuredError, SuggestedAction};
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Engine(#[from] eq_common::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl StoreError {
    pub fn code(&self) -> u32 {
        match self {
            StoreError::Engine(e) => e.code(),
            StoreError::Io(_) => 60,
            StoreError::Json(_) => 61,
            StoreError::Parquet(_) => 62,
            StoreError::Arrow(_) => 63,
            StoreError::InvalidPath(_) => 64,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::Engine(e) => e.category(),
            _ => ErrorCategory::Io,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::Engine(e) => e.is_recoverable(),
            StoreError::Io(_) => true,
            StoreError::Json(_) | StoreError::Parquet(_) | StoreError::Arrow(_) => false,
            StoreError::InvalidPath(_) => true,
        }
    }

    pub fn suggested_action(&self) -> SuggestedAction {
        match self {
            StoreError::Engine(e) => e.suggested_action(),
            StoreError::Io(_) | StoreError::InvalidPath(_) => SuggestedAction::Retry,
            StoreError::Json(_) | StoreError::Parquet(_) | StoreError::Arrow(_) => {
                SuggestedAction::RunVerify
            }
        }
    }

    pub fn headline(&self) -> &'static str {
        match self {
            StoreError::Engine(e) => e.headline(),
            StoreError::Io(_) => "I/O Error",
            StoreError::Json(_) => "Metadata Parse Error",
            StoreError::Parquet(_) => "Segment Read/Write Error",
            StoreError::Arrow(_) => "Segment Schema Error",
            StoreError::InvalidPath(_) => "Invalid Path",
        }
    }

    pub fn remediation(&self) -> &'static str {
        match self {
            StoreError::Engine(e) => e.remediation(),
            StoreError::Io(_) => "Check disk space and permissions on the data directory. Retry.",
            StoreError::Json(_) | StoreError::Parquet(_) | StoreError::Arrow(_) => {
                "Run 'equeue verify' to rebuild metadata from the segment files."
            }
            StoreError::InvalidPath(_) => "Pass a writable directory with --data-dir.",
        }
    }

    /// Whether the error came from cooperative cancellation or a deadline.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            StoreError::Engine(eq_common::Error::Cancelled)
                | StoreError::Engine(eq_common::Error::Timeout { .. })
        )
    }

    pub fn to_structured(&self) -> StructuredError {
        match self {
            StoreError::Engine(e) => StructuredError::from(e),
            other => StructuredError {
                code: other.code(),
                category: other.category(),
                message: other.to_string(),
                recoverable: other.is_recoverable(),
                suggested_action: other.suggested_action(),
                context: Default::default(),
            },
        }
    }
}
