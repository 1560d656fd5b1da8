//! Error types for the queue statistics engine.
//!
//! Every error carries:
//! - A stable numeric code for machine parsing
//! - A category for grouping
//! - A recoverability hint and a suggested action for the calling scheduler
//! - A remediation hint for humans
//!
//! # Human-Facing Output
//!
//! ```text
//! ✗ Ambiguous Duplicate
//!   Reason: ambiguous duplicate at 2026-01-15T14:30:00Z: stored 5, incoming 7
//!   Fix: The source reported two different values for one instant. Drop one of them.
//! ```
//!
//! # Agent-Facing Output
//!
//! ```json
//! {
//!   "code": 11,
//!   "category": "ingest",
//!   "message": "ambiguous duplicate at 2026-01-15T14:30:00Z: stored 5, incoming 7",
//!   "recoverable": false,
//!   "suggested_action": "skip"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Observation validation and duplicate handling.
    Ingest,
    /// Segment integrity and catalog errors.
    Storage,
    /// Range, resolution, cancellation and deadline errors.
    Query,
    /// Configuration file errors.
    Config,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Ingest => write!(f, "ingest"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Query => write!(f, "query"),
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Suggested actions for the caller (scheduler or presentation layer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Retry the operation (possibly with backoff).
    Retry,
    /// Drop this item and continue.
    Skip,
    /// Narrow the query and try again.
    NarrowQuery,
    /// Run `equeue verify` to inspect storage.
    RunVerify,
    /// Fix the configuration file.
    FixConfig,
    /// Manual intervention required.
    ManualIntervention,
}

impl std::fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuggestedAction::Retry => write!(f, "retry"),
            SuggestedAction::Skip => write!(f, "skip"),
            SuggestedAction::NarrowQuery => write!(f, "narrow_query"),
            SuggestedAction::RunVerify => write!(f, "run_verify"),
            SuggestedAction::FixConfig => write!(f, "fix_config"),
            SuggestedAction::ManualIntervention => write!(f, "manual_intervention"),
        }
    }
}

/// Unified error type for the engine.
#[derive(Error, Debug)]
pub enum Error {
    // Ingest errors (10-19)
    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    #[error("ambiguous duplicate at {timestamp}: stored {existing}, incoming {incoming}")]
    AmbiguousDuplicate {
        timestamp: DateTime<Utc>,
        existing: String,
        incoming: String,
    },

    // Storage errors (20-29)
    #[error("corrupt segment {path}: {reason}")]
    CorruptSegment { path: String, reason: String },

    #[error("segment {id} not found")]
    SegmentNotFound { id: u64 },

    // Query errors (30-39)
    #[error("invalid range: {start} is after {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("query exceeded deadline of {millis}ms")]
    Timeout { millis: u64 },

    // Configuration errors (40-49)
    #[error("configuration error: {0}")]
    Config(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Ingest errors
    /// - 20-29: Storage errors
    /// - 30-39: Query errors
    /// - 40-49: Configuration errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidObservation(_) => 10,
            Error::AmbiguousDuplicate { .. } => 11,
            Error::CorruptSegment { .. } => 20,
            Error::SegmentNotFound { .. } => 21,
            Error::InvalidRange { .. } => 30,
            Error::InvalidResolution(_) => 31,
            Error::Cancelled => 32,
            Error::Timeout { .. } => 33,
            Error::Config(_) => 40,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidObservation(_) | Error::AmbiguousDuplicate { .. } => {
                ErrorCategory::Ingest
            }
            Error::CorruptSegment { .. } | Error::SegmentNotFound { .. } => ErrorCategory::Storage,
            Error::InvalidRange { .. }
            | Error::InvalidResolution(_)
            | Error::Cancelled
            | Error::Timeout { .. } => ErrorCategory::Query,
            Error::Config(_) => ErrorCategory::Config,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable by the caller.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // The scheduler may refetch and get a clean sample
            Error::InvalidObservation(_) => true,
            // Silently picking one value loses information
            Error::AmbiguousDuplicate { .. } => false,

            Error::CorruptSegment { .. } => false,
            Error::SegmentNotFound { .. } => true,

            Error::InvalidRange { .. } => true,
            Error::InvalidResolution(_) => true,
            Error::Cancelled => true,
            Error::Timeout { .. } => true,

            Error::Config(_) => true,

            Error::Io(_) => true,
            Error::Json(_) => false,
        }
    }

    /// Returns the suggested action for the caller.
    pub fn suggested_action(&self) -> SuggestedAction {
        match self {
            Error::InvalidObservation(_) => SuggestedAction::Retry,
            Error::AmbiguousDuplicate { .. } => SuggestedAction::Skip,
            Error::CorruptSegment { .. } => SuggestedAction::RunVerify,
            Error::SegmentNotFound { .. } => SuggestedAction::Retry,
            Error::InvalidRange { .. } | Error::InvalidResolution(_) => {
                SuggestedAction::NarrowQuery
            }
            Error::Cancelled => SuggestedAction::Skip,
            Error::Timeout { .. } => SuggestedAction::NarrowQuery,
            Error::Config(_) => SuggestedAction::FixConfig,
            Error::Io(_) => SuggestedAction::Retry,
            Error::Json(_) => SuggestedAction::ManualIntervention,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::InvalidObservation(_) => {
                "The sample was rejected. Refetch the source or drop this tick."
            }
            Error::AmbiguousDuplicate { .. } => {
                "The source reported two different values for one instant. Drop one of them."
            }
            Error::CorruptSegment { .. } => {
                "The segment was quarantined as *.corrupt. Run 'equeue verify' and restore it from backup if needed."
            }
            Error::SegmentNotFound { .. } => {
                "The segment was replaced by compaction or retention. Retry the query."
            }
            Error::InvalidRange { .. } => "Swap --from and --to, or pass a non-empty range.",
            Error::InvalidResolution(_) => {
                "Use a positive resolution such as '5min', 'h', 'd', '30m' or '3600s'."
            }
            Error::Cancelled => "The query was cancelled by the caller.",
            Error::Timeout { .. } => "Query a shorter range or raise --timeout.",
            Error::Config(_) => {
                "Run 'equeue config show' to inspect the resolved configuration and fix engine.json."
            }
            Error::Io(_) => "Check disk space and permissions on the data directory. Retry.",
            Error::Json(_) => "Invalid JSON. Check syntax with 'jq .' or restore from backup.",
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::InvalidObservation(_) => "Invalid Observation",
            Error::AmbiguousDuplicate { .. } => "Ambiguous Duplicate",
            Error::CorruptSegment { .. } => "Corrupt Segment",
            Error::SegmentNotFound { .. } => "Segment Not Found",
            Error::InvalidRange { .. } => "Invalid Range",
            Error::InvalidResolution(_) => "Invalid Resolution",
            Error::Cancelled => "Query Cancelled",
            Error::Timeout { .. } => "Query Timeout",
            Error::Config(_) => "Configuration Error",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Parse Error",
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Suggested action for the caller.
    pub suggested_action: SuggestedAction,

    /// Additional structured context (e.g., timestamp, segment path).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::AmbiguousDuplicate {
                timestamp,
                existing,
                incoming,
            } => {
                context.insert("timestamp".to_string(), serde_json::json!(timestamp));
                context.insert("existing".to_string(), serde_json::json!(existing));
                context.insert("incoming".to_string(), serde_json::json!(incoming));
            }
            Error::CorruptSegment { path, .. } => {
                context.insert("path".to_string(), serde_json::json!(path));
            }
            Error::SegmentNotFound { id } => {
                context.insert("segment_id".to_string(), serde_json::json!(id));
            }
            Error::InvalidRange { start, end } => {
                context.insert("start".to_string(), serde_json::json!(start));
                context.insert("end".to_string(), serde_json::json!(end));
            }
            Error::Timeout { millis } => {
                context.insert("timeout_ms".to_string(), serde_json::json!(millis));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            suggested_action: err.suggested_action(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }

    /// Serialize to pretty JSON string.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.to_json())
    }
}

/// Format an error for human-readable stderr output.
///
/// ```text
/// ✗ [Headline]
///   Reason: [Error message]
///   Fix: [Remediation hint]
/// ```
pub fn format_error_human(headline: &str, message: &str, remediation: &str, use_color: bool) -> String {
    let (red, cyan, reset) = if use_color {
        ("\x1b[31m", "\x1b[36m", "\x1b[0m")
    } else {
        ("", "", "")
    };

    format!("{red}✗{reset} {headline}\n  Reason: {message}\n  {cyan}Fix:{reset} {remediation}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 14, 30, 0).unwrap()
    }

    #[test]
    fn test_error_code() {
        assert_eq!(Error::InvalidObservation("x".into()).code(), 10);
        assert_eq!(Error::CorruptSegment { path: "p".into(), reason: "r".into() }.code(), 20);
        assert_eq!(Error::Timeout { millis: 5 }.code(), 33);
        assert_eq!(Error::Config("x".into()).code(), 40);
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::Cancelled.category(), ErrorCategory::Query);
        assert_eq!(Error::SegmentNotFound { id: 3 }.category(), ErrorCategory::Storage);
        assert_eq!(
            Error::AmbiguousDuplicate {
                timestamp: ts(),
                existing: "5".into(),
                incoming: "7".into()
            }
            .category(),
            ErrorCategory::Ingest
        );
    }

    #[test]
    fn test_duplicate_is_not_recoverable() {
        let err = Error::AmbiguousDuplicate {
            timestamp: ts(),
            existing: "5".into(),
            incoming: "7".into(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.suggested_action(), SuggestedAction::Skip);
    }

    #[test]
    fn test_structured_error_context() {
        let err = Error::Timeout { millis: 250 };
        let structured = StructuredError::from(&err);
        assert_eq!(structured.code, 33);
        assert_eq!(structured.context.get("timeout_ms"), Some(&serde_json::json!(250)));

        let json = structured.to_json();
        assert!(json.contains(r#""category":"query""#));
        assert!(json.contains(r#""suggested_action":"narrow_query""#));
    }

    #[test]
    fn test_format_error_human() {
        let err = Error::InvalidObservation("queue_length -3 is negative".into());
        let formatted = format_error_human(err.headline(), &err.to_string(), err.remediation(), false);
        assert!(formatted.contains("Invalid Observation"));
        assert!(formatted.contains("queue_length -3 is negative"));
        assert!(formatted.contains("Fix:"));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ErrorCategory::Storage.to_string(), "storage");
        assert_eq!(SuggestedAction::RunVerify.to_string(), "run_verify");
    }
}
