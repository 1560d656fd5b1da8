//! Exit codes for the equeue CLI.
//!
//! Exit codes communicate the outcome without requiring output parsing and
//! are a stable contract for scrapers and cron jobs.
//!
//! Exit code ranges:
//! - 0-1: Operational outcomes
//! - 10-19: Caller errors (fix the input or configuration)
//! - 20-29: Engine errors (storage, I/O, deadlines, integrity)

use eq_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational Outcomes (0-1)
    // ========================================================================
    /// Success
    Clean = 0,

    /// Some input lines were rejected; the rest were stored
    Partial = 1,

    // ========================================================================
    // Caller Errors (10-19)
    // ========================================================================
    /// Invalid arguments or configuration
    ArgsError = 10,

    /// Observation rejected by validation
    InvalidObservation = 11,

    /// Two different readings for one instant
    AmbiguousDuplicate = 12,

    // ========================================================================
    // Engine Errors (20-29)
    // ========================================================================
    /// Internal error (bug or corrupt storage)
    InternalError = 20,

    /// I/O error
    IoError = 21,

    /// Query exceeded its deadline or was cancelled
    TimeoutError = 22,

    /// `verify` found the ledger and the files disagree
    VerifyMismatch = 23,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    /// Codes 10-19: resolvable by changing the input.
    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Error code name for JSON output.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Partial => "OK_PARTIAL",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::InvalidObservation => "ERR_INVALID_OBSERVATION",
            ExitCode::AmbiguousDuplicate => "ERR_AMBIGUOUS_DUPLICATE",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
            ExitCode::TimeoutError => "ERR_TIMEOUT",
            ExitCode::VerifyMismatch => "ERR_VERIFY",
        }
    }

    pub fn from_engine_error(err: &eq_common::Error) -> Self {
        use eq_common::Error;
        match err {
            Error::InvalidObservation(_) => ExitCode::InvalidObservation,
            Error::AmbiguousDuplicate { .. } => ExitCode::AmbiguousDuplicate,
            Error::InvalidRange { .. } | Error::InvalidResolution(_) | Error::Config(_) => {
                ExitCode::ArgsError
            }
            Error::Cancelled | Error::Timeout { .. } => ExitCode::TimeoutError,
            Error::CorruptSegment { .. } | Error::SegmentNotFound { .. } => ExitCode::InternalError,
            Error::Io(_) => ExitCode::IoError,
            Error::Json(_) => ExitCode::InternalError,
        }
    }

    pub fn from_store_error(err: &StoreError) -> Self {
        match err {
            StoreError::Engine(e) => Self::from_engine_error(e),
            StoreError::Io(_) => ExitCode::IoError,
            StoreError::InvalidPath(_) => ExitCode::ArgsError,
            StoreError::Json(_) | StoreError::Parquet(_) | StoreError::Arrow(_) => {
                ExitCode::InternalError
            }
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
