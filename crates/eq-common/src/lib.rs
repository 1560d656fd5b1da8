//! Shared types for the border queue statistics engine.
//!
//! This crate provides the pieces every other crate speaks in:
//! - The observation model and its validation rules
//! - The engine error type with stable codes
//! - Query resolutions and aggregation modes
//! - Output formats

pub mod error;
pub mod observation;
pub mod output;
pub mod resolution;

pub use error::{Error, ErrorCategory, Result, StructuredError, SuggestedAction};
pub use observation::{
    validate, Candidate, Disposition, IngestPolicy, Observation, RawObservation, Validated,
};
pub use output::OutputFormat;
pub use resolution::{Aggregation, Resolution};

/// Version of the persisted metadata and JSON payload layout.
pub const SCHEMA_VERSION: &str = "1.0.0";
