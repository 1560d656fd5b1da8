//! Queue statistics engine configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for engine.json
//! - Config resolution (CLI → env → XDG → /etc → defaults)
//! - Semantic validation with stable error codes

pub mod engine;
pub mod resolve;
pub mod validate;

pub use engine::{
    CompactionSettings, DownsampleRule, EngineConfig, IngestSettings, QuerySettings,
    RetentionSettings, SegmentSettings,
};
pub use resolve::{load_config, resolve_config_path, ConfigSource, ResolvedConfig};
pub use validate::{validate_config, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";
