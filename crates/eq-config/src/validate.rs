//! Configuration validation errors and semantic validation.

use thiserror::Error;

use crate::engine::EngineConfig;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::IoError(_) => 60,
            ValidationError::ParseError(_) => 61,
            ValidationError::SemanticError(_) => 63,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::VersionMismatch { .. } => 66,
        }
    }
}

impl From<ValidationError> for eq_common::Error {
    fn from(err: ValidationError) -> Self {
        eq_common::Error::Config(err.to_string())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate an engine configuration semantically.
pub fn validate_config(config: &EngineConfig) -> ValidationResult<()> {
    if config.schema_version != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    if config.sampling_cadence_secs == 0 {
        return Err(invalid("sampling_cadence_secs", "Must be at least 1"));
    }

    let segment = &config.segment;
    if segment.max_records == 0 {
        return Err(invalid("segment.max_records", "Must be at least 1"));
    }
    if segment.max_duration_secs == 0 {
        return Err(invalid("segment.max_duration_secs", "Must be at least 1"));
    }
    if segment.max_bytes < 64 {
        return Err(invalid(
            "segment.max_bytes",
            format!("Must hold at least one frame (64 bytes), got {}", segment.max_bytes),
        ));
    }

    if config.compaction.min_run_length == 0 {
        return Err(invalid("compaction.min_run_length", "Must be at least 1"));
    }
    if config.compaction.max_sample_gap_secs == 0 {
        return Err(invalid("compaction.max_sample_gap_secs", "Must be at least 1"));
    }

    validate_retention(config)?;

    Ok(())
}

fn validate_retention(config: &EngineConfig) -> ValidationResult<()> {
    let retention = &config.retention;

    if retention.raw_horizon_days == 0 {
        return Err(invalid("retention.raw_horizon_days", "Must be at least 1"));
    }

    let mut previous: Option<&crate::engine::DownsampleRule> = None;
    for (idx, rule) in retention.downsample.iter().enumerate() {
        let field = format!("retention.downsample[{}]", idx);
        if rule.granularity_secs == 0 {
            return Err(invalid(&field, "granularity_secs must be positive"));
        }
        if rule.older_than_days < retention.raw_horizon_days {
            return Err(invalid(
                &field,
                format!(
                    "older_than_days {} is inside the raw horizon ({} days)",
                    rule.older_than_days, retention.raw_horizon_days
                ),
            ));
        }
        if let Some(prev) = previous {
            if rule.older_than_days <= prev.older_than_days {
                return Err(ValidationError::SemanticError(format!(
                    "downsample rules must be ordered by increasing age ({} after {})",
                    rule.older_than_days, prev.older_than_days
                )));
            }
            if rule.granularity_secs < prev.granularity_secs {
                return Err(ValidationError::SemanticError(format!(
                    "older history cannot be finer: {}s after {}s",
                    rule.granularity_secs, prev.granularity_secs
                )));
            }
        }
        previous = Some(rule);
    }

    if let Some(evict) = retention.evict_older_than_days {
        if evict < retention.raw_horizon_days {
            return Err(invalid(
                "retention.evict_older_than_days",
                format!(
                    "{} is shorter than the raw horizon ({} days)",
                    evict, retention.raw_horizon_days
                ),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DownsampleRule;

    #[test]
    fn defaults_are_valid() {
        validate_config(&EngineConfig::default()).unwrap();
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut config = EngineConfig::default();
        config.schema_version = "0.9.0".to_string();
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.code(), 66);
    }

    #[test]
    fn rejects_zero_run_length() {
        let mut config = EngineConfig::default();
        config.compaction.min_run_length = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_finer_granularity_for_older_data() {
        let mut config = EngineConfig::default();
        config.retention.downsample = vec![
            DownsampleRule {
                older_than_days: 30,
                granularity_secs: 86_400,
            },
            DownsampleRule {
                older_than_days: 90,
                granularity_secs: 3600,
            },
        ];
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::SemanticError(_))
        ));
    }

    #[test]
    fn rejects_eviction_inside_raw_horizon() {
        let mut config = EngineConfig::default();
        config.retention.evict_older_than_days = Some(3);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn converts_into_engine_error() {
        let err: eq_common::Error = ValidationError::ParseError("bad".into()).into();
        assert_eq!(err.code(), 40);
    }
}
