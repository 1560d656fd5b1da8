//! CLI error type: everything a command can fail with, mapped to an exit
//! code and a structured error payload.

use eq_common::{ErrorCategory, StructuredError, SuggestedAction};
use eq_config::ValidationError;
use eq_store::StoreError;
use thiserror::Error;

use crate::exit_codes::ExitCode;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ValidationError),

    #[error("cannot read input {path}: {source}")]
    Input {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<eq_common::Error> for CliError {
    fn from(err: eq_common::Error) -> Self {
        CliError::Store(StoreError::from(err))
    }
}

impl CliError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Store(e) => ExitCode::from_store_error(e),
            CliError::Config(_) => ExitCode::ArgsError,
            CliError::Input { .. } => ExitCode::IoError,
        }
    }

    pub fn headline(&self) -> &'static str {
        match self {
            CliError::Store(e) => e.headline(),
            CliError::Config(_) => "Configuration Error",
            CliError::Input { .. } => "Unreadable Input",
        }
    }

    pub fn remediation(&self) -> &'static str {
        match self {
            CliError::Store(e) => e.remediation(),
            CliError::Config(_) => {
                "Run 'equeue config show' to inspect the resolved configuration and fix engine.json."
            }
            CliError::Input { .. } => "Check the input path, or pass '-' to read standard input.",
        }
    }

    pub fn to_structured(&self) -> StructuredError {
        match self {
            CliError::Store(e) => e.to_structured(),
            CliError::Config(e) => StructuredError {
                code: e.code(),
                category: ErrorCategory::Config,
                message: self.to_string(),
                recoverable: true,
                suggested_action: SuggestedAction::FixConfig,
                context: Default::default(),
            },
            CliError::Input { path, .. } => StructuredError {
                code: 60,
                category: ErrorCategory::Io,
                message: self.to_string(),
                recoverable: true,
                suggested_action: SuggestedAction::Retry,
                context: Default::default(),
            }
            .with_context("path", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_keep_codes_and_exit_codes() {
        let err = CliError::from(eq_common::Error::InvalidObservation("negative".into()));
        assert_eq!(err.exit_code(), ExitCode::InvalidObservation);
        assert_eq!(err.to_structured().code, 10);
        assert_eq!(err.headline(), "Invalid Observation");
    }

    #[test]
    fn config_errors_are_argument_errors() {
        let err = CliError::from(ValidationError::ParseError("bad".into()));
        assert_eq!(err.exit_code(), ExitCode::ArgsError);
        assert_eq!(err.to_structured().category, ErrorCategory::Config);
    }
}
