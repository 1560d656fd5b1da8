//! Border queue statistics engine CLI support.
//!
//! The `equeue` binary lives in `main.rs`; this library holds the pieces it
//! shares with tests:
//! - Exit codes and the CLI error type
//! - Logging setup
//! - Query range parsing

pub mod error;
pub mod exit_codes;
pub mod logging;
pub mod timerange;

pub use error::CliError;
pub use exit_codes::ExitCode;
