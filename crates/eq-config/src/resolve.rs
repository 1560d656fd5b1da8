//! Configuration resolution and path discovery.
//!
//! Resolution order: CLI argument → environment variables → XDG paths →
//! system config → builtin defaults.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::engine::EngineConfig;
use crate::validate::{validate_config, ValidationResult};

/// Where the configuration file was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Found in XDG config directory.
    XdgConfig,

    /// Found in /etc/equeue/.
    SystemConfig,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::SystemConfig => write!(f, "system config"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// A loaded, validated configuration together with its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: EngineConfig,
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

/// Environment variable names.
const ENV_CONFIG_PATH: &str = "EQUEUE_CONFIG";
const ENV_CONFIG_DIR: &str = "EQUEUE_CONFIG_DIR";

/// Standard config file name.
const CONFIG_FILENAME: &str = "engine.json";

/// Application name for XDG directories.
const APP_NAME: &str = "equeue";

/// Resolve the engine configuration path.
///
/// 1. Explicit CLI path (if it exists)
/// 2. `EQUEUE_CONFIG`
/// 3. `EQUEUE_CONFIG_DIR` + `engine.json`
/// 4. XDG config directory (`~/.config/equeue/`)
/// 5. System config (`/etc/equeue/`)
/// 6. Built-in defaults (None)
pub fn resolve_config_path(cli_path: Option<&Path>) -> (Option<PathBuf>, ConfigSource) {
    if let Some(path) = cli_path {
        if path.exists() {
            return (Some(path.to_path_buf()), ConfigSource::CliArgument);
        }
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return (Some(path), ConfigSource::Environment);
        }
    }

    if let Ok(config_dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(config_dir).join(CONFIG_FILENAME);
        if path.exists() {
            return (Some(path), ConfigSource::Environment);
        }
    }

    if let Some(xdg_dir) = xdg_config_dir() {
        let path = xdg_dir.join(CONFIG_FILENAME);
        if path.exists() {
            return (Some(path), ConfigSource::XdgConfig);
        }
    }

    let system_path = system_config_dir().join(CONFIG_FILENAME);
    if system_path.exists() {
        return (Some(system_path), ConfigSource::SystemConfig);
    }

    (None, ConfigSource::BuiltinDefault)
}

/// Resolve, load and validate the engine configuration.
///
/// A CLI path that does not exist is an error rather than a silent fallback:
/// the caller asked for that file specifically.
pub fn load_config(cli_path: Option<&Path>) -> ValidationResult<ResolvedConfig> {
    if let Some(path) = cli_path {
        if !path.exists() {
            return Err(crate::validate::ValidationError::IoError(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
    }

    let (path, source) = resolve_config_path(cli_path);
    let config = match &path {
        Some(p) => EngineConfig::from_file(p)?,
        None => EngineConfig::default(),
    };
    validate_config(&config)?;

    Ok(ResolvedConfig {
        config,
        path,
        source,
    })
}

/// Get the XDG config directory for equeue.
pub fn xdg_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

/// Get the system config directory.
pub fn system_config_dir() -> PathBuf {
    PathBuf::from("/etc").join(APP_NAME)
}

/// Default data directory: `$XDG_DATA_HOME/equeue` (or `./equeue`).
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_source_display() {
        assert_eq!(format!("{}", ConfigSource::CliArgument), "CLI argument");
        assert_eq!(
            format!("{}", ConfigSource::Environment),
            "environment variable"
        );
        assert_eq!(
            format!("{}", ConfigSource::BuiltinDefault),
            "builtin default"
        );
    }

    #[test]
    fn test_missing_cli_path_is_error() {
        let err = load_config(Some(Path::new("/definitely/not/here/engine.json"))).unwrap_err();
        assert_eq!(err.code(), 60);
    }

    #[test]
    fn test_system_config_dir() {
        assert_eq!(system_config_dir(), PathBuf::from("/etc/equeue"));
    }

    #[test]
    fn test_default_data_dir_ends_with_app() {
        assert!(default_data_dir().ends_with(APP_NAME));
    }
}
