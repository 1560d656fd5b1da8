//! Resolution order and loading tests against real files on disk.
//!
//! Covers:
//! - CLI path over environment
//! - EQUEUE_CONFIG over EQUEUE_CONFIG_DIR
//! - Validation failures surfacing from load_config

use eq_config::resolve::{load_config, resolve_config_path, ConfigSource};
use eq_config::ValidationError;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

struct EnvGuard {
    keys: Vec<String>,
    saved: Vec<Option<String>>,
}

impl EnvGuard {
    fn new(keys: &[&str]) -> Self {
        let mut saved = Vec::with_capacity(keys.len());
        for key in keys {
            saved.push(env::var(key).ok());
        }
        Self {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            saved,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (idx, key) in self.keys.iter().enumerate() {
            match self.saved.get(idx).and_then(|v| v.as_ref()) {
                Some(val) => env::set_var(key, val),
                None => env::remove_var(key),
            }
        }
    }
}

fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .expect("env lock poisoned");
    f()
}

fn write_config(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create config parent");
    }
    fs::write(path, body).expect("write config");
}

const ENV_KEYS: &[&str] = &["EQUEUE_CONFIG", "EQUEUE_CONFIG_DIR", "XDG_CONFIG_HOME"];

#[test]
fn cli_path_wins_over_env() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let temp = TempDir::new().unwrap();
        let cli = temp.path().join("cli/engine.json");
        let env_file = temp.path().join("env/engine.json");
        write_config(&cli, r#"{"compaction":{"epsilon":1}}"#);
        write_config(&env_file, r#"{"compaction":{"epsilon":9}}"#);
        env::set_var("EQUEUE_CONFIG", env_file.display().to_string());

        let resolved = load_config(Some(&cli)).expect("load");
        assert_eq!(resolved.source, ConfigSource::CliArgument);
        assert_eq!(resolved.config.compaction.epsilon, 1);
    });
}

#[test]
fn env_file_wins_over_config_dir() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let temp = TempDir::new().unwrap();
        let env_file = temp.path().join("direct.json");
        let dir = temp.path().join("dir");
        write_config(&env_file, r#"{"segment":{"max_records":10}}"#);
        write_config(&dir.join("engine.json"), r#"{"segment":{"max_records":20}}"#);
        env::set_var("EQUEUE_CONFIG", env_file.display().to_string());
        env::set_var("EQUEUE_CONFIG_DIR", dir.display().to_string());

        let (path, source) = resolve_config_path(None);
        assert_eq!(source, ConfigSource::Environment);
        assert_eq!(path.as_deref(), Some(env_file.as_path()));

        env::remove_var("EQUEUE_CONFIG");
        let resolved = load_config(None).expect("load");
        assert_eq!(resolved.config.segment.max_records, 20);
    });
}

#[test]
fn invalid_values_fail_load() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let temp = TempDir::new().unwrap();
        let cli = temp.path().join("engine.json");
        write_config(&cli, r#"{"retention":{"raw_horizon_days":0}}"#);

        let err = load_config(Some(&cli)).expect_err("zero horizon must fail");
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
    });
}

#[test]
fn malformed_file_is_parse_error() {
    with_env_lock(|| {
        let _guard = EnvGuard::new(ENV_KEYS);
        let temp = TempDir::new().unwrap();
        let cli = temp.path().join("engine.json");
        write_config(&cli, "{ segment: ");

        let err = load_config(Some(&cli)).expect_err("malformed must fail");
        assert_eq!(err.code(), 61);
    });
}
