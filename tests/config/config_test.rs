//! Coverage for config parsing, overrides, and validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use execguard::config::{config_dir, EngineConfig, GuardConfig};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn default_engine_values() {
    let engine = EngineConfig::default();
    assert_eq!(engine.workers, 4);
    assert_eq!(engine.read_limit_bytes, 5 * 1024 * 1024);
    assert_eq!(engine.hash_time_required_ms, 1_100);
    assert_eq!(engine.deny_delay_ms, 200);
    assert_eq!(engine.temp_allow_window(), chrono::Duration::seconds(10));
    assert_eq!(engine.caller_access_window(), chrono::Duration::seconds(5));
    assert_eq!(engine.sweep_interval(), Duration::from_secs(10));
}

#[test]
fn zero_read_limit_means_whole_file() {
    let engine = EngineConfig {
        read_limit_bytes: 0,
        ..EngineConfig::default()
    };
    assert_eq!(engine.digest_options().read_limit, None);
    assert_eq!(
        EngineConfig::default().digest_options().read_limit,
        Some(5 * 1024 * 1024)
    );
}

#[test]
fn config_dir_resolves() {
    let path = match config_dir() {
        Ok(path) => path,
        Err(err) => panic!("config dir should resolve: {err}"),
    };
    assert!(path.ends_with(".execguard"));
}

#[test]
fn parse_partial_config_keeps_defaults() {
    let toml_str = r#"
[engine]
workers = 8
deny_delay_ms = 0

[control]
socket_path = "/tmp/execguard-test.sock"
"#;
    let config = match GuardConfig::from_toml(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("partial config should parse: {err}"),
    };
    assert_eq!(config.engine.workers, 8);
    assert_eq!(config.engine.deny_delay_ms, 0);
    assert_eq!(config.engine.temp_allow_secs, 10);
    assert_eq!(
        config.control.socket_path,
        PathBuf::from("/tmp/execguard-test.sock")
    );
    assert_eq!(
        config.protection.config_file,
        PathBuf::from("/Users/Shared/ExecGuard/config.plist")
    );
}

#[test]
fn unknown_types_fail_to_parse() {
    assert!(GuardConfig::from_toml("[engine]\nworkers = \"many\"\n").is_err());
}

#[test]
fn env_overrides_apply_and_bad_values_are_ignored() {
    let mut config = GuardConfig::default();
    config.apply_overrides(env_from(&[
        ("EXECGUARD_CONTROL_SOCKET", "/tmp/c.sock"),
        ("EXECGUARD_FEED_SOCKET", "/tmp/f.sock"),
        ("EXECGUARD_LOGS_DIR", "/tmp/logs"),
        ("EXECGUARD_WORKERS", "not-a-number"),
        ("EXECGUARD_DENY_DELAY_MS", "50"),
    ]));
    assert_eq!(config.control.socket_path, PathBuf::from("/tmp/c.sock"));
    assert_eq!(config.monitor.feed_socket, PathBuf::from("/tmp/f.sock"));
    assert_eq!(config.paths.logs_dir, Some(PathBuf::from("/tmp/logs")));
    assert_eq!(config.engine.workers, 4);
    assert_eq!(config.engine.deny_delay_ms, 50);
}

#[test]
fn load_with_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let missing = dir.path().join("absent.toml");
    let config = match GuardConfig::load_with(Some(&missing), env_from(&[])) {
        Ok(config) => config,
        Err(err) => panic!("missing file should fall back to defaults: {err}"),
    };
    assert_eq!(config, GuardConfig::default());
}

#[test]
fn load_with_reads_path_from_env() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let file = dir.path().join("guard.toml");
    std::fs::write(&file, "[engine]\nworkers = 2\n").expect("should write config");
    let file_str = file.to_string_lossy().into_owned();

    let config = match GuardConfig::load_with(
        None,
        env_from(&[("EXECGUARD_CONFIG", file_str.as_str()), ("EXECGUARD_WORKERS", "3")]),
    ) {
        Ok(config) => config,
        Err(err) => panic!("config from env path should load: {err}"),
    };
    // Environment overrides win over the file.
    assert_eq!(config.engine.workers, 3);
}

#[test]
fn load_with_reports_parse_errors() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let file = dir.path().join("broken.toml");
    std::fs::write(&file, "[engine\n").expect("should write config");
    assert!(GuardConfig::load_with(Some(Path::new(&file)), env_from(&[])).is_err());
}

#[test]
fn validate_rejects_unusable_settings() {
    assert!(GuardConfig::default().validate().is_ok());

    let mut zero_workers = GuardConfig::default();
    zero_workers.engine.workers = 0;
    assert!(zero_workers.validate().is_err());

    let mut bad_fraction = GuardConfig::default();
    bad_fraction.engine.budget_fraction = 1.5;
    assert!(bad_fraction.validate().is_err());

    let mut inverted = GuardConfig::default();
    inverted.engine.min_headroom_ms = 6_000;
    assert!(inverted.validate().is_err());

    let mut relative = GuardConfig::default();
    relative.protection.bundle_path = PathBuf::from("ExecGuard.app");
    assert!(relative.validate().is_err());

    let mut no_retries = GuardConfig::default();
    no_retries.control.notify_retry_ms.clear();
    assert!(no_retries.validate().is_err());
}

#[test]
fn logs_dir_prefers_configured_path() {
    let mut config = GuardConfig::default();
    config.paths.logs_dir = Some(PathBuf::from("/var/log/execguard"));
    match config.logs_dir() {
        Ok(dir) => assert_eq!(dir, PathBuf::from("/var/log/execguard")),
        Err(err) => panic!("configured logs dir should resolve: {err}"),
    }
}
