//! Configuration loading and validation.
//!
//! Precedence: `EXECGUARD_*` env vars > TOML file > defaults. A missing file
//! is not an error; every section has defaults matching production.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::identity::{DigestOptions, DEFAULT_BLOCK_SIZE, DEFAULT_READ_LIMIT, MIN_BLOCK_SIZE};
use crate::notify::DEFAULT_RETRY_DELAYS_MS;
pub use crate::protection::ProtectionConfig;
use crate::valve::DeadlinePolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    /// Decision engine tuning.
    pub engine: EngineConfig,
    /// Control channel.
    pub control: ControlConfig,
    /// Kernel event feed.
    pub monitor: MonitorConfig,
    /// Self-protection.
    pub protection: ProtectionConfig,
    /// Local filesystem layout.
    pub paths: PathsConfig,
}

/// Decision engine tuning (`[engine]`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent decision workers (and concurrent hashes).
    pub workers: usize,
    /// Share of the time until the deadline the worker may use.
    pub budget_fraction: f64,
    /// Smallest headroom reserved for the emergency response.
    pub min_headroom_ms: u64,
    /// Largest headroom reserved for the emergency response.
    pub max_headroom_ms: u64,
    /// Temporary allow window.
    pub temp_allow_secs: u64,
    /// Protected configuration access grant window.
    pub caller_access_secs: u64,
    /// Interval between expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Bytes hashed per file; `0` hashes the whole file.
    pub read_limit_bytes: u64,
    /// Read block size for hashing.
    pub block_size_bytes: usize,
    /// Hashing is skipped (deny) with less than this left before the deadline.
    pub hash_time_required_ms: u64,
    /// Upper bound on the pause before a deny is sent.
    pub deny_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            budget_fraction: 0.8,
            min_headroom_ms: 1_000,
            max_headroom_ms: 5_000,
            temp_allow_secs: 10,
            caller_access_secs: 5,
            sweep_interval_secs: 10,
            read_limit_bytes: DEFAULT_READ_LIMIT,
            block_size_bytes: DEFAULT_BLOCK_SIZE,
            hash_time_required_ms: 1_100,
            deny_delay_ms: 200,
        }
    }
}

impl EngineConfig {
    /// Deadline split for the valve.
    pub fn deadline_policy(&self) -> DeadlinePolicy {
        DeadlinePolicy {
            budget_fraction: self.budget_fraction,
            min_headroom: Duration::from_millis(self.min_headroom_ms),
            max_headroom: Duration::from_millis(self.max_headroom_ms),
        }
    }

    /// Hashing options.
    pub fn digest_options(&self) -> DigestOptions {
        DigestOptions {
            read_limit: (self.read_limit_bytes > 0).then_some(self.read_limit_bytes),
            block_size: self.block_size_bytes.max(MIN_BLOCK_SIZE),
        }
    }

    /// Temporary allow window.
    pub fn temp_allow_window(&self) -> chrono::Duration {
        seconds(self.temp_allow_secs)
    }

    /// Configuration access grant window.
    pub fn caller_access_window(&self) -> chrono::Duration {
        seconds(self.caller_access_secs)
    }

    /// Expiry sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Windows longer than a day are clamped to a day.
const MAX_WINDOW_SECS: u64 = 86_400;

fn seconds(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs.min(MAX_WINDOW_SECS)).unwrap_or(0);
    chrono::Duration::try_seconds(secs).unwrap_or_else(chrono::Duration::zero)
}

/// Control channel (`[control]`).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    /// Unix socket the privileged application connects to.
    pub socket_path: PathBuf,
    /// Delays before each notice delivery attempt.
    pub notify_retry_ms: Vec<u64>,
    /// Notices queued before new ones are dropped.
    pub notify_queue: usize,
    /// Banner title of terminal notices.
    pub notice_title: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/execguard/control.sock"),
            notify_retry_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            notify_queue: 256,
            notice_title: "ExecGuard".to_owned(),
        }
    }
}

impl ControlConfig {
    /// Retry schedule as durations.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.notify_retry_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

/// Kernel event feed (`[monitor]`).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Unix socket the event producer connects to.
    pub feed_socket: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            feed_socket: PathBuf::from("/var/run/execguard/feed.sock"),
        }
    }
}

/// Local filesystem layout (`[paths]`).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Log directory; defaults to `logs/` under [`config_dir`].
    pub logs_dir: Option<PathBuf>,
}

impl GuardConfig {
    /// Load from `path` (or the default location) and apply env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`GuardConfig::load`] with a custom env resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match env("EXECGUARD_CONFIG") {
                Some(p) => PathBuf::from(p),
                None => config_dir()?.join("config.toml"),
            },
        };
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read config at {}: {e}",
                    path.display()
                ))
            }
        };
        config.apply_overrides(env);
        Ok(config)
    }

    /// Parse TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid TOML or unknown value types.
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `EXECGUARD_*` overrides through `env`.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("EXECGUARD_CONTROL_SOCKET") {
            self.control.socket_path = PathBuf::from(v);
        }
        if let Some(v) = env("EXECGUARD_FEED_SOCKET") {
            self.monitor.feed_socket = PathBuf::from(v);
        }
        if let Some(v) = env("EXECGUARD_LOGS_DIR") {
            self.paths.logs_dir = Some(PathBuf::from(v));
        }
        override_parsed(&env, "EXECGUARD_WORKERS", &mut self.engine.workers);
        override_parsed(&env, "EXECGUARD_DENY_DELAY_MS", &mut self.engine.deny_delay_ms);
        override_parsed(
            &env,
            "EXECGUARD_TEMP_ALLOW_SECS",
            &mut self.engine.temp_allow_secs,
        );
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let engine = &self.engine;
        if engine.workers == 0 {
            anyhow::bail!("engine.workers must be at least 1");
        }
        if !(engine.budget_fraction > 0.0 && engine.budget_fraction <= 1.0) {
            anyhow::bail!(
                "engine.budget_fraction must be in (0, 1], got {}",
                engine.budget_fraction
            );
        }
        if engine.min_headroom_ms > engine.max_headroom_ms {
            anyhow::bail!(
                "engine.min_headroom_ms ({}) exceeds engine.max_headroom_ms ({})",
                engine.min_headroom_ms,
                engine.max_headroom_ms
            );
        }
        if self.control.notify_retry_ms.is_empty() {
            anyhow::bail!("control.notify_retry_ms needs at least one attempt");
        }
        let protection = &self.protection;
        for (name, path) in [
            ("protection.bundle_path", &protection.bundle_path),
            ("protection.config_file", &protection.config_file),
            ("protection.protected_dir", &protection.protected_dir),
        ] {
            if !path.is_absolute() {
                anyhow::bail!("{name} must be absolute, got {}", path.display());
            }
        }
        Ok(())
    }

    /// Resolved log directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the home directory
    /// cannot be determined.
    pub fn logs_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.paths.logs_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("logs")),
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

/// Resolve the default config directory (`~/.execguard/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".execguard"))
}
