//! Shared fixtures: a recording monitor and engine builders.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use execguard::config::EngineConfig;
use execguard::engine::Engine;
use execguard::monitor::{
    Action, AuthMessage, AuthResponse, Event, EventKind, MonitorClient, MonitorError, PathMatch,
    Pid, ProcessInfo,
};
use execguard::notify::{BlockedNotice, NotifierHandle};
use execguard::protection::{ProtectionConfig, SelfProtection};

/// One response as seen by the monitor.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub id: u64,
    pub response: AuthResponse,
    pub at: Instant,
}

/// Non-response calls, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCall {
    MuteSelf,
    UnmuteAll,
    Invert,
    Watch(String, PathMatch),
    Subscribe(Vec<EventKind>),
}

/// Monitor double that records everything it is told.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    responses: Mutex<Vec<Recorded>>,
    calls: Mutex<Vec<MonitorCall>>,
}

impl RecordingMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn responses(&self) -> Vec<Recorded> {
        self.responses.lock().clone()
    }

    pub fn calls(&self) -> Vec<MonitorCall> {
        self.calls.lock().clone()
    }

    /// Poll until at least `count` responses arrived or `timeout` passed.
    pub async fn wait_for_responses(&self, count: usize, timeout: Duration) -> Vec<Recorded> {
        let started = Instant::now();
        loop {
            let seen = self.responses();
            if seen.len() >= count || started.elapsed() >= timeout {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl MonitorClient for RecordingMonitor {
    fn respond(&self, message: &AuthMessage, response: AuthResponse) -> Result<(), MonitorError> {
        self.responses.lock().push(Recorded {
            id: message.id,
            response,
            at: Instant::now(),
        });
        Ok(())
    }

    fn mute_self(&self) -> Result<(), MonitorError> {
        self.calls.lock().push(MonitorCall::MuteSelf);
        Ok(())
    }

    fn unmute_all_target_paths(&self) -> Result<(), MonitorError> {
        self.calls.lock().push(MonitorCall::UnmuteAll);
        Ok(())
    }

    fn invert_target_path_muting(&self) -> Result<(), MonitorError> {
        self.calls.lock().push(MonitorCall::Invert);
        Ok(())
    }

    fn watch_path(&self, path: &str, matching: PathMatch) -> Result<(), MonitorError> {
        self.calls
            .lock()
            .push(MonitorCall::Watch(path.to_owned(), matching));
        Ok(())
    }

    fn subscribe(&self, kinds: &[EventKind]) -> Result<(), MonitorError> {
        self.calls.lock().push(MonitorCall::Subscribe(kinds.to_vec()));
        Ok(())
    }
}

/// Engine settings for tests: no deny pause.
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        deny_delay_ms: 0,
        ..EngineConfig::default()
    }
}

/// Fresh engine plus the receiver of its notices.
pub fn engine_with(config: EngineConfig) -> (Arc<Engine>, mpsc::Receiver<BlockedNotice>) {
    let (notifier, notices) = NotifierHandle::detached(64);
    let engine = Engine::new(
        config,
        SelfProtection::new(ProtectionConfig::default()),
        notifier,
    );
    (Arc::new(engine), notices)
}

/// Fresh engine with [`engine_config`].
pub fn engine() -> (Arc<Engine>, mpsc::Receiver<BlockedNotice>) {
    engine_with(engine_config())
}

/// An unsigned process outside every protected location.
pub fn process(pid: Pid) -> ProcessInfo {
    ProcessInfo {
        pid,
        ppid: 1,
        signing_id: None,
        executable: PathBuf::from("/usr/bin/stranger"),
        tty: None,
    }
}

/// Authorization message for `event` with `remaining` until the deadline.
pub fn message(id: u64, event: Event, process: ProcessInfo, remaining: Duration) -> AuthMessage {
    let now = Instant::now();
    AuthMessage {
        id,
        action: Action::Auth,
        event,
        process,
        deadline: now.checked_add(remaining).unwrap_or(now),
    }
}

/// Exec message for `path`.
pub fn exec_message(id: u64, path: &Path, remaining: Duration) -> AuthMessage {
    message(
        id,
        Event::Exec {
            path: path.to_string_lossy().into_owned(),
            signing_id: Some("com.example.App".to_owned()),
        },
        process(4_000),
        remaining,
    )
}

/// Write an "executable" with `content` under `dir`.
pub fn write_exe(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Err(err) = std::fs::write(&path, content) {
        panic!("should write {}: {err}", path.display());
    }
    path
}

/// Path as the engine sees it.
pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
