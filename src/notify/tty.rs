//! Plain-text notice written to the blocked process's terminal.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{BlockedNotice, NoticeSink, NotifyError};
use crate::monitor::Pid;

const LABEL_WIDTH: usize = 12;
const BOLD_RED: &str = "\u{1b}[1m\u{1b}[31m";
const BOLD: &str = "\u{1b}[1m";
const RESET: &str = "\u{1b}[0m";

/// Writes a notice to the controlling terminal of the blocked process.
///
/// Every failure (no terminal, permission denied, device gone) is swallowed.
#[derive(Debug, Clone)]
pub struct TerminalSink {
    title: String,
    proc_root: PathBuf,
}

impl TerminalSink {
    /// Sink whose banner reads `title`.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Look up terminals under `proc_root` instead of `/proc`.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    fn terminal_for(&self, notice: &BlockedNotice) -> Option<PathBuf> {
        notice
            .tty
            .clone()
            .or_else(|| find_terminal(&self.proc_root, notice.parent_pid))
    }
}

#[async_trait]
impl NoticeSink for TerminalSink {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn deliver(&self, notice: &BlockedNotice) -> Result<(), NotifyError> {
        let Some(device) = self.terminal_for(notice) else {
            debug!(pid = notice.parent_pid, "no terminal for blocked exec");
            return Ok(());
        };
        let message = format_notice(&self.title, notice);
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .append(true)
            .open(&device)
            .await;
        match opened {
            Ok(mut file) => {
                if let Err(e) = file.write_all(message.as_bytes()).await {
                    debug!(device = %device.display(), error = %e, "terminal write failed");
                }
            }
            Err(e) => debug!(device = %device.display(), error = %e, "terminal open failed"),
        }
        Ok(())
    }
}

/// Render the terminal banner.
pub fn format_notice(title: &str, notice: &BlockedNotice) -> String {
    let digest = notice
        .digest
        .as_ref()
        .map(|d| d.as_str().to_owned())
        .unwrap_or_else(|| "unavailable".to_owned());
    let identifier = notice.signing_id.as_deref().unwrap_or("Unknown");
    let parent = notice.parent_pid.to_string();

    let mut out = String::from("\n\n");
    out.push_str(&format!("{BOLD_RED}{title}{RESET}\n\n"));
    out.push_str("The following application has been blocked from execution\n");
    out.push_str("because it was added to the locked list.\n\n");
    for (label, value) in [
        ("Path:", notice.path.as_str()),
        ("Identifier:", identifier),
        ("SHA256:", digest.as_str()),
        ("Parent PID:", parent.as_str()),
    ] {
        out.push_str(&format!("{BOLD}{label:<width$}{RESET} {value}\n", width = LABEL_WIDTH));
    }
    out.push_str("Authenticate...\n\n");
    out
}

/// First open file descriptor of `pid` that points at a terminal device.
pub fn find_terminal(proc_root: &Path, pid: Pid) -> Option<PathBuf> {
    let fd_dir = proc_root.join(pid.to_string()).join("fd");
    let entries = std::fs::read_dir(fd_dir).ok()?;
    let mut fds: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    fds.sort();
    fds.into_iter()
        .filter_map(|fd| std::fs::read_link(fd).ok())
        .find(|target| is_terminal_device(target))
}

fn is_terminal_device(path: &Path) -> bool {
    let text = path.to_string_lossy();
    text.starts_with("/dev/tty") || text.starts_with("/dev/pts/")
}
