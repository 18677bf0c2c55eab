//! Best-effort denial notices.
//!
//! The exec worker hands a [`BlockedNotice`] to a [`NotifierHandle`] and
//! returns immediately. A dedicated task fans each notice out to every
//! registered [`NoticeSink`], retrying sinks that report
//! [`NotifyError::Unavailable`] on a short backoff schedule. Nothing here can
//! delay a kernel response: the handle never awaits and drops notices when
//! the queue is full.

pub mod app;
pub mod tty;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::identity::Digest;
use crate::monitor::Pid;

/// Default retry schedule for sinks with no peer available.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 6] = [0, 10, 20, 50, 100, 250];

/// Default cap on sink deliveries running at once across all notices.
pub const DEFAULT_MAX_DELIVERIES: usize = 16;

/// What was blocked and who asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedNotice {
    /// Display name of the blocked application.
    pub name: String,
    /// Executable path that was denied.
    pub path: String,
    /// Content digest, when one was established.
    pub digest: Option<Digest>,
    /// Signing identifier of the blocked executable.
    pub signing_id: Option<String>,
    /// Parent of the process that attempted the exec.
    pub parent_pid: Pid,
    /// Controlling terminal of the attempting process, when known.
    pub tty: Option<PathBuf>,
}

/// Delivery failures reported by a sink.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// No receiver is reachable right now; worth retrying.
    #[error("no notice receiver available")]
    Unavailable,
    /// Delivery failed in a way retrying will not fix.
    #[error("notice delivery failed: {0}")]
    Failed(String),
}

/// A destination for denial notices.
#[async_trait]
pub trait NoticeSink: Send + Sync {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Deliver one notice.
    async fn deliver(&self, notice: &BlockedNotice) -> Result<(), NotifyError>;
}

/// Non-blocking submission side of the notifier.
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<BlockedNotice>,
}

impl NotifierHandle {
    /// Queue a notice. Drops it with a warning when the queue is full or the
    /// notifier has stopped.
    pub fn notify(&self, notice: BlockedNotice) {
        if let Err(e) = self.tx.try_send(notice) {
            warn!(error = %e, "dropping blocked notice");
        }
    }

    /// A handle whose notices go nowhere, plus the receiver to observe them.
    pub fn detached(capacity: usize) -> (Self, mpsc::Receiver<BlockedNotice>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

/// Fan-out task feeding notices to sinks.
pub struct Notifier {
    sinks: Vec<Arc<dyn NoticeSink>>,
    retry_delays: Arc<[Duration]>,
    max_deliveries: usize,
}

impl Notifier {
    /// Build with the given sinks and retry schedule.
    ///
    /// Each entry in `retry_delays` is one attempt, preceded by that delay.
    pub fn new(sinks: Vec<Arc<dyn NoticeSink>>, retry_delays: Vec<Duration>) -> Self {
        let retry_delays: Arc<[Duration]> = if retry_delays.is_empty() {
            Arc::from(vec![Duration::ZERO])
        } else {
            Arc::from(retry_delays)
        };
        Self {
            sinks,
            retry_delays,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    /// Cap how many sink deliveries, retries included, run at once.
    pub fn with_max_deliveries(mut self, max_deliveries: usize) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Start the fan-out task.
    ///
    /// Once `max_deliveries` are in flight the task stops draining the queue,
    /// so a burst of denials fills it and further notices are dropped by
    /// [`NotifierHandle::notify`].
    pub fn spawn(self, capacity: usize) -> (NotifierHandle, JoinHandle<()>) {
        let (handle, mut rx) = NotifierHandle::detached(capacity);
        let permits = Arc::new(Semaphore::new(self.max_deliveries));
        let task = tokio::spawn(async move {
            'notices: while let Some(notice) = rx.recv().await {
                for sink in &self.sinks {
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        break 'notices;
                    };
                    let sink = Arc::clone(sink);
                    let notice = notice.clone();
                    let delays = Arc::clone(&self.retry_delays);
                    tokio::spawn(async move {
                        let _permit = permit;
                        deliver_with_retry(sink, notice, delays).await;
                    });
                }
            }
            debug!("notifier stopped");
        });
        (handle, task)
    }
}

/// Try `sink` once per entry in `delays`. Returns whether it was delivered.
pub async fn deliver_with_retry(
    sink: Arc<dyn NoticeSink>,
    notice: BlockedNotice,
    delays: Arc<[Duration]>,
) -> bool {
    for (attempt, delay) in delays.iter().enumerate() {
        if !delay.is_zero() {
            tokio::time::sleep(*delay).await;
        }
        match sink.deliver(&notice).await {
            Ok(()) => {
                debug!(sink = sink.name(), attempt, path = %notice.path, "notice delivered");
                return true;
            }
            Err(NotifyError::Unavailable) => continue,
            Err(e) => {
                warn!(sink = sink.name(), path = %notice.path, error = %e, "notice delivery failed");
                return false;
            }
        }
    }
    debug!(
        sink = sink.name(),
        path = %notice.path,
        attempts = delays.len(),
        "no receiver available, notice dropped"
    );
    false
}

/// Display name for an executable: the enclosing `.app` bundle name when the
/// path is `…/Name.app/Contents/MacOS/bin`, else the file name.
pub fn app_name_for(path: &str) -> String {
    let path = std::path::Path::new(path);
    let bundle = path
        .ancestors()
        .find(|p| p.extension().is_some_and(|ext| ext == "app"));
    let named = bundle.unwrap_or(path);
    named
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
