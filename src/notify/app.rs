//! Notice pushed to the privileged application over the control channel.

use std::sync::Arc;

use async_trait::async_trait;

use super::{BlockedNotice, NoticeSink, NotifyError};
use crate::control::protocol::ServerFrame;
use crate::control::session::SessionRegistry;

/// Pushes notices to every authenticated control connection.
#[derive(Debug, Clone)]
pub struct AppSink {
    sessions: Arc<SessionRegistry>,
}

impl AppSink {
    /// Sink over the live session set.
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl NoticeSink for AppSink {
    fn name(&self) -> &'static str {
        "app"
    }

    async fn deliver(&self, notice: &BlockedNotice) -> Result<(), NotifyError> {
        let frame = ServerFrame::BlockedNotice {
            name: notice.name.clone(),
            path: notice.path.clone(),
            digest: notice.digest.clone(),
        };
        if self.sessions.broadcast_authenticated(&frame) == 0 {
            return Err(NotifyError::Unavailable);
        }
        Ok(())
    }
}
