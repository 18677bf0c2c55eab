//! Control server: accept loop, per-connection framing, and the session gate.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::handshake::{server_respond, KeyMaterial};
use super::protocol::{Request, ServerFrame};
use super::session::{ConnectionId, SessionRegistry};
use super::ControlError;
use crate::engine::Engine;

/// Serves privileged requests from authenticated peers.
#[derive(Debug)]
pub struct ControlServer {
    engine: Arc<Engine>,
    sessions: Arc<SessionRegistry>,
    keys: KeyMaterial,
}

impl ControlServer {
    /// Server over `engine`, tracking connections in `sessions`.
    pub fn new(engine: Arc<Engine>, sessions: Arc<SessionRegistry>, keys: KeyMaterial) -> Self {
        Self {
            engine,
            sessions,
            keys,
        }
    }

    /// Live sessions.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Bind the control socket.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be bound.
    pub fn bind(path: &Path) -> Result<UnixListener, ControlError> {
        Ok(crate::socket::bind_owner_only(path)?)
    }

    /// Apply one request from connection `conn`.
    ///
    /// Privileged requests on a connection that has not completed the
    /// handshake get [`ServerFrame::Unauthorized`] and change nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Handshake`] when an `authenticate` request
    /// fails verification; the caller must drop the connection.
    pub fn handle_request(
        &self,
        conn: ConnectionId,
        request: Request,
    ) -> Result<ServerFrame, ControlError> {
        if request.is_privileged() && !self.sessions.is_authenticated(conn) {
            warn!(conn = %conn, request = request.name(), "rejected unauthenticated request");
            return Ok(ServerFrame::Unauthorized);
        }

        let frame = match request {
            Request::Authenticate(proof) => {
                let reply = server_respond(&self.keys, &proof)?;
                self.sessions.mark_authenticated(conn);
                if let Some(pid) = self.sessions.peer_pid(conn) {
                    self.engine.set_main_app_pid(pid);
                }
                info!(conn = %conn, "control connection authenticated");
                ServerFrame::Authenticated(reply)
            }
            Request::ReplacePolicy { entries } => {
                self.engine.replace_policy(&entries);
                ServerFrame::Ack
            }
            Request::AllowTemporarily { digest } => {
                self.engine.allow_temporarily(digest);
                ServerFrame::Ack
            }
            Request::GrantCallerAccess { pid } => {
                if pid <= 0 {
                    return Ok(ServerFrame::Error {
                        message: format!("invalid pid {pid}"),
                    });
                }
                self.engine.grant_caller_access(pid);
                ServerFrame::Ack
            }
            Request::SetPreferredLanguage { code } => {
                let code = code.trim();
                if code.is_empty() {
                    return Ok(ServerFrame::Error {
                        message: "language code is empty".to_owned(),
                    });
                }
                self.engine.set_preferred_language(code);
                ServerFrame::Ack
            }
        };
        Ok(frame)
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle_connection(stream).await });
                    }
                    Err(e) => warn!(error = %e, "control accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("control server stopped");
    }

    /// Serve one connection until it closes or fails the handshake.
    pub async fn handle_connection(&self, stream: UnixStream) {
        let peer_pid = stream.peer_cred().ok().and_then(|cred| cred.pid());
        let (reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
        let conn = self.sessions.register(peer_pid, out_tx.clone());
        debug!(conn = %conn, ?peer_pid, "control connection opened");

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let mut line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "failed to encode control frame");
                        continue;
                    }
                };
                line.push('\n');
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(conn = %conn, error = %e, "control read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let request = match serde_json::from_str::<Request>(&line) {
                Ok(request) => request,
                Err(e) if self.sessions.is_authenticated(conn) => {
                    let _ = out_tx.send(ServerFrame::Error {
                        message: format!("malformed request: {e}"),
                    });
                    continue;
                }
                Err(e) => {
                    warn!(conn = %conn, error = %e, "malformed frame before handshake, closing");
                    let _ = out_tx.send(ServerFrame::Unauthorized);
                    break;
                }
            };
            match self.handle_request(conn, request) {
                Ok(frame) => {
                    if out_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(conn = %conn, error = %e, "control handshake failed, closing");
                    let _ = out_tx.send(ServerFrame::Unauthorized);
                    break;
                }
            }
        }

        self.sessions.remove(conn);
        drop(out_tx);
        if let Err(e) = writer_task.await {
            debug!(conn = %conn, error = %e, "control writer ended abnormally");
        }
        debug!(conn = %conn, "control connection closed");
    }
}
