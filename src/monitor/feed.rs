//! Newline-delimited JSON transport to an external event producer.
//!
//! The producer is the platform shim that owns the real kernel client. It
//! opens one stream per logical client, introduces itself with a `hello`
//! frame naming the role, then streams messages. Everything the engine sends
//! back (responses, mutes, subscriptions) travels as [`MonitorCommand`]
//! frames on the same stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Action, AuthMessage, AuthResponse, Event, EventKind, MonitorClient, MonitorError, PathMatch,
    ProcessInfo,
};
use crate::client::ClientRole;
use crate::policy::Verdict;

/// Buffered inbound messages per feed before the reader applies backpressure.
const MESSAGE_CHANNEL_CAPACITY: usize = 1024;

/// Code given to [`Event::Other`] when the producer's event carries none.
pub const UNKNOWN_EVENT_CODE: u32 = u32::MAX;

/// Errors establishing a feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Transport failure.
    #[error("feed I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The producer closed the stream before saying hello.
    #[error("producer closed the feed before the hello frame")]
    MissingHello,
    /// The first frame was not a valid hello.
    #[error("invalid hello frame: {0}")]
    BadHello(String),
}

/// Message as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Producer-assigned id, echoed in the response.
    pub id: u64,
    /// Auth or notify.
    #[serde(default = "default_action")]
    pub action: Action,
    /// Event payload, decoded by [`WireMessage::into_message`].
    pub event: Value,
    /// Originating process.
    pub process: ProcessInfo,
    /// Milliseconds left until the kernel deadline when the producer sent it.
    pub deadline_ms: u64,
}

fn default_action() -> Action {
    Action::Auth
}

impl WireMessage {
    /// Convert to an owned message, anchoring the deadline at `received`.
    ///
    /// An event the engine cannot decode becomes [`Event::Other`] so it is
    /// still answered.
    pub fn into_message(self, received: Instant) -> AuthMessage {
        let deadline = received
            .checked_add(Duration::from_millis(self.deadline_ms))
            .unwrap_or(received);
        AuthMessage {
            id: self.id,
            action: self.action,
            event: decode_event(&self.event),
            process: self.process,
            deadline,
        }
    }
}

/// Decode an event payload, falling back to [`Event::Other`].
pub fn decode_event(value: &Value) -> Event {
    match Event::deserialize(value) {
        Ok(event) => event,
        Err(e) => {
            let code = value
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|code| u32::try_from(code).ok())
                .unwrap_or(UNKNOWN_EVENT_CODE);
            debug!(
                kind = value.get("kind").and_then(serde_json::Value::as_str).unwrap_or("?"),
                code,
                error = %e,
                "undecodable event, treating as other"
            );
            Event::Other { code }
        }
    }
}

/// Id of an auth message whose frame failed to parse, if it owes a response.
fn unanswered_id(frame: &Value) -> Option<u64> {
    if frame.get("type").and_then(Value::as_str) == Some("hello") {
        return None;
    }
    if frame.get("action").and_then(Value::as_str) == Some("notify") {
        return None;
    }
    frame.get("id").and_then(Value::as_u64)
}

/// Frames sent by the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProducerFrame {
    /// First frame on every stream.
    Hello {
        /// Which logical client this stream carries.
        role: ClientRole,
    },
    /// A kernel message.
    Message(WireMessage),
}

/// Frames sent to the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorCommand {
    /// Answer message `id`.
    Respond {
        /// Message being answered.
        id: u64,
        /// The answer.
        response: AuthResponse,
    },
    /// Mute every event from `pid`.
    MuteProcess {
        /// Process to mute.
        pid: u32,
    },
    /// Clear all target-path mutes.
    UnmuteAllTargetPaths,
    /// Invert target-path muting.
    InvertTargetPathMuting,
    /// Mute (watch, once inverted) a target path.
    WatchPath {
        /// Path to watch.
        path: String,
        /// Literal or prefix.
        matching: PathMatch,
    },
    /// Subscribe to event kinds.
    Subscribe {
        /// Kinds to receive.
        kinds: Vec<EventKind>,
    },
}

/// [`MonitorClient`] backed by a feed stream.
///
/// Commands are queued on an unbounded channel drained by a writer task, so
/// no call ever blocks the caller.
#[derive(Debug, Clone)]
pub struct FeedMonitor {
    commands: mpsc::UnboundedSender<MonitorCommand>,
}

impl FeedMonitor {
    fn send(&self, command: MonitorCommand) -> Result<(), MonitorError> {
        self.commands
            .send(command)
            .map_err(|_| MonitorError::Disconnected)
    }
}

impl MonitorClient for FeedMonitor {
    fn respond(&self, message: &AuthMessage, response: AuthResponse) -> Result<(), MonitorError> {
        self.send(MonitorCommand::Respond {
            id: message.id,
            response,
        })
    }

    fn mute_self(&self) -> Result<(), MonitorError> {
        self.send(MonitorCommand::MuteProcess {
            pid: std::process::id(),
        })
    }

    fn unmute_all_target_paths(&self) -> Result<(), MonitorError> {
        self.send(MonitorCommand::UnmuteAllTargetPaths)
    }

    fn invert_target_path_muting(&self) -> Result<(), MonitorError> {
        self.send(MonitorCommand::InvertTargetPathMuting)
    }

    fn watch_path(&self, path: &str, matching: PathMatch) -> Result<(), MonitorError> {
        self.send(MonitorCommand::WatchPath {
            path: path.to_owned(),
            matching,
        })
    }

    fn subscribe(&self, kinds: &[EventKind]) -> Result<(), MonitorError> {
        self.send(MonitorCommand::Subscribe {
            kinds: kinds.to_vec(),
        })
    }
}

/// An established feed.
#[derive(Debug)]
pub struct FeedConnection {
    /// Role announced by the producer.
    pub role: ClientRole,
    /// Command side.
    pub monitor: Arc<FeedMonitor>,
    /// Inbound messages.
    pub messages: mpsc::Receiver<AuthMessage>,
}

/// Establish a feed over a connected Unix stream.
///
/// # Errors
///
/// Fails when the hello frame is missing or invalid.
pub async fn accept_stream(stream: UnixStream) -> Result<FeedConnection, FeedError> {
    let (reader, writer) = stream.into_split();
    accept(reader, writer).await
}

/// Establish a feed over any reader/writer pair.
///
/// Spawns one reader task and one writer task; both end when the stream
/// closes or the [`FeedConnection`] is dropped.
///
/// # Errors
///
/// Fails when the hello frame is missing or invalid.
pub async fn accept<R, W>(reader: R, writer: W) -> Result<FeedConnection, FeedError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    let hello = lines.next_line().await?.ok_or(FeedError::MissingHello)?;
    let role = match serde_json::from_str::<ProducerFrame>(&hello) {
        Ok(ProducerFrame::Hello { role }) => role,
        Ok(other) => return Err(FeedError::BadHello(format!("{other:?}"))),
        Err(e) => return Err(FeedError::BadHello(e.to_string())),
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);

    tokio::spawn(write_commands(writer, command_rx, role));

    let fallback_tx = command_tx.clone();
    tokio::spawn(async move {
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(role = %role, error = %e, "feed read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let received = Instant::now();
            let frame = match serde_json::from_str::<Value>(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(role = %role, error = %e, "dropping malformed feed frame");
                    continue;
                }
            };
            match ProducerFrame::deserialize(&frame) {
                Ok(ProducerFrame::Message(wire)) => {
                    if message_tx.send(wire.into_message(received)).await.is_err() {
                        break;
                    }
                }
                Ok(ProducerFrame::Hello { .. }) => {
                    warn!(role = %role, "ignoring repeated hello frame");
                }
                Err(e) => match unanswered_id(&frame) {
                    Some(id) => {
                        warn!(
                            role = %role,
                            id,
                            error = %e,
                            "malformed auth message, allowing"
                        );
                        let allow = MonitorCommand::Respond {
                            id,
                            response: AuthResponse::Auth {
                                verdict: Verdict::Allow,
                                cache: false,
                            },
                        };
                        if fallback_tx.send(allow).is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!(role = %role, error = %e, "dropping malformed feed frame");
                    }
                },
            }
        }
        debug!(role = %role, "feed reader finished");
    });

    Ok(FeedConnection {
        role,
        monitor: Arc::new(FeedMonitor {
            commands: command_tx,
        }),
        messages: message_rx,
    })
}

async fn write_commands<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<MonitorCommand>,
    role: ClientRole,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        let mut line = match serde_json::to_string(&command) {
            Ok(line) => line,
            Err(e) => {
                warn!(role = %role, error = %e, "failed to encode monitor command");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(role = %role, error = %e, "feed write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(role = %role, error = %e, "feed flush failed");
            break;
        }
    }
    debug!(role = %role, "feed writer finished");
}
