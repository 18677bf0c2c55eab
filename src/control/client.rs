//! Client side of the control channel, used by `execguard-ctl`.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use super::handshake::{ClientHandshake, KeyMaterial};
use super::protocol::{Request, ServerFrame};
use super::ControlError;

/// A connection to the engine's control socket.
#[derive(Debug)]
pub struct ControlClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    /// Connect to `path`.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be reached.
    pub async fn connect(path: &Path) -> Result<Self, ControlError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Run the handshake with `keys`.
    ///
    /// # Errors
    ///
    /// Fails when the engine rejects our proof or its own proof does not
    /// verify. The connection must not be used afterwards.
    pub async fn authenticate(&mut self, keys: &KeyMaterial) -> Result<(), ControlError> {
        let (handshake, proof) = ClientHandshake::start(keys);
        match self.request(&Request::Authenticate(proof)).await? {
            ServerFrame::Authenticated(reply) => {
                handshake.finish(&reply)?;
                debug!("control channel authenticated");
                Ok(())
            }
            ServerFrame::Unauthorized => Err(ControlError::Unauthorized),
            other => Err(ControlError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Send `request` and wait for its reply, skipping pushed notices.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, malformed frames, or a closed connection.
    pub async fn request(&mut self, request: &Request) -> Result<ServerFrame, ControlError> {
        self.send(request).await?;
        loop {
            match self.next_frame().await? {
                ServerFrame::BlockedNotice { path, .. } => {
                    debug!(path = %path, "skipping pushed notice while awaiting reply");
                }
                frame => return Ok(frame),
            }
        }
    }

    /// Send a privileged request and require an acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Unauthorized`] when the connection is not
    /// authenticated and [`ControlError::Unexpected`] for any other reply.
    pub async fn call(&mut self, request: &Request) -> Result<(), ControlError> {
        match self.request(request).await? {
            ServerFrame::Ack => Ok(()),
            ServerFrame::Unauthorized => Err(ControlError::Unauthorized),
            ServerFrame::Error { message } => Err(ControlError::Unexpected(message)),
            other => Err(ControlError::Unexpected(format!("{other:?}"))),
        }
    }

    /// Next frame from the engine.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Closed`] once the engine hangs up.
    pub async fn next_frame(&mut self) -> Result<ServerFrame, ControlError> {
        loop {
            let line = self.lines.next_line().await?.ok_or(ControlError::Closed)?;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(&line)?);
        }
    }

    async fn send(&mut self, request: &Request) -> Result<(), ControlError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
