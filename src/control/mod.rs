//! Authenticated control channel to the privileged application.

pub mod client;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod session;

use handshake::HandshakeError;

/// Control-channel failures.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Socket I/O failed.
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame did not encode or decode.
    #[error("invalid control frame: {0}")]
    Frame(#[from] serde_json::Error),
    /// The handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The peer closed the connection.
    #[error("control connection closed")]
    Closed,
    /// The engine refused a privileged request.
    #[error("request rejected: connection is not authenticated")]
    Unauthorized,
    /// The peer answered with something else than expected.
    #[error("unexpected reply: {0}")]
    Unexpected(String),
}
