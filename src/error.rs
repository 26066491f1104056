//! Error types for the VNC server library.

use std::io;
use thiserror::Error;

/// Result type for VNC operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur in VNC server operations.
///
/// Every connection-scoped failure is confined to that connection: an error on one client's
/// thread never propagates to the hub or to any other connection.
#[derive(Debug, Error)]
pub enum VncError {
    /// I/O error occurred while reading or writing the socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection, or a message was cut short mid-read.
    #[error("connection closed")]
    ConnectionClosed,

    /// A malformed message, unsupported mandatory feature, or invalid dimension was seen.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// VNC authentication failed (bad password, or no response within the handshake timeout).
    #[error("authentication failed")]
    AuthFailure,

    /// The server already has `max_clients` connections established.
    #[error("too many clients")]
    ResourceLimit,

    /// The `ServerOptions` passed to `VncServer::new` are invalid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

impl VncError {
    /// True if this failure represents an ordinary disconnect rather than a protocol fault.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        match self {
            VncError::ConnectionClosed => true,
            VncError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
