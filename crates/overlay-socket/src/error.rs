//! Socket error taxonomy.
//!
//! Every blocking call either succeeds or fails with one of these; nothing is
//! retried here. A rejected handshake is never reported to the initiator
//! (the acceptor stays silent), so initiators observe it as `Timeout`.

use overlay_protocol::ProtocolError;

use crate::channel::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("socket is not bound")]
    NotBound,
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is already bound")]
    AlreadyBound,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transport failure: {0}")]
    TransportFailure(#[from] ChannelError),
    /// Admission failure. Never surfaced to the initiator, which only sees
    /// the missing response as `Timeout`.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(&'static str),
    #[error("socket is closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SocketError {
    pub fn timeout(operation: &'static str) -> Self {
        SocketError::Timeout { operation }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        SocketError::InvalidArgument(reason.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SocketError::Timeout { .. })
    }
}

pub type Result<T, E = SocketError> = std::result::Result<T, E>;
