//! Error types for the relay core.

use crate::codec::CodecError;
use crate::config::{ProxyProtocol, TargetId};
use crate::session::{Handle, SessionId, SessionState};
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the session table and the state machines.
#[derive(Debug, Error)]
pub enum Error {
    /// Target unknown, disabled or without an endpoint
    #[error("{0} has no enabled endpoint")]
    TargetDisabled(TargetId),

    /// Endpoint connection limit reached; the caller may retry later
    #[error("{target} reached its limit of {limit} connections")]
    Capacity { target: TargetId, limit: u32 },

    /// Malformed or unsupported wire data
    #[error("protocol violation: {0}")]
    Protocol(#[from] CodecError),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("peer selected unsupported authentication method {0:#04x}")]
    UnexpectedMethod(u8),

    /// Credentials rejected, by us or by the upstream
    #[error("authentication failed")]
    Authentication,

    #[error("connect request refused with reply code {0:#04x}")]
    ConnectRejected(u8),

    /// Peer closed the stream in the middle of the handshake
    #[error("stream ended mid-handshake with {0} bytes buffered")]
    Truncated(usize),

    #[error("bytes received in state {0}")]
    UnexpectedInput(SessionState),

    #[error("session {session} cannot move from {from} to {to}")]
    InvalidTransition {
        session: SessionId,
        from: SessionState,
        to: SessionState,
    },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("invalid handle")]
    InvalidHandle,

    #[error("handle {handle} is bound to session {owner}")]
    HandleInUse { handle: Handle, owner: SessionId },

    #[error("session is not connected")]
    NotConnected,

    #[error("{0} endpoints cannot be driven by the SOCKS5 client")]
    UnsupportedProtocol(ProxyProtocol),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if the caller may simply retry later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Capacity { .. })
    }

    /// Check if this error is a credential mismatch
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Authentication)
    }

    /// Check if the peer broke the protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::NoAcceptableMethod
                | Error::UnexpectedMethod(_)
                | Error::ConnectRejected(_)
                | Error::Truncated(_)
                | Error::UnexpectedInput(_)
        )
    }
}
