// error.rs - error taxonomy shared by the agent and the client

use std::io;

use thiserror::Error;

use crate::correlator::PendingKey;
use crate::protocol::ErrorKind;

/// Errors surfaced by the relay, on either side of the control channel.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The ping intent was rejected before any packet was sent.
    #[error("invalid ping request: {0}")]
    InvalidIntent(String),

    /// The target host could not be resolved to a usable address.
    #[error("cannot resolve target {0}")]
    Unresolvable(String),

    /// A raw echo request could not be sent.
    #[error(transparent)]
    Transmit(#[from] TransmitError),

    /// Raw sockets are not available to this process.
    #[error("raw ICMP socket unavailable (are you root?): {0}")]
    Permission(#[source] io::Error),

    /// The shared raw transport stopped working.
    #[error("raw transport closed: {0}")]
    TransportClosed(String),

    /// Every session id is taken by a live session.
    #[error("agent busy: no free session id")]
    Busy,

    /// A control channel frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The control channel closed before the session completed.
    #[error("session incomplete: relay closed the connection after {received} result(s)")]
    IncompleteSession { received: usize },

    /// The agent reported an error instead of completing the session.
    #[error("relay error ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Maps this error onto the kind carried by an `Error` message on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidIntent(_) => ErrorKind::InvalidIntent,
            Self::Unresolvable(_) => ErrorKind::Unresolvable,
            Self::Transmit(_) | Self::TransportClosed(_) | Self::Permission(_) => {
                ErrorKind::TransportUnavailable
            }
            Self::Remote { kind, .. } => *kind,
            Self::Busy | Self::Protocol(_) | Self::IncompleteSession { .. } | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Failure to emit one raw echo request.
#[derive(Error, Debug)]
#[error("send echo request failed: {source}")]
pub struct TransmitError {
    #[from]
    source: io::Error,
}

impl TransmitError {
    pub fn new(source: io::Error) -> Self {
        Self { source }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }

    /// Whether the transport itself is unusable, as opposed to this one
    /// destination being unreachable right now.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.source.kind(),
            io::ErrorKind::PermissionDenied
                | io::ErrorKind::NotConnected
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::AddrNotAvailable
        )
    }
}

/// A request was registered twice under the same key while still pending.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("duplicate pending request for session {} sequence {}", .0.session, .0.sequence)]
pub struct DuplicateKey(pub PendingKey);
