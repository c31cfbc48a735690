use std::time::Duration;

use uuid::Uuid;
use wisp_types::ProtocolError;

use crate::transport::{RendezvousError, TransportError};

/// Coarse classification used by hosts to decide how loudly to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or options; surfaced before any network activity.
    Validation,
    /// The peer broke the wire contract.
    ProtocolViolation,
    /// Transport loss, timeouts, peer-reported errors, storage failures.
    Network,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("invalid code {0:?}: expected four letters, a hyphen and four digits")]
    InvalidCode(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("nothing to send")]
    NoFiles,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("message for session {got}, expected {expected}")]
    ForeignSession { expected: Uuid, got: Uuid },

    #[error("protocol version mismatch: local {local}, peer {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("no data from sender for {0:?}")]
    Stalled(Duration),

    #[error("no end_ack after {0} attempts")]
    EndAckExhausted(u32),

    #[error("file {index} incomplete: peer confirmed {received} of {size} bytes")]
    FileIncomplete { index: u32, received: u64, size: u64 },

    #[error("transfer incomplete: {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("peer disconnected: {0}")]
    Disconnected(String),

    #[error("peer reported error: {0}")]
    Remote(String),

    #[error("rendezvous: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("storage: {0}")]
    Io(String),

    #[error("session task ended abnormally: {0}")]
    Aborted(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCode(_) | Self::InvalidOptions(_) | Self::NoFiles => ErrorKind::Validation,
            Self::Protocol(_) | Self::ForeignSession { .. } => ErrorKind::ProtocolViolation,
            Self::VersionMismatch { .. }
            | Self::Timeout(_)
            | Self::Stalled(_)
            | Self::EndAckExhausted(_)
            | Self::FileIncomplete { .. }
            | Self::Incomplete { .. }
            | Self::Disconnected(_)
            | Self::Remote(_)
            | Self::Rendezvous(_)
            | Self::Transport(_)
            | Self::Io(_)
            | Self::Aborted(_) => ErrorKind::Network,
        }
    }

    /// Whether a host should present this prominently. Validation errors are
    /// the user's to fix and are reported quietly.
    pub fn is_alarming(&self) -> bool {
        self.kind() != ErrorKind::Validation
    }

    /// Whether the peer should hear about this failure with an `error` message.
    /// Failures that came from the peer or the link itself are not echoed back.
    pub(crate) fn reportable_to_peer(&self) -> bool {
        !matches!(
            self,
            Self::Remote(_) | Self::Transport(_) | Self::Disconnected(_) | Self::Rendezvous(_) | Self::Aborted(_)
        )
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<ProtocolError> for TransferError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
