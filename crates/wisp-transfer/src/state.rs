/// Session state machines. Every mutation goes through `StateMachine::transition`,
/// which applies only the moves listed in the role's transition table and logs
/// and rejects the rest.

use std::fmt;

pub trait SessionState: Copy + Eq + fmt::Display {
    fn can_transition_to(self, next: Self) -> bool;

    fn is_terminal(self) -> bool;

    /// A peer link is attached and the session is past the rendezvous.
    fn is_active(self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Initializing,
    Listening,
    Handshaking,
    Negotiating,
    Transferring,
    Finishing,
    AwaitingAck,
    Completed,
    Cancelled,
    Closed,
}

impl SenderState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Listening => "listening",
            Self::Handshaking => "handshaking",
            Self::Negotiating => "negotiating",
            Self::Transferring => "transferring",
            Self::Finishing => "finishing",
            Self::AwaitingAck => "awaiting_ack",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
        }
    }

    /// States in which the sender emits heartbeat pings.
    pub fn heartbeat_enabled(self) -> bool {
        matches!(self, Self::Transferring | Self::Finishing | Self::AwaitingAck)
    }

    /// Once data is flowing, new connections are rejected instead of replacing
    /// the current one.
    pub fn is_committed(self) -> bool {
        matches!(self, Self::Transferring | Self::Finishing | Self::AwaitingAck)
    }
}

impl SessionState for SenderState {
    fn can_transition_to(self, next: Self) -> bool {
        use SenderState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Initializing, Listening) => true,
            (Listening, Handshaking) => true,
            (Handshaking, Negotiating | Handshaking | Listening | Cancelled) => true,
            (Negotiating, Transferring | Handshaking | Listening | Cancelled) => true,
            (Transferring, Finishing | Cancelled) => true,
            (Finishing, AwaitingAck | Cancelled) => true,
            (AwaitingAck, Completed | Cancelled) => true,
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Closed)
    }

    fn is_active(self) -> bool {
        matches!(
            self,
            Self::Handshaking | Self::Negotiating | Self::Transferring | Self::Finishing | Self::AwaitingAck
        )
    }
}

impl fmt::Display for SenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Initializing,
    Connecting,
    Handshaking,
    Negotiating,
    Transferring,
    Completed,
    Cancelled,
    Closed,
}

impl ReceiverState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Negotiating => "negotiating",
            Self::Transferring => "transferring",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Closed => "closed",
        }
    }
}

impl SessionState for ReceiverState {
    fn can_transition_to(self, next: Self) -> bool {
        use ReceiverState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Initializing, Connecting) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Negotiating | Cancelled) => true,
            (Negotiating, Transferring | Cancelled) => true,
            (Transferring, Completed | Cancelled) => true,
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Closed)
    }

    fn is_active(self) -> bool {
        matches!(self, Self::Handshaking | Self::Negotiating | Self::Transferring)
    }
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one session plus the guard that enforces its table.
#[derive(Debug)]
pub struct StateMachine<S> {
    role: &'static str,
    state: S,
}

impl<S: SessionState> StateMachine<S> {
    pub fn new(role: &'static str, initial: S) -> Self {
        Self { role, state: initial }
    }

    pub fn get(&self) -> S {
        self.state
    }

    /// Apply `next` if the table allows it. Returns whether the state changed.
    pub fn transition(&mut self, next: S) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!("{}: rejected transition {} -> {}", self.role, self.state, next);
            return false;
        }
        tracing::debug!("{}: {} -> {}", self.role, self.state, next);
        self.state = next;
        true
    }
}
