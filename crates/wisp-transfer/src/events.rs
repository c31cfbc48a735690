/// What a session tells its host: one ordered channel of `SessionEvent`s and
/// a single terminal `SessionOutcome`.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;
use wisp_types::{FileDescriptor, Progress, Side};

use crate::error::TransferError;
use crate::state::{ReceiverState, SenderState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sender(SenderState),
    Receiver(ReceiverState),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Sender is about to try this code; it may still collide.
    CodeAttempt { code: String },
    /// Sender holds this code; share it with the receiver.
    CodeIssued { code: String },
    StateChanged(Phase),
    /// Receiver: the first file was announced. With confirmation enabled the
    /// session waits for `ReceiveHandle::accept`.
    FileOffered {
        session_id: Uuid,
        file: FileDescriptor,
        manifest: Vec<FileDescriptor>,
        total_size: u64,
        awaiting_confirmation: bool,
    },
    FileStarted { index: u32, file: FileDescriptor },
    FileFinished { index: u32, file: FileDescriptor, bytes: u64 },
    Progress(Progress),
    Completed(TransferSummary),
    Failed(TransferError),
    Cancelled { by: Side },
    /// The peer left before any data moved.
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    pub session_id: Uuid,
    pub files: u32,
    pub bytes: u64,
    pub chunks: u64,
    /// Most chunks ever unacknowledged at once (sender only).
    pub peak_in_flight: usize,
    pub elapsed: Duration,
}

/// How a session ended.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed(TransferSummary),
    Failed(TransferError),
    Cancelled(Side),
    /// Peer left before the transfer started.
    Disconnected,
    /// Stopped locally before a peer was attached.
    Closed,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    fn to_event(&self) -> Option<SessionEvent> {
        match self {
            Self::Completed(summary) => Some(SessionEvent::Completed(summary.clone())),
            Self::Failed(err) => Some(SessionEvent::Failed(err.clone())),
            Self::Cancelled(by) => Some(SessionEvent::Cancelled { by: *by }),
            Self::Disconnected => Some(SessionEvent::Disconnected),
            Self::Closed => None,
        }
    }
}

/// Event emitter owned by a session task. Delivers the terminal outcome at
/// most once; anything after it is swallowed.
pub(crate) struct Reporter {
    tx: mpsc::UnboundedSender<SessionEvent>,
    settled: bool,
}

impl Reporter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx, settled: false }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.settled {
            return;
        }
        // Host may have dropped the receiver; the session carries on regardless.
        let _ = self.tx.send(event);
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.tx.clone()
    }

    /// Report the terminal outcome. Returns false if one was already reported.
    pub(crate) fn settle(&mut self, outcome: &SessionOutcome) -> bool {
        if self.settled {
            tracing::debug!("outcome already reported, dropping {outcome:?}");
            return false;
        }
        if let Some(event) = outcome.to_event() {
            self.emit(event);
        }
        self.settled = true;
        true
    }

    /// Final `Closed`, always the last event.
    pub(crate) fn closed(&self) {
        let _ = self.tx.send(SessionEvent::Closed);
    }
}
