/// Host-facing handles for running sessions.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::TransferError;
use crate::events::SessionOutcome;

/// Commands a handle can enqueue for its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Stop,
    Accept,
}

struct HandleInner {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<SessionOutcome>,
}

impl HandleInner {
    fn send(&self, command: Command) {
        // A finished session has nothing left to stop.
        let _ = self.commands.send(command);
    }

    async fn join(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => SessionOutcome::Failed(TransferError::Aborted(e.to_string())),
        }
    }
}

/// Handle to an outbound session.
pub struct SendHandle {
    inner: HandleInner,
}

impl SendHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, task: JoinHandle<SessionOutcome>) -> Self {
        Self {
            inner: HandleInner { commands, task },
        }
    }

    /// Stop the session. Idempotent; a session that already ended ignores it.
    pub fn stop(&self) {
        self.inner.send(Command::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.task.is_finished()
    }

    /// Wait for the session to end.
    pub async fn join(self) -> SessionOutcome {
        self.inner.join().await
    }
}

/// Handle to an inbound session.
pub struct ReceiveHandle {
    inner: HandleInner,
}

impl ReceiveHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, task: JoinHandle<SessionOutcome>) -> Self {
        Self {
            inner: HandleInner { commands, task },
        }
    }

    /// Accept the offered files when the session was started with
    /// `require_confirmation`. Ignored otherwise.
    pub fn accept(&self) {
        self.inner.send(Command::Accept);
    }

    /// Stop the session. Idempotent; a session that already ended ignores it.
    pub fn stop(&self) {
        self.inner.send(Command::Stop);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.task.is_finished()
    }

    pub async fn join(self) -> SessionOutcome {
        self.inner.join().await
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
