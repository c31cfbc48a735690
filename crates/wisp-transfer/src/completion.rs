/// Completion handshake: the sender's bounded `end` retries and the checks
/// both sides apply before declaring success, plus the receiver's redundant
/// fire-and-forget re-acks.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use wisp_types::ProtocolMessage;
use wisp_types::protocol::{END_ACK_ATTEMPTS, END_ACK_BACKOFF, END_ACK_TIMEOUT};

use crate::error::TransferError;
use crate::transport::{PeerLink, send_message};

/// How long the sender waits for `end_ack`, and how often it asks.
#[derive(Debug, Clone, Copy)]
pub struct EndAckPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: f64,
}

impl Default for EndAckPolicy {
    fn default() -> Self {
        EndAckPolicy {
            timeout: END_ACK_TIMEOUT,
            attempts: END_ACK_ATTEMPTS,
            backoff: END_ACK_BACKOFF,
        }
    }
}

impl EndAckPolicy {
    /// Wait for attempt `attempt` (1-based): `timeout * backoff^(attempt-1)`.
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        self.timeout.mul_f64(self.backoff.powi(exp))
    }

    /// Total time before the sender gives up.
    pub fn budget(&self) -> Duration {
        (1..=self.attempts).map(|a| self.timeout_for(a)).sum()
    }
}

/// Sender side: an `end_ack` counts only if both of its numbers equal what
/// was sent.
pub fn verify_end_ack(received: u64, total: u64, expected: u64) -> Result<(), TransferError> {
    if received == expected && total == expected {
        Ok(())
    } else {
        Err(TransferError::Incomplete {
            received,
            expected,
        })
    }
}

/// Receiver side: never acknowledge `end` unless every byte was written.
pub fn verify_received(received: u64, expected: u64) -> Result<(), TransferError> {
    if received == expected {
        Ok(())
    } else {
        Err(TransferError::Incomplete { received, expected })
    }
}

/// Send `ack` again after each delay (measured from now, not cumulatively),
/// then close the link. Failures are ignored: the sender may already be gone.
/// Only the link is touched, never session state.
pub fn spawn_redundant_acks(
    link: Arc<dyn PeerLink>,
    ack: ProtocolMessage,
    delays: Vec<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        for delay in delays {
            tokio::time::sleep_until(start + delay).await;
            if !link.is_open() {
                return;
            }
            if let Err(e) = send_message(link.as_ref(), &ack) {
                tracing::trace!("redundant end_ack not sent: {e}");
                return;
            }
        }
        link.close();
    })
}
