/// Transfer logging trait for structured per-session logs.
///
/// Sessions report protocol milestones and per-chunk traffic through a
/// `TransferLogger`, so a host can route them to tracing, a remote
/// collector, or nowhere.

use std::fmt;

use uuid::Uuid;

/// Structured log entry for one session.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub session_id: Option<Uuid>,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sender: code reserved with the rendezvous
    CodeReserved { code: String, attempt: u32 },
    /// Sender: code already held by someone else
    CodeCollision { code: String, attempt: u32 },
    /// Sender: extra connection turned away while busy
    ConnectionRejected { reason: String },
    /// Sender: fresher connection replaced an idle one
    ConnectionReplaced,
    /// Both: hello exchange done
    HandshakeComplete { protocol_version: u32 },
    /// Sender: chunk header and payload queued
    ChunkSent { seq: u64, size: u64, in_flight: usize },
    /// Sender: chunk acknowledged
    ChunkAcked { seq: u64, rtt_ms: u64 },
    /// Sender: ack window full
    WindowStall { in_flight: usize, smoothed_rtt_ms: Option<u64> },
    /// Sender: transport buffer over high-water mark
    BufferStall { buffered: usize },
    /// Receiver: chunk written through the sink
    ChunkWritten { seq: u64, received: u64 },
    /// Both: one file done
    FileComplete { index: u32, bytes: u64 },
    /// Sender: `end` sent
    EndAttempt { attempt: u32, timeout_ms: u64 },
    /// Sender: pong received
    HeartbeatRtt { rtt_ms: i64 },
    /// Both: reserved message received and ignored
    ReservedIgnored { tag: &'static str },
    /// Transfer complete
    TransferComplete { total_bytes: u64, duration_ms: u64, chunks: u64 },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CodeReserved { code, attempt } => {
                write!(f, "code_reserved code={} attempt={}", code, attempt)
            }
            Self::CodeCollision { code, attempt } => {
                write!(f, "code_collision code={} attempt={}", code, attempt)
            }
            Self::ConnectionRejected { reason } => {
                write!(f, "connection_rejected reason={}", reason)
            }
            Self::ConnectionReplaced => f.write_str("connection_replaced"),
            Self::HandshakeComplete { protocol_version } => {
                write!(f, "handshake_complete version={}", protocol_version)
            }
            Self::ChunkSent { seq, size, in_flight } => {
                write!(f, "chunk_sent seq={} size={} in_flight={}", seq, size, in_flight)
            }
            Self::ChunkAcked { seq, rtt_ms } => {
                write!(f, "chunk_acked seq={} rtt_ms={}", seq, rtt_ms)
            }
            Self::WindowStall {
                in_flight,
                smoothed_rtt_ms: Some(rtt),
            } => {
                write!(f, "window_stall in_flight={} srtt_ms={}", in_flight, rtt)
            }
            Self::WindowStall {
                in_flight,
                smoothed_rtt_ms: None,
            } => {
                write!(f, "window_stall in_flight={}", in_flight)
            }
            Self::BufferStall { buffered } => {
                write!(f, "buffer_stall buffered={}", buffered)
            }
            Self::ChunkWritten { seq, received } => {
                write!(f, "chunk_written seq={} received={}", seq, received)
            }
            Self::FileComplete { index, bytes } => {
                write!(f, "file_complete index={} bytes={}", index, bytes)
            }
            Self::EndAttempt { attempt, timeout_ms } => {
                write!(f, "end_attempt attempt={} timeout_ms={}", attempt, timeout_ms)
            }
            Self::HeartbeatRtt { rtt_ms } => {
                write!(f, "heartbeat rtt_ms={}", rtt_ms)
            }
            Self::ReservedIgnored { tag } => {
                write!(f, "reserved_ignored t={}", tag)
            }
            Self::TransferComplete { total_bytes, duration_ms, chunks } => {
                write!(f, "transfer_complete bytes={} duration_ms={} chunks={}", total_bytes, duration_ms, chunks)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can forward logs elsewhere,
/// write to tracing, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        let sid = entry.session_id.map(|id| id.to_string()).unwrap_or_default();
        // info for lifecycle milestones, debug for per-chunk spam
        match &entry.event {
            TransferEvent::ChunkSent { .. }
            | TransferEvent::ChunkAcked { .. }
            | TransferEvent::ChunkWritten { .. }
            | TransferEvent::HeartbeatRtt { .. } => {
                tracing::debug!(
                    component = entry.component,
                    session_id = %sid,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::Error { .. } | TransferEvent::ConnectionRejected { .. } => {
                tracing::warn!(
                    component = entry.component,
                    session_id = %sid,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    session_id = %sid,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
