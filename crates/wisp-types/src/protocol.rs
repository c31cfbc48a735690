use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::FileDescriptor;

/// Wire protocol version. Peers must match exactly; there is no negotiation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default payload bytes per chunk (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of chunks a sender may have unacknowledged.
pub const DEFAULT_WINDOW: usize = 32;

/// Fallback re-poll interval while the ack window is full.
pub const ACK_FALLBACK_INTERVAL: Duration = Duration::from_secs(1);

/// Transport buffered bytes above which the sender pauses (8 MiB).
pub const BUFFER_HIGH_WATER: usize = 8 * 1024 * 1024;

/// Transport buffered bytes at or below which the sender resumes (1 MiB).
pub const BUFFER_LOW_WATER: usize = 1024 * 1024;

/// Poll interval used when the transport has no drained notification.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Sender heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed for the `hello` exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// First wait for `end_ack` / `file_end_ack`.
pub const END_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Number of `end` attempts before the sender gives up.
pub const END_ACK_ATTEMPTS: u32 = 3;

/// Growth of the `end_ack` wait per retry.
pub const END_ACK_BACKOFF: f64 = 1.5;

/// Receiver staleness watchdog, armed only while transferring.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(15);

/// Delays (after the first ack) of the redundant `end_ack`s a receiver sends.
pub const REDUNDANT_END_ACK_DELAYS: [Duration; 2] =
    [Duration::from_millis(100), Duration::from_millis(300)];

/// Error decoding a control frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Control messages exchanged between sender and receiver.
///
/// Serialized as JSON text frames with the discriminant in `t`, e.g.
/// `{"t":"chunk_ack","seq":4,"received":327680}`. A `Chunk` header is always
/// followed by exactly one binary frame of `size` bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProtocolMessage {
    /// First message from both peers once the link is open. The sender owns
    /// the session id and always includes `sessionId`; the receiver has none
    /// yet and leaves the field out. Receivers require it, senders ignore it.
    Hello {
        protocol_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
    },

    /// Manifest for multi-file sessions, sent before the first `Meta`.
    FileList {
        file_count: u32,
        files: Vec<FileDescriptor>,
        total_size: u64,
    },

    /// Announces the file whose chunks follow.
    Meta {
        session_id: Uuid,
        name: String,
        size: u64,
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_index: Option<u32>,
    },

    /// Receiver accepted the offer; the sender may start pumping chunks.
    Ready,

    /// Header for the binary payload that immediately follows.
    Chunk {
        seq: u64,
        offset: u64,
        size: u64,
        total: u64,
    },

    /// Payload `seq` was written; `received` is the file's byte count so far.
    ChunkAck { seq: u64, received: u64 },

    /// Last chunk of file `file_index` has been sent.
    FileEnd { file_index: u32 },

    /// Receiver's confirmation of a finished file.
    FileEndAck {
        file_index: u32,
        received: u64,
        size: u64,
    },

    /// Sender finished all files; `attempt` counts from 1.
    End { attempt: u32 },

    /// Receiver's confirmation that every byte arrived.
    EndAck { received: u64, total: u64 },

    Ping { timestamp: i64 },

    Pong { timestamp: i64 },

    /// Fatal condition reported by the peer.
    Error { message: String },

    /// The peer stopped the transfer.
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Reserved. Never sent; ignored on receipt.
    Resume,

    /// Reserved. Never sent; ignored on receipt.
    ResumeAck,
}

impl ProtocolMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire tag, for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::FileList { .. } => "file_list",
            Self::Meta { .. } => "meta",
            Self::Ready => "ready",
            Self::Chunk { .. } => "chunk",
            Self::ChunkAck { .. } => "chunk_ack",
            Self::FileEnd { .. } => "file_end",
            Self::FileEndAck { .. } => "file_end_ack",
            Self::End { .. } => "end",
            Self::EndAck { .. } => "end_ack",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
            Self::Resume => "resume",
            Self::ResumeAck => "resume_ack",
        }
    }

    /// Heartbeat probe stamped with the current wall clock.
    pub fn ping_now() -> Self {
        Self::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
