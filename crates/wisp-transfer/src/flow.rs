/// Sender-side flow control, layered above the transport's own buffering.
///
/// Two gates must both be open before the next chunk goes out:
///   1. Ack window: at most `window` chunks sent but not yet acknowledged by
///      the receiver. Waits for a `chunk_ack`, re-checking every
///      `ack_fallback` in case an ack was lost to a bug rather than the link.
///   2. Transport buffer: after a payload is queued, if the link holds more
///      than `high_water` bytes the sender pauses until it drains to
///      `low_water` or below.
///
/// There is no retransmission; the transport is reliable and ordered.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::transport::PeerLink;
use wisp_types::protocol::{
    ACK_FALLBACK_INTERVAL, BUFFER_HIGH_WATER, BUFFER_LOW_WATER, DEFAULT_WINDOW, DRAIN_POLL_INTERVAL,
};

/// Flow control configuration.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Maximum unacknowledged chunks.
    pub window: usize,
    /// Re-check interval while the window is full.
    pub ack_fallback: Duration,
    /// Pause sending above this many buffered transport bytes.
    pub high_water: usize,
    /// Resume at or below this many buffered transport bytes.
    pub low_water: usize,
    /// Poll interval when the link has no drained notification.
    pub drain_poll: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            window: DEFAULT_WINDOW,
            ack_fallback: ACK_FALLBACK_INTERVAL,
            high_water: BUFFER_HIGH_WATER,
            low_water: BUFFER_LOW_WATER,
            drain_poll: DRAIN_POLL_INTERVAL,
        }
    }
}

/// A chunk the receiver has not confirmed yet.
#[derive(Debug, Clone, Copy)]
pub struct UnackedChunk {
    pub seq: u64,
    pub offset: u64,
    pub size: u64,
    pub sent_at: Instant,
}

pub struct FlowControl {
    config: FlowConfig,
    unacked: BTreeMap<u64, UnackedChunk>,
    peak_in_flight: usize,
    bytes_acked: u64,
    /// EWMA of send-to-ack time.
    smoothed_ack_rtt: Option<Duration>,
}

impl FlowControl {
    pub fn new(config: FlowConfig) -> Self {
        FlowControl {
            config,
            unacked: BTreeMap::new(),
            peak_in_flight: 0,
            bytes_acked: 0,
            smoothed_ack_rtt: None,
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn on_sent(&mut self, seq: u64, offset: u64, size: u64) {
        self.unacked.insert(
            seq,
            UnackedChunk {
                seq,
                offset,
                size,
                sent_at: Instant::now(),
            },
        );
        self.peak_in_flight = self.peak_in_flight.max(self.unacked.len());
    }

    /// Retire `seq`. Returns the chunk if it was outstanding; duplicate or
    /// unknown acks return `None` and change nothing.
    pub fn on_ack(&mut self, seq: u64) -> Option<UnackedChunk> {
        let chunk = self.unacked.remove(&seq)?;
        self.bytes_acked += chunk.size;

        let rtt = chunk.sent_at.elapsed();
        self.smoothed_ack_rtt = Some(match self.smoothed_ack_rtt {
            None => rtt,
            Some(prev) => (prev * 7 + rtt) / 8, // same weight as TCP's SRTT
        });
        Some(chunk)
    }

    pub fn window_full(&self) -> bool {
        self.unacked.len() >= self.config.window
    }

    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    pub fn smoothed_ack_rtt(&self) -> Option<Duration> {
        self.smoothed_ack_rtt
    }

    /// Oldest outstanding chunk, for stall diagnostics.
    pub fn oldest_unacked(&self) -> Option<&UnackedChunk> {
        self.unacked.values().next()
    }

    pub fn needs_drain(&self, buffered: usize) -> bool {
        buffered > self.config.high_water
    }

    pub fn is_drained(&self, buffered: usize) -> bool {
        buffered <= self.config.low_water
    }

    /// Wait for one drain signal: the link's notification if it has one,
    /// bounded by the poll interval either way.
    pub async fn drain_signal(&self, link: &dyn PeerLink) {
        match link.drained() {
            Some(notify) => {
                let _ = tokio::time::timeout(self.config.drain_poll, notify.notified()).await;
            }
            None => tokio::time::sleep(self.config.drain_poll).await,
        }
    }
}
