/// Session tunables. Defaults are the wire constants from `wisp_types::protocol`.

use std::sync::Arc;
use std::time::Duration;

use wisp_types::protocol::{
    DEFAULT_CHUNK_SIZE, HANDSHAKE_TIMEOUT, HEARTBEAT_INTERVAL, REDUNDANT_END_ACK_DELAYS, WATCHDOG_TIMEOUT,
};

use crate::code::is_valid_code;
use crate::completion::EndAckPolicy;
use crate::error::TransferError;
use crate::flow::FlowConfig;
use crate::logging::{TracingLogger, TransferLogger};

/// Attempts at reserving a code before giving up.
pub const DEFAULT_CODE_ATTEMPTS: u32 = 4;

/// Time the sender keeps listening for a late `end_ack` after the peer closed.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Time the receiver allows the rendezvous to produce a link.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SendOptions {
    /// Use this code instead of generating one.
    pub code: Option<String>,
    pub max_code_attempts: u32,
    pub chunk_size: usize,
    pub flow: FlowConfig,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub end_ack: EndAckPolicy,
    pub close_grace: Duration,
    pub logger: Arc<dyn TransferLogger>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            code: None,
            max_code_attempts: DEFAULT_CODE_ATTEMPTS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            flow: FlowConfig::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            end_ack: EndAckPolicy::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
            logger: Arc::new(TracingLogger),
        }
    }
}

impl SendOptions {
    pub fn validate(&self) -> Result<(), TransferError> {
        if let Some(code) = &self.code {
            if !is_valid_code(code) {
                return Err(TransferError::InvalidCode(code.clone()));
            }
        }
        if self.max_code_attempts == 0 {
            return Err(TransferError::InvalidOptions("max_code_attempts must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidOptions("chunk_size must be non-zero".into()));
        }
        if self.flow.window == 0 {
            return Err(TransferError::InvalidOptions("window must be non-zero".into()));
        }
        if self.flow.low_water > self.flow.high_water {
            return Err(TransferError::InvalidOptions(format!(
                "low watermark {} above high watermark {}",
                self.flow.low_water, self.flow.high_water
            )));
        }
        if self.end_ack.attempts == 0 || self.end_ack.backoff < 1.0 {
            return Err(TransferError::InvalidOptions(
                "end_ack needs at least one attempt and a backoff of 1.0 or more".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(TransferError::InvalidOptions("heartbeat_interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ReceiveOptions {
    /// Wait for `ReceiveHandle::accept` before sending `ready`.
    pub require_confirmation: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub watchdog_timeout: Duration,
    /// Extra `end_ack`s after the first, measured from it.
    pub redundant_end_ack_delays: Vec<Duration>,
    pub logger: Arc<dyn TransferLogger>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        ReceiveOptions {
            require_confirmation: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            watchdog_timeout: WATCHDOG_TIMEOUT,
            redundant_end_ack_delays: REDUNDANT_END_ACK_DELAYS.to_vec(),
            logger: Arc::new(TracingLogger),
        }
    }
}

impl ReceiveOptions {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.watchdog_timeout.is_zero() {
            return Err(TransferError::InvalidOptions("watchdog_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
