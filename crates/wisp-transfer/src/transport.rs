/// Seams to the outside world: the rendezvous service that pairs peers by
/// code, and the ordered, reliable message link between them.
///
/// Frames on a link arrive in send order. Text frames carry JSON control
/// messages; binary frames carry chunk payloads.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::{Notify, mpsc};
use wisp_types::ProtocolMessage;

use crate::error::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something that happened on a link, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Frame(Frame),
    Closed,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("link closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RendezvousError {
    #[error("code {0} is already in use")]
    CodeTaken(String),
    #[error("no sender is waiting on code {0}")]
    NotFound(String),
    #[error("rendezvous unavailable: {0}")]
    Unavailable(String),
}

/// Sending half of a peer link.
pub trait PeerLink: Send + Sync {
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Bytes accepted by `send` but not yet handed to the peer.
    fn buffered_amount(&self) -> usize;

    /// Threshold at or below which `drained` is signalled.
    fn set_low_water_mark(&self, bytes: usize);

    /// Signalled when buffered bytes fall to the low-water mark. Links without
    /// this notification are polled instead.
    fn drained(&self) -> Option<Arc<Notify>> {
        None
    }

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// An open link to the peer plus its ordered event stream.
pub struct PeerConnection {
    pub link: Arc<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl PeerConnection {
    pub fn new(link: Arc<dyn PeerLink>, events: mpsc::UnboundedReceiver<ConnectionEvent>) -> Self {
        Self { link, events }
    }

    pub fn send_message(&self, msg: &ProtocolMessage) -> Result<(), TransferError> {
        send_message(self.link.as_ref(), msg)
    }
}

pub(crate) fn send_message(link: &dyn PeerLink, msg: &ProtocolMessage) -> Result<(), TransferError> {
    let text = msg.encode()?;
    link.send(Frame::Text(text))?;
    Ok(())
}

/// A code held by a sender. Receivers that connect with the code show up on
/// `next_connection`. Dropping the reservation releases the code.
pub struct Reservation {
    code: String,
    pub(crate) incoming: mpsc::UnboundedReceiver<PeerConnection>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl Reservation {
    pub fn new(
        code: impl Into<String>,
        incoming: mpsc::UnboundedReceiver<PeerConnection>,
        on_release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            code: code.into(),
            incoming,
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub async fn next_connection(&mut self) -> Option<PeerConnection> {
        self.incoming.recv().await
    }

    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.run_release();
    }
}

/// Pairs a sender and a receiver by a short human code.
pub trait Rendezvous: Send + Sync {
    /// Claim `code` for a sender. Fails with `CodeTaken` on collision.
    fn reserve<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<Reservation, RendezvousError>>;

    /// Open a link to the sender holding `code`.
    fn connect<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<PeerConnection, RendezvousError>>;
}
