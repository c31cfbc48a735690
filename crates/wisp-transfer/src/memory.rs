/// In-process rendezvous and transport.
///
/// Pairs sessions inside one process: `reserve` registers a code, `connect`
/// builds a pair of linked `PeerConnection`s and hands the listening half to
/// the reservation. Each direction is relayed by its own task, which keeps
/// frames in order, applies the configured latency, and tracks the sender's
/// buffered byte count for backpressure. Used by the loopback tool and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use uuid::Uuid;
use wisp_types::Side;

use crate::transport::{
    ConnectionEvent, Frame, PeerConnection, PeerLink, Rendezvous, RendezvousError, Reservation, TransportError,
};

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// One-way delay applied to every frame.
    pub latency: Duration,
    /// Whether links expose a drained notification or must be polled.
    pub drain_notification: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        MemoryOptions {
            latency: Duration::ZERO,
            drain_notification: true,
        }
    }
}

/// Copy of a frame as it is delivered, tagged with the side that sent it.
/// The reserving side is the sender.
#[derive(Debug, Clone)]
pub struct TapRecord {
    pub from: Side,
    pub frame: Frame,
}

#[derive(Clone)]
pub struct MemoryRendezvous {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    options: MemoryOptions,

    /// code -> (reservation id, listener channel)
    listeners: Mutex<HashMap<String, (Uuid, mpsc::UnboundedSender<PeerConnection>)>>,

    tap: Mutex<Option<mpsc::UnboundedSender<TapRecord>>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                options,
                listeners: Mutex::new(HashMap::new()),
                tap: Mutex::new(None),
            }),
        }
    }

    /// Observe every frame delivered on links created from now on.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<TapRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.tap.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    pub fn is_reserved(&self, code: &str) -> bool {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(code)
    }

    fn reserve_code(&self, code: &str) -> Result<Reservation, RendezvousError> {
        let mut listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners.contains_key(code) {
            return Err(RendezvousError::CodeTaken(code.to_string()));
        }
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(code.to_string(), (id, tx));

        let inner = Arc::downgrade(&self.inner);
        let owned = code.to_string();
        Ok(Reservation::new(code, rx, move || {
            let Some(inner) = inner.upgrade() else { return };
            let mut listeners = inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
            // Only release our own registration.
            if listeners.get(&owned).is_some_and(|(stored, _)| *stored == id) {
                listeners.remove(&owned);
            }
        }))
    }

    fn connect_code(&self, code: &str) -> Result<PeerConnection, RendezvousError> {
        let listener = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(code)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| RendezvousError::NotFound(code.to_string()))?;

        let (listening_half, connecting_half) = self.pair();
        listener
            .send(listening_half)
            .map_err(|_| RendezvousError::NotFound(code.to_string()))?;
        Ok(connecting_half)
    }

    /// Two connected halves: (listener side, connector side).
    fn pair(&self) -> (PeerConnection, PeerConnection) {
        let open = Arc::new(AtomicBool::new(true));
        let (listener_events_tx, listener_events_rx) = mpsc::unbounded_channel();
        let (connector_events_tx, connector_events_rx) = mpsc::unbounded_channel();

        let listener_link = self.half(Side::Sender, connector_events_tx, open.clone());
        let connector_link = self.half(Side::Receiver, listener_events_tx, open);
        (
            PeerConnection::new(listener_link, listener_events_rx),
            PeerConnection::new(connector_link, connector_events_rx),
        )
    }

    fn half(
        &self,
        from: Side,
        peer_events: mpsc::UnboundedSender<ConnectionEvent>,
        open: Arc<AtomicBool>,
    ) -> Arc<dyn PeerLink> {
        let (pipe_tx, pipe_rx) = mpsc::unbounded_channel();
        let link = Arc::new(MemoryLink {
            pipe: pipe_tx,
            open: open.clone(),
            buffered: Arc::new(AtomicUsize::new(0)),
            low_water: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            drain_notification: self.inner.options.drain_notification,
            latency: self.inner.options.latency,
        });
        let tap = self
            .inner
            .tap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let relay = Relay {
            from,
            peer_events,
            open,
            buffered: link.buffered.clone(),
            low_water: link.low_water.clone(),
            drained: link.drained.clone(),
            tap,
        };
        tokio::spawn(relay.run(pipe_rx));
        link
    }
}

impl Default for MemoryRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous for MemoryRendezvous {
    fn reserve<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<Reservation, RendezvousError>> {
        Box::pin(async move { self.reserve_code(code) })
    }

    fn connect<'a>(&'a self, code: &'a str) -> BoxFuture<'a, Result<PeerConnection, RendezvousError>> {
        Box::pin(async move { self.connect_code(code) })
    }
}

enum Pipe {
    Frame { frame: Frame, due: Instant },
    Close { due: Instant },
}

struct MemoryLink {
    pipe: mpsc::UnboundedSender<Pipe>,
    /// Shared by both halves: closing either end closes the pair.
    open: Arc<AtomicBool>,
    buffered: Arc<AtomicUsize>,
    low_water: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    drain_notification: bool,
    latency: Duration,
}

impl PeerLink for MemoryLink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        let due = Instant::now() + self.latency;
        self.pipe.send(Pipe::Frame { frame, due }).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn set_low_water_mark(&self, bytes: usize) {
        self.low_water.store(bytes, Ordering::Release);
    }

    fn drained(&self) -> Option<Arc<Notify>> {
        self.drain_notification.then(|| self.drained.clone())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.pipe.send(Pipe::Close {
                due: Instant::now() + self.latency,
            });
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

struct Relay {
    from: Side,
    peer_events: mpsc::UnboundedSender<ConnectionEvent>,
    open: Arc<AtomicBool>,
    buffered: Arc<AtomicUsize>,
    low_water: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    tap: Option<mpsc::UnboundedSender<TapRecord>>,
}

impl Relay {
    async fn run(self, mut pipe: mpsc::UnboundedReceiver<Pipe>) {
        while let Some(item) = pipe.recv().await {
            match item {
                Pipe::Frame { frame, due } => {
                    tokio::time::sleep_until(due).await;
                    let len = frame.len();
                    let left = self.buffered.fetch_sub(len, Ordering::AcqRel) - len;
                    if left <= self.low_water.load(Ordering::Acquire) {
                        self.drained.notify_one();
                    }
                    if let Some(tap) = &self.tap {
                        let _ = tap.send(TapRecord {
                            from: self.from,
                            frame: frame.clone(),
                        });
                    }
                    let _ = self.peer_events.send(ConnectionEvent::Frame(frame));
                }
                Pipe::Close { due } => {
                    tokio::time::sleep_until(due).await;
                    let _ = self.peer_events.send(ConnectionEvent::Closed);
                    return;
                }
            }
        }
        // Every handle to this half was dropped without an explicit close.
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.peer_events.send(ConnectionEvent::Closed);
        }
    }
}
