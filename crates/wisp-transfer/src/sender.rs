/// Outbound session.
///
/// ```text
/// reserve code -> listening -> hello -> file_list? + meta -> ready
///   -> [chunk header + payload]* (per file, gated by flow control)
///   -> file_end / file_end_ack (multi-file only)
///   -> end{attempt} ... end_ack -> completed
/// ```
///
/// The session runs as one task. It suspends only at explicit waits (ack
/// window, transport drain, handshake and end-ack replies) and observes
/// `stop()` at each of them, plus between chunks.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use uuid::Uuid;
use wisp_types::{FileDescriptor, PROTOCOL_VERSION, Progress, ProtocolMessage, Side};

use crate::completion::verify_end_ack;
use crate::config::SendOptions;
use crate::error::TransferError;
use crate::events::{Phase, Reporter, SessionEvent, SessionOutcome, TransferSummary};
use crate::files::FileSource;
use crate::flow::FlowControl;
use crate::logging::{TransferEvent, TransferLog};
use crate::session::{Command, SendHandle, sleep_until_or_never};
use crate::state::{SenderState, SessionState, StateMachine};
use crate::transport::{
    ConnectionEvent, Frame, PeerConnection, PeerLink, Rendezvous, RendezvousError, Reservation, TransportError,
    send_message,
};

const COMPONENT: &str = "sender";

/// Start an outbound session. Fails synchronously, before any network
/// activity, if there is nothing to send or the options are inconsistent.
/// Must be called from within a tokio runtime.
pub fn start_send(
    files: Vec<Arc<dyn FileSource>>,
    rendezvous: Arc<dyn Rendezvous>,
    code_generator: impl FnMut() -> String + Send + 'static,
    options: SendOptions,
) -> Result<(SendHandle, mpsc::UnboundedReceiver<SessionEvent>), TransferError> {
    if files.is_empty() {
        return Err(TransferError::NoFiles);
    }
    options.validate()?;

    let descriptors: Vec<FileDescriptor> = files.iter().map(|f| f.descriptor()).collect();
    let total_size = descriptors.iter().map(|d| d.size).sum();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let session = SenderSession {
        session_id: Uuid::new_v4(),
        files,
        descriptors,
        total_size,
        rendezvous,
        codes: Box::new(code_generator),
        flow: FlowControl::new(options.flow.clone()),
        options,
        state: StateMachine::new(COMPONENT, SenderState::Initializing),
        reporter: Reporter::new(events_tx),
        commands: commands_rx,
        commands_closed: false,
        reservation: None,
        incoming_closed: false,
        conn: None,
        peer_closed: false,
        closed_at: None,
        next_seq: 0,
        chunks_sent: 0,
        next_ping: Instant::now(),
        started: Instant::now(),
    };
    let task = tokio::spawn(session.run());
    Ok((SendHandle::new(commands_tx, task), events_rx))
}

/// Why the session stopped making progress.
enum Halt {
    Failed(TransferError),
    Cancelled(Side),
    /// Local stop before any peer was attached.
    Stopped,
    /// A fresher connection arrived before the transfer started.
    Replaced(PeerConnection),
    /// The receiver went away before the transfer started.
    PeerLeft,
}

impl From<TransferError> for Halt {
    fn from(e: TransferError) -> Self {
        Halt::Failed(e)
    }
}

enum Input {
    Message(ProtocolMessage),
    /// The deadline passed, or the peer closed during the `end_ack` grace.
    /// Callers recheck their clocks.
    Timeout,
}

enum Wake {
    Command(Option<Command>),
    Event(Option<ConnectionEvent>),
    Incoming(Option<PeerConnection>),
    Heartbeat,
    Deadline,
}

struct SenderSession {
    session_id: Uuid,
    files: Vec<Arc<dyn FileSource>>,
    descriptors: Vec<FileDescriptor>,
    total_size: u64,
    rendezvous: Arc<dyn Rendezvous>,
    codes: Box<dyn FnMut() -> String + Send>,
    options: SendOptions,
    flow: FlowControl,
    state: StateMachine<SenderState>,
    reporter: Reporter,

    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,

    reservation: Option<Reservation>,
    incoming_closed: bool,

    /// The one active peer connection.
    conn: Option<PeerConnection>,
    peer_closed: bool,
    /// When the peer closed while we were awaiting `end_ack`.
    closed_at: Option<Instant>,

    next_seq: u64,
    chunks_sent: u64,
    next_ping: Instant,
    started: Instant,
}

impl SenderSession {
    async fn run(mut self) -> SessionOutcome {
        let result = self.drive().await;
        self.finish(result)
    }

    async fn drive(&mut self) -> Result<TransferSummary, Halt> {
        self.reserve_code().await?;
        let mut conn = self.wait_for_receiver().await?;
        loop {
            match self.establish(conn).await {
                Ok(()) => break,
                Err(Halt::Replaced(next)) => {
                    self.log(TransferEvent::ConnectionReplaced);
                    conn = next;
                }
                Err(Halt::PeerLeft) => {
                    tracing::info!("sender {}: receiver left before the transfer started", self.session_id);
                    self.detach();
                    self.reporter.emit(SessionEvent::Disconnected);
                    self.enter(SenderState::Listening);
                    conn = self.wait_for_receiver().await?;
                }
                Err(halt) => return Err(halt),
            }
        }
        self.pump_files().await?;
        self.complete().await
    }

    // ── Rendezvous ─────────────────────────────────────────────────────

    async fn reserve_code(&mut self) -> Result<(), Halt> {
        let mut code = match &self.options.code {
            Some(code) => code.clone(),
            None => (self.codes)(),
        };
        let attempts = self.options.max_code_attempts;

        for attempt in 1..=attempts {
            self.reporter.emit(SessionEvent::CodeAttempt { code: code.clone() });

            let result = {
                let rendezvous = self.rendezvous.clone();
                let mut reserve = rendezvous.reserve(&code);
                loop {
                    let wake = tokio::select! {
                        biased;
                        cmd = self.commands.recv(), if !self.commands_closed => Err(cmd),
                        result = &mut reserve => Ok(result),
                    };
                    match wake {
                        Ok(result) => break result,
                        Err(Some(cmd)) => self.on_command(cmd)?,
                        Err(None) => self.commands_closed = true,
                    }
                }
            };

            match result {
                Ok(reservation) => {
                    self.log(TransferEvent::CodeReserved {
                        code: code.clone(),
                        attempt,
                    });
                    self.reservation = Some(reservation);
                    self.reporter.emit(SessionEvent::CodeIssued { code });
                    self.enter(SenderState::Listening);
                    return Ok(());
                }
                Err(RendezvousError::CodeTaken(_)) if attempt < attempts => {
                    self.log(TransferEvent::CodeCollision { code, attempt });
                    code = (self.codes)();
                }
                Err(e) => return Err(TransferError::from(e).into()),
            }
        }
        Err(TransferError::Rendezvous(RendezvousError::Unavailable(format!(
            "no free code after {attempts} attempts"
        )))
        .into())
    }

    async fn wait_for_receiver(&mut self) -> Result<PeerConnection, Halt> {
        loop {
            let wake = {
                let Some(reservation) = self.reservation.as_mut() else {
                    return Err(TransferError::Rendezvous(RendezvousError::Unavailable("code released".into())).into());
                };
                tokio::select! {
                    biased;
                    cmd = self.commands.recv(), if !self.commands_closed => Wake::Command(cmd),
                    conn = reservation.incoming.recv() => Wake::Incoming(conn),
                }
            };
            match wake {
                Wake::Command(Some(cmd)) => self.on_command(cmd)?,
                Wake::Command(None) => self.commands_closed = true,
                Wake::Incoming(Some(conn)) => return Ok(conn),
                Wake::Incoming(None) => {
                    self.incoming_closed = true;
                    return Err(
                        TransferError::Rendezvous(RendezvousError::Unavailable("rendezvous went away".into())).into(),
                    );
                }
                Wake::Event(_) | Wake::Heartbeat | Wake::Deadline => {}
            }
        }
    }

    // ── Handshake and negotiation ──────────────────────────────────────

    async fn establish(&mut self, conn: PeerConnection) -> Result<(), Halt> {
        self.attach(conn);
        self.enter(SenderState::Handshaking);
        self.send(&ProtocolMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            session_id: Some(self.session_id),
        })?;

        let deadline = Instant::now() + self.options.handshake_timeout;
        loop {
            match self.next_input(Some(deadline)).await? {
                Input::Message(ProtocolMessage::Hello { protocol_version, .. }) => {
                    if protocol_version != PROTOCOL_VERSION {
                        return Err(TransferError::VersionMismatch {
                            local: PROTOCOL_VERSION,
                            remote: protocol_version,
                        }
                        .into());
                    }
                    break;
                }
                Input::Message(other) => self.unexpected(&other),
                Input::Timeout => return Err(TransferError::Timeout("hello").into()),
            }
        }
        self.log(TransferEvent::HandshakeComplete {
            protocol_version: PROTOCOL_VERSION,
        });

        self.enter(SenderState::Negotiating);
        if self.is_multi_file() {
            self.send(&ProtocolMessage::FileList {
                file_count: self.descriptors.len() as u32,
                files: self.descriptors.clone(),
                total_size: self.total_size,
            })?;
        }
        let meta = self.meta_for(0);
        self.send(&meta)?;

        // No deadline: the receiver may be waiting on its user.
        loop {
            match self.next_input(None).await? {
                Input::Message(ProtocolMessage::Ready) => break,
                Input::Message(other) => self.unexpected(&other),
                Input::Timeout => {}
            }
        }
        self.enter(SenderState::Transferring);
        self.next_ping = Instant::now() + self.options.heartbeat_interval;
        Ok(())
    }

    fn meta_for(&self, index: usize) -> ProtocolMessage {
        let file = &self.descriptors[index];
        ProtocolMessage::Meta {
            session_id: self.session_id,
            name: file.name.clone(),
            size: file.size,
            mime: file.mime.clone(),
            file_index: self.is_multi_file().then_some(index as u32),
        }
    }

    fn is_multi_file(&self) -> bool {
        self.descriptors.len() > 1
    }

    // ── Chunk pump ─────────────────────────────────────────────────────

    async fn pump_files(&mut self) -> Result<(), Halt> {
        for i in 0..self.files.len() {
            let source = self.files[i].clone();
            let file = self.descriptors[i].clone();
            let index = i as u32;
            if index > 0 {
                let meta = self.meta_for(i);
                self.send(&meta)?;
            }
            self.reporter.emit(SessionEvent::FileStarted {
                index,
                file: file.clone(),
            });

            let mut offset = 0u64;
            while offset < file.size {
                self.poll_pending()?;
                self.wait_for_window().await?;

                let len = (file.size - offset).min(self.options.chunk_size as u64);
                let data = source.read_range(offset, len as usize).await.map_err(TransferError::from)?;
                if data.len() as u64 != len {
                    return Err(TransferError::Io(format!(
                        "short read from {}: {} of {} bytes at offset {}",
                        file.name,
                        data.len(),
                        len,
                        offset
                    ))
                    .into());
                }
                // The read may have taken a while; honour a stop that came in meanwhile.
                self.poll_pending()?;

                let seq = self.next_seq;
                self.send(&ProtocolMessage::Chunk {
                    seq,
                    offset,
                    size: len,
                    total: file.size,
                })?;
                self.send_payload(data)?;
                self.flow.on_sent(seq, offset, len);
                self.next_seq += 1;
                self.chunks_sent += 1;
                offset += len;
                self.log(TransferEvent::ChunkSent {
                    seq,
                    size: len,
                    in_flight: self.flow.in_flight(),
                });

                self.wait_for_drain().await?;
            }

            if self.is_multi_file() {
                self.await_file_end_ack(index, file.size).await?;
            }
            self.log(TransferEvent::FileComplete { index, bytes: file.size });
            let bytes = file.size;
            self.reporter.emit(SessionEvent::FileFinished { index, file, bytes });
        }
        Ok(())
    }

    async fn wait_for_window(&mut self) -> Result<(), Halt> {
        if self.flow.window_full() {
            self.log(TransferEvent::WindowStall {
                in_flight: self.flow.in_flight(),
                smoothed_rtt_ms: self.flow.smoothed_ack_rtt().map(|rtt| rtt.as_millis() as u64),
            });
        }
        while self.flow.window_full() {
            let deadline = Instant::now() + self.flow.config().ack_fallback;
            match self.next_input(Some(deadline)).await? {
                Input::Message(msg) => self.on_transfer_message(msg)?,
                Input::Timeout => {
                    if let Some(oldest) = self.flow.oldest_unacked() {
                        tracing::debug!(
                            "sender {}: window still full, oldest unacked seq={} sent {:?} ago",
                            self.session_id,
                            oldest.seq,
                            oldest.sent_at.elapsed()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn wait_for_drain(&mut self) -> Result<(), Halt> {
        let link = self.link()?;
        let buffered = link.buffered_amount();
        if !self.flow.needs_drain(buffered) {
            return Ok(());
        }
        self.log(TransferEvent::BufferStall { buffered });
        link.set_low_water_mark(self.flow.config().low_water);

        while !self.flow.is_drained(link.buffered_amount()) {
            // A closed link never drains; its close event is picked up by the next wait.
            if !link.is_open() {
                break;
            }
            let wake = {
                let signal = self.flow.drain_signal(link.as_ref());
                tokio::select! {
                    biased;
                    cmd = self.commands.recv(), if !self.commands_closed => Some(cmd),
                    _ = signal => None,
                }
            };
            match wake {
                Some(Some(cmd)) => self.on_command(cmd)?,
                Some(None) => self.commands_closed = true,
                None => {}
            }
        }
        Ok(())
    }

    async fn await_file_end_ack(&mut self, index: u32, size: u64) -> Result<(), Halt> {
        self.send(&ProtocolMessage::FileEnd { file_index: index })?;
        let deadline = Instant::now() + self.options.end_ack.timeout;
        loop {
            match self.next_input(Some(deadline)).await? {
                Input::Message(ProtocolMessage::FileEndAck {
                    file_index, received, ..
                }) if file_index == index => {
                    if received != size {
                        return Err(TransferError::FileIncomplete { index, received, size }.into());
                    }
                    return Ok(());
                }
                Input::Message(msg) => self.on_transfer_message(msg)?,
                Input::Timeout => return Err(TransferError::Timeout("file_end_ack").into()),
            }
        }
    }

    // ── Completion ─────────────────────────────────────────────────────

    async fn complete(&mut self) -> Result<TransferSummary, Halt> {
        self.enter(SenderState::Finishing);
        let policy = self.options.end_ack;

        for attempt in 1..=policy.attempts {
            let timeout = policy.timeout_for(attempt);
            self.log(TransferEvent::EndAttempt {
                attempt,
                timeout_ms: timeout.as_millis() as u64,
            });
            if !self.peer_closed {
                self.send(&ProtocolMessage::End { attempt })?;
            }
            if attempt == 1 {
                self.enter(SenderState::AwaitingAck);
            }

            let deadline = Instant::now() + timeout;
            loop {
                let grace_end = self.closed_at.map(|at| at + self.options.close_grace);
                let wait_until = grace_end.map_or(deadline, |g| g.min(deadline));
                match self.next_input(Some(wait_until)).await? {
                    Input::Message(ProtocolMessage::EndAck { received, total }) => {
                        verify_end_ack(received, total, self.total_size)?;
                        self.enter(SenderState::Completed);
                        return Ok(self.summary());
                    }
                    Input::Message(msg) => self.on_transfer_message(msg)?,
                    Input::Timeout => {
                        let now = Instant::now();
                        let grace_end = self.closed_at.map(|at| at + self.options.close_grace);
                        if grace_end.is_some_and(|g| now >= g) {
                            return Err(TransferError::Disconnected("closed while awaiting end_ack".into()).into());
                        }
                        if now >= deadline {
                            break;
                        }
                    }
                }
            }
            tracing::warn!("sender {}: no end_ack for attempt {attempt}", self.session_id);
        }
        Err(TransferError::EndAckExhausted(policy.attempts).into())
    }

    fn summary(&self) -> TransferSummary {
        TransferSummary {
            session_id: self.session_id,
            files: self.files.len() as u32,
            bytes: self.total_size,
            chunks: self.chunks_sent,
            peak_in_flight: self.flow.peak_in_flight(),
            elapsed: self.started.elapsed(),
        }
    }

    // ── Input ──────────────────────────────────────────────────────────

    /// Wait for the next protocol message that needs the caller's attention.
    /// Commands, heartbeats, extra connections and housekeeping messages are
    /// handled here.
    async fn next_input(&mut self, deadline: Option<Instant>) -> Result<Input, Halt> {
        loop {
            let wake = {
                let Some(conn) = self.conn.as_mut() else {
                    return Err(TransferError::Disconnected("no peer connection".into()).into());
                };
                let heartbeat = self.state.get().heartbeat_enabled();
                let incoming_open = !self.incoming_closed;
                let incoming = self.reservation.as_mut().map(|r| &mut r.incoming);
                tokio::select! {
                    biased;
                    cmd = self.commands.recv(), if !self.commands_closed => Wake::Command(cmd),
                    event = conn.events.recv(), if !self.peer_closed => Wake::Event(event),
                    extra = recv_incoming(incoming), if incoming_open => Wake::Incoming(extra),
                    _ = tokio::time::sleep_until(self.next_ping), if heartbeat => Wake::Heartbeat,
                    _ = sleep_until_or_never(deadline) => Wake::Deadline,
                }
            };
            match wake {
                Wake::Command(Some(cmd)) => self.on_command(cmd)?,
                Wake::Command(None) => self.commands_closed = true,
                Wake::Event(Some(event)) => {
                    if let Some(msg) = self.on_connection_event(event)? {
                        return Ok(Input::Message(msg));
                    }
                    if self.peer_closed {
                        return Ok(Input::Timeout);
                    }
                }
                Wake::Event(None) => {
                    self.on_peer_closed("connection dropped")?;
                    return Ok(Input::Timeout);
                }
                Wake::Incoming(Some(extra)) => self.on_incoming(extra)?,
                Wake::Incoming(None) => self.incoming_closed = true,
                Wake::Heartbeat => {
                    self.send_ping()?;
                    if self.peer_closed {
                        return Ok(Input::Timeout);
                    }
                }
                Wake::Deadline => return Ok(Input::Timeout),
            }
        }
    }

    /// Drain whatever is already queued without waiting. Runs between chunks
    /// so a stop or a peer cancellation takes effect before the next send.
    fn poll_pending(&mut self) -> Result<(), Halt> {
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => self.on_command(cmd)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.commands_closed = true;
                    break;
                }
            }
        }
        loop {
            let next = match self.reservation.as_mut() {
                Some(r) if !self.incoming_closed => r.incoming.try_recv(),
                _ => break,
            };
            match next {
                Ok(extra) => self.on_incoming(extra)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.incoming_closed = true;
                    break;
                }
            }
        }
        loop {
            let next = match self.conn.as_mut() {
                Some(conn) if !self.peer_closed => conn.events.try_recv(),
                _ => break,
            };
            match next {
                Ok(event) => {
                    if let Some(msg) = self.on_connection_event(event)? {
                        self.on_transfer_message(msg)?;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.on_peer_closed("connection dropped")?,
            }
        }
        if self.state.get().heartbeat_enabled() && Instant::now() >= self.next_ping {
            self.send_ping()?;
        }
        Ok(())
    }

    fn on_command(&mut self, cmd: Command) -> Result<(), Halt> {
        match cmd {
            Command::Stop => {
                tracing::info!("sender {}: stop requested in {}", self.session_id, self.state.get());
                if self.state.get().is_active() {
                    Err(Halt::Cancelled(Side::Sender))
                } else {
                    Err(Halt::Stopped)
                }
            }
            Command::Accept => Ok(()),
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) -> Result<Option<ProtocolMessage>, Halt> {
        match event {
            ConnectionEvent::Frame(Frame::Text(text)) => {
                let msg = ProtocolMessage::decode(&text).map_err(TransferError::from)?;
                self.on_control(msg)
            }
            ConnectionEvent::Frame(Frame::Binary(data)) => Err(TransferError::protocol(format!(
                "unexpected {}-byte binary frame from receiver",
                data.len()
            ))
            .into()),
            ConnectionEvent::Closed => {
                self.on_peer_closed("peer closed the connection")?;
                Ok(None)
            }
            ConnectionEvent::Error(e) => {
                tracing::warn!("sender {}: transport error: {e}", self.session_id);
                self.on_peer_closed(&e)?;
                Ok(None)
            }
        }
    }

    /// Messages that mean the same thing in every state.
    fn on_control(&mut self, msg: ProtocolMessage) -> Result<Option<ProtocolMessage>, Halt> {
        match msg {
            ProtocolMessage::Ping { timestamp } => {
                self.send(&ProtocolMessage::Pong { timestamp })?;
                Ok(None)
            }
            ProtocolMessage::Pong { timestamp } => {
                let rtt_ms = chrono::Utc::now().timestamp_millis() - timestamp;
                self.log(TransferEvent::HeartbeatRtt { rtt_ms });
                Ok(None)
            }
            ProtocolMessage::Cancelled { reason } => {
                tracing::info!(
                    "sender {}: receiver cancelled ({})",
                    self.session_id,
                    reason.as_deref().unwrap_or("no reason")
                );
                match self.state.get() {
                    SenderState::Handshaking | SenderState::Negotiating => Err(Halt::PeerLeft),
                    _ => Err(Halt::Cancelled(Side::Receiver)),
                }
            }
            ProtocolMessage::Error { message } => Err(TransferError::Remote(message).into()),
            ProtocolMessage::Resume => {
                self.log(TransferEvent::ReservedIgnored { tag: "resume" });
                Ok(None)
            }
            ProtocolMessage::ResumeAck => {
                self.log(TransferEvent::ReservedIgnored { tag: "resume_ack" });
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    /// Messages expected while chunks are in flight.
    fn on_transfer_message(&mut self, msg: ProtocolMessage) -> Result<(), Halt> {
        match msg {
            ProtocolMessage::ChunkAck { seq, received } => match self.flow.on_ack(seq) {
                Some(chunk) => {
                    self.log(TransferEvent::ChunkAcked {
                        seq,
                        rtt_ms: chunk.sent_at.elapsed().as_millis() as u64,
                    });
                    tracing::trace!("sender {}: receiver has {received} bytes of current file", self.session_id);
                    self.reporter.emit(SessionEvent::Progress(Progress::new(
                        self.flow.bytes_acked(),
                        self.total_size,
                    )));
                }
                None => tracing::debug!("sender {}: ignoring ack for unknown chunk {seq}", self.session_id),
            },
            ProtocolMessage::Ready => {
                // Rejected by the transition table once transferring.
                self.enter(SenderState::Transferring);
            }
            other => self.unexpected(&other),
        }
        Ok(())
    }

    fn on_peer_closed(&mut self, reason: &str) -> Result<(), Halt> {
        self.peer_closed = true;
        match self.state.get() {
            SenderState::Handshaking | SenderState::Negotiating => Err(Halt::PeerLeft),
            SenderState::Transferring | SenderState::Finishing => Err(Halt::Cancelled(Side::Receiver)),
            SenderState::AwaitingAck => {
                tracing::info!(
                    "sender {}: peer closed while awaiting end_ack, waiting {:?}",
                    self.session_id,
                    self.options.close_grace
                );
                self.closed_at.get_or_insert_with(Instant::now);
                Ok(())
            }
            _ => Err(TransferError::Disconnected(reason.to_string()).into()),
        }
    }

    fn on_incoming(&mut self, conn: PeerConnection) -> Result<(), Halt> {
        if !self.state.get().is_committed() {
            return Err(Halt::Replaced(conn));
        }
        let reason = "session busy: a transfer is already in progress".to_string();
        self.log(TransferEvent::ConnectionRejected { reason: reason.clone() });
        let _ = conn.send_message(&ProtocolMessage::Error { message: reason });
        conn.link.close();
        Ok(())
    }

    fn unexpected(&self, msg: &ProtocolMessage) {
        tracing::warn!(
            "sender {}: ignoring unexpected {} in {}",
            self.session_id,
            msg.tag(),
            self.state.get()
        );
    }

    // ── Output ─────────────────────────────────────────────────────────

    fn link(&self) -> Result<Arc<dyn PeerLink>, Halt> {
        self.conn
            .as_ref()
            .map(|c| c.link.clone())
            .ok_or_else(|| TransferError::Disconnected("no peer connection".into()).into())
    }

    fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Halt> {
        let link = self.link()?;
        match send_message(link.as_ref(), msg) {
            Ok(()) => Ok(()),
            Err(TransferError::Transport(TransportError::Closed)) => self.on_peer_closed("link closed"),
            Err(e) => Err(e.into()),
        }
    }

    fn send_payload(&mut self, data: Bytes) -> Result<(), Halt> {
        let link = self.link()?;
        match link.send(Frame::Binary(data)) {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => self.on_peer_closed("link closed"),
            Err(e) => Err(TransferError::from(e).into()),
        }
    }

    fn send_ping(&mut self) -> Result<(), Halt> {
        self.next_ping = Instant::now() + self.options.heartbeat_interval;
        self.send(&ProtocolMessage::ping_now())
    }

    /// Best effort: the peer may already be gone.
    fn notify_peer(&self, msg: &ProtocolMessage) {
        if let Some(conn) = &self.conn {
            if let Err(e) = conn.send_message(msg) {
                tracing::debug!("sender {}: could not send {} to peer: {e}", self.session_id, msg.tag());
            }
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    fn enter(&mut self, next: SenderState) -> bool {
        let changed = self.state.transition(next);
        if changed {
            tracing::info!("sender {}: {}", self.session_id, next);
            self.reporter.emit(SessionEvent::StateChanged(Phase::Sender(next)));
        }
        changed
    }

    fn attach(&mut self, conn: PeerConnection) {
        self.detach();
        self.conn = Some(conn);
        self.peer_closed = false;
        self.closed_at = None;
    }

    fn detach(&mut self) {
        if let Some(old) = self.conn.take() {
            old.link.close();
        }
    }

    fn finish(mut self, result: Result<TransferSummary, Halt>) -> SessionOutcome {
        let outcome = match result {
            Ok(summary) => {
                self.log(TransferEvent::TransferComplete {
                    total_bytes: summary.bytes,
                    duration_ms: summary.elapsed.as_millis() as u64,
                    chunks: summary.chunks,
                });
                SessionOutcome::Completed(summary)
            }
            Err(Halt::Cancelled(by)) => {
                if by == Side::Sender {
                    self.notify_peer(&ProtocolMessage::Cancelled {
                        reason: Some("stopped by sender".into()),
                    });
                }
                self.enter(SenderState::Cancelled);
                SessionOutcome::Cancelled(by)
            }
            Err(Halt::Stopped) => SessionOutcome::Closed,
            Err(Halt::PeerLeft) | Err(Halt::Replaced(_)) => SessionOutcome::Disconnected,
            Err(Halt::Failed(err)) => {
                self.log(TransferEvent::Error {
                    message: err.to_string(),
                });
                if err.reportable_to_peer() {
                    self.notify_peer(&ProtocolMessage::Error {
                        message: err.to_string(),
                    });
                }
                SessionOutcome::Failed(err)
            }
        };

        self.reporter.settle(&outcome);
        self.detach();
        if let Some(reservation) = self.reservation.take() {
            reservation.release();
        }
        self.enter(SenderState::Closed);
        self.reporter.closed();
        outcome
    }

    fn log(&self, event: TransferEvent) {
        self.options.logger.log(TransferLog {
            component: COMPONENT,
            session_id: Some(self.session_id),
            event,
        });
    }
}

async fn recv_incoming(incoming: Option<&mut mpsc::UnboundedReceiver<PeerConnection>>) -> Option<PeerConnection> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
