/// Inbound session.
///
/// ```text
/// connect(code) -> hello -> [file_list] -> meta(0) -> (accept?) -> ready
///   -> [chunk header, payload]* -> write queue -> chunk_ack
///   -> file_end / file_end_ack (multi-file only)
///   -> end -> flush + verify -> end_ack (+ redundant re-acks) -> completed
/// ```
///
/// Payloads are matched to their headers by position and written through a
/// strictly ordered queue. A staleness watchdog runs only while transferring.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;
use wisp_types::{FileDescriptor, PROTOCOL_VERSION, ProtocolMessage, Side};

use crate::code::parse_code;
use crate::completion::{spawn_redundant_acks, verify_received};
use crate::config::ReceiveOptions;
use crate::error::TransferError;
use crate::events::{Phase, Reporter, SessionEvent, SessionOutcome, TransferSummary};
use crate::files::FileSink;
use crate::logging::{TransferEvent, TransferLog};
use crate::session::{Command, ReceiveHandle, sleep_until_or_never};
use crate::state::{ReceiverState, SessionState, StateMachine};
use crate::transport::{ConnectionEvent, Frame, PeerConnection, PeerLink, Rendezvous, TransportError, send_message};
use crate::write_queue::WriteQueue;

const COMPONENT: &str = "receiver";

/// Start an inbound session for `code`. A malformed code fails synchronously
/// with a validation error and no network activity. Must be called from
/// within a tokio runtime.
pub fn start_receive(
    code: &str,
    rendezvous: Arc<dyn Rendezvous>,
    sink: Box<dyn FileSink>,
    options: ReceiveOptions,
) -> Result<(ReceiveHandle, mpsc::UnboundedReceiver<SessionEvent>), TransferError> {
    let code = parse_code(code)?;
    options.validate()?;

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = ReceiverSession {
        code,
        rendezvous,
        options,
        state: StateMachine::new(COMPONENT, ReceiverState::Initializing),
        reporter: Reporter::new(events_tx),
        commands: commands_rx,
        commands_closed: false,
        conn: None,
        sink: Some(sink),
        queue: None,
        session_id: None,
        manifest: Vec::new(),
        multi_file: false,
        expected_total: 0,
        current: None,
        intake: Intake::AwaitingHeader,
        last_seq: None,
        files_done: 0,
        watchdog: None,
        started: Instant::now(),
    };
    let task = tokio::spawn(session.run());
    Ok((ReceiveHandle::new(commands_tx, task), events_rx))
}

#[derive(Debug, Clone, Copy)]
struct ChunkHeader {
    seq: u64,
    size: u64,
}

/// Header/payload pairing: a `chunk` header must be followed by exactly one
/// binary frame before anything else chunk-related.
#[derive(Debug, Clone, Copy)]
enum Intake {
    AwaitingHeader,
    AwaitingPayload(ChunkHeader),
}

enum Halt {
    Failed(TransferError),
    Cancelled(Side),
    /// Local stop before a peer was attached.
    Stopped,
    /// The sender went away before the transfer started.
    PeerLeft,
}

impl From<TransferError> for Halt {
    fn from(e: TransferError) -> Self {
        Halt::Failed(e)
    }
}

enum Input {
    Message(ProtocolMessage),
    Payload(Bytes),
    Accept,
    Timeout,
}

enum Wake {
    Command(Option<Command>),
    Event(Option<ConnectionEvent>),
    WriteFailed(TransferError),
    Watchdog,
    Deadline,
}

struct ReceiverSession {
    code: String,
    rendezvous: Arc<dyn Rendezvous>,
    options: ReceiveOptions,
    state: StateMachine<ReceiverState>,
    reporter: Reporter,

    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,

    conn: Option<PeerConnection>,
    /// Handed to the write queue once the transfer starts.
    sink: Option<Box<dyn FileSink>>,
    queue: Option<WriteQueue>,

    session_id: Option<Uuid>,
    manifest: Vec<FileDescriptor>,
    multi_file: bool,
    expected_total: u64,
    /// File currently open for writing.
    current: Option<(u32, FileDescriptor)>,
    intake: Intake,
    last_seq: Option<u64>,
    files_done: u32,

    watchdog: Option<Instant>,
    started: Instant,
}

impl ReceiverSession {
    async fn run(mut self) -> SessionOutcome {
        let result = self.drive().await;
        self.finish(result)
    }

    async fn drive(&mut self) -> Result<TransferSummary, Halt> {
        self.enter(ReceiverState::Connecting);
        let conn = self.connect().await?;
        self.conn = Some(conn);

        self.enter(ReceiverState::Handshaking);
        self.send(&ProtocolMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            session_id: None,
        })?;
        self.handshake().await?;

        self.enter(ReceiverState::Negotiating);
        self.negotiate().await?;
        self.start_transfer()?;
        self.transfer().await
    }

    async fn connect(&mut self) -> Result<PeerConnection, Halt> {
        let rendezvous = self.rendezvous.clone();
        let code = self.code.clone();
        let mut connect = rendezvous.connect(&code);
        let deadline = Instant::now() + self.options.connect_timeout;
        loop {
            let wake = tokio::select! {
                biased;
                cmd = self.commands.recv(), if !self.commands_closed => Err(cmd),
                result = &mut connect => Ok(Some(result)),
                _ = tokio::time::sleep_until(deadline) => Ok(None),
            };
            match wake {
                Ok(Some(result)) => return result.map_err(|e| TransferError::from(e).into()),
                Ok(None) => return Err(TransferError::Timeout("connection").into()),
                Err(Some(cmd)) => self.on_command(cmd)?,
                Err(None) => self.commands_closed = true,
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), Halt> {
        let deadline = Instant::now() + self.options.handshake_timeout;
        loop {
            match self.next_input(Some(deadline)).await? {
                Input::Message(ProtocolMessage::Hello {
                    protocol_version,
                    session_id,
                }) => {
                    if protocol_version != PROTOCOL_VERSION {
                        return Err(TransferError::VersionMismatch {
                            local: PROTOCOL_VERSION,
                            remote: protocol_version,
                        }
                        .into());
                    }
                    let Some(id) = session_id else {
                        return Err(TransferError::protocol("sender hello without a session id").into());
                    };
                    self.session_id = Some(id);
                    self.log(TransferEvent::HandshakeComplete {
                        protocol_version,
                    });
                    return Ok(());
                }
                Input::Message(other) => self.unexpected(&other),
                Input::Payload(_) => return Err(TransferError::protocol("payload before handshake").into()),
                Input::Timeout => return Err(TransferError::Timeout("hello").into()),
                Input::Accept => {}
            }
        }
    }

    async fn negotiate(&mut self) -> Result<(), Halt> {
        loop {
            match self.next_input(None).await? {
                Input::Message(ProtocolMessage::FileList {
                    file_count,
                    files,
                    total_size,
                }) => {
                    if files.len() != file_count as usize {
                        return Err(TransferError::protocol(format!(
                            "file_list announces {file_count} files but lists {}",
                            files.len()
                        ))
                        .into());
                    }
                    tracing::info!("receiver: {} files, {} bytes announced", file_count, total_size);
                    self.manifest = files;
                    self.expected_total = total_size;
                    self.multi_file = true;
                }
                Input::Message(ProtocolMessage::Meta {
                    session_id,
                    name,
                    size,
                    mime,
                    file_index,
                }) => {
                    self.check_session(session_id)?;
                    let index = file_index.unwrap_or(0);
                    if index != 0 {
                        return Err(TransferError::protocol(format!("first meta is for file {index}")).into());
                    }
                    let file = FileDescriptor { name, size, mime };
                    if !self.multi_file {
                        self.manifest = vec![file.clone()];
                        self.expected_total = size;
                    }
                    self.current = Some((0, file.clone()));

                    let awaiting_confirmation = self.options.require_confirmation;
                    self.reporter.emit(SessionEvent::FileOffered {
                        session_id,
                        file,
                        manifest: self.manifest.clone(),
                        total_size: self.expected_total,
                        awaiting_confirmation,
                    });
                    if awaiting_confirmation {
                        self.await_accept().await?;
                    }
                    return Ok(());
                }
                Input::Message(other) => self.unexpected(&other),
                Input::Payload(_) => {
                    return Err(TransferError::protocol("payload without pending chunk header").into());
                }
                Input::Accept | Input::Timeout => {}
            }
        }
    }

    async fn await_accept(&mut self) -> Result<(), Halt> {
        tracing::info!("receiver: waiting for confirmation");
        loop {
            match self.next_input(None).await? {
                Input::Accept => return Ok(()),
                Input::Message(other) => self.unexpected(&other),
                Input::Payload(_) => return Err(TransferError::protocol("payload before ready").into()),
                Input::Timeout => {}
            }
        }
    }

    fn start_transfer(&mut self) -> Result<(), Halt> {
        let link = self.link()?;
        let session_id = self.session_id.ok_or_else(|| TransferError::protocol("no session id"))?;
        let sink = self
            .sink
            .take()
            .ok_or_else(|| TransferError::Io("sink already handed off".into()))?;
        let queue = WriteQueue::spawn(
            sink,
            link,
            self.reporter.sender(),
            self.options.logger.clone(),
            session_id,
            self.expected_total,
        );
        if let Some((index, file)) = &self.current {
            queue.begin_file(*index, file.clone());
            self.reporter.emit(SessionEvent::FileStarted {
                index: *index,
                file: file.clone(),
            });
        }
        self.queue = Some(queue);

        self.send(&ProtocolMessage::Ready)?;
        self.enter(ReceiverState::Transferring);
        self.touch_watchdog();
        Ok(())
    }

    async fn transfer(&mut self) -> Result<TransferSummary, Halt> {
        loop {
            match self.next_input(None).await? {
                Input::Message(ProtocolMessage::Chunk { seq, size, total, .. }) => {
                    self.on_chunk_header(ChunkHeader { seq, size }, total)?;
                }
                Input::Payload(data) => self.on_payload(data)?,
                Input::Message(ProtocolMessage::Meta {
                    session_id,
                    name,
                    size,
                    mime,
                    file_index,
                }) => {
                    self.check_session(session_id)?;
                    self.on_next_file(file_index, FileDescriptor { name, size, mime })?;
                }
                Input::Message(ProtocolMessage::FileEnd { file_index }) => self.on_file_end(file_index).await?,
                Input::Message(ProtocolMessage::End { attempt }) => return self.on_end(attempt).await,
                Input::Message(other) => self.unexpected(&other),
                Input::Accept | Input::Timeout => {}
            }
        }
    }

    // ── Chunk intake ───────────────────────────────────────────────────

    fn on_chunk_header(&mut self, header: ChunkHeader, total: u64) -> Result<(), Halt> {
        if let Intake::AwaitingPayload(pending) = self.intake {
            return Err(TransferError::protocol(format!(
                "chunk {} announced while payload for chunk {} is pending",
                header.seq, pending.seq
            ))
            .into());
        }
        if let Some(last) = self.last_seq {
            if header.seq <= last {
                return Err(TransferError::protocol(format!("chunk {} after chunk {last}", header.seq)).into());
            }
        }
        let Some((index, file)) = &self.current else {
            return Err(TransferError::protocol(format!("chunk {} outside of any file", header.seq)).into());
        };
        if total != file.size {
            return Err(TransferError::protocol(format!(
                "chunk {} claims file size {total}, file {index} was announced with {}",
                header.seq, file.size
            ))
            .into());
        }
        self.intake = Intake::AwaitingPayload(header);
        Ok(())
    }

    fn on_payload(&mut self, data: Bytes) -> Result<(), Halt> {
        let Intake::AwaitingPayload(header) = self.intake else {
            return Err(TransferError::protocol("payload without pending chunk header").into());
        };
        if data.len() as u64 != header.size {
            return Err(TransferError::protocol(format!(
                "chunk {} payload is {} bytes, header declared {}",
                header.seq,
                data.len(),
                header.size
            ))
            .into());
        }
        self.intake = Intake::AwaitingHeader;
        self.last_seq = Some(header.seq);
        self.queue()?.write(header.seq, data);
        Ok(())
    }

    fn on_next_file(&mut self, file_index: Option<u32>, file: FileDescriptor) -> Result<(), Halt> {
        self.expect_header("meta")?;
        if let Some((open, _)) = &self.current {
            return Err(TransferError::protocol(format!("meta before file_end of file {open}")).into());
        }
        let index = file_index.unwrap_or(self.files_done);
        if index != self.files_done {
            return Err(TransferError::protocol(format!(
                "meta for file {index}, expected file {}",
                self.files_done
            ))
            .into());
        }
        self.queue()?.begin_file(index, file.clone());
        self.current = Some((index, file.clone()));
        self.reporter.emit(SessionEvent::FileStarted { index, file });
        Ok(())
    }

    async fn on_file_end(&mut self, file_index: u32) -> Result<(), Halt> {
        self.expect_header("file_end")?;
        let (index, file) = match self.current.take() {
            Some((index, file)) if index == file_index => (index, file),
            _ => {
                return Err(TransferError::protocol(format!("file_end for file {file_index}, which is not open")).into());
            }
        };
        let queue = self.queue()?;
        queue.finish_file(index);
        let tally = queue.flush().await?;

        self.send(&ProtocolMessage::FileEndAck {
            file_index: index,
            received: tally.file_received,
            size: file.size,
        })?;
        self.files_done += 1;
        self.log(TransferEvent::FileComplete {
            index,
            bytes: tally.file_received,
        });
        self.reporter.emit(SessionEvent::FileFinished {
            index,
            file,
            bytes: tally.file_received,
        });
        Ok(())
    }

    async fn on_end(&mut self, attempt: u32) -> Result<TransferSummary, Halt> {
        self.expect_header("end")?;
        tracing::debug!("receiver: end attempt {attempt}");

        // A single file is closed by `end`; in multi-file mode every file
        // must already have been closed by its `file_end`.
        let closing = match self.current.take() {
            Some((index, _)) if self.multi_file => {
                return Err(TransferError::protocol(format!("end before file_end of file {index}")).into());
            }
            other => other,
        };
        let queue = self.queue()?;
        if let Some((index, _)) = &closing {
            queue.finish_file(*index);
        }
        let tally = queue.flush().await?;

        // Never acknowledge optimistically.
        verify_received(tally.total_received, self.expected_total)?;
        if self.multi_file && self.files_done as usize != self.manifest.len() {
            return Err(TransferError::protocol(format!(
                "end after {} of {} announced files",
                self.files_done,
                self.manifest.len()
            ))
            .into());
        }

        let ack = ProtocolMessage::EndAck {
            received: tally.total_received,
            total: self.expected_total,
        };
        self.send(&ack)?;

        if let Some((index, file)) = closing {
            self.files_done += 1;
            self.log(TransferEvent::FileComplete {
                index,
                bytes: tally.file_received,
            });
            self.reporter.emit(SessionEvent::FileFinished {
                index,
                file,
                bytes: tally.file_received,
            });
        }
        self.enter(ReceiverState::Completed);

        // The re-ack task owns the link from here and closes it when done.
        if let Some(conn) = self.conn.take() {
            spawn_redundant_acks(conn.link, ack, self.options.redundant_end_ack_delays.clone());
        }

        Ok(TransferSummary {
            session_id: self.session_id.unwrap_or_default(),
            files: self.files_done,
            bytes: tally.total_received,
            chunks: tally.chunks,
            peak_in_flight: 0,
            elapsed: self.started.elapsed(),
        })
    }

    fn expect_header(&self, what: &str) -> Result<(), Halt> {
        match self.intake {
            Intake::AwaitingHeader => Ok(()),
            Intake::AwaitingPayload(pending) => Err(TransferError::protocol(format!(
                "{what} while payload for chunk {} is pending",
                pending.seq
            ))
            .into()),
        }
    }

    fn check_session(&self, got: Uuid) -> Result<(), Halt> {
        match self.session_id {
            Some(expected) if expected != got => Err(TransferError::ForeignSession { expected, got }.into()),
            _ => Ok(()),
        }
    }

    // ── Input ──────────────────────────────────────────────────────────

    async fn next_input(&mut self, deadline: Option<Instant>) -> Result<Input, Halt> {
        loop {
            let wake = {
                let Some(conn) = self.conn.as_mut() else {
                    return Err(TransferError::Disconnected("no peer connection".into()).into());
                };
                let watchdog = match self.state.get() {
                    ReceiverState::Transferring => self.watchdog,
                    _ => None,
                };
                let queue = self.queue.as_mut();
                tokio::select! {
                    biased;
                    cmd = self.commands.recv(), if !self.commands_closed => Wake::Command(cmd),
                    err = write_failure(queue) => Wake::WriteFailed(err),
                    event = conn.events.recv() => Wake::Event(event),
                    _ = sleep_until_or_never(watchdog) => Wake::Watchdog,
                    _ = sleep_until_or_never(deadline) => Wake::Deadline,
                }
            };
            match wake {
                Wake::Command(Some(Command::Accept)) => return Ok(Input::Accept),
                Wake::Command(Some(cmd)) => self.on_command(cmd)?,
                Wake::Command(None) => self.commands_closed = true,
                Wake::WriteFailed(err) => return Err(err.into()),
                Wake::Event(Some(ConnectionEvent::Frame(frame))) => {
                    self.touch_watchdog();
                    match frame {
                        Frame::Binary(data) => return Ok(Input::Payload(data)),
                        Frame::Text(text) => {
                            let msg = ProtocolMessage::decode(&text).map_err(TransferError::from)?;
                            if let Some(msg) = self.on_control(msg)? {
                                return Ok(Input::Message(msg));
                            }
                        }
                    }
                }
                Wake::Event(Some(ConnectionEvent::Error(e))) => {
                    tracing::warn!("receiver: transport error: {e}");
                    return Err(self.peer_gone());
                }
                Wake::Event(Some(ConnectionEvent::Closed)) | Wake::Event(None) => return Err(self.peer_gone()),
                Wake::Watchdog => {
                    return Err(TransferError::Stalled(self.options.watchdog_timeout).into());
                }
                Wake::Deadline => return Ok(Input::Timeout),
            }
        }
    }

    fn on_command(&mut self, cmd: Command) -> Result<(), Halt> {
        match cmd {
            Command::Stop => {
                tracing::info!("receiver: stop requested in {}", self.state.get());
                if self.state.get().is_active() {
                    Err(Halt::Cancelled(Side::Receiver))
                } else {
                    Err(Halt::Stopped)
                }
            }
            Command::Accept => Ok(()),
        }
    }

    fn on_control(&mut self, msg: ProtocolMessage) -> Result<Option<ProtocolMessage>, Halt> {
        match msg {
            ProtocolMessage::Ping { timestamp } => {
                self.send(&ProtocolMessage::Pong { timestamp })?;
                Ok(None)
            }
            ProtocolMessage::Pong { .. } => Ok(None),
            ProtocolMessage::Cancelled { reason } => {
                tracing::info!("receiver: sender cancelled ({})", reason.as_deref().unwrap_or("no reason"));
                Err(self.peer_gone())
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

    /// The sender cancelled or the link went away.
    fn peer_gone(&self) -> Halt {
        match self.state.get() {
            ReceiverState::Handshaking | ReceiverState::Negotiating => Halt::PeerLeft,
            ReceiverState::Transferring => Halt::Cancelled(Side::Sender),
            _ => Halt::Failed(TransferError::Disconnected("link closed".into())),
        }
    }

    fn touch_watchdog(&mut self) {
        if self.state.get() == ReceiverState::Transferring {
            self.watchdog = Some(Instant::now() + self.options.watchdog_timeout);
        }
    }

    fn unexpected(&self, msg: &ProtocolMessage) {
        tracing::warn!("receiver: ignoring unexpected {} in {}", msg.tag(), self.state.get());
    }

    // ── Output ─────────────────────────────────────────────────────────

    fn link(&self) -> Result<Arc<dyn PeerLink>, Halt> {
        self.conn
            .as_ref()
            .map(|c| c.link.clone())
            .ok_or_else(|| TransferError::Disconnected("no peer connection".into()).into())
    }

    fn queue(&mut self) -> Result<&mut WriteQueue, Halt> {
        self.queue
            .as_mut()
            .ok_or_else(|| TransferError::protocol("data before ready").into())
    }

    fn send(&self, msg: &ProtocolMessage) -> Result<(), Halt> {
        let link = self.link()?;
        match send_message(link.as_ref(), msg) {
            Ok(()) => Ok(()),
            Err(TransferError::Transport(TransportError::Closed)) => Err(self.peer_gone()),
            Err(e) => Err(e.into()),
        }
    }

    fn notify_peer(&self, msg: &ProtocolMessage) {
        if let Some(conn) = &self.conn {
            if let Err(e) = conn.send_message(msg) {
                tracing::debug!("receiver: could not send {} to peer: {e}", msg.tag());
            }
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    fn enter(&mut self, next: ReceiverState) -> bool {
        let changed = self.state.transition(next);
        if changed {
            tracing::info!("receiver {}: {}", self.code, next);
            self.reporter.emit(SessionEvent::StateChanged(Phase::Receiver(next)));
        }
        changed
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
                if by == Side::Receiver {
                    self.notify_peer(&ProtocolMessage::Cancelled {
                        reason: Some("stopped by receiver".into()),
                    });
                }
                self.enter(ReceiverState::Cancelled);
                SessionOutcome::Cancelled(by)
            }
            Err(Halt::Stopped) => SessionOutcome::Closed,
            Err(Halt::PeerLeft) => SessionOutcome::Disconnected,
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
        self.queue = None;
        if let Some(conn) = self.conn.take() {
            conn.link.close();
        }
        self.enter(ReceiverState::Closed);
        self.reporter.closed();
        outcome
    }

    fn log(&self, event: TransferEvent) {
        self.options.logger.log(TransferLog {
            component: COMPONENT,
            session_id: self.session_id,
            event,
        });
    }
}

async fn write_failure(queue: Option<&mut WriteQueue>) -> TransferError {
    match queue {
        Some(queue) => queue.failed().await,
        None => std::future::pending().await,
    }
}
