/// Wisp Transfer: peer-to-peer file transfer protocol engine.
///
/// Runs the application-level protocol on top of an ordered, reliable
/// message transport:
/// - Sender and receiver session state machines with enforced transition tables
/// - `hello` handshake with exact protocol version match
/// - Ack-window and transport-buffer flow control
/// - Multi-file sessions bracketed by `file_end` / `file_end_ack`
/// - Completion handshake with bounded `end` retries and redundant re-acks
/// - Strictly ordered receiver write-through
///
/// Rendezvous, transport and file access are collaborator traits; `memory`
/// provides in-process implementations.

pub mod code;
pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod files;
pub mod flow;
pub mod logging;
pub mod memory;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod state;
pub mod transport;
pub mod write_queue;

// Re-export key types for convenience.
pub use code::{generate_code, is_valid_code, parse_code};
pub use config::{ReceiveOptions, SendOptions};
pub use error::{ErrorKind, TransferError};
pub use events::{Phase, SessionEvent, SessionOutcome, TransferSummary};
pub use files::{FileSink, FileSource, MemoryFile, MemorySink};
pub use logging::{NullLogger, TracingLogger, TransferLogger};
pub use memory::{MemoryOptions, MemoryRendezvous};
pub use receiver::start_receive;
pub use sender::start_send;
pub use session::{ReceiveHandle, SendHandle};
pub use state::{ReceiverState, SenderState};
pub use transport::{ConnectionEvent, Frame, PeerConnection, PeerLink, Rendezvous, RendezvousError, Reservation};
