/// Wisp shared types: the peer transfer wire vocabulary and the small value
/// types both session roles report through their event channels.

pub mod models;
pub mod protocol;

pub use models::{FileDescriptor, Progress, Side};
pub use protocol::{PROTOCOL_VERSION, ProtocolError, ProtocolMessage};
