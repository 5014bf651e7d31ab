//! Peer wire protocol: handshake, message framing, and per-connection state.
pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;

pub use bitfield::Bitfield;
pub use message::{FramingError, Message, MessageCodec};
pub use session::{PeerSession, SessionConfig, SessionError, SessionState};
