//! Per-peer connection state machine.
//!
//! One [`PeerSession`] is owned by one task for the lifetime of a TCP
//! connection to a single peer, mirroring the one-task-per-peer concurrency
//! model: all mutable state here is local to that task, so nothing in this
//! file needs a lock.
use super::bitfield::Bitfield;
use super::handshake::{self, Handshake};
use super::message::{FramingError, Message, MessageCodec};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] crate::torrent::TorrentError),

    #[error("wire framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("requested block is out of range for its piece")]
    OutOfRangeBlock,

    #[error("piece {0} exceeded its retry budget")]
    PieceRetriesExhausted(usize),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Tunables that govern how aggressively a session requests blocks and how
/// long it tolerates a silent peer.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub request_window: usize,
    pub block_size: u32,
    pub dead_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_window: 10,
            block_size: crate::piece::BLOCK_SIZE,
            dead_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(90),
        }
    }
}

/// The four choke/interest flags plus the in-flight request window and
/// announced piece availability for one peer connection.
#[derive(Debug)]
pub struct SessionState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub bitfield: Option<Bitfield>,
    num_pieces: usize,
    outstanding: VecDeque<(u32, u32, u32)>,
    window: usize,
    seen_post_handshake_message: bool,
}

impl SessionState {
    pub fn new(num_pieces: usize, window: usize) -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
            num_pieces,
            outstanding: VecDeque::new(),
            window,
            seen_post_handshake_message: false,
        }
    }

    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.outstanding.len() < self.window
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn record_request(&mut self, index: u32, begin: u32, length: u32) {
        self.outstanding.push_back((index, begin, length));
    }

    fn clear_outstanding(&mut self) {
        self.outstanding.clear();
    }

    fn complete_request(&mut self, index: u32, begin: u32) {
        self.outstanding.retain(|(i, b, _)| *i != index || *b != begin);
    }

    /// Folds one incoming message into session state.
    ///
    /// A `Bitfield` is only legal as the very first post-handshake message;
    /// arriving at any other point means the peer is either malformed or
    /// adversarial, so the connection is torn down rather than guessed at.
    pub fn apply_incoming(&mut self, message: &Message) -> SessionResult<()> {
        if let Message::Bitfield(bits) = message {
            if self.seen_post_handshake_message {
                return Err(SessionError::ProtocolViolation(
                    "bitfield arrived after another message",
                ));
            }
            self.bitfield = Bitfield::from_bytes(bits, self.num_pieces);
            self.seen_post_handshake_message = true;
            if self.bitfield.is_none() {
                return Err(SessionError::ProtocolViolation(
                    "bitfield length does not match the torrent's piece count",
                ));
            }
            return Ok(());
        }

        self.seen_post_handshake_message = true;
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                self.clear_outstanding();
            }
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { index } => {
                if let Some(bitfield) = &mut self.bitfield {
                    bitfield.set_piece(*index as usize);
                }
            }
            Message::Piece { index, begin, .. } => self.complete_request(*index, *begin),
            Message::Request { .. } | Message::Cancel { .. } | Message::Port(_) => {}
            Message::Bitfield(_) => unreachable!("handled above"),
        }
        Ok(())
    }
}

/// An established, handshaken connection to a single peer.
pub struct PeerSession {
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    pub state: SessionState,
    framed: Framed<TcpStream, MessageCodec>,
}

impl PeerSession {
    /// Dials `addr`, performs the handshake, and wraps the resulting stream
    /// in the message framer.
    #[instrument(level = "debug", skip(info_hash, our_peer_id))]
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
        config: SessionConfig,
    ) -> SessionResult<Self> {
        let (stream, Handshake { peer_id, .. }) =
            handshake::do_handshake(addr, info_hash, our_peer_id).await?;
        Ok(Self {
            addr,
            peer_id,
            state: SessionState::new(num_pieces, config.request_window),
            framed: Framed::new(stream, MessageCodec),
        })
    }

    pub async fn send(&mut self, message: Message) -> SessionResult<()> {
        self.framed.send(message).await?;
        Ok(())
    }

    /// Reads the next message, folding it into session state. Returns
    /// `None` when the peer closed the connection.
    pub async fn recv(&mut self) -> SessionResult<Option<Message>> {
        match self.framed.next().await {
            Some(Ok(message)) => {
                self.state.apply_incoming(&message)?;
                Ok(Some(message))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_after_another_message_is_a_protocol_violation() {
        let mut state = SessionState::new(8, 10);
        state.apply_incoming(&Message::Unchoke).unwrap();
        let err = state.apply_incoming(&Message::Bitfield(vec![0xff])).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[test]
    fn bitfield_with_wrong_length_is_a_protocol_violation() {
        let mut state = SessionState::new(20, 10);
        let err = state.apply_incoming(&Message::Bitfield(vec![0xff])).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[test]
    fn choke_clears_outstanding_requests() {
        let mut state = SessionState::new(8, 10);
        state.apply_incoming(&Message::Unchoke).unwrap();
        state.record_request(0, 0, 16384);
        assert_eq!(state.outstanding_count(), 1);
        state.apply_incoming(&Message::Choke).unwrap();
        assert_eq!(state.outstanding_count(), 0);
    }

    #[test]
    fn window_bounds_can_request() {
        let mut state = SessionState::new(8, 2);
        state.apply_incoming(&Message::Unchoke).unwrap();
        assert!(state.can_request());
        state.record_request(0, 0, 16384);
        state.record_request(0, 16384, 16384);
        assert!(!state.can_request());
    }

    #[test]
    fn piece_received_completes_matching_request() {
        let mut state = SessionState::new(8, 10);
        state.apply_incoming(&Message::Unchoke).unwrap();
        state.record_request(0, 0, 3);
        state
            .apply_incoming(&Message::Piece { index: 0, begin: 0, block: vec![1, 2, 3] })
            .unwrap();
        assert_eq!(state.outstanding_count(), 0);
    }
}
