//! The post-handshake peer wire protocol.
//!
//! Every message is a 4-byte big-endian length prefix followed by that many
//! bytes: an empty body is `KeepAlive`, otherwise the first payload byte is
//! the message ID. Built on `tokio_util::codec` rather than a hand-rolled
//! read loop, since a single `TcpStream` read can deliver zero, one, or many
//! frames, or split one frame across reads, and `BytesMut` already tracks
//! that partial state for us.
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// An upper bound on a single frame's length, comfortably above the largest
/// legitimate `Piece` message (a 16 KiB block plus its 9-byte header) while
/// still rejecting a peer that claims an absurd frame size.
const MAX_FRAME_LEN: usize = (1 << 17) + 13;
const LEN_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame length {0} exceeds the maximum of {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("message id {0} body is shorter than its fixed fields require")]
    TruncatedBody(u8),
}

/// A peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
}

#[derive(Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FramingError> {
        if src.len() < LEN_PREFIX_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[..LEN_PREFIX_LEN].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FramingError::FrameTooLarge(len));
        }
        if src.len() < LEN_PREFIX_LEN + len {
            src.reserve(LEN_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX_LEN);
        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut body = src.split_to(len);
        let message_id = body.get_u8();
        let require = |body: &BytesMut, needed: usize| -> Result<(), FramingError> {
            if body.remaining() < needed {
                Err(FramingError::TruncatedBody(message_id))
            } else {
                Ok(())
            }
        };
        let message = match message_id {
            id::CHOKE => Message::Choke,
            id::UNCHOKE => Message::Unchoke,
            id::INTERESTED => Message::Interested,
            id::NOT_INTERESTED => Message::NotInterested,
            id::HAVE => {
                require(&body, 4)?;
                Message::Have { index: body.get_u32() }
            }
            id::BITFIELD => Message::Bitfield(body.to_vec()),
            id::REQUEST => {
                require(&body, 12)?;
                Message::Request {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                }
            }
            id::PIECE => {
                require(&body, 8)?;
                Message::Piece {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    block: body.to_vec(),
                }
            }
            id::CANCEL => {
                require(&body, 12)?;
                Message::Cancel {
                    index: body.get_u32(),
                    begin: body.get_u32(),
                    length: body.get_u32(),
                }
            }
            id::PORT => {
                require(&body, 2)?;
                Message::Port(body.get_u16())
            }
            unknown => {
                tracing::debug!(id = unknown, "discarding message with unknown id");
                return self.decode(src);
            }
        };
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), FramingError> {
        match item {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => put_frame(dst, id::CHOKE, &[]),
            Message::Unchoke => put_frame(dst, id::UNCHOKE, &[]),
            Message::Interested => put_frame(dst, id::INTERESTED, &[]),
            Message::NotInterested => put_frame(dst, id::NOT_INTERESTED, &[]),
            Message::Have { index } => put_frame(dst, id::HAVE, &index.to_be_bytes()),
            Message::Bitfield(bits) => put_frame(dst, id::BITFIELD, &bits),
            Message::Request { index, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                put_frame(dst, id::REQUEST, &payload);
            }
            Message::Piece { index, begin, block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&block);
                put_frame(dst, id::PIECE, &payload);
            }
            Message::Cancel { index, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                put_frame(dst, id::CANCEL, &payload);
            }
            Message::Port(port) => put_frame(dst, id::PORT, &port.to_be_bytes()),
        }
        Ok(())
    }
}

fn put_frame(dst: &mut BytesMut, message_id: u8, payload: &[u8]) {
    dst.put_u32((1 + payload.len()) as u32);
    dst.put_u8(message_id);
    dst.put_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_fixed_messages() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have { index: 7 });
        round_trip(Message::Bitfield(vec![0xff, 0x00]));
        round_trip(Message::Request { index: 1, begin: 0, length: 16384 });
        round_trip(Message::Piece { index: 1, begin: 0, block: vec![1, 2, 3] });
        round_trip(Message::Cancel { index: 1, begin: 0, length: 16384 });
        round_trip(Message::Port(6881));
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Have { index: 3 }, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn decode_handles_multiple_frames_in_one_buffer() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Choke, &mut buf).unwrap();
        codec.encode(Message::Unchoke, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Choke));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn truncated_have_body_is_a_framing_error_not_a_panic() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        // Claims a Have message (id 4) but only supplies 2 of the required 4 index bytes.
        buf.put_u32(3);
        buf.put_u8(id::HAVE);
        buf.put_u8(0);
        buf.put_u8(0);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FramingError::TruncatedBody(id::HAVE)));
    }

    #[test]
    fn discards_unknown_message_id_and_continues() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        // An unrecognized id (200) with an empty payload, followed by a real message.
        buf.put_u32(1);
        buf.put_u8(200);
        codec.encode(Message::Unchoke, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
    }
}
