//! The BitTorrent peer handshake.
//!
//! The handshake is the first exchange between two peers. It verifies that
//! both sides are talking about the same torrent (via `info_hash`) before
//! any wire messages are exchanged.
use crate::torrent::{TorrentError, TorrentResult};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A BitTorrent handshake message: a fixed 68-byte header that precedes
/// every peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol: *PROTOCOL,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68-byte wire form:
    /// `pstrlen(1) pstr(19) reserved(8) info_hash(20) peer_id(20)`.
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    #[instrument(level = "trace", skip(stream))]
    async fn read(stream: &mut TcpStream) -> TorrentResult<Self> {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        if length_buf[0] != 19 {
            return Err(TorrentError::HandshakeInvalidProtocol);
        }

        let mut buf = [0u8; 67];
        stream.read_exact(&mut buf).await?;

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[0..19]);
        if &protocol != PROTOCOL {
            return Err(TorrentError::HandshakeInvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn validate(&self, expected_info_hash: [u8; 20]) -> TorrentResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(TorrentError::HandshakeInfoHashMismatch);
        }
        Ok(())
    }
}

/// Dials `peer_addr`, exchanges handshakes, and returns the connected
/// stream together with the peer's handshake once validated.
#[instrument(level = "debug", skip(info_hash, peer_id))]
pub async fn do_handshake(
    peer_addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> TorrentResult<(TcpStream, Handshake)> {
    let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(peer_addr))
        .await
        .map_err(|_| TorrentError::HandshakeTimeout)??;

    let ours = Handshake::new(info_hash, peer_id);
    stream.write_all(&ours.serialize()).await?;

    let theirs = timeout(HANDSHAKE_TIMEOUT, Handshake::read(&mut stream))
        .await
        .map_err(|_| TorrentError::HandshakeTimeout)??;
    theirs.validate(info_hash)?;

    Ok((stream, theirs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_68_bytes_with_expected_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL.as_slice());
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn validate_rejects_mismatched_info_hash() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate([9u8; 20]).is_err());
        assert!(handshake.validate([1u8; 20]).is_ok());
    }
}
