//! Tracker client.
//!
//! Implements communication with BitTorrent trackers: building and sending
//! the announce request, and parsing both compact and non-compact peer
//! lists out of the bencoded response.
use crate::bencode::{self, BencodeValue};
use crate::torrent::file::TorrentFile;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("bencode error in tracker response: {0}")]
    Bencode(#[from] bencode::BencodeError),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A client communicating with a single BitTorrent tracker.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

/// Parameters for a tracker announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub compact: bool,
    pub left: i64,
}

/// A peer address returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// The parsed announce response.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

impl Client {
    pub fn new(port: u16) -> TrackerResult<Self> {
        Ok(Self {
            peer_id: generate_peer_id(),
            port,
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends an announce request to the tracker and returns the parsed peer list.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(&self, torrent: &TorrentFile) -> TrackerResult<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            left: torrent.total_length(),
        };

        let mut url = url::Url::parse(&torrent.announce)?;
        let params = [
            ("info_hash", url_encode(&request.info_hash)),
            ("peer_id", url_encode(&request.peer_id)),
            ("port", request.port.to_string()),
            ("uploaded", request.uploaded.to_string()),
            ("downloaded", request.downloaded.to_string()),
            ("left", request.left.to_string()),
            ("compact", (request.compact as i32).to_string()),
        ];
        url.query_pairs_mut().extend_pairs(&params).finish();
        tracing::debug!(%url, "sending announce request");

        let response = reqwest::get(url).await?;
        let response_bytes = response.bytes().await?;
        Self::parse_announce_response(&response_bytes)
    }

    /// Parses a bencoded tracker response, handling both the compact
    /// (6-byte-chunk) and non-compact (list of dicts) peer list formats.
    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let (value, _) = bencode::decode(bytes)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| TrackerError::MalformedResponse("response is not a dictionary".to_string()))?;

        if let Some(BencodeValue::String(reason)) = dict.get(b"failure reason".as_slice()) {
            return Err(TrackerError::MalformedResponse(
                String::from_utf8_lossy(reason).into_owned(),
            ));
        }

        let interval = match dict.get(b"interval".as_slice()) {
            Some(BencodeValue::Integer(i)) => *i,
            _ => 0,
        };

        let peers = match dict.get(b"peers".as_slice()) {
            Some(BencodeValue::String(compact)) => parse_compact_peers(compact)?,
            Some(BencodeValue::List(list)) => parse_dict_peers(list)?,
            _ => Vec::new(),
        };

        Ok(AnnounceResponse { interval, peers })
    }
}

fn parse_compact_peers(bytes: &[u8]) -> TrackerResult<Vec<Peer>> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::MalformedResponse(
            "compact peers string is not a multiple of 6 bytes".to_string(),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer {
                ip: IpAddr::V4(ip),
                port,
            }
        })
        .collect())
}

fn parse_dict_peers(list: &[BencodeValue]) -> TrackerResult<Vec<Peer>> {
    let mut peers = Vec::with_capacity(list.len());
    for entry in list {
        let dict = entry
            .as_dict()
            .ok_or_else(|| TrackerError::MalformedResponse("peer entry is not a dictionary".to_string()))?;
        let ip_bytes = match dict.get(b"ip".as_slice()) {
            Some(BencodeValue::String(s)) => s,
            _ => continue,
        };
        let ip_str = match std::str::from_utf8(ip_bytes) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let ip: IpAddr = match ip_str.parse() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        let port = match dict.get(b"port".as_slice()) {
            Some(BencodeValue::Integer(p)) => *p as u16,
            _ => continue,
        };
        peers.push(Peer { ip, port });
    }
    Ok(peers)
}

/// Generates a 20-byte peer ID: an 8-byte client prefix followed by 11
/// random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-CO0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// URL-encodes a byte slice per RFC 3986: unreserved characters pass
/// through, everything else becomes `%XX`.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_peer_id_with_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-CO0001-");
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn url_encodes_unreserved_passthrough() {
        assert_eq!(url_encode(b"abc-_.~"), "abc-_.~");
        assert_eq!(url_encode(&[0xff, 0x00]), "%FF%00");
    }

    #[test]
    fn parses_compact_peer_list() {
        let bytes = b"d8:intervali900e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x08\x08\x08\x08\x1a\xe1e";
        let response = Client::parse_announce_response(bytes).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(response.peers[0].port, 0x1ae1);
    }

    #[test]
    fn parses_non_compact_peer_list() {
        let bytes = b"d8:intervali900e5:peersld2:ip9:127.0.0.17:porti6881eeee";
        let response = Client::parse_announce_response(bytes).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn reports_failure_reason() {
        let bytes = b"d14:failure reason23:torrent not registerede";
        assert!(Client::parse_announce_response(bytes).is_err());
    }
}
