//! Torrent metainfo parsing and error handling.
//!
//! This module provides types and error handling for working with .torrent
//! files, including parsing, validation, and error reporting.
use thiserror::Error;

pub mod file;
pub mod info_hash;

pub use file::{FileDict, InfoDict, TorrentFile};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("invalid data type for field: {0}")]
    InvalidFieldType(String),

    #[error("invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("path conversion error: {0}")]
    PathConversion(String),

    #[error("date parse error")]
    DateParseError,

    #[error("url parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("handshake failed: invalid protocol identifier")]
    HandshakeInvalidProtocol,

    #[error("handshake failed: info hash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Result type for torrent operations.
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
