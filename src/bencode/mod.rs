//! Bencode codec.
//!
//! Bencode is the binary encoding used by `.torrent` files and tracker
//! responses: integers, byte strings, lists, and dictionaries. The
//! dictionary variant is a `BTreeMap` rather than a hash map so that
//! canonical (sorted-key) encoding falls out of iteration order instead of
//! needing a separate sort step that could silently disagree with what the
//! decoder accepted as sorted.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, extract_info_slice};
pub use encoder::encode;

/// A decoded Bencode value.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    /// A raw byte string. Bencode strings are length-prefixed binary data,
    /// not necessarily UTF-8 text.
    String(Vec<u8>),
    /// A signed integer. The wire format places no upper bound on magnitude;
    /// `i64` is sufficient for every quantity this protocol needs.
    Integer(i64),
    List(Vec<BencodeValue>),
    /// Keys sorted lexicographically as raw bytes, per the bencode spec.
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Custom error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("unexpected end of input")]
    UnexpectedEOI,

    #[error("cannot encode type: {0}")]
    CannotEncodeType(&'static str),

    #[error("dictionary keys must be byte strings")]
    DictKeyNotString,

    #[error("dictionary keys out of order or duplicated at key {0:?}")]
    DictKeysUnsorted(Vec<u8>),

    #[error("trailing bytes after top-level value")]
    TrailingBytes,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
