//! Bencode decoding.
//!
//! Unlike a `Read`-based parser, [`Decoder`] walks a byte slice and tracks
//! its cursor position. That is what lets [`extract_info_slice`] hand back
//! the exact byte range of the `info` dictionary without re-encoding it —
//! re-encoding a dictionary that arrived in non-canonical form would change
//! its hash, and the info-hash must not depend on that.
use super::{BencodeError, BencodeResult, BencodeValue};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::instrument;

pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEOI)
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BencodeError::UnexpectedEOI)?;
        let slice = self
            .input
            .get(self.pos..end)
            .ok_or(BencodeError::UnexpectedEOI)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            let byte = self.peek()?;
            if byte == delimiter {
                let slice = &self.input[start..self.pos];
                self.advance(1);
                return Ok(slice);
            }
            self.advance(1);
        }
    }

    #[instrument(skip(self), level = "trace")]
    pub fn decode_value(&mut self) -> BencodeResult<BencodeValue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_string().map(BencodeValue::String),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            other => Err(BencodeError::InvalidFormat(format!(
                "unexpected byte {:#04x} at start of value",
                other
            ))),
        }
    }

    #[instrument(skip(self), level = "trace")]
    pub fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let len_bytes = self.read_until(b':')?;
        let len_str =
            std::str::from_utf8(len_bytes).map_err(|_| BencodeError::InvalidStringLength)?;
        if len_str.is_empty() || (len_str.len() > 1 && len_str.starts_with('0')) {
            return Err(BencodeError::InvalidStringLength);
        }
        let length: usize = len_str
            .parse()
            .map_err(|_| BencodeError::InvalidStringLength)?;
        Ok(self.take(length)?.to_vec())
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        self.advance(1); // 'i'
        let num_bytes = self.read_until(b'e')?;
        let num_str = std::str::from_utf8(num_bytes).map_err(|_| BencodeError::InvalidInteger)?;

        if num_str.is_empty() || num_str == "-0" {
            return Err(BencodeError::InvalidInteger);
        }
        let digits = num_str.strip_prefix('-').unwrap_or(num_str);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BencodeError::InvalidInteger);
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(BencodeError::InvalidInteger);
        }

        num_str.parse().map_err(|_| BencodeError::InvalidInteger)
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        self.advance(1); // 'l'
        let mut list = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.advance(1);
                return Ok(list);
            }
            list.push(self.decode_value()?);
        }
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_dict(&mut self) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
        self.advance(1); // 'd'
        let mut dict = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            if self.peek()? == b'e' {
                self.advance(1);
                return Ok(dict);
            }
            if !matches!(self.peek()?, b'0'..=b'9') {
                return Err(BencodeError::DictKeyNotString);
            }
            let key = self.decode_string()?;
            if let Some(prev) = &last_key {
                if key <= *prev {
                    return Err(BencodeError::DictKeysUnsorted(key));
                }
            }
            let value = self.decode_value()?;
            last_key = Some(key.clone());
            dict.insert(key, value);
        }
    }
}

/// Decodes exactly one value from the head of `bytes`, returning it along
/// with how many bytes it consumed.
#[instrument(skip(bytes), level = "debug")]
pub fn decode(bytes: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.decode_value()?;
    Ok((value, decoder.position()))
}

/// Decodes the top-level metainfo dictionary, returning the whole value plus
/// the exact half-open byte range occupied by the raw `info` sub-dictionary.
///
/// The range is what the SHA-1 info-hash must be computed over: re-encoding
/// `info` after decoding it would only be guaranteed byte-identical if the
/// source was already canonical, which tracker/metainfo input is not
/// guaranteed to be.
#[instrument(skip(bytes), level = "debug")]
pub fn extract_info_slice(bytes: &[u8]) -> BencodeResult<(BencodeValue, Range<usize>)> {
    let mut decoder = Decoder::new(bytes);
    if decoder.peek()? != b'd' {
        return Err(BencodeError::InvalidFormat(
            "metainfo root is not a dictionary".to_string(),
        ));
    }
    decoder.advance(1);

    let mut dict = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    let mut info_range: Option<Range<usize>> = None;

    loop {
        if decoder.peek()? == b'e' {
            decoder.advance(1);
            break;
        }
        let key = decoder.decode_string()?;
        if let Some(prev) = &last_key {
            if key <= *prev {
                return Err(BencodeError::DictKeysUnsorted(key));
            }
        }

        let value_start = decoder.position();
        let value = decoder.decode_value()?;
        let value_end = decoder.position();

        if key == b"info" {
            info_range = Some(value_start..value_end);
        }

        last_key = Some(key.clone());
        dict.insert(key, value);
    }

    let info_range = info_range.ok_or_else(|| {
        BencodeError::InvalidFormat("metainfo is missing the `info` key".to_string())
    })?;

    Ok((BencodeValue::Dict(dict), info_range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        let (v, n) = decode(b"5:hello").unwrap();
        assert_eq!(v, BencodeValue::String(b"hello".to_vec()));
        assert_eq!(n, 7);
    }

    #[test]
    fn decodes_integer() {
        let (v, _) = decode(b"i42e").unwrap();
        assert_eq!(v, BencodeValue::Integer(42));
        let (v, _) = decode(b"i-3e").unwrap();
        assert_eq!(v, BencodeValue::Integer(-3));
        let (v, _) = decode(b"i0e").unwrap();
        assert_eq!(v, BencodeValue::Integer(0));
    }

    #[test]
    fn rejects_leading_zero_integer() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"ie").is_err());
    }

    #[test]
    fn decodes_list() {
        let (v, _) = decode(b"li42e5:helloe").unwrap();
        assert_eq!(
            v,
            BencodeValue::List(vec![
                BencodeValue::Integer(42),
                BencodeValue::String(b"hello".to_vec())
            ])
        );
    }

    #[test]
    fn decodes_dict_sorted() {
        let (v, _) = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
        let dict = v.as_dict().unwrap();
        assert_eq!(
            dict.get(b"bar".as_slice()).unwrap(),
            &BencodeValue::String(b"spam".to_vec())
        );
        assert_eq!(
            dict.get(b"foo".as_slice()).unwrap(),
            &BencodeValue::Integer(42)
        );
    }

    #[test]
    fn rejects_unsorted_dict_keys() {
        assert!(decode(b"d3:fooi1e3:bari2ee").is_err());
    }

    #[test]
    fn rejects_duplicate_dict_keys() {
        assert!(decode(b"d3:fooi1e3:fooi2ee").is_err());
    }

    #[test]
    fn rejects_string_length_exceeding_input() {
        assert!(decode(b"10:short").is_err());
    }

    #[test]
    fn extract_info_slice_returns_exact_range() {
        let bytes = b"d8:announce3:foo4:infod6:lengthi10ee6:pieces0:e";
        let (_, range) = extract_info_slice(bytes).unwrap();
        assert_eq!(&bytes[range.clone()], &b"d6:lengthi10ee"[..]);
    }
}
