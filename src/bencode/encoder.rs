//! Bencode encoding.
use super::{BencodeError, BencodeResult, BencodeValue};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &BTreeMap<Vec<u8>, BencodeValue>) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    // BTreeMap iterates in sorted key order already, so the wire output is
    // canonical without a separate sort step.
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes a value to its canonical bencode byte representation.
#[instrument(skip(value), level = "debug")]
pub fn encode(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode_value(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_string() {
        assert_eq!(encode(&BencodeValue::String(b"hello".to_vec())).unwrap(), b"5:hello");
    }

    #[test]
    fn encodes_integer() {
        assert_eq!(encode(&BencodeValue::Integer(42)).unwrap(), b"i42e");
        assert_eq!(encode(&BencodeValue::Integer(-3)).unwrap(), b"i-3e");
    }

    #[test]
    fn encodes_list() {
        let value = BencodeValue::List(vec![
            BencodeValue::Integer(1),
            BencodeValue::String(b"a".to_vec()),
        ]);
        assert_eq!(encode(&value).unwrap(), b"li1e1:ae");
    }

    #[test]
    fn encodes_dict_in_sorted_order() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zebra".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"apple".to_vec(), BencodeValue::Integer(2));
        let value = BencodeValue::Dict(dict);
        assert_eq!(encode(&value).unwrap(), b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn round_trips_through_decode() {
        use super::super::decoder::decode;
        let mut dict = BTreeMap::new();
        dict.insert(b"length".to_vec(), BencodeValue::Integer(10));
        dict.insert(b"name".to_vec(), BencodeValue::String(b"file.bin".to_vec()));
        let value = BencodeValue::Dict(dict);
        let bytes = encode(&value).unwrap();
        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }
}
