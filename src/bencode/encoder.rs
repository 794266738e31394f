use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use std::collections::HashMap;
use std::io::Write;
use tracing::instrument;

/// Encodes a byte slice as a bencode string.
///
/// # Example Output
/// For input: b"hello"
/// Output: "5:hello"
#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

/// Encodes an integer as a bencode integer.
///
/// # Example Output
/// For input: 42
/// Output: "i42e"
#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

/// Encodes a slice of BencodeValue as a bencode list.
///
/// # Example Output
/// For input: [1, "hello"]
/// Output: "li1e5:helloe"
#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a HashMap of byte slices to BencodeValue as a bencode dictionary.
///
/// Keys are sorted lexicographically before writing: bencode dictionaries
/// are required to carry sorted keys, and a re-encode must be bit-exact
/// relative to anything else built from the same tree.
///
/// # Example Output
/// For input: {"key": 42}
/// Output: "d3:keyi42ee"
#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(
    writer: &mut W,
    dict: &HashMap<Vec<u8>, BencodeValue>,
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    let mut keys: Vec<&Vec<u8>> = dict.keys().collect();
    keys.sort_unstable();
    for key in keys {
        encode_string(writer, key)?;
        let value = dict
            .get(key)
            .ok_or_else(|| BencodeError::InvalidFormat("Missing dict value for key".to_string()))?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a BencodeValue into its bencode representation.
#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Public function to encode a BencodeValue into its bencode representation.
#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper returning the encoded bytes directly.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder;

    #[test]
    fn round_trips_dict() {
        let input = b"d3:cow3:moo4:spam4:eggse";
        let value = decoder::decode(input).unwrap();
        let encoded = encode_to_vec(&value).unwrap();
        assert_eq!(encoded, input);
    }

    #[test]
    fn round_trips_nested_list() {
        let input = b"d4:listl4:spami42eee";
        let value = decoder::decode(input).unwrap();
        let encoded = encode_to_vec(&value).unwrap();
        assert_eq!(encoded, input);
    }

    #[test]
    fn decode_then_encode_is_idempotent() {
        let value = BencodeValue::Integer(-17);
        let encoded = encode_to_vec(&value).unwrap();
        let decoded = decoder::decode(&encoded).unwrap();
        assert_eq!(value, decoded);
    }
}
