use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::cell::Cell;
use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::rc::Rc;
use tracing::instrument;

/// Decodes a bencode string from the input stream.
///
/// This function reads a bencode string in the format `<length>:<data>` where:
/// - `<length>` is a decimal number indicating the length of the string
/// - `<data>` is the actual string data of the specified length
///
/// # Arguments
/// * `reader` - A peekable iterator over the bytes of the input stream
///
/// # Returns
/// * `Result<Vec<u8>>` - The decoded string as a byte vector, or an error if:
///   - The length prefix is invalid or missing
///   - The input ends unexpectedly
///   - An I/O error occurs
///
/// # Example
/// For input "5:hello", this function will return a Vec<u8> containing [104, 101, 108, 108, 111]
#[instrument(skip(reader), level = "trace")]
pub fn decode_string<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
) -> BencodeResult<Vec<u8>> {
    let length_str = read_until(reader, b':')?;
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    let mut string_bytes = vec![0; length];
    for byte in string_bytes.iter_mut() {
        *byte = reader
            .next()
            .ok_or(BencodeError::UnexpectedEOI)?
            .map_err(|e| BencodeError::Io(e.kind().into()))?;
    }
    Ok(string_bytes)
}

/// Reads bytes from the reader until a specified delimiter is encountered.
///
/// This function reads bytes one at a time from the input stream until it finds
/// the specified delimiter byte. It collects all bytes read (excluding the delimiter)
/// into a buffer and returns them as a UTF-8 string.
///
/// # Arguments
/// * `reader` - A peekable iterator over the bytes of the input stream
/// * `delimiter` - The byte value that marks the end of the reading
///
/// # Returns
/// * `Result<String>` - The collected bytes as a UTF-8 string, or an error if:
///   - The input ends unexpectedly
///   - An I/O error occurs
///   - The collected bytes are not valid UTF-8
#[instrument(skip(reader), level = "trace")]
pub fn read_until<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
    delimiter: u8,
) -> BencodeResult<String> {
    let mut buffer = Vec::new();

    loop {
        let &current_byte = reader
            .peek()
            .ok_or(BencodeError::UnexpectedEOI)?
            .as_ref()
            .map_err(|e| BencodeError::Io(e.kind().into()))?;

        if current_byte == delimiter {
            reader
                .next()
                .ok_or(BencodeError::UnexpectedEOI)?
                .map_err(|e| BencodeError::Io(e.kind().into()))?;
            break;
        } else {
            buffer.push(
                reader
                    .next()
                    .ok_or(BencodeError::UnexpectedEOI)?
                    .map_err(|e| BencodeError::Io(e.kind().into()))?,
            );
        }
    }

    String::from_utf8(buffer).map_err(|e| {
        BencodeError::InvalidFormat(format!("Non-UTF8 characters in length/integer: {}", e))
    })
}

/// Decodes a bencode integer from the input stream.
///
/// This function reads a bencode integer in the format `i<number>e` where:
/// - `i` is the literal character 'i' marking the start of an integer
/// - `<number>` is the actual integer value
/// - `e` is the literal character 'e' marking the end of the integer
///
/// The function performs several validations:
/// - Ensures the integer starts with 'i'
/// - Rejects leading zeros (except for single '0')
/// - Rejects "-0" as invalid
/// - Rejects empty integers
#[instrument(skip(reader), level = "trace")]
pub fn decode_integer<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
) -> BencodeResult<i64> {
    let first_byte = reader
        .next()
        .ok_or(BencodeError::UnexpectedEOI)?
        .map_err(|e| BencodeError::Io(e.kind().into()))?;

    if first_byte != b'i' {
        return Err(BencodeError::InvalidFormat(
            "Integer must start with 'i'".to_string(),
        ));
    }

    let num_str = read_until(reader, b'e')?;

    if num_str.len() > 1 && num_str.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }

    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }

    num_str
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger)
}

/// Decodes a bencode list from the input stream.
#[instrument(skip(reader), level = "trace")]
fn decode_list<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
) -> BencodeResult<Vec<BencodeValue>> {
    let first_byte = reader
        .next()
        .ok_or(BencodeError::UnexpectedEOI)?
        .map_err(|e| BencodeError::Io(e.kind().into()))?;
    if first_byte != b'l' {
        return Err(BencodeError::InvalidFormat(
            "List must start with 'l'".to_string(),
        ));
    }

    let mut list = Vec::new();

    loop {
        let &current_byte = reader
            .peek()
            .ok_or(BencodeError::UnexpectedEOI)?
            .as_ref()
            .map_err(|e| BencodeError::Io(e.kind().into()))?;

        if current_byte == b'e' {
            reader
                .next()
                .ok_or(BencodeError::UnexpectedEOI)?
                .map_err(|e| BencodeError::Io(e.kind().into()))?;
            break;
        }

        let item = decode_next(reader)?;
        list.push(item);
    }

    Ok(list)
}

/// Decodes a bencode dictionary from the input stream.
///
/// Keys must be strings, strictly increasing in byte order with no
/// duplicates (bencode's strict-mode canonical form); a key that is equal
/// to or lexicographically before the previous one is rejected with
/// [`BencodeError::StrictKeyViolation`].
#[instrument(skip(reader), level = "trace")]
fn decode_dict<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
) -> BencodeResult<HashMap<Vec<u8>, BencodeValue>> {
    let first_byte = reader
        .next()
        .ok_or(BencodeError::UnexpectedEOI)?
        .map_err(|e| BencodeError::Io(e.kind().into()))?;

    if first_byte != b'd' {
        return Err(BencodeError::InvalidFormat(
            "Dictionary must start with 'd'".to_string(),
        ));
    }

    let mut dict = HashMap::new();
    let mut last_key: Option<Vec<u8>> = None;

    loop {
        let &current_byte = reader
            .peek()
            .ok_or(BencodeError::UnexpectedEOI)?
            .as_ref()
            .map_err(|e| BencodeError::Io(e.kind().into()))?;

        if current_byte == b'e' {
            reader
                .next()
                .ok_or(BencodeError::UnexpectedEOI)?
                .map_err(|e| BencodeError::Io(e.kind().into()))?;
            break;
        }

        if !current_byte.is_ascii_digit() {
            return Err(BencodeError::DictKeyNotString);
        }

        let key = decode_string(reader)?;
        if let Some(previous) = &last_key {
            if &key <= previous {
                return Err(BencodeError::StrictKeyViolation {
                    previous: previous.clone(),
                    key,
                });
            }
        }
        last_key = Some(key.clone());

        let value = decode_next(reader)?;
        dict.insert(key, value);
    }

    Ok(dict)
}

#[instrument(skip(reader), level = "trace")]
fn decode_next<R: Read>(
    reader: &mut std::iter::Peekable<io::Bytes<R>>,
) -> BencodeResult<BencodeValue> {
    let &first_byte = reader
        .peek()
        .ok_or(BencodeError::UnexpectedEOI)?
        .as_ref()
        .map_err(|e| BencodeError::Io(e.kind().into()))?;

    match first_byte {
        b'0'..=b'9' => decode_string(reader).map(BencodeValue::String),
        b'i' => decode_integer(reader).map(BencodeValue::Integer),
        b'l' => decode_list(reader).map(BencodeValue::List),
        b'd' => decode_dict(reader).map(BencodeValue::Dict),
        _ => Err(BencodeError::InvalidFormat(format!(
            "Unexpected character: {}",
            first_byte as char
        ))),
    }
}

/// Decodes a single bencode value from a complete byte slice.
///
/// Trailing bytes after the value are ignored, matching `serde_bencode`'s
/// permissive top-level behavior; callers that need strict "whole input is
/// one value" semantics should check the iterator is exhausted themselves.
#[instrument(skip(data), level = "debug")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let mut reader = Cursor::new(data).bytes().peekable();
    decode_next(&mut reader)
}

/// A `Read` wrapper that counts bytes pulled through it, used to recover the
/// exact byte span a nested value occupied in the original input.
struct CountingReader<R> {
    inner: R,
    count: Rc<Cell<usize>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.set(self.count.get() + n);
        Ok(n)
    }
}

/// Decodes the top-level bencode dictionary of `data`, additionally
/// returning the `[start, end)` byte range that the value bound to
/// `wanted_key` occupied in `data`.
///
/// This exists solely to satisfy the info-hash invariant: the hash must be
/// computed over the literal wire bytes of the `info` value, never over a
/// re-encoding of the parsed tree (some producers emit non-canonical key
/// order, which a re-encode would not reproduce).
#[instrument(skip(data), level = "debug")]
pub fn decode_root_with_span(
    data: &[u8],
    wanted_key: &[u8],
) -> BencodeResult<(HashMap<Vec<u8>, BencodeValue>, Option<(usize, usize)>)> {
    let count = Rc::new(Cell::new(0usize));
    let counting = CountingReader {
        inner: Cursor::new(data),
        count: count.clone(),
    };
    let mut reader = counting.bytes().peekable();

    let first_byte = reader
        .next()
        .ok_or(BencodeError::UnexpectedEOI)?
        .map_err(|e| BencodeError::Io(e.kind().into()))?;
    if first_byte != b'd' {
        return Err(BencodeError::InvalidFormat(
            "Root value is not a dictionary".to_string(),
        ));
    }

    let mut dict = HashMap::new();
    let mut wanted_span = None;
    let mut last_key: Option<Vec<u8>> = None;

    loop {
        let &current_byte = reader
            .peek()
            .ok_or(BencodeError::UnexpectedEOI)?
            .as_ref()
            .map_err(|e| BencodeError::Io(e.kind().into()))?;

        if current_byte == b'e' {
            reader
                .next()
                .ok_or(BencodeError::UnexpectedEOI)?
                .map_err(|e| BencodeError::Io(e.kind().into()))?;
            break;
        }

        let key = decode_string(&mut reader)?;
        if let Some(previous) = &last_key {
            if &key <= previous {
                return Err(BencodeError::StrictKeyViolation {
                    previous: previous.clone(),
                    key,
                });
            }
        }
        last_key = Some(key.clone());

        let start = count.get();
        let value = decode_next(&mut reader)?;
        let end = count.get();

        if key == wanted_key {
            wanted_span = Some((start, end));
        }
        dict.insert(key, value);
    }

    Ok((dict, wanted_span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::BencodeValue;

    #[test]
    fn decodes_string() {
        let v = decode(b"5:hello").unwrap();
        assert_eq!(v, BencodeValue::String(b"hello".to_vec()));
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-3e").unwrap(), BencodeValue::Integer(-3));
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i03e").is_err());
    }

    #[test]
    fn decodes_list() {
        let v = decode(b"l4:spami42ee").unwrap();
        assert_eq!(
            v,
            BencodeValue::List(vec![
                BencodeValue::String(b"spam".to_vec()),
                BencodeValue::Integer(42),
            ])
        );
    }

    #[test]
    fn decodes_dict() {
        let v = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let mut expected = HashMap::new();
        expected.insert(b"cow".to_vec(), BencodeValue::String(b"moo".to_vec()));
        expected.insert(b"spam".to_vec(), BencodeValue::String(b"eggs".to_vec()));
        assert_eq!(v, BencodeValue::Dict(expected));
    }

    #[test]
    fn rejects_premature_end() {
        assert!(decode(b"5:hel").is_err());
        assert!(decode(b"i42").is_err());
        assert!(decode(b"l4:spam").is_err());
    }

    #[test]
    fn span_extraction_matches_substring() {
        let data = b"d8:announce3:foo4:infod6:lengthi10e4:name4:teste" as &[u8];
        let (_dict, span) = decode_root_with_span(data, b"info").unwrap();
        let (start, end) = span.expect("info span present");
        assert_eq!(&data[start..end], b"d6:lengthi10e4:name4:teste");
    }

    #[test]
    fn rejects_duplicate_key() {
        let err = decode(b"d3:cow3:moo3:cow3:baae").unwrap_err();
        assert!(matches!(err, BencodeError::StrictKeyViolation { .. }));
    }

    #[test]
    fn rejects_unsorted_keys() {
        let err = decode(b"d4:spam4:eggs3:cow3:mooe").unwrap_err();
        assert!(matches!(err, BencodeError::StrictKeyViolation { .. }));
    }

    #[test]
    fn root_span_rejects_unsorted_top_level_keys() {
        let err = decode_root_with_span(b"d4:infod4:name4:teste8:announce3:fooe", b"info").unwrap_err();
        assert!(matches!(err, BencodeError::StrictKeyViolation { .. }));
    }
}
