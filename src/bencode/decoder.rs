//! Recursive-descent bencode decoder over an in-memory byte cursor.
//!
//! `.torrent` files and tracker responses are always read fully into memory
//! before decoding (they are at most a few hundred KiB), so decoding works
//! over a `&[u8]` cursor rather than a streaming `Read` — simpler, and lets
//! the top-level entry point assert there are no trailing bytes.
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes one value from `input`, returning the value and the number of
/// bytes consumed. `strict` additionally rejects non-ascending or duplicate
/// dictionary keys; ingestion can leave it off, but canonical re-encoding
/// requires it (see the module docs on [`super::BencodeValue`]).
#[instrument(skip(input), level = "trace")]
pub fn decode(input: &[u8], strict: bool) -> BencodeResult<(BencodeValue, usize)> {
    let mut pos = 0;
    let value = decode_next(input, &mut pos, strict)?;
    Ok((value, pos))
}

/// Decodes exactly one top-level value, erroring on any trailing bytes.
#[instrument(skip(input), level = "debug")]
pub fn decode_all(input: &[u8], strict: bool) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode(input, strict)?;
    if consumed != input.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

fn peek(input: &[u8], pos: usize) -> BencodeResult<u8> {
    input.get(pos).copied().ok_or(BencodeError::UnexpectedEof)
}

fn decode_next(input: &[u8], pos: &mut usize, strict: bool) -> BencodeResult<BencodeValue> {
    match peek(input, *pos)? {
        b'0'..=b'9' => decode_string(input, pos).map(BencodeValue::Bytes),
        b'i' => decode_integer(input, pos).map(BencodeValue::Int),
        b'l' => decode_list(input, pos, strict).map(BencodeValue::List),
        b'd' => decode_dict(input, pos, strict).map(BencodeValue::Dict),
        other => Err(BencodeError::InvalidFormat(format!(
            "unexpected leading byte {:#04x}",
            other
        ))),
    }
}

/// `<decimal-length>:<bytes>`
#[instrument(skip(input), level = "trace")]
fn decode_string(input: &[u8], pos: &mut usize) -> BencodeResult<Vec<u8>> {
    let start = *pos;
    while peek(input, *pos)? != b':' {
        if !peek(input, *pos)?.is_ascii_digit() {
            return Err(BencodeError::InvalidStringLength);
        }
        *pos += 1;
    }
    let length_str = std::str::from_utf8(&input[start..*pos])
        .map_err(|_| BencodeError::InvalidStringLength)?;
    if length_str.len() > 1 && length_str.starts_with('0') {
        return Err(BencodeError::InvalidStringLength);
    }
    let length: usize = length_str
        .parse()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    *pos += 1; // consume ':'

    let end = pos
        .checked_add(length)
        .ok_or(BencodeError::InvalidStringLength)?;
    if end > input.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let bytes = input[*pos..end].to_vec();
    *pos = end;
    Ok(bytes)
}

/// `i<decimal>e`, rejecting leading zeros and `-0`.
#[instrument(skip(input), level = "trace")]
fn decode_integer(input: &[u8], pos: &mut usize) -> BencodeResult<i64> {
    debug_assert_eq!(peek(input, *pos)?, b'i');
    *pos += 1;
    let start = *pos;
    while peek(input, *pos)? != b'e' {
        *pos += 1;
    }
    let digits = std::str::from_utf8(&input[start..*pos]).map_err(|_| BencodeError::InvalidInteger)?;
    *pos += 1; // consume 'e'

    if digits.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    if digits == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    let unsigned = digits.strip_prefix('-').unwrap_or(digits);
    if unsigned.len() > 1 && unsigned.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }
    digits.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)
}

/// `l<value>*e`
#[instrument(skip(input), level = "trace")]
fn decode_list(input: &[u8], pos: &mut usize, strict: bool) -> BencodeResult<Vec<BencodeValue>> {
    debug_assert_eq!(peek(input, *pos)?, b'l');
    *pos += 1;
    let mut list = Vec::new();
    while peek(input, *pos)? != b'e' {
        list.push(decode_next(input, pos, strict)?);
    }
    *pos += 1; // consume 'e'
    Ok(list)
}

/// `d(<string><value>)*e`
#[instrument(skip(input), level = "trace")]
fn decode_dict(
    input: &[u8],
    pos: &mut usize,
    strict: bool,
) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
    debug_assert_eq!(peek(input, *pos)?, b'd');
    *pos += 1;
    let mut dict = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    while peek(input, *pos)? != b'e' {
        if peek(input, *pos)?.is_ascii_digit() {
            let key = decode_string(input, pos)?;
            if strict {
                if let Some(prev) = &last_key {
                    if key == *prev {
                        return Err(BencodeError::DuplicateKey);
                    }
                    if key < *prev {
                        return Err(BencodeError::KeysNotSorted);
                    }
                }
                last_key = Some(key.clone());
            }
            let value = decode_next(input, pos, strict)?;
            if dict.insert(key, value).is_some() && !strict {
                return Err(BencodeError::DuplicateKey);
            }
        } else {
            return Err(BencodeError::DictKeyNotString);
        }
    }
    *pos += 1; // consume 'e'
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::BencodeValue::*;

    #[test]
    fn decodes_integer() {
        assert_eq!(decode_all(b"i42e", false).unwrap(), Int(42));
        assert_eq!(decode_all(b"i-42e", false).unwrap(), Int(-42));
        assert_eq!(decode_all(b"i0e", false).unwrap(), Int(0));
    }

    #[test]
    fn rejects_malformed_integers() {
        assert!(decode_all(b"i01e", false).is_err());
        assert!(decode_all(b"i-0e", false).is_err());
        assert!(decode_all(b"ie", false).is_err());
    }

    #[test]
    fn decodes_string() {
        assert_eq!(decode_all(b"5:hello", false).unwrap(), Bytes(b"hello".to_vec()));
        assert_eq!(decode_all(b"0:", false).unwrap(), Bytes(Vec::new()));
    }

    #[test]
    fn decodes_list() {
        let value = decode_all(b"li42ei-1ee", false).unwrap();
        assert_eq!(value, List(vec![Int(42), Int(-1)]));
    }

    #[test]
    fn decodes_dict_in_btreemap_order() {
        let value = decode_all(b"d1:ai1e1:bli2e5:threeee", false).unwrap();
        match value {
            Dict(map) => {
                let keys: Vec<&Vec<u8>> = map.keys().collect();
                assert_eq!(keys, vec![&b"a".to_vec(), &b"b".to_vec()]);
            }
            _ => panic!("expected dict"),
        }
    }

    #[test]
    fn strict_mode_rejects_out_of_order_keys() {
        let encoded = b"d1:bi1e1:ai2ee";
        assert!(decode_all(encoded, true).is_err());
        assert!(decode_all(encoded, false).is_ok());
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(decode_all(b"5:hel", false).is_err());
        assert!(decode_all(b"li1e", false).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert!(decode_all(b"i1ei2e", false).is_err());
        assert!(decode(b"i1ei2e", false).is_ok());
    }
}
