//! Bencode codec: the compact self-delimited binary serialisation used for
//! `.torrent` metainfo and tracker announce replies.
//!
//! A [`BencodeValue`] is a tagged sum over the four bencode variants. Decoding
//! returns the tree as-is; higher-level parsers (see [`crate::metainfo`])
//! destructure it into typed records and reject shape mismatches as their own
//! error type. Dictionaries are kept in a `BTreeMap` rather than a `HashMap`
//! so that "encode keys in ascending lexicographic order" is structural
//! instead of something every encode call site has to remember to do.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer literal")]
    InvalidInteger,

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("dictionary keys must be strings")]
    DictKeyNotString,

    #[error("duplicate dictionary key")]
    DuplicateKey,

    #[error("dictionary keys out of ascending order")]
    KeysNotSorted,

    #[error("trailing bytes after top-level value")]
    TrailingBytes,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
