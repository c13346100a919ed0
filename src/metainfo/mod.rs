//! Torrent metainfo parsing: turns a bencoded `.torrent` file into a typed
//! [`Metainfo`] record and computes its info-hash.
//!
//! Single-file torrents only (see SPEC_FULL.md Non-goals and the Open
//! Question decision in DESIGN.md): a bencoded `info` dict that carries
//! `files` instead of `length` is rejected rather than guessed at.
use crate::bencode::decoder::decode_all;
use crate::bencode::BencodeValue;
use thiserror::Error;

pub mod info_hash;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode decoding failed: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("root value is not a dictionary")]
    RootNotDict,

    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    #[error("field {0} is not valid UTF-8")]
    NotUtf8(&'static str),

    #[error("pieces length {0} is not a multiple of 20")]
    InvalidPiecesLength(usize),

    #[error("piece_length must be positive, got {0}")]
    NonPositivePieceLength(i64),

    #[error("length must be positive, got {0}")]
    NonPositiveLength(i64),

    #[error("ceil(length / piece_length) = {expected} but pieces implies {actual} pieces")]
    PieceCountMismatch { expected: u64, actual: u64 },
}

pub type Result<T> = std::result::Result<T, MetainfoError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: String,
    pub info_hash: [u8; 20],
    pub piece_length: u32,
    pub pieces: Vec<u8>,
    pub name: String,
    pub length: u64,
}

impl Metainfo {
    #[tracing::instrument(level = "debug")]
    pub fn parse(bytes: &[u8]) -> Result<Metainfo> {
        let root = decode_all(bytes, false)?;
        let mut root_dict = match root {
            BencodeValue::Dict(d) => d,
            _ => return Err(MetainfoError::RootNotDict),
        };

        let announce_bytes = root_dict
            .remove(&b"announce".to_vec())
            .and_then(|v| match v {
                BencodeValue::Bytes(b) => Some(b),
                _ => None,
            })
            .ok_or(MetainfoError::MissingField("announce"))?;
        let announce =
            String::from_utf8(announce_bytes).map_err(|_| MetainfoError::NotUtf8("announce"))?;

        let info_value = root_dict
            .remove(&b"info".to_vec())
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_dict = match &info_value {
            BencodeValue::Dict(d) => d.clone(),
            _ => return Err(MetainfoError::MissingField("info")),
        };

        let piece_length = match info_dict.get(&b"piece length".to_vec()) {
            Some(BencodeValue::Int(i)) if *i > 0 => *i as u32,
            Some(BencodeValue::Int(i)) => return Err(MetainfoError::NonPositivePieceLength(*i)),
            _ => return Err(MetainfoError::MissingField("piece length")),
        };

        let pieces = match info_dict.get(&b"pieces".to_vec()) {
            Some(BencodeValue::Bytes(b)) => b.clone(),
            _ => return Err(MetainfoError::MissingField("pieces")),
        };
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPiecesLength(pieces.len()));
        }

        let name_bytes = match info_dict.get(&b"name".to_vec()) {
            Some(BencodeValue::Bytes(b)) => b.clone(),
            _ => return Err(MetainfoError::MissingField("name")),
        };
        let name = String::from_utf8(name_bytes).map_err(|_| MetainfoError::NotUtf8("name"))?;

        let length = match info_dict.get(&b"length".to_vec()) {
            Some(BencodeValue::Int(i)) if *i > 0 => *i as u64,
            Some(BencodeValue::Int(i)) => return Err(MetainfoError::NonPositiveLength(*i)),
            _ => return Err(MetainfoError::MissingField("length")),
        };

        let info_hash = info_hash::calculate(&info_dict);

        let metainfo = Metainfo {
            announce,
            info_hash,
            piece_length,
            pieces,
            name,
            length,
        };
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<()> {
        let num_pieces = self.num_pieces() as u64;
        let expected = (self.length + self.piece_length as u64 - 1) / self.piece_length as u64;
        if expected != num_pieces {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                actual: num_pieces,
            });
        }
        Ok(())
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Length of piece `index`; the last piece may be shorter than
    /// `piece_length`.
    pub fn piece_length_of(&self, index: usize) -> u32 {
        if index + 1 == self.num_pieces() {
            let full = (self.num_pieces() - 1) as u64 * self.piece_length as u64;
            (self.length - full) as u32
        } else {
            self.piece_length
        }
    }

    pub fn expected_hash(&self, index: usize) -> &[u8] {
        &self.pieces[index * 20..index * 20 + 20]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes(num_pieces: usize, length: u64, piece_length: u32) -> Vec<u8> {
        use crate::bencode::encoder::encode_to_vec;
        use std::collections::BTreeMap;

        let mut info = BTreeMap::new();
        info.insert(
            b"piece length".to_vec(),
            BencodeValue::Int(piece_length as i64),
        );
        info.insert(
            b"pieces".to_vec(),
            BencodeValue::Bytes(vec![0u8; 20 * num_pieces]),
        );
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"test_file.txt".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Int(length as i64));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::Bytes(b"http://tracker.example.com:8080/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        encode_to_vec(&BencodeValue::Dict(root)).unwrap()
    }

    #[test]
    fn parses_well_formed_metainfo() {
        // 1024-byte file, 16384-byte piece_length => a single (short) piece.
        let bytes = sample_bytes(1, 1024, 16384);
        let m = Metainfo::parse(&bytes).unwrap();
        assert_eq!(m.announce, "http://tracker.example.com:8080/announce");
        assert_eq!(m.name, "test_file.txt");
        assert_eq!(m.length, 1024);
        assert_eq!(m.num_pieces(), 1);
        assert_eq!(m.piece_length_of(0), 1024);
    }

    #[test]
    fn info_hash_is_sha1_of_canonical_info_encoding() {
        use crate::bencode::encoder::encode_to_vec;
        use sha1::{Digest, Sha1};

        let bytes = sample_bytes(1, 1024, 16384);
        let m = Metainfo::parse(&bytes).unwrap();

        let mut info = std::collections::BTreeMap::new();
        info.insert(
            b"piece length".to_vec(),
            BencodeValue::Int(16384),
        );
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(vec![0u8; 20]));
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"test_file.txt".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Int(1024));
        let encoded = encode_to_vec(&BencodeValue::Dict(info)).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(&encoded);
        let expected: [u8; 20] = hasher.finalize().into();

        assert_eq!(m.info_hash, expected);
        assert_eq!(m.info_hash.len(), 20);
    }

    #[test]
    fn last_piece_may_be_shorter() {
        // 3 pieces of 16384 bytes, total length trimmed so the last piece is short.
        let length = 16384 * 2 + 100;
        let bytes = sample_bytes(3, length, 16384);
        let m = Metainfo::parse(&bytes).unwrap();
        assert_eq!(m.piece_length_of(0), 16384);
        assert_eq!(m.piece_length_of(1), 16384);
        assert_eq!(m.piece_length_of(2), 100);
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        // 1024 bytes needs exactly 1 piece at piece_length=16384, claim 2.
        let bytes = sample_bytes(2, 1024, 16384);
        assert!(matches!(
            Metainfo::parse(&bytes),
            Err(MetainfoError::PieceCountMismatch { .. })
        ));
    }

    #[test]
    fn rejects_missing_fields() {
        let bytes = crate::bencode::encoder::encode_to_vec(&BencodeValue::Dict(Default::default()))
            .unwrap();
        assert!(matches!(
            Metainfo::parse(&bytes),
            Err(MetainfoError::MissingField("announce"))
        ));
    }
}
