//! Info-hash computation: SHA-1 of the canonical bencode re-encoding of the
//! `info` sub-dictionary. This is the only correct way to compute it — see
//! the rationale in SPEC_FULL.md §4.1. Every peer and tracker that parsed the
//! same `.torrent` file must land on the same 20 bytes here.
use crate::bencode::encoder::encode_to_vec;
use crate::bencode::BencodeValue;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

pub fn calculate(info_dict: &BTreeMap<Vec<u8>, BencodeValue>) -> [u8; 20] {
    let encoded = encode_to_vec(&BencodeValue::Dict(info_dict.clone()))
        .expect("encoding a decoded BencodeValue::Dict is infallible");
    let mut hasher = Sha1::new();
    hasher.update(&encoded);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}
