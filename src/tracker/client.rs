//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers: building
//! and sending an announce request, and parsing the bencoded response. Peers
//! are always taken in dictionary form (`ip`/`port`/`peer_id` sub-dicts) —
//! the compact peers-string encoding is not supported, matching the
//! dictionary-only responses our own tracker server emits.
use crate::bencode::decoder::decode_all;
use crate::bencode::BencodeValue;
use crate::metainfo::Metainfo;
use anyhow::{anyhow, Result};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker response was not a bencoded dictionary")]
    MalformedResponse,

    #[error("tracker returned failure reason: {0}")]
    Failure(String),
}

/// A client communicating with a BitTorrent tracker on behalf of one torrent
/// session. Holds this client's peer id and listen port across announces.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

/// Parameters for a tracker announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<&'static str>,
}

/// A peer returned by the tracker.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: [u8; 20],
    pub ip: IpAddr,
    pub port: u16,
}

/// The parsed response from a tracker announce.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

impl Client {
    pub fn new(peer_id: [u8; 20], port: u16) -> Self {
        Self { peer_id, port }
    }

    /// Sends an announce request to the tracker named in `metainfo.announce`
    /// and returns the parsed peer list.
    #[tracing::instrument(skip(self, metainfo), fields(name = %metainfo.name), level = "debug")]
    pub async fn announce(&self, metainfo: &Metainfo, left: u64, event: Option<&'static str>) -> Result<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: 0,
            left,
            event,
        };

        let mut url = url::Url::parse(&metainfo.announce)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("info_hash", &url_encode(&request.info_hash));
            pairs.append_pair("peer_id", &url_encode(&request.peer_id));
            pairs.append_pair("port", &request.port.to_string());
            pairs.append_pair("uploaded", &request.uploaded.to_string());
            pairs.append_pair("downloaded", &request.downloaded.to_string());
            pairs.append_pair("left", &request.left.to_string());
            if let Some(event) = request.event {
                pairs.append_pair("event", event);
            }
        }

        tracing::debug!(%url, "making announce request to tracker");
        let response = reqwest::get(url).await?;
        let response_bytes = response.bytes().await?;
        Self::parse_announce_response(&response_bytes)
    }

    /// Parses a bencoded tracker announce response.
    ///
    /// The expected shape is a dictionary:
    /// `d8:intervali<n>e5:peersl d7:peer_id20:...2:ip<n>:...4:porti<n>eeee`
    fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse> {
        let value = decode_all(bytes, false).map_err(|e| anyhow!(e))?;
        let root = match value {
            BencodeValue::Dict(d) => d,
            _ => return Err(TrackerError::MalformedResponse.into()),
        };

        if let Some(BencodeValue::Bytes(reason)) = root.get(&b"failure reason".to_vec()) {
            let reason = String::from_utf8_lossy(reason).into_owned();
            return Err(TrackerError::Failure(reason).into());
        }

        let interval = match root.get(&b"interval".to_vec()) {
            Some(BencodeValue::Int(i)) => *i,
            _ => return Err(TrackerError::MalformedResponse.into()),
        };

        let peers_list = match root.get(&b"peers".to_vec()) {
            Some(BencodeValue::List(list)) => list,
            _ => return Err(TrackerError::MalformedResponse.into()),
        };

        let mut peers = Vec::with_capacity(peers_list.len());
        for entry in peers_list {
            let dict = match entry {
                BencodeValue::Dict(d) => d,
                _ => return Err(TrackerError::MalformedResponse.into()),
            };
            let ip_bytes = match dict.get(&b"ip".to_vec()) {
                Some(BencodeValue::Bytes(b)) => b,
                _ => return Err(TrackerError::MalformedResponse.into()),
            };
            let ip: IpAddr = String::from_utf8_lossy(ip_bytes)
                .parse()
                .map_err(|_| TrackerError::MalformedResponse)?;
            let port = match dict.get(&b"port".to_vec()) {
                Some(BencodeValue::Int(i)) => *i as u16,
                _ => return Err(TrackerError::MalformedResponse.into()),
            };
            let peer_id = match dict.get(&b"peer_id".to_vec()) {
                Some(BencodeValue::Bytes(b)) if b.len() == 20 => {
                    let mut id = [0u8; 20];
                    id.copy_from_slice(b);
                    id
                }
                _ => [0u8; 20],
            };
            peers.push(Peer { peer_id, ip, port });
        }

        Ok(AnnounceResponse { interval, peers })
    }
}

/// URL-encodes a byte slice per RFC 3986, leaving the unreserved character
/// set (`a-zA-Z0-9-._~`) untouched and percent-encoding everything else.
pub fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode_to_vec;
    use std::collections::BTreeMap;

    #[test]
    fn url_encode_leaves_unreserved_untouched() {
        assert_eq!(url_encode(b"abc-._~"), "abc-._~");
        assert_eq!(url_encode(b" "), "%20");
    }

    #[test]
    fn parses_dictionary_format_peers() {
        let mut peer_dict = BTreeMap::new();
        peer_dict.insert(b"peer_id".to_vec(), BencodeValue::Bytes(vec![1u8; 20]));
        peer_dict.insert(b"ip".to_vec(), BencodeValue::Bytes(b"127.0.0.1".to_vec()));
        peer_dict.insert(b"port".to_vec(), BencodeValue::Int(6881));

        let mut root = BTreeMap::new();
        root.insert(b"interval".to_vec(), BencodeValue::Int(120));
        root.insert(
            b"peers".to_vec(),
            BencodeValue::List(vec![BencodeValue::Dict(peer_dict)]),
        );

        let bytes = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
        let response = Client::parse_announce_response(&bytes).unwrap();
        assert_eq!(response.interval, 120);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port, 6881);
        assert_eq!(response.peers[0].ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_failure_reason() {
        let mut root = BTreeMap::new();
        root.insert(
            b"failure reason".to_vec(),
            BencodeValue::Bytes(b"unregistered torrent".to_vec()),
        );
        let bytes = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
        assert!(Client::parse_announce_response(&bytes).is_err());
    }
}
