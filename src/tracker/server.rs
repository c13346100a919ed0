//! Standalone HTTP tracker: accepts `GET /announce`, returns the bencoded
//! dictionary-format peer list for that torrent, and serves `GET /stats` as
//! a small HTML status page.
//!
//! Grounded on `original_source/tracker.py`'s `TrackerData`/`TrackerRequestHandler`
//! (per-torrent peer map keyed by `ip:port`, `stopped` removes the peer,
//! stale peers reaped on a timer) ported onto an axum router, since the
//! teacher crate has no HTTP server of its own.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::error_handling::HandleErrorLayer;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{BoxError, Router};
use serde::Deserialize;
use tokio::sync::Mutex;
use tower::ServiceBuilder;

use crate::bencode::encoder::encode_to_vec;
use crate::bencode::BencodeValue;

/// Interval advertised to peers in the `interval` field of announce
/// responses (SPEC_FULL.md ambient stack).
pub const ANNOUNCE_INTERVAL_SECS: i64 = 120;
/// Peers that haven't announced within this window are reaped.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(180);
/// How often the reaper sweeps for stale peers.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);
/// Per-request timeout applied to every route.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type InfoHash = Vec<u8>;

#[derive(Debug, Clone)]
struct PeerRecord {
    peer_id: Vec<u8>,
    ip: IpAddr,
    port: u16,
    completed: bool,
    last_announce: Instant,
}

#[derive(Default)]
struct TrackerData {
    torrents: HashMap<InfoHash, HashMap<String, PeerRecord>>,
}

impl TrackerData {
    fn add_peer(&mut self, info_hash: InfoHash, peer_key: String, record: PeerRecord, event: Option<&str>) {
        let peers = self.torrents.entry(info_hash).or_default();
        if event == Some("stopped") {
            peers.remove(&peer_key);
        } else {
            peers.insert(peer_key, record);
        }
    }

    fn peers_for(&self, info_hash: &[u8], exclude: &str) -> Vec<PeerRecord> {
        self.torrents
            .get(info_hash)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(key, _)| key.as_str() != exclude)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reap_stale(&mut self) {
        let now = Instant::now();
        self.torrents.retain(|_, peers| {
            peers.retain(|_, record| now.duration_since(record.last_announce) <= PEER_TIMEOUT);
            !peers.is_empty()
        });
    }

    fn stats(&self) -> Vec<(String, usize, usize, usize)> {
        self.torrents
            .iter()
            .map(|(info_hash, peers)| {
                let seeders = peers.values().filter(|p| p.completed).count();
                let total = peers.len();
                (hex::encode(&info_hash[..info_hash.len().min(8)]), total, seeders, total - seeders)
            })
            .collect()
    }
}

pub struct TrackerState {
    data: Mutex<TrackerData>,
}

impl TrackerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(TrackerData::default()),
        })
    }

    /// Spawns the background task that periodically drops peers that
    /// haven't announced within [`PEER_TIMEOUT`].
    pub fn spawn_reaper(self: &Arc<Self>) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            loop {
                interval.tick().await;
                let mut data = state.data.lock().await;
                data.reap_stale();
            }
        });
    }
}

#[derive(Debug, Deserialize)]
pub struct AnnounceQuery {
    info_hash: String,
    peer_id: String,
    port: u16,
    #[serde(default)]
    event: Option<String>,
}

pub fn router(state: Arc<TrackerState>) -> Router {
    Router::new()
        .route("/announce", get(handle_announce))
        .route("/stats", get(handle_stats))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_request_timeout))
                .timeout(REQUEST_TIMEOUT),
        )
        .with_state(state)
}

async fn handle_request_timeout(err: BoxError) -> Response {
    let reason = if err.is::<tower::timeout::error::Elapsed>() {
        "request timed out".to_string()
    } else {
        format!("unhandled internal error: {err}")
    };
    failure_response(StatusCode::INTERNAL_SERVER_ERROR, &reason)
}

/// Builds the bencoded `{ "failure reason": ... }` body spec'd for tracker
/// errors (§4.5), paired with the given status code.
fn failure_response(status: StatusCode, reason: &str) -> Response {
    let mut root = std::collections::BTreeMap::new();
    root.insert(
        b"failure reason".to_vec(),
        BencodeValue::Bytes(reason.as_bytes().to_vec()),
    );
    let body = encode_to_vec(&BencodeValue::Dict(root)).expect("encoding a flat dict tree is infallible");
    (status, body).into_response()
}

#[tracing::instrument(skip(state, query, addr), level = "debug")]
async fn handle_announce(
    State(state): State<Arc<TrackerState>>,
    Query(query): Query<AnnounceQuery>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> Response {
    let info_hash = match percent_decode(&query.info_hash) {
        Some(bytes) if bytes.len() == 20 => bytes,
        _ => return failure_response(StatusCode::BAD_REQUEST, "invalid info_hash"),
    };
    let peer_id = match percent_decode(&query.peer_id) {
        Some(bytes) if bytes.len() == 20 => bytes,
        _ => return failure_response(StatusCode::BAD_REQUEST, "invalid peer_id"),
    };

    let ip = addr.ip();
    let peer_key = format!("{}:{}", ip, query.port);
    let record = PeerRecord {
        peer_id,
        ip,
        port: query.port,
        completed: query.event.as_deref() == Some("completed"),
        last_announce: Instant::now(),
    };

    let mut data = state.data.lock().await;
    data.add_peer(info_hash.clone(), peer_key.clone(), record, query.event.as_deref());
    let peers = data.peers_for(&info_hash, &peer_key);
    drop(data);

    let body = encode_announce_response(&peers);
    ([(axum::http::header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn encode_announce_response(peers: &[PeerRecord]) -> Vec<u8> {
    let mut root = std::collections::BTreeMap::new();
    root.insert(b"interval".to_vec(), BencodeValue::Int(ANNOUNCE_INTERVAL_SECS));
    let peer_values = peers
        .iter()
        .map(|p| {
            let mut dict = std::collections::BTreeMap::new();
            dict.insert(b"peer_id".to_vec(), BencodeValue::Bytes(p.peer_id.clone()));
            dict.insert(b"ip".to_vec(), BencodeValue::Bytes(p.ip.to_string().into_bytes()));
            dict.insert(b"port".to_vec(), BencodeValue::Int(p.port as i64));
            BencodeValue::Dict(dict)
        })
        .collect();
    root.insert(b"peers".to_vec(), BencodeValue::List(peer_values));
    encode_to_vec(&BencodeValue::Dict(root)).expect("encoding a flat dict tree is infallible")
}

async fn handle_stats(State(state): State<Arc<TrackerState>>) -> Html<String> {
    let data = state.data.lock().await;
    let stats = data.stats();
    drop(data);

    let mut body = String::from(
        "<html><head><title>Tracker Stats</title></head><body><h1>BitTorrent Tracker Statistics</h1>",
    );
    body.push_str(&format!("<p>Total torrents: {}</p>", stats.len()));
    body.push_str("<table border='1'><tr><th>Info Hash</th><th>Peers</th><th>Seeders</th><th>Leechers</th></tr>");
    for (info_hash, peers, seeders, leechers) in stats {
        body.push_str(&format!(
            "<tr><td>{info_hash}</td><td>{peers}</td><td>{seeders}</td><td>{leechers}</td></tr>"
        ));
    }
    body.push_str("</table></body></html>");
    Html(body)
}

/// Percent-decodes a query value back into raw bytes (the inverse of
/// [`crate::tracker::client::url_encode`]).
fn percent_decode(s: &str) -> Option<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::client::url_encode;

    #[test]
    fn percent_decode_round_trips_url_encode() {
        let original = [0xde, 0xad, 0xbe, 0xef, b'a', b'-'];
        let encoded = url_encode(&original);
        assert_eq!(percent_decode(&encoded).unwrap(), original.to_vec());
    }

    #[test]
    fn tracker_data_removes_peer_on_stopped_event() {
        let mut data = TrackerData::default();
        let info_hash = vec![1u8; 20];
        let record = PeerRecord {
            peer_id: vec![2u8; 20],
            ip: "127.0.0.1".parse().unwrap(),
            port: 6881,
            completed: false,
            last_announce: Instant::now(),
        };
        data.add_peer(info_hash.clone(), "127.0.0.1:6881".to_string(), record.clone(), None);
        assert_eq!(data.peers_for(&info_hash, "").len(), 1);

        data.add_peer(info_hash.clone(), "127.0.0.1:6881".to_string(), record, Some("stopped"));
        assert_eq!(data.peers_for(&info_hash, "").len(), 0);
    }

    #[test]
    fn failure_response_bencodes_reason_dict() {
        let response = failure_response(StatusCode::BAD_REQUEST, "invalid info_hash");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn peers_for_excludes_requesting_peer() {
        let mut data = TrackerData::default();
        let info_hash = vec![1u8; 20];
        let record = PeerRecord {
            peer_id: vec![2u8; 20],
            ip: "127.0.0.1".parse().unwrap(),
            port: 6881,
            completed: false,
            last_announce: Instant::now(),
        };
        data.add_peer(info_hash.clone(), "127.0.0.1:6881".to_string(), record, None);
        assert_eq!(data.peers_for(&info_hash, "127.0.0.1:6881").len(), 0);
    }
}
