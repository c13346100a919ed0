//! Orchestration for a single torrent session: parse the metainfo, stand up
//! the piece manager, announce to the tracker, connect out to discovered
//! peers, and accept inbound connections.
//!
//! Ported from `original_source/peer.py`'s `PeerClient` (`announce_to_tracker`,
//! `connect_to_peer`, `accept_connections`, `run`'s progress-monitoring loop)
//! onto tokio tasks: one inbound listener bounded by a semaphore instead of
//! a thread-per-connection accept loop, and re-announce on a timer instead
//! of a one-shot `started` call.
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::bencode::encoder::encode_to_vec;
use crate::bencode::BencodeValue;
use crate::config::{Config, MAX_INBOUND_PEERS};
use crate::metainfo::Metainfo;
use crate::peer::handshake::Handshake;
use crate::peer::session::PeerSession;
use crate::piece::PieceManager;
use crate::tracker::client::Client as TrackerClient;

/// Piece length used when authoring new torrents, matching
/// `original_source/create_torrent.py`'s default of 256 KiB.
pub const DEFAULT_PIECE_LENGTH: u32 = 262_144;

pub struct Engine {
    metainfo: Metainfo,
    piece_manager: Arc<PieceManager>,
    config: Config,
    tracker: TrackerClient,
}

impl Engine {
    #[tracing::instrument(skip(metainfo_bytes), level = "info")]
    pub fn new(metainfo_bytes: &[u8], download_dir: &Path, config: Config) -> Result<Self> {
        let metainfo = Metainfo::parse(metainfo_bytes)?;
        tracing::info!(name = %metainfo.name, length = metainfo.length, pieces = metainfo.num_pieces(), "loaded torrent");
        let piece_manager = Arc::new(PieceManager::new(metainfo.clone(), download_dir)?);
        let tracker = TrackerClient::new(config.peer_id, config.listen_port);
        Ok(Self {
            metainfo,
            piece_manager,
            config,
            tracker,
        })
    }

    /// Runs the engine until the download completes: announces `started`,
    /// connects to every peer the tracker returns, accepts inbound
    /// connections, re-announces on the tracker's interval, announces
    /// `completed` once every piece verifies, then keeps seeding until the
    /// process receives Ctrl+C, at which point it announces `stopped`.
    #[tracing::instrument(skip(self), level = "info")]
    pub async fn run(&self) -> Result<()> {
        let listener = bind_listener(self.config.listen_port).await?;
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            self.metainfo.info_hash,
            self.config.peer_id,
            Arc::clone(&self.piece_manager),
        ));

        let left = |pm: &PieceManager| {
            let total = pm.metainfo().length;
            let done = (pm.progress() * total as f64) as u64;
            total.saturating_sub(done)
        };

        let response = self
            .tracker
            .announce(&self.metainfo, left(&self.piece_manager), Some("started"))
            .await?;
        tracing::info!(peer_count = response.peers.len(), "announced to tracker");

        for peer in response.peers {
            let addr = SocketAddr::new(peer.ip, peer.port);
            tokio::spawn(connect_to_peer(
                addr,
                self.metainfo.info_hash,
                self.config.peer_id,
                Arc::clone(&self.piece_manager),
            ));
        }

        let reannounce_interval = Duration::from_secs(response.interval.max(1) as u64);
        let mut ticker = tokio::time::interval(reannounce_interval);
        ticker.tick().await; // first tick fires immediately; we already announced
        let mut progress_ticker = tokio::time::interval(Duration::from_secs(5));
        let mut completed_announced = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tracker.announce(&self.metainfo, left(&self.piece_manager), None).await {
                        tracing::warn!(%err, "re-announce failed");
                    }
                }
                _ = progress_ticker.tick() => {
                    if self.piece_manager.complete() {
                        if !completed_announced {
                            tracing::info!("download complete, seeding");
                            self.tracker.announce(&self.metainfo, 0, Some("completed")).await.ok();
                            completed_announced = true;
                        }
                    } else {
                        tracing::info!(progress = self.piece_manager.progress(), "download progress");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received shutdown signal");
                    break;
                }
            }
        }

        self.tracker.announce(&self.metainfo, left(&self.piece_manager), Some("stopped")).await.ok();
        accept_handle.abort();
        Ok(())
    }

    pub fn piece_manager(&self) -> &Arc<PieceManager> {
        &self.piece_manager
    }
}

async fn bind_listener(preferred_port: u16) -> Result<TcpListener> {
    for port in crate::config::LISTEN_PORT_RANGE {
        if port < preferred_port {
            continue;
        }
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok(listener);
        }
    }
    Ok(TcpListener::bind(("0.0.0.0", preferred_port)).await?)
}

async fn connect_to_peer(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_manager: Arc<PieceManager>,
) {
    match Handshake::do_handshake(addr.to_string(), info_hash, peer_id).await {
        Ok((stream, _their_handshake)) => {
            if let Err(err) = PeerSession::spawn(addr, stream, piece_manager, false).await {
                tracing::warn!(%addr, %err, "failed to start peer session");
            }
        }
        Err(err) => tracing::debug!(%addr, %err, "handshake failed"),
    }
}

async fn accept_loop(
    listener: TcpListener,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_manager: Arc<PieceManager>,
) {
    let semaphore = Arc::new(Semaphore::new(MAX_INBOUND_PEERS));
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "error accepting inbound connection");
                continue;
            }
        };
        let permit = match Arc::clone(&semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(%addr, "dropping inbound connection, at capacity");
                continue;
            }
        };
        let piece_manager = Arc::clone(&piece_manager);
        tokio::spawn(async move {
            let _permit = permit;
            match crate::peer::handshake::Handshake::read(&mut stream).await {
                Ok(their_handshake) if their_handshake.validate(info_hash).is_ok() => {
                    let our_handshake = Handshake::new(info_hash, peer_id);
                    use tokio::io::AsyncWriteExt;
                    if stream.write_all(&our_handshake.serialize()).await.is_ok() {
                        if let Err(err) = PeerSession::spawn(addr, stream, piece_manager, true).await {
                            tracing::warn!(%addr, %err, "failed to start inbound peer session");
                        }
                    }
                }
                _ => tracing::debug!(%addr, "rejected inbound handshake"),
            }
        });
    }
}

/// Builds and writes a single-file `.torrent` metainfo dictionary for
/// `file_path`, splitting it into [`DEFAULT_PIECE_LENGTH`]-byte pieces.
#[tracing::instrument(level = "info")]
pub fn create_torrent(file_bytes: &[u8], file_name: &str, tracker_url: &str) -> Result<Vec<u8>> {
    use sha1::{Digest, Sha1};
    use std::collections::BTreeMap;

    let mut pieces = Vec::new();
    for chunk in file_bytes.chunks(DEFAULT_PIECE_LENGTH as usize) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        pieces.extend_from_slice(&hasher.finalize());
    }

    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), BencodeValue::Bytes(file_name.as_bytes().to_vec()));
    info.insert(
        b"piece length".to_vec(),
        BencodeValue::Int(DEFAULT_PIECE_LENGTH as i64),
    );
    info.insert(b"pieces".to_vec(), BencodeValue::Bytes(pieces));
    info.insert(b"length".to_vec(), BencodeValue::Int(file_bytes.len() as i64));

    let mut root = BTreeMap::new();
    root.insert(
        b"announce".to_vec(),
        BencodeValue::Bytes(tracker_url.as_bytes().to_vec()),
    );
    root.insert(b"info".to_vec(), BencodeValue::Dict(info));

    Ok(encode_to_vec(&BencodeValue::Dict(root))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_torrent_round_trips_through_metainfo_parse() {
        let data = vec![42u8; DEFAULT_PIECE_LENGTH as usize + 100];
        let bytes = create_torrent(&data, "sample.bin", "http://tracker.example.com/announce").unwrap();
        let metainfo = Metainfo::parse(&bytes).unwrap();
        assert_eq!(metainfo.name, "sample.bin");
        assert_eq!(metainfo.length, data.len() as u64);
        assert_eq!(metainfo.num_pieces(), 2);
    }
}
