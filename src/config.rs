//! Ambient configuration and constants shared across the peer engine,
//! tracker client, and tracker server.
//!
//! Pulled together from values that were scattered as module-level
//! constants in `original_source/peer.py` and `original_source/tracker.py`
//! (`BLOCK_SIZE`, `KEEP_ALIVE_INTERVAL`, `ANNOUNCE_INTERVAL`, `PEER_TIMEOUT`)
//! plus `devharshthakur-rs-torrent-client`'s `generate_peer_id`, which
//! becomes a method here so a single `Config` value threads through the
//! engine instead of a module-global.
use anyhow::Result;
use rand::Rng;

/// Size of one REQUEST/PIECE block, per the wire protocol.
pub const BLOCK_SIZE: u32 = crate::piece::BLOCK_SIZE;

/// Send a keep-alive if nothing has been sent to a peer within this window.
pub const KEEP_ALIVE_INTERVAL_SECS: u64 = 120;

/// A peer connection that has been silent for this long is considered dead.
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default port range a listening peer binds to, matching
/// `original_source/peer.py`'s `random.randint(6881, 6889)` range.
pub const LISTEN_PORT_RANGE: std::ops::RangeInclusive<u16> = 6881..=6889;

/// Upper bound on simultaneously accepted inbound peer connections.
pub const MAX_INBOUND_PEERS: usize = 50;

/// A requested block that hasn't arrived within this window is treated as
/// abandoned and becomes eligible for re-request.
pub const BLOCK_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub peer_id: [u8; 20],
    pub listen_port: u16,
}

impl Config {
    pub fn new(listen_port: u16) -> Result<Self> {
        Ok(Self {
            peer_id: generate_peer_id()?,
            listen_port,
        })
    }

    /// Picks a listen port in [`LISTEN_PORT_RANGE`] at random, the way
    /// `original_source/peer.py`'s `PeerClient.__init__` does.
    pub fn with_random_port() -> Result<Self> {
        let port = rand::rng().random_range(LISTEN_PORT_RANGE);
        Self::new(port)
    }
}

/// Generates a unique peer ID for this client.
///
/// Consists of a client-identifying prefix `-RT0001-` ("RT" = Rust Torrent)
/// followed by 11 random bytes, for a 20-byte peer id.
fn generate_peer_id() -> Result<[u8; 20]> {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    Ok(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id_has_expected_prefix_and_length() {
        let config = Config::new(6881).unwrap();
        assert_eq!(config.peer_id.len(), 20);
        assert_eq!(&config.peer_id[..8], b"-RT0001-");
    }
}
