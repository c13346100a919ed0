//! Peer wire protocol: handshake, message framing, and the per-connection
//! session that drives choke/interest state and piece transfer.
pub mod handshake;
pub mod message;
pub mod session;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] anyhow::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("peer session timed out waiting for a message")]
    Timeout,
}
