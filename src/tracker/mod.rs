//! Tracker client and tracker server.
//!
//! `client` is what a downloading peer uses to discover other peers for a
//! torrent; `server` is a standalone HTTP tracker peers can announce to.
//! Both speak the dictionary-format announce response (no compact peers
//! string) over the crate's own bencode codec.
pub mod client;
pub mod server;

pub use client::{AnnounceRequest, AnnounceResponse, Client, Peer};
