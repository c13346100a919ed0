//! Piece manager: owns the on-disk file and the per-piece completion state.
//!
//! Ported line-for-line in semantics from `original_source/peer.py`'s
//! `PieceManager` (pending-block map keyed by `begin`, expected-block-count
//! completion check, hash-then-write-then-flip-status, pending map cleared on
//! both the success and hash-mismatch paths) with a typed `PieceState` enum
//! standing in for the Python version's parallel `piece_status`/`pending_blocks`
//! bookkeeping.
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::metainfo::Metainfo;

/// Size of one REQUEST/PIECE block, per spec §6.
pub const BLOCK_SIZE: u32 = 16384;

#[derive(Debug, Error)]
pub enum PieceManagerError {
    #[error("piece index {0} out of range")]
    IndexOutOfRange(usize),

    #[error("I/O error on backing file: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PieceManagerError>;

#[derive(Debug, Clone, Default)]
struct InFlightPiece {
    /// Blocks received and verified-pending-assembly, keyed by `begin`.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// Offsets handed out by `next_request` that haven't shown up in
    /// `blocks` yet, keyed by `begin`, valued by when they were requested.
    /// An entry here older than `BLOCK_REQUEST_TIMEOUT_SECS` is treated as
    /// abandoned and is reissued.
    pending: BTreeMap<u32, Instant>,
}

#[derive(Debug, Clone)]
enum PieceState {
    Missing,
    InFlight(InFlightPiece),
    Have,
}

struct Inner {
    file: File,
    states: Vec<PieceState>,
}

/// Shared owner of the target file and its piece bitmap. Every mutating
/// operation is serialised under a single mutex (SPEC_FULL.md §4.3); the
/// mutex is a plain `std::sync::Mutex` because the critical sections are
/// synchronous file I/O, never an `.await`.
pub struct PieceManager {
    metainfo: Metainfo,
    inner: Mutex<Inner>,
    completed_tx: broadcast::Sender<usize>,
}

impl PieceManager {
    /// Creates (or truncates) `dir/metainfo.name`, sizes it to
    /// `metainfo.length`, and starts every piece as `Missing`.
    #[tracing::instrument(skip(metainfo), fields(name = %metainfo.name), level = "debug")]
    pub fn new(metainfo: Metainfo, dir: &Path) -> Result<Self> {
        let path = dir.join(&metainfo.name);
        let file = Self::create_sized_file(&path, metainfo.length)?;
        let num_pieces = metainfo.num_pieces();
        let states = (0..num_pieces).map(|_| PieceState::Missing).collect::<Vec<_>>();
        let (completed_tx, _) = broadcast::channel(num_pieces.max(1));
        Ok(Self {
            metainfo,
            inner: Mutex::new(Inner { file, states }),
            completed_tx,
        })
    }

    fn create_sized_file(path: &PathBuf, length: u64) -> std::io::Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(length)?;
        Ok(file)
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn num_pieces(&self) -> usize {
        self.metainfo.num_pieces()
    }

    /// Subscribe to piece-completed events, emitted after a successful
    /// `accept_block` so peer sessions can send outbound HAVE messages.
    pub fn subscribe_completed(&self) -> broadcast::Receiver<usize> {
        self.completed_tx.subscribe()
    }

    pub fn have(&self, index: usize) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(inner.states.get(index), Some(PieceState::Have))
    }

    /// Packs the Have bitmap MSB-first per byte, `ceil(num_pieces/8)` bytes,
    /// unused trailing bits zero.
    pub fn bitfield(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut bytes = vec![0u8; (inner.states.len() + 7) / 8];
        for (i, state) in inner.states.iter().enumerate() {
            if matches!(state, PieceState::Have) {
                bytes[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        bytes
    }

    /// Picks the first `(index, begin)` not yet received and not currently
    /// pending (or whose pending request has timed out), in ascending
    /// `(index, begin)` order, restricted to pieces `peer_have` has set.
    /// Simultaneously (re-)records it as pending with a fresh timestamp, so
    /// a peer that chokes or drops mid-piece doesn't strand that offset
    /// forever.
    #[tracing::instrument(skip(self, peer_have), level = "trace")]
    pub fn next_request(&self, peer_have: &[bool]) -> Option<(usize, u32, u32)> {
        let timeout = Duration::from_secs(crate::config::BLOCK_REQUEST_TIMEOUT_SECS);
        self.next_request_with_timeout(peer_have, timeout)
    }

    /// Same as [`Self::next_request`] with the pending-request timeout
    /// parameterised, so tests can exercise the re-request path without
    /// waiting out the real timeout.
    fn next_request_with_timeout(&self, peer_have: &[bool], timeout: Duration) -> Option<(usize, u32, u32)> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let num_pieces = inner.states.len();
        for index in 0..num_pieces {
            if !peer_have.get(index).copied().unwrap_or(false) {
                continue;
            }
            if matches!(inner.states[index], PieceState::Have) {
                continue;
            }
            let piece_len = self.metainfo.piece_length_of(index);
            if matches!(inner.states[index], PieceState::Missing) {
                inner.states[index] = PieceState::InFlight(InFlightPiece::default());
            }
            let begin = {
                let piece = match &inner.states[index] {
                    PieceState::InFlight(p) => p,
                    _ => unreachable!(),
                };
                let mut begin = 0u32;
                while begin < piece_len {
                    let received = piece.blocks.contains_key(&begin);
                    let stale_pending = piece
                        .pending
                        .get(&begin)
                        .is_some_and(|requested_at| now.duration_since(*requested_at) >= timeout);
                    let outstanding = piece.pending.contains_key(&begin) && !stale_pending;
                    if !received && !outstanding {
                        break;
                    }
                    begin += BLOCK_SIZE;
                }
                begin
            };
            if begin >= piece_len {
                continue;
            }
            let length = BLOCK_SIZE.min(piece_len - begin);
            if let PieceState::InFlight(piece) = &mut inner.states[index] {
                piece.pending.insert(begin, now);
            }
            return Some((index, begin, length));
        }
        None
    }

    /// Stores a received block. If it completes the piece, verifies the
    /// SHA-1 and either commits it to disk (`Have`) or discards it back to
    /// `Missing`. Returns whether the piece was just completed successfully.
    #[tracing::instrument(skip(self, data), fields(index, begin, len = data.len()), level = "debug")]
    pub fn accept_block(&self, index: usize, begin: u32, data: Vec<u8>) -> Result<bool> {
        if index >= self.num_pieces() {
            return Err(PieceManagerError::IndexOutOfRange(index));
        }
        let piece_len = self.metainfo.piece_length_of(index);

        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.states[index], PieceState::Have) {
            return Ok(false); // already have it; duplicate/late block, ignore
        }
        if matches!(inner.states[index], PieceState::Missing) {
            inner.states[index] = PieceState::InFlight(InFlightPiece::default());
        }
        if let PieceState::InFlight(piece) = &mut inner.states[index] {
            piece.pending.remove(&begin);
            piece.blocks.insert(begin, data);
        }

        // Blocks form a contiguous run from offset 0 only once every gap is filled;
        // BTreeMap gives us ascending offset order for free.
        let covers_whole_piece = if let PieceState::InFlight(piece) = &inner.states[index] {
            let mut expected_offset = 0u32;
            let mut contiguous = true;
            for (&offset, bytes) in piece.blocks.iter() {
                if offset != expected_offset {
                    contiguous = false;
                    break;
                }
                expected_offset += bytes.len() as u32;
            }
            contiguous && expected_offset == piece_len
        } else {
            false
        };

        if !covers_whole_piece {
            return Ok(false);
        }

        let assembled = if let PieceState::InFlight(piece) = &inner.states[index] {
            let mut buf = Vec::with_capacity(piece_len as usize);
            for bytes in piece.blocks.values() {
                buf.extend_from_slice(bytes);
            }
            buf
        } else {
            unreachable!()
        };

        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let digest = hasher.finalize();

        if digest.as_slice() == self.metainfo.expected_hash(index) {
            let offset = index as u64 * self.metainfo.piece_length as u64;
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.write_all(&assembled)?;
            inner.states[index] = PieceState::Have;
            drop(inner);
            let _ = self.completed_tx.send(index);
            Ok(true)
        } else {
            tracing::warn!(index, "piece hash mismatch, discarding and re-requesting");
            inner.states[index] = PieceState::Missing;
            Ok(false)
        }
    }

    /// Reads `length` bytes from the on-disk copy of piece `index` starting
    /// at `begin`. Only succeeds when the piece is `Have`.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn read_block(&self, index: usize, begin: u32, length: u32) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.states.get(index), Some(PieceState::Have)) {
            return Ok(None);
        }
        let offset = index as u64 * self.metainfo.piece_length as u64 + begin as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        inner.file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    pub fn complete(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.states.iter().all(|s| matches!(s, PieceState::Have))
    }

    pub fn progress(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        if inner.states.is_empty() {
            return 1.0;
        }
        let have = inner
            .states
            .iter()
            .filter(|s| matches!(s, PieceState::Have))
            .count();
        have as f64 / inner.states.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode_to_vec;
    use crate::bencode::BencodeValue;
    use std::collections::BTreeMap as BMap;

    fn build_metainfo(piece_count: usize, piece_length: u32, length: u64, piece_hashes: Vec<u8>) -> Metainfo {
        let mut info = BMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Int(piece_length as i64));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(piece_hashes));
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"piece_test.bin".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Int(length as i64));
        let mut root = BMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::Bytes(b"http://tracker.example.com/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
        let m = Metainfo::parse(&bytes).unwrap();
        assert_eq!(m.num_pieces(), piece_count);
        m
    }

    fn piece_hash(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    #[test]
    fn accept_block_completes_and_verifies_piece() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 100];
        let hash = piece_hash(&data);
        let metainfo = build_metainfo(1, 16384, 100, hash);
        let pm = PieceManager::new(metainfo, dir.path()).unwrap();

        assert!(!pm.have(0));
        let completed = pm.accept_block(0, 0, data.clone()).unwrap();
        assert!(completed);
        assert!(pm.have(0));
        assert!(pm.complete());
        assert_eq!(pm.progress(), 1.0);

        let read_back = pm.read_block(0, 0, 100).unwrap().unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn hash_mismatch_rolls_piece_back_to_missing() {
        let dir = tempfile::tempdir().unwrap();
        let correct = vec![1u8; 50];
        let wrong_hash = piece_hash(&[0u8; 50]);
        let metainfo = build_metainfo(1, 16384, 50, wrong_hash);
        let pm = PieceManager::new(metainfo, dir.path()).unwrap();

        let completed = pm.accept_block(0, 0, correct).unwrap();
        assert!(!completed);
        assert!(!pm.have(0));
        assert_eq!(pm.progress(), 0.0);

        // the piece is Missing again, so next_request should hand it back out
        let peer_have = vec![true];
        let req = pm.next_request(&peer_have);
        assert_eq!(req, Some((0, 0, 50)));
    }

    #[test]
    fn next_request_does_not_double_issue_same_block() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![9u8; 40000]; // spans 3 blocks of 16384
        let hash = piece_hash(&data);
        let metainfo = build_metainfo(1, 16384, 40000, hash);
        let pm = PieceManager::new(metainfo, dir.path()).unwrap();

        let peer_have = vec![true];
        let r1 = pm.next_request(&peer_have).unwrap();
        let r2 = pm.next_request(&peer_have).unwrap();
        let r3 = pm.next_request(&peer_have).unwrap();
        assert_eq!((r1.1, r2.1, r3.1), (0, 16384, 32768));
        assert!(pm.next_request(&peer_have).is_none());
    }

    #[test]
    fn abandoned_pending_block_is_reissued_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![9u8; 40000]; // spans 3 blocks of 16384
        let hash = piece_hash(&data);
        let metainfo = build_metainfo(1, 16384, 40000, hash);
        let pm = PieceManager::new(metainfo, dir.path()).unwrap();
        let peer_have = vec![true];
        let short_timeout = std::time::Duration::from_millis(5);

        let first = pm.next_request_with_timeout(&peer_have, short_timeout).unwrap();
        assert_eq!(first.1, 0);

        // Immediately re-requesting must not hand back the same offset.
        let second = pm.next_request_with_timeout(&peer_have, short_timeout).unwrap();
        assert_eq!(second.1, 16384);

        std::thread::sleep(std::time::Duration::from_millis(20));

        // Both outstanding requests have now aged past the timeout, so the
        // scan (lowest offset first) reissues them before ever reaching the
        // never-yet-requested third block.
        let third = pm.next_request_with_timeout(&peer_have, short_timeout).unwrap();
        assert_eq!(third.1, 0);
        let fourth = pm.next_request_with_timeout(&peer_have, short_timeout).unwrap();
        assert_eq!(fourth.1, 16384);
        let fifth = pm.next_request_with_timeout(&peer_have, short_timeout).unwrap();
        assert_eq!(fifth.1, 32768);
    }

    #[test]
    fn bitfield_is_msb_first_and_padded() {
        let dir = tempfile::tempdir().unwrap();
        let data0 = vec![1u8; 10];
        let data1 = vec![2u8; 10];
        let data2 = vec![3u8; 10];
        let mut pieces = Vec::new();
        pieces.extend(piece_hash(&data0));
        pieces.extend(piece_hash(&data1));
        pieces.extend(piece_hash(&data2));
        let metainfo = build_metainfo(3, 10, 30, pieces);
        let pm = PieceManager::new(metainfo, dir.path()).unwrap();

        pm.accept_block(0, 0, data0).unwrap();
        pm.accept_block(1, 0, data1).unwrap();
        // piece 2 left Missing

        let bf = pm.bitfield();
        assert_eq!(bf.len(), 1);
        assert_eq!(bf[0], 0b1100_0000);
    }
}
