//! Drives a single peer connection once the handshake has completed: reads
//! incoming messages and updates choke/interest/bitfield state, serves block
//! requests, and separately requests blocks we still need.
//!
//! Ported from `original_source/peer.py`'s `PeerConnection` (choke/interest
//! flags, `has_piece`/bitfield tracking, `_handle_message` dispatch) and
//! `PeerClient.download_from_peer` (the separate request-loop thread) onto
//! two cooperating tokio tasks sharing `Arc<SessionState>` instead of one
//! thread each per peer plus shared mutable attributes.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::peer::message::Message;
use crate::piece::PieceManager;

/// Cross-task state for one peer connection. Booleans are the four
/// choke/interest flags from the wire protocol; `peer_have` is this peer's
/// advertised bitfield, expanded to one bool per piece for convenient
/// indexing by [`PieceManager::next_request`].
pub struct SessionState {
    pub am_choking: AtomicBool,
    pub am_interested: AtomicBool,
    pub peer_choking: AtomicBool,
    pub peer_interested: AtomicBool,
    pub alive: AtomicBool,
    peer_have: Mutex<Vec<bool>>,
    unchoked: Notify,
    last_sent: Mutex<tokio::time::Instant>,
}

impl SessionState {
    fn new(num_pieces: usize) -> Self {
        Self {
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            peer_have: Mutex::new(vec![false; num_pieces]),
            unchoked: Notify::new(),
            last_sent: Mutex::new(tokio::time::Instant::now()),
        }
    }

    async fn peer_have_snapshot(&self) -> Vec<bool> {
        self.peer_have.lock().await.clone()
    }
}

/// Writes `message` on the shared connection and records the send time so
/// the keep-alive loop knows the link has recently had traffic.
async fn send_message<W: AsyncWrite + Unpin>(
    writer: &Arc<Mutex<W>>,
    state: &SessionState,
    message: Message,
) -> Result<()> {
    let mut w = writer.lock().await;
    message.write(&mut *w).await?;
    drop(w);
    *state.last_sent.lock().await = tokio::time::Instant::now();
    Ok(())
}

/// Sends a zero-length keep-alive frame whenever nothing else has been sent
/// for [`crate::config::KEEP_ALIVE_INTERVAL_SECS`].
async fn keepalive_loop<W: AsyncWrite + Unpin>(
    addr: SocketAddr,
    state: Arc<SessionState>,
    writer: Arc<Mutex<W>>,
) {
    let interval = Duration::from_secs(crate::config::KEEP_ALIVE_INTERVAL_SECS);
    while state.alive.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let elapsed = state.last_sent.lock().await.elapsed();
        if elapsed >= interval {
            if let Err(err) = send_message(&writer, &state, Message::KeepAlive).await {
                tracing::debug!(%addr, %err, "failed to send keep-alive, ending session");
                break;
            }
        }
    }
}

/// A running connection to one peer, addressable for logging.
pub struct PeerSession {
    pub addr: SocketAddr,
    pub state: Arc<SessionState>,
}

impl PeerSession {
    /// Spawns the reader and requester tasks for an already-handshaken
    /// connection and returns a handle carrying the shared state. Sends our
    /// bitfield and an initial `interested` before returning. `inbound`
    /// marks a session opened by accepting an incoming connection rather
    /// than by dialing out; per spec §4.4, an inbound-accepted session
    /// additionally sends UNCHOKE and clears `am_choking` so seeding works
    /// without waiting on the remote side to ask.
    #[tracing::instrument(skip(stream, piece_manager), fields(%addr, inbound), level = "info")]
    pub async fn spawn<S>(
        addr: SocketAddr,
        stream: S,
        piece_manager: Arc<PieceManager>,
        inbound: bool,
    ) -> Result<PeerSession>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let num_pieces = piece_manager.num_pieces();
        let state = Arc::new(SessionState::new(num_pieces));
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(write_half));

        send_message(
            &writer,
            &state,
            Message::Bitfield {
                bits: piece_manager.bitfield(),
            },
        )
        .await?;
        send_message(&writer, &state, Message::Interested).await?;
        state.am_interested.store(true, Ordering::SeqCst);

        if inbound {
            send_message(&writer, &state, Message::Unchoke).await?;
            state.am_choking.store(false, Ordering::SeqCst);
        }

        tokio::spawn(reader_loop(
            addr,
            read_half,
            Arc::clone(&state),
            Arc::clone(&piece_manager),
            Arc::clone(&writer),
        ));
        tokio::spawn(requester_loop(
            addr,
            Arc::clone(&state),
            Arc::clone(&piece_manager),
            Arc::clone(&writer),
        ));
        tokio::spawn(keepalive_loop(addr, Arc::clone(&state), Arc::clone(&writer)));

        Ok(PeerSession { addr, state })
    }
}

async fn reader_loop<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    addr: SocketAddr,
    mut reader: R,
    state: Arc<SessionState>,
    piece_manager: Arc<PieceManager>,
    writer: Arc<Mutex<W>>,
) {
    loop {
        let message = match timeout(
            Duration::from_secs(crate::config::READ_TIMEOUT_SECS),
            Message::read(&mut reader),
        )
        .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => {
                tracing::debug!(%addr, %err, "peer connection closed");
                break;
            }
            Err(_) => {
                tracing::debug!(%addr, "peer read timed out");
                break;
            }
        };

        if let Err(err) = handle_message(message, &addr, &state, &piece_manager, &writer).await {
            tracing::warn!(%addr, %err, "error handling peer message");
            break;
        }
    }
    state.alive.store(false, Ordering::SeqCst);
}

async fn handle_message<W: AsyncWrite + Unpin>(
    message: Message,
    addr: &SocketAddr,
    state: &Arc<SessionState>,
    piece_manager: &Arc<PieceManager>,
    writer: &Arc<Mutex<W>>,
) -> Result<()> {
    match message {
        Message::KeepAlive => {}
        Message::Choke => state.peer_choking.store(true, Ordering::SeqCst),
        Message::Unchoke => {
            state.peer_choking.store(false, Ordering::SeqCst);
            state.unchoked.notify_waiters();
        }
        Message::Interested => state.peer_interested.store(true, Ordering::SeqCst),
        Message::NotInterested => state.peer_interested.store(false, Ordering::SeqCst),
        Message::Have { index } => {
            let mut have = state.peer_have.lock().await;
            if let Some(slot) = have.get_mut(index as usize) {
                *slot = true;
            }
        }
        Message::Bitfield { bits } => {
            let mut have = state.peer_have.lock().await;
            for (i, slot) in have.iter_mut().enumerate() {
                let byte = i / 8;
                let bit = i % 8;
                *slot = bits.get(byte).is_some_and(|b| b & (1 << (7 - bit)) != 0);
            }
        }
        Message::Request { index, begin, length } => {
            if !state.am_choking.load(Ordering::SeqCst) {
                if let Some(block) = piece_manager.read_block(index as usize, begin, length)? {
                    send_message(writer, state, Message::Piece { index, begin, block }).await?;
                }
            }
        }
        Message::Piece { index, begin, block } => {
            if let Err(err) = piece_manager.accept_block(index as usize, begin, block) {
                tracing::warn!(%addr, %err, index, "failed to accept block");
            }
        }
        Message::Cancel { .. } => {
            // No outbound request queue is modeled; an unanswered REQUEST is
            // simply never matched by a PIECE, which the requester loop
            // tolerates by re-requesting.
        }
        Message::Unknown { .. } => {}
    }
    Ok(())
}

async fn requester_loop<W: AsyncWrite + Unpin>(
    addr: SocketAddr,
    state: Arc<SessionState>,
    piece_manager: Arc<PieceManager>,
    writer: Arc<Mutex<W>>,
) {
    while state.alive.load(Ordering::SeqCst) {
        if state.peer_choking.load(Ordering::SeqCst) {
            let _ = timeout(Duration::from_secs(5), state.unchoked.notified()).await;
            continue;
        }
        if !state.am_interested.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let peer_have = state.peer_have_snapshot().await;
        match piece_manager.next_request(&peer_have) {
            Some((index, begin, length)) => {
                let request = Message::Request {
                    index: index as u32,
                    begin,
                    length,
                };
                if let Err(err) = send_message(&writer, &state, request).await {
                    tracing::debug!(%addr, %err, "failed to send request, ending session");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            None => {
                if piece_manager.complete() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    state.alive.store(false, Ordering::SeqCst);
}
