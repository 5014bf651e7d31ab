//! The torrent runtime: wires the tracker client, the peer pool, the
//! scheduler, and the piece store together into a single download.
use crate::config::Config;
use crate::peer::{message::Message, PeerSession, SessionConfig};
use crate::piece::{next_block_length, PieceError, PieceStore};
use crate::scheduler::Scheduler;
use crate::torrent::TorrentFile;
use crate::tracker;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::instrument;

/// Starting backoff before the first tracker re-announce retry.
const INITIAL_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(30);
/// Backoff never shrinks below this, regardless of what the tracker's
/// `interval` says, and the cap it's doubled against never goes below it
/// either.
const MIN_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(60);
const MAX_ANNOUNCE_BACKOFF: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("tracker error: {0}")]
    Tracker(#[from] tracker::TrackerError),

    #[error("the tracker returned no peers")]
    NoPeers,

    #[error("every peer was exhausted or blacklisted before the download completed")]
    AllPeersExhausted,

    #[error("one or more pieces exceeded their retry budget and can never complete")]
    RetriesExceeded,

    #[error("piece storage error: {0}")]
    Piece(#[from] PieceError),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

pub struct TorrentRuntime {
    torrent: Arc<TorrentFile>,
    config: Config,
}

/// Tracks how far an assigned piece's request window has progressed: the
/// smallest byte offset that is neither completed nor in flight.
struct PieceProgress {
    index: usize,
    piece_len: u32,
    next_offset: u32,
}

impl TorrentRuntime {
    pub fn new(torrent: TorrentFile, config: Config) -> Self {
        Self {
            torrent: Arc::new(torrent),
            config,
        }
    }

    /// Announces to the tracker, maintains up to `max_peers` simultaneous
    /// peer sessions — replenishing from the unused portion of the peer
    /// list as sessions end, and re-announcing once that list runs dry —
    /// until every piece is downloaded or the download can provably make
    /// no further progress.
    #[instrument(skip(self), level = "info", fields(info_hash = %hex::encode(self.torrent.info_hash)))]
    pub async fn run(&self) -> RuntimeResult<()> {
        let tracker_client = tracker::Client::new(6881).map_err(RuntimeError::Tracker)?;

        let scheduler = Arc::new(Scheduler::new(self.torrent.num_pieces()));
        let piece_store = Arc::new(PieceStore::new(self.torrent.clone(), self.config.download_root.clone()));
        piece_store.load_existing_pieces(&scheduler).await?;

        if scheduler.is_done() {
            tracing::info!("every piece already present from a prior run, assembling output");
            piece_store.assemble_final().await?;
            return Ok(());
        }

        let session_config = SessionConfig {
            request_window: self.config.request_window,
            block_size: self.config.block_size,
            dead_timeout: Duration::from_secs(self.config.dead_timeout_secs),
            keepalive_interval: Duration::from_secs(self.config.keepalive_interval_secs),
        };

        let mut peer_queue: VecDeque<SocketAddr> = VecDeque::new();
        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut backoff = INITIAL_ANNOUNCE_BACKOFF;
        let mut ever_had_peers = false;

        loop {
            while sessions.len() < self.config.max_peers {
                let Some(addr) = peer_queue.pop_front() else {
                    break;
                };
                if scheduler.is_blacklisted(addr) {
                    continue;
                }
                let torrent = self.torrent.clone();
                let scheduler = scheduler.clone();
                let piece_store = piece_store.clone();
                let info_hash = self.torrent.info_hash;
                let peer_id = tracker_client.peer_id();
                sessions.spawn(async move {
                    if let Err(e) =
                        run_peer(addr, info_hash, peer_id, torrent, scheduler, piece_store, session_config).await
                    {
                        tracing::debug!(%addr, error = %e, "peer session ended");
                    }
                });
            }

            if sessions.is_empty() {
                if scheduler.is_done() {
                    break;
                }
                match tracker_client.announce(&self.torrent).await {
                    Ok(announce) => {
                        backoff = INITIAL_ANNOUNCE_BACKOFF;
                        tracing::info!(
                            peer_count = announce.peers.len(),
                            interval = announce.interval,
                            "tracker announce complete"
                        );
                        peer_queue.extend(announce.peers.into_iter().map(|p| SocketAddr::new(p.ip, p.port)));
                        if !peer_queue.is_empty() {
                            ever_had_peers = true;
                            continue;
                        }
                        return Err(if ever_had_peers {
                            RuntimeError::AllPeersExhausted
                        } else {
                            RuntimeError::NoPeers
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "tracker announce failed, retrying after backoff");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_ANNOUNCE_BACKOFF).max(MIN_ANNOUNCE_BACKOFF);
                        continue;
                    }
                }
            }

            sessions.join_next().await;

            if scheduler.is_done() {
                break;
            }
        }

        if scheduler.has_permanently_failed_pieces() {
            return Err(RuntimeError::RetriesExceeded);
        }

        piece_store.assemble_final().await?;
        Ok(())
    }
}

/// Drives a single peer connection for as long as it has work to do:
/// handshake, announce interest, then request and accept pieces' worth of
/// blocks, incrementally topping up the request window, until the peer
/// disconnects or the torrent completes.
#[instrument(skip(torrent, scheduler, piece_store, session_config), level = "debug")]
async fn run_peer(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    torrent: Arc<TorrentFile>,
    scheduler: Arc<Scheduler>,
    piece_store: Arc<PieceStore>,
    session_config: SessionConfig,
) -> crate::peer::session::SessionResult<()> {
    let mut session = match PeerSession::connect(addr, info_hash, peer_id, torrent.num_pieces(), session_config).await
    {
        Ok(session) => session,
        Err(e) => {
            // A rejected handshake or an info-hash mismatch means this peer
            // will never be useful for this torrent; don't reconnect to it.
            scheduler.blacklist(addr);
            return Err(e);
        }
    };
    session.send(Message::Interested).await?;
    session.state.am_interested = true;

    let mut current: Option<PieceProgress> = None;
    let result = drive_peer_loop(&mut session, &torrent, &scheduler, &piece_store, session_config, &mut current).await;

    if let Some(progress) = current {
        scheduler.piece_failed(progress.index);
    }
    scheduler.peer_dropped(addr);
    result
}

async fn drive_peer_loop(
    session: &mut PeerSession,
    torrent: &TorrentFile,
    scheduler: &Scheduler,
    piece_store: &PieceStore,
    session_config: SessionConfig,
    current: &mut Option<PieceProgress>,
) -> crate::peer::session::SessionResult<()> {
    let mut keepalive = tokio::time::interval(session_config.keepalive_interval);
    keepalive.tick().await; // first tick fires immediately; skip it

    loop {
        let message = tokio::select! {
            result = tokio::time::timeout(session_config.dead_timeout, session.recv()) => match result {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(()), // dead-peer timeout: treat as a clean disconnect
            },
            _ = keepalive.tick() => {
                session.send(Message::KeepAlive).await?;
                continue;
            }
        };

        match message {
            Message::Unchoke | Message::Bitfield(_) | Message::Have { .. } => {
                ensure_piece_assigned(session, torrent, scheduler, piece_store, current).await?;
                top_up_requests(session, session_config, current).await?;
            }
            Message::Piece { index, begin, block } => {
                let index = index as usize;
                if let Err(e) = piece_store.accept_block(index, begin, &block) {
                    tracing::debug!(%e, "dropping out-of-range or stray block");
                    continue;
                }

                let piece_ready = matches!(current, Some(progress) if progress.index == index
                    && progress.next_offset >= progress.piece_len
                    && session.state.outstanding_count() == 0);

                if piece_ready {
                    finish_current_piece(session, scheduler, piece_store, current).await?;
                    if scheduler.is_done() {
                        return Ok(());
                    }
                    ensure_piece_assigned(session, torrent, scheduler, piece_store, current).await?;
                }
                top_up_requests(session, session_config, current).await?;
            }
            _ => {}
        }
    }
}

/// Assigns the next piece from the scheduler if none is currently assigned
/// to this session.
async fn ensure_piece_assigned(
    session: &mut PeerSession,
    torrent: &TorrentFile,
    scheduler: &Scheduler,
    piece_store: &PieceStore,
    current: &mut Option<PieceProgress>,
) -> crate::peer::session::SessionResult<()> {
    if current.is_some() {
        return Ok(());
    }
    let Some(bitfield) = &session.state.bitfield else {
        return Ok(());
    };
    let Some(index) = scheduler.next_piece_for(session.addr, bitfield) else {
        return Ok(());
    };

    piece_store.begin_piece(index);
    let piece_len = torrent.piece_size(index).max(0) as u32;
    *current = Some(PieceProgress { index, piece_len, next_offset: 0 });
    Ok(())
}

/// Requests as many of the currently assigned piece's remaining blocks as
/// the session's request window has room for, advancing `next_offset` by
/// exactly the blocks it sends. Called after every accepted block so the
/// window tops up incrementally instead of only once it fully drains —
/// a piece larger than one window's worth of blocks would otherwise never
/// finish requesting.
async fn top_up_requests(
    session: &mut PeerSession,
    session_config: SessionConfig,
    current: &mut Option<PieceProgress>,
) -> crate::peer::session::SessionResult<()> {
    let Some(progress) = current else {
        return Ok(());
    };
    while session.state.can_request() {
        let length = next_block_length(progress.piece_len, progress.next_offset, session_config.block_size);
        if length == 0 {
            break;
        }
        let begin = progress.next_offset;
        session
            .send(Message::Request { index: progress.index as u32, begin, length })
            .await?;
        session.state.record_request(progress.index as u32, begin, length);
        progress.next_offset += length;
    }
    Ok(())
}

async fn finish_current_piece(
    session: &mut PeerSession,
    scheduler: &Scheduler,
    piece_store: &PieceStore,
    current: &mut Option<PieceProgress>,
) -> crate::peer::session::SessionResult<()> {
    let Some(progress) = current.take() else {
        return Ok(());
    };
    let index = progress.index;
    match piece_store.finalize_piece(index).await {
        Ok(true) => {
            scheduler.piece_completed(index);
        }
        Ok(false) => {
            scheduler.piece_failed(index);
        }
        Err(PieceError::RetriesExhausted(index)) => {
            scheduler.mark_permanently_failed(index);
            scheduler.blacklist(session.addr);
            tracing::warn!(piece = index, peer = %session.addr, "piece exceeded its retry budget, blacklisting peer");
        }
        Err(e) => {
            scheduler.piece_failed(index);
            tracing::warn!(piece = index, error = %e, "giving up on piece for this peer");
        }
    }
    Ok(())
}
