//! The download control surface: `start`, `progress`, `stop`.
//!
//! This is the crate's "external collaborator" boundary — a CLI or any
//! other front end drives a download entirely through this module.
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::config::Config;
use crate::peer::pool::PeerPool;
use crate::piece::{Assembler, AssemblerError};
use crate::torrent::file::TorrentFile;
use crate::torrent::TorrentError;
use crate::tracker::{Client as TrackerClient, TrackerError};

pub mod driver;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Assembler(#[from] AssemblerError),
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// A point-in-time snapshot of download progress.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub pieces_complete: usize,
    pub total_pieces: usize,
    pub bytes_downloaded: u64,
    pub connected_peers: usize,
}

struct Shared {
    assembler: Assembler,
    pool: PeerPool,
    piece_length: u32,
}

/// A running leecher-mode download. Dropping this without calling `stop`
/// leaves the background driver task running; call `stop` to shut it down
/// deterministically.
pub struct Download {
    shared: Arc<Mutex<Shared>>,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
    total_pieces: usize,
    total_length: u64,
}

impl Download {
    /// Loads the metainfo file, discovers peers, pre-allocates output
    /// files, and spawns the background driver task.
    #[instrument(skip(config), level = "info")]
    pub async fn start(
        metainfo_path: &Path,
        output_dir: &Path,
        config: Config,
    ) -> DownloadResult<Self> {
        let torrent = TorrentFile::load(metainfo_path)?;
        let peer_id = crate::tracker::generate_peer_id();

        let tracker_client = TrackerClient::new(
            peer_id,
            config.listening_port,
            config.udp_tracker_timeout,
            config.http_tracker_timeout,
        );
        let peers = tracker_client
            .discover_peers(&torrent, config.tracker_peer_ceiling)
            .await;
        info!(count = peers.len(), "tracker discovery complete");

        let mut assembler =
            Assembler::with_pending_timeout(&torrent, output_dir, config.block_pending_timeout);
        assembler.preallocate_files().await?;

        let mut pool = PeerPool::new(
            torrent.num_pieces(),
            torrent.info_hash,
            peer_id,
            config.session_limits(),
        );
        for peer in &peers {
            pool.add(std::net::SocketAddr::new(peer.ip, peer.port));
        }

        let total_pieces = torrent.num_pieces();
        let total_length = torrent.total_length().max(0) as u64;

        let shared = Arc::new(Mutex::new(Shared {
            assembler,
            pool,
            piece_length: torrent.info.piece_length as u32,
        }));
        let stop = Arc::new(Notify::new());

        let handle = tokio::spawn(driver::run(shared.clone(), stop.clone(), config));

        Ok(Self {
            shared,
            stop,
            handle,
            total_pieces,
            total_length,
        })
    }

    pub async fn progress(&self) -> Progress {
        let guard = self.shared.lock().await;
        let pieces_complete = guard.assembler.completed_count();
        let bytes_downloaded = if self.total_pieces == 0 {
            0
        } else {
            (pieces_complete as u64) * (guard.piece_length as u64)
        };
        Progress {
            pieces_complete,
            total_pieces: self.total_pieces,
            bytes_downloaded: bytes_downloaded.min(self.total_length),
            connected_peers: guard.pool.connected_count(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the driver task to stop and waits for it to exit. Safe to
    /// call at any time, including after the download has already
    /// completed on its own.
    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.handle.await;
    }
}
