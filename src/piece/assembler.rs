//! Ties the block table, hash verification, and file writer together.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{info, instrument};

use crate::peer::BLOCK_SIZE;
use crate::torrent::file::TorrentFile;

use super::piece::Piece;
use super::rarest::RarestIndex;
use super::{AssemblerError, AssemblerResult};

/// Default time a block may sit `Pending` before being reclaimed, used
/// when a caller doesn't override it via `Config`.
pub const BLOCK_PENDING_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the piece table from a parsed torrent, accepts delivered blocks,
/// verifies completed pieces, and writes them to the right output files.
pub struct Assembler {
    pieces: Vec<Piece>,
    output_root: PathBuf,
    open_files: HashMap<PathBuf, File>,
    rarest: RarestIndex,
    completed_count: usize,
    block_pending_timeout: Duration,
}

impl Assembler {
    pub fn new(torrent: &TorrentFile, output_root: impl Into<PathBuf>) -> Self {
        Self::with_pending_timeout(torrent, output_root, BLOCK_PENDING_TIMEOUT)
    }

    pub fn with_pending_timeout(
        torrent: &TorrentFile,
        output_root: impl Into<PathBuf>,
        block_pending_timeout: Duration,
    ) -> Self {
        let num_pieces = torrent.num_pieces();
        let mut pieces = Vec::with_capacity(num_pieces);
        for index in 0..num_pieces {
            let size = torrent.piece_size(index) as u32;
            let hash = torrent.pieces_hash[index];
            let segments = torrent.file_segments_for_piece(index);
            pieces.push(Piece::new(index, size, hash, segments));
        }

        Self {
            pieces,
            output_root: output_root.into(),
            open_files: HashMap::new(),
            rarest: RarestIndex::new(num_pieces),
            completed_count: 0,
            block_pending_timeout,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_done(&self) -> bool {
        self.completed_count == self.pieces.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count
    }

    pub fn rarest_mut(&mut self) -> &mut RarestIndex {
        &mut self.rarest
    }

    pub fn is_piece_complete(&self, index: usize) -> bool {
        self.pieces.get(index).map(|p| p.is_complete).unwrap_or(false)
    }

    /// Pre-allocates every distinct output file to its declared length
    /// (sparse where the filesystem supports it, else a single trailing
    /// zero byte), creating parent directories as needed.
    #[instrument(level = "debug", skip(self))]
    pub async fn preallocate_files(&mut self) -> AssemblerResult<()> {
        let mut lengths: HashMap<PathBuf, u64> = HashMap::new();
        for piece in &self.pieces {
            for seg in &piece.segments {
                let end = seg.file_offset + seg.length as u64;
                let entry = lengths.entry(seg.path.clone()).or_insert(0);
                *entry = (*entry).max(end);
            }
        }

        for (rel_path, length) in lengths {
            let full_path = self.output_root.join(&rel_path);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .read(true)
                .truncate(false)
                .open(&full_path)
                .await?;
            file.set_len(length).await?;
            self.open_files.insert(rel_path, file);
        }
        Ok(())
    }

    /// Delivers one block's data. Returns `true` if this completed and
    /// verified the owning piece.
    #[instrument(level = "trace", skip(self, data), fields(piece_index, offset))]
    pub async fn on_block(&mut self, piece_index: usize, offset: u32, data: Vec<u8>) -> AssemblerResult<bool> {
        if offset % BLOCK_SIZE != 0 {
            return Err(AssemblerError::MisalignedOffset(offset));
        }
        let piece = self
            .pieces
            .get_mut(piece_index)
            .ok_or(AssemblerError::PieceIndexOutOfRange(piece_index))?;
        if piece.is_complete {
            return Ok(false);
        }

        let block_idx = piece
            .block_at(offset)
            .ok_or(AssemblerError::NoSuchBlock(offset, piece_index))?;
        let block = &mut piece.blocks[block_idx];
        if block.state == super::block::BlockState::Full {
            return Ok(false);
        }
        if data.len() != block.size as usize {
            return Err(AssemblerError::UnexpectedBlockLength {
                got: data.len(),
                expected: block.size as usize,
            });
        }
        block.fill(data);

        if let Some(verified) = piece.try_complete() {
            self.completed_count += 1;
            self.rarest.on_piece_complete(piece_index);
            self.write_piece(piece_index, &verified).await?;
            info!(piece_index, "piece verified and written");
            return Ok(true);
        }
        Ok(false)
    }

    async fn write_piece(&mut self, piece_index: usize, data: &[u8]) -> AssemblerResult<()> {
        let segments = self.pieces[piece_index].segments.clone();
        for seg in segments {
            let file = self.file_for(&seg.path).await?;
            file.seek(std::io::SeekFrom::Start(seg.file_offset)).await?;
            let start = seg.piece_offset as usize;
            let end = start + seg.length as usize;
            file.write_all(&data[start..end]).await?;
        }
        Ok(())
    }

    async fn file_for(&mut self, rel_path: &Path) -> AssemblerResult<&mut File> {
        if !self.open_files.contains_key(rel_path) {
            let full_path = self.output_root.join(rel_path);
            let file = OpenOptions::new().write(true).read(true).open(&full_path).await?;
            self.open_files.insert(rel_path.to_path_buf(), file);
        }
        Ok(self.open_files.get_mut(rel_path).unwrap())
    }

    /// Reclaims every `Pending` block older than this assembler's pending
    /// timeout, across every incomplete piece.
    pub fn reclaim_stale_blocks(&mut self) {
        for piece in &mut self.pieces {
            if !piece.is_complete {
                piece.reclaim_stale(self.block_pending_timeout);
            }
        }
    }

    /// Finds the next block to request for `piece_index`: marks the first
    /// `Free` block `Pending` and returns its (piece, offset, length).
    pub fn next_block_request(&mut self, piece_index: usize) -> Option<(usize, u32, u32)> {
        let piece = self.pieces.get_mut(piece_index)?;
        if piece.is_complete {
            return None;
        }
        let block_idx = piece.first_free_block()?;
        piece.blocks[block_idx].mark_pending();
        let offset = super::block::block_offset(block_idx);
        let length = piece.blocks[block_idx].size;
        Some((piece_index, offset, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_torrent(piece_length: i64, total: i64, hashes: Vec<[u8; 20]>) -> TorrentFile {
        use crate::torrent::file::{FileDict, InfoDict};
        TorrentFile {
            announce: "http://tracker.example/announce".to_string(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            info: InfoDict {
                piece_length,
                pieces: Vec::new(),
                private: false,
                name: "test.bin".to_string(),
                length: Some(total),
                files: Vec::<FileDict>::new(),
                is_directory: false,
            },
            info_hash: [0u8; 20],
            pieces_hash: hashes,
        }
    }

    #[test]
    fn reclaim_stale_resets_expired_pending_blocks() {
        let torrent = make_torrent(BLOCK_SIZE as i64, BLOCK_SIZE as i64, vec![[0u8; 20]]);
        let mut assembler = Assembler::new(&torrent, "/tmp/does-not-matter");
        let (_, _, _) = assembler.next_block_request(0).unwrap();
        assembler.pieces[0].blocks[0].last_seen = std::time::Instant::now() - Duration::from_secs(20);
        assembler.reclaim_stale_blocks();
        assert_eq!(assembler.pieces[0].blocks[0].state, super::block::BlockState::Free);
    }

    #[test]
    fn next_block_request_returns_none_once_piece_complete() {
        let torrent = make_torrent(BLOCK_SIZE as i64, BLOCK_SIZE as i64, vec![[0u8; 20]]);
        let mut assembler = Assembler::new(&torrent, "/tmp/does-not-matter");
        assembler.pieces[0].is_complete = true;
        assert!(assembler.next_block_request(0).is_none());
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("rstc-assembler-test-{}-{}-{}", std::process::id(), label, n))
    }

    #[tokio::test]
    async fn on_block_verifies_and_writes_single_block_piece_to_disk() {
        use sha1::{Digest, Sha1};

        let data = vec![42u8; BLOCK_SIZE as usize];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();

        let torrent = make_torrent(BLOCK_SIZE as i64, BLOCK_SIZE as i64, vec![hash]);
        let output_dir = unique_temp_dir("single-piece");
        let mut assembler = Assembler::new(&torrent, &output_dir);
        assembler.preallocate_files().await.unwrap();

        let (piece_index, offset, length) = assembler.next_block_request(0).unwrap();
        assert_eq!(length, BLOCK_SIZE);

        let completed = assembler.on_block(piece_index, offset, data.clone()).await.unwrap();
        assert!(completed);
        assert!(assembler.is_piece_complete(0));
        assert_eq!(assembler.completed_count(), 1);

        let written = tokio::fs::read(output_dir.join("test.bin")).await.unwrap();
        assert_eq!(written, data);

        let _ = tokio::fs::remove_dir_all(&output_dir).await;
    }
}
