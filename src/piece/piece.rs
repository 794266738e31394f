//! A single piece: its block table, completion state, and the file
//! segments it needs to be written to once verified.
use sha1::{Digest, Sha1};
use tracing::{instrument, warn};

use super::block::{block_offset, blocks_for_piece_size, Block, BlockState};
use super::FileSegment;

/// One piece of the torrent payload.
pub struct Piece {
    pub index: usize,
    pub size: u32,
    pub expected_hash: [u8; 20],
    pub blocks: Vec<Block>,
    pub segments: Vec<FileSegment>,
    pub is_complete: bool,
}

impl Piece {
    pub fn new(index: usize, size: u32, expected_hash: [u8; 20], segments: Vec<FileSegment>) -> Self {
        Self {
            index,
            size,
            expected_hash,
            blocks: blocks_for_piece_size(size),
            segments,
            is_complete: false,
        }
    }

    /// Locates the block whose offset within the piece equals `offset`.
    pub fn block_at(&self, offset: u32) -> Option<usize> {
        self.blocks.iter().enumerate().find_map(|(i, _)| {
            if block_offset(i) == offset {
                Some(i)
            } else {
                None
            }
        })
    }

    pub fn all_blocks_full(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Full)
    }

    /// Concatenates every block's data in order.
    pub fn concatenated(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size as usize);
        for b in &self.blocks {
            buf.extend_from_slice(&b.data);
        }
        buf
    }

    /// Verifies the concatenated block data against the expected hash. On
    /// success marks the piece complete and returns the verified buffer; on
    /// mismatch resets every block to `Free` and returns `None` without
    /// flagging any peer as at fault.
    #[instrument(level = "debug", skip(self), fields(index = self.index))]
    pub fn try_complete(&mut self) -> Option<Vec<u8>> {
        if !self.all_blocks_full() {
            return None;
        }
        let data = self.concatenated();
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest = hasher.finalize();

        if digest.as_slice() == self.expected_hash {
            self.is_complete = true;
            Some(data)
        } else {
            warn!(index = self.index, "piece hash verification failed, resetting blocks");
            for b in &mut self.blocks {
                b.mark_free();
            }
            None
        }
    }

    /// The first `Free` block, if any, without mutating state.
    pub fn first_free_block(&self) -> Option<usize> {
        self.blocks.iter().position(|b| b.state == BlockState::Free)
    }

    /// Resets every `Pending` block older than `timeout` back to `Free`.
    pub fn reclaim_stale(&mut self, timeout: std::time::Duration) {
        for b in &mut self.blocks {
            if b.is_stale(timeout) {
                b.mark_free();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::BLOCK_SIZE;

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let mut out = [0u8; 20];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    #[test]
    fn completes_on_matching_hash() {
        let data = vec![7u8; BLOCK_SIZE as usize];
        let expected = hash_of(&data);
        let mut piece = Piece::new(0, BLOCK_SIZE, expected, Vec::new());
        piece.blocks[0].fill(data.clone());
        let result = piece.try_complete();
        assert_eq!(result, Some(data));
        assert!(piece.is_complete);
    }

    #[test]
    fn resets_blocks_on_hash_mismatch() {
        let data = vec![7u8; BLOCK_SIZE as usize];
        let mut piece = Piece::new(0, BLOCK_SIZE, [0u8; 20], Vec::new());
        piece.blocks[0].fill(data);
        let result = piece.try_complete();
        assert!(result.is_none());
        assert!(!piece.is_complete);
        assert_eq!(piece.blocks[0].state, BlockState::Free);
        assert!(piece.blocks[0].data.is_empty());
    }

    #[test]
    fn block_at_locates_by_offset() {
        let piece = Piece::new(0, BLOCK_SIZE * 2, [0u8; 20], Vec::new());
        assert_eq!(piece.block_at(0), Some(0));
        assert_eq!(piece.block_at(BLOCK_SIZE), Some(1));
        assert_eq!(piece.block_at(BLOCK_SIZE / 2), None);
    }
}
