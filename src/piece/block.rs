//! A single 16 KiB transfer unit within a piece.
use std::time::{Duration, Instant};

use crate::peer::BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Pending,
    Full,
}

/// One block of a piece: `Free` implies empty data; `Full` implies
/// `data.len()` equals `size`; at most one request is ever outstanding
/// against a `Pending` block.
#[derive(Debug, Clone)]
pub struct Block {
    pub state: BlockState,
    pub size: u32,
    pub data: Vec<u8>,
    pub last_seen: Instant,
}

impl Block {
    pub fn new(size: u32) -> Self {
        Self {
            state: BlockState::Free,
            size,
            data: Vec::new(),
            last_seen: Instant::now(),
        }
    }

    /// Fills the block with delivered data. Rejects anything longer than
    /// `size`; the caller is expected to have already validated this per
    /// the assembler's final-block-of-final-piece rule.
    pub fn fill(&mut self, data: Vec<u8>) -> bool {
        if data.len() > self.size as usize {
            return false;
        }
        self.data = data;
        self.state = BlockState::Full;
        self.last_seen = Instant::now();
        true
    }

    pub fn mark_pending(&mut self) {
        self.state = BlockState::Pending;
        self.last_seen = Instant::now();
    }

    pub fn mark_free(&mut self) {
        self.state = BlockState::Free;
        self.data.clear();
        self.last_seen = Instant::now();
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.state == BlockState::Pending && self.last_seen.elapsed() > timeout
    }

    pub fn is_full(&self) -> bool {
        self.state == BlockState::Full
    }
}

/// Splits `piece_size` into consecutive `BLOCK_SIZE` blocks, the final one
/// truncated to the remainder.
pub fn blocks_for_piece_size(piece_size: u32) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut remaining = piece_size;
    while remaining > 0 {
        let size = remaining.min(BLOCK_SIZE);
        blocks.push(Block::new(size));
        remaining -= size;
    }
    blocks
}

/// Returns the byte offset within the piece of the block at `block_index`,
/// given every earlier block is a full `BLOCK_SIZE`.
pub fn block_offset(block_index: usize) -> u32 {
    block_index as u32 * BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_piece_into_full_blocks_plus_remainder() {
        let blocks = blocks_for_piece_size(BLOCK_SIZE * 2 + 100);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].size, BLOCK_SIZE);
        assert_eq!(blocks[1].size, BLOCK_SIZE);
        assert_eq!(blocks[2].size, 100);
    }

    #[test]
    fn fill_marks_full_and_mark_free_clears_data() {
        let mut b = Block::new(4);
        assert!(b.fill(vec![1, 2, 3, 4]));
        assert!(b.is_full());
        b.mark_free();
        assert_eq!(b.state, BlockState::Free);
        assert!(b.data.is_empty());
    }

    #[test]
    fn rejects_oversized_fill() {
        let mut b = Block::new(4);
        assert!(!b.fill(vec![0; 5]));
        assert_eq!(b.state, BlockState::Free);
    }

    #[test]
    fn pending_block_becomes_stale_after_timeout() {
        let mut b = Block::new(4);
        b.mark_pending();
        assert!(!b.is_stale(Duration::from_secs(10)));
        assert!(b.is_stale(Duration::from_nanos(0)));
    }
}
