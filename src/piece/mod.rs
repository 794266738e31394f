//! Piece/block bookkeeping: the block state machine, per-piece hash
//! verification, the file-segment mapping, rarest-first selection, and the
//! assembler that ties them together.
use thiserror::Error;

pub mod assembler;
pub mod block;
pub mod piece;
pub mod rarest;

pub use assembler::Assembler;
pub use block::{Block, BlockState};
pub use piece::Piece;
pub use rarest::RarestIndex;

/// One contiguous run of bytes shared between a piece and an output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub path: std::path::PathBuf,
    pub file_offset: u64,
    pub piece_offset: u32,
    pub length: u32,
}

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece index {0} out of range")]
    PieceIndexOutOfRange(usize),

    #[error("block offset {0} is not a multiple of the block size")]
    MisalignedOffset(u32),

    #[error("no block at offset {0} in piece {1}")]
    NoSuchBlock(u32, usize),

    #[error("block data length {got} does not match expected block size {expected}")]
    UnexpectedBlockLength { got: usize, expected: usize },
}

pub type AssemblerResult<T> = std::result::Result<T, AssemblerError>;
