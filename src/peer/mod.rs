//! Peer wire protocol, per-peer session state machine, and the peer pool.
//!
//! This module covers everything that talks directly to a single remote
//! peer: the handshake, the length-prefixed message codec, the
//! choke/interest state machine, and the pool that multiplexes many
//! sessions at once.
use thiserror::Error;

pub mod handshake;
pub mod message;
pub mod pool;
pub mod session;

pub use handshake::Handshake;
pub use message::PeerMessage;
pub use pool::PeerPool;
pub use session::{PeerSession, SessionState};

/// 16 KiB, the fixed block size used for all `Request`/`Piece` payloads
/// except possibly the final block of the final piece.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Unpacks a wire `Bitfield` payload (MSB-first, high bit of byte 0 is
/// piece 0) into one `bool` per piece, ignoring any spare bits past
/// `num_pieces` in the final byte.
pub fn unpack_bitfield(bits: &[u8], num_pieces: usize) -> Vec<bool> {
    (0..num_pieces)
        .map(|i| {
            let byte = i / 8;
            let bit = 7 - (i % 8);
            byte < bits.len() && (bits[byte] >> bit) & 1 == 1
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid protocol identifier in handshake")]
    HandshakeInvalidProtocol,

    #[error("info hash mismatch: got {got:x?}, expected {expected:x?}")]
    HandshakeInfoHashMismatch { got: [u8; 20], expected: [u8; 20] },

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("message payload length {got} exceeds cap {cap}")]
    PayloadTooLarge { got: usize, cap: usize },

    #[error("invalid fixed-length payload for message {message}: expected {expected}, got {got}")]
    FixedLengthMismatch {
        message: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("request/cancel length {0} exceeds the maximum block size")]
    RequestTooLarge(u32),

    #[error("bitfield length {got} bytes does not match ceil(num_pieces / 8) = {expected} bytes")]
    InvalidBitfieldLength { got: usize, expected: usize },
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
