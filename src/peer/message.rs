//! The length-prefixed peer message codec.
//!
//! Wire shape: a 4-byte big-endian payload length, then (if the length is
//! nonzero) a 1-byte type id and the payload. A length of zero is
//! `KeepAlive`.
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use super::{PeerError, PeerResult, BLOCK_SIZE};

/// Default cap on a single message's payload length, guarding against a
/// malicious or buggy peer claiming an enormous frame.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
}

impl PeerMessage {
    /// Serializes this message into its length-prefixed wire form.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            PeerMessage::KeepAlive => 0u32.to_be_bytes().to_vec(),
            PeerMessage::Choke => frame(0, &[]),
            PeerMessage::Unchoke => frame(1, &[]),
            PeerMessage::Interested => frame(2, &[]),
            PeerMessage::NotInterested => frame(3, &[]),
            PeerMessage::Have { piece_index } => frame(4, &piece_index.to_be_bytes()),
            PeerMessage::Bitfield(bits) => frame(5, bits),
            PeerMessage::Request { index, begin, length } => {
                let mut payload = [0u8; 12];
                BigEndian::write_u32(&mut payload[0..4], *index);
                BigEndian::write_u32(&mut payload[4..8], *begin);
                BigEndian::write_u32(&mut payload[8..12], *length);
                frame(6, &payload)
            }
            PeerMessage::Piece { index, begin, block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                frame(7, &payload)
            }
            PeerMessage::Cancel { index, begin, length } => {
                let mut payload = [0u8; 12];
                BigEndian::write_u32(&mut payload[0..4], *index);
                BigEndian::write_u32(&mut payload[4..8], *begin);
                BigEndian::write_u32(&mut payload[8..12], *length);
                frame(8, &payload)
            }
            PeerMessage::Port(port) => frame(9, &port.to_be_bytes()),
        }
    }

    /// Reads and parses one complete message from an async stream.
    #[instrument(skip(reader), level = "trace")]
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_payload_len: usize,
    ) -> PeerResult<PeerMessage> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = BigEndian::read_u32(&len_buf) as usize;

        if len == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if len > max_payload_len {
            return Err(PeerError::PayloadTooLarge {
                got: len,
                cap: max_payload_len,
            });
        }

        let mut id_buf = [0u8; 1];
        reader.read_exact(&mut id_buf).await?;
        let mut payload = vec![0u8; len - 1];
        reader.read_exact(&mut payload).await?;

        Self::from_id_and_payload(id_buf[0], payload)
    }

    /// Writes this message to an async stream.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> PeerResult<()> {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }

    fn from_id_and_payload(id: u8, payload: Vec<u8>) -> PeerResult<PeerMessage> {
        match id {
            0 => expect_empty("Choke", &payload).map(|_| PeerMessage::Choke),
            1 => expect_empty("Unchoke", &payload).map(|_| PeerMessage::Unchoke),
            2 => expect_empty("Interested", &payload).map(|_| PeerMessage::Interested),
            3 => expect_empty("NotInterested", &payload).map(|_| PeerMessage::NotInterested),
            4 => {
                expect_len("Have", &payload, 4)?;
                Ok(PeerMessage::Have {
                    piece_index: BigEndian::read_u32(&payload),
                })
            }
            5 => Ok(PeerMessage::Bitfield(payload)),
            6 => {
                expect_len("Request", &payload, 12)?;
                let (index, begin, length) = read_index_begin_length(&payload);
                if length > BLOCK_SIZE {
                    return Err(PeerError::RequestTooLarge(length));
                }
                Ok(PeerMessage::Request { index, begin, length })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(PeerError::FixedLengthMismatch {
                        message: "Piece",
                        expected: 8,
                        got: payload.len(),
                    });
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                let block = payload[8..].to_vec();
                Ok(PeerMessage::Piece { index, begin, block })
            }
            8 => {
                expect_len("Cancel", &payload, 12)?;
                let (index, begin, length) = read_index_begin_length(&payload);
                if length > BLOCK_SIZE {
                    return Err(PeerError::RequestTooLarge(length));
                }
                Ok(PeerMessage::Cancel { index, begin, length })
            }
            9 => {
                expect_len("Port", &payload, 2)?;
                Ok(PeerMessage::Port(BigEndian::read_u16(&payload)))
            }
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u32;
    let mut out = Vec::with_capacity(4 + 1 + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(id);
    out.extend_from_slice(payload);
    out
}

fn expect_empty(name: &'static str, payload: &[u8]) -> PeerResult<()> {
    expect_len(name, payload, 0)
}

fn expect_len(name: &'static str, payload: &[u8], expected: usize) -> PeerResult<()> {
    if payload.len() != expected {
        return Err(PeerError::FixedLengthMismatch {
            message: name,
            expected,
            got: payload.len(),
        });
    }
    Ok(())
}

fn read_index_begin_length(payload: &[u8]) -> (u32, u32, u32) {
    (
        BigEndian::read_u32(&payload[0..4]),
        BigEndian::read_u32(&payload[4..8]),
        BigEndian::read_u32(&payload[8..12]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn round_trip(msg: PeerMessage) -> PeerMessage {
        let bytes = msg.encode();
        let mut cursor = Cursor::new(bytes);
        PeerMessage::read_from(&mut cursor, DEFAULT_MAX_PAYLOAD_LEN)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn round_trips_every_message_kind() {
        assert_eq!(round_trip(PeerMessage::KeepAlive).await, PeerMessage::KeepAlive);
        assert_eq!(round_trip(PeerMessage::Choke).await, PeerMessage::Choke);
        assert_eq!(round_trip(PeerMessage::Unchoke).await, PeerMessage::Unchoke);
        assert_eq!(round_trip(PeerMessage::Interested).await, PeerMessage::Interested);
        assert_eq!(
            round_trip(PeerMessage::NotInterested).await,
            PeerMessage::NotInterested
        );
        assert_eq!(
            round_trip(PeerMessage::Have { piece_index: 7 }).await,
            PeerMessage::Have { piece_index: 7 }
        );
        assert_eq!(
            round_trip(PeerMessage::Bitfield(vec![0xff, 0x00])).await,
            PeerMessage::Bitfield(vec![0xff, 0x00])
        );
        assert_eq!(
            round_trip(PeerMessage::Request {
                index: 1,
                begin: 0,
                length: 16384
            })
            .await,
            PeerMessage::Request {
                index: 1,
                begin: 0,
                length: 16384
            }
        );
        assert_eq!(
            round_trip(PeerMessage::Piece {
                index: 2,
                begin: 16384,
                block: vec![1, 2, 3]
            })
            .await,
            PeerMessage::Piece {
                index: 2,
                begin: 16384,
                block: vec![1, 2, 3]
            }
        );
        assert_eq!(
            round_trip(PeerMessage::Cancel {
                index: 1,
                begin: 0,
                length: 16384
            })
            .await,
            PeerMessage::Cancel {
                index: 1,
                begin: 0,
                length: 16384
            }
        );
        assert_eq!(round_trip(PeerMessage::Port(6881)).await, PeerMessage::Port(6881));
    }

    #[tokio::test]
    async fn rejects_request_length_over_block_size() {
        let mut payload = [0u8; 12];
        BigEndian::write_u32(&mut payload[8..12], 32768);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.push(6);
        bytes.extend_from_slice(&payload);
        let mut cursor = Cursor::new(bytes);
        let err = PeerMessage::read_from(&mut cursor, DEFAULT_MAX_PAYLOAD_LEN)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::RequestTooLarge(32768)));
    }

    #[tokio::test]
    async fn rejects_unknown_message_id() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.push(200);
        let mut cursor = Cursor::new(bytes);
        let err = PeerMessage::read_from(&mut cursor, DEFAULT_MAX_PAYLOAD_LEN)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::UnknownMessageId(200)));
    }

    #[tokio::test]
    async fn rejects_payload_beyond_cap() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((DEFAULT_MAX_PAYLOAD_LEN as u32) + 1).to_be_bytes());
        let mut cursor = Cursor::new(bytes);
        let err = PeerMessage::read_from(&mut cursor, DEFAULT_MAX_PAYLOAD_LEN)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::PayloadTooLarge { .. }));
    }
}
