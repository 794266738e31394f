//! The BitTorrent peer handshake.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both peers are participating in the same torrent (via
//! info_hash) and establishes basic protocol compatibility.
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

use super::{PeerError, PeerResult};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// A parsed BitTorrent handshake: protocol identifier, reserved
/// extension-flag bytes, the torrent's info hash, and the sender's peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its fixed 68-byte wire form:
    /// 1 byte length + 19 byte protocol string + 8 reserved + 20 byte
    /// info hash + 20 byte peer id.
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads exactly 68 bytes from `reader` and parses them as a handshake,
    /// rejecting a protocol length/string other than the canonical one.
    #[instrument(level = "trace", skip(reader))]
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> PeerResult<Self> {
        let mut buf = [0u8; 68];
        reader.read_exact(&mut buf).await?;

        if buf[0] != 19 || &buf[1..20] != PROTOCOL {
            return Err(PeerError::HandshakeInvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Writes this handshake's wire form to `writer`.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> PeerResult<()> {
        writer.write_all(&self.serialize()).await?;
        Ok(())
    }

    /// Checks this handshake's info hash against the one we expect.
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::HandshakeInfoHashMismatch {
                got: self.info_hash,
                expected: expected_info_hash,
            });
        }
        Ok(())
    }

    /// Connects to `peer_addr`, exchanges handshakes, and returns the
    /// peer's handshake once its info hash has been validated against ours.
    ///
    /// Bounds connect and handshake I/O by `connect_timeout`/`handshake_timeout`
    /// so a silent peer cannot hang the caller indefinitely.
    #[instrument(level = "debug", skip(peer_id))]
    pub async fn perform(
        peer_addr: std::net::SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> PeerResult<(TcpStream, Handshake)> {
        let mut stream = timeout(connect_timeout, TcpStream::connect(peer_addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout)??;

        let ours = Handshake::new(info_hash, peer_id);
        timeout(handshake_timeout, ours.write_to(&mut stream))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;

        let theirs = timeout(handshake_timeout, Handshake::read_from(&mut stream))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
        theirs.validate(info_hash)?;

        Ok((stream, theirs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn serializes_to_68_bytes_with_expected_layout() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL);
        assert_eq!(&bytes[28..48], &[1u8; 20][..]);
        assert_eq!(&bytes[48..68], &[2u8; 20][..]);
    }

    #[tokio::test]
    async fn round_trips_through_read_from() {
        let hs = Handshake::new([3u8; 20], [4u8; 20]);
        let bytes = hs.serialize();
        let mut cursor = Cursor::new(bytes.to_vec());
        let parsed = Handshake::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, hs);
    }

    #[tokio::test]
    async fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[1] = b'X';
        let mut cursor = Cursor::new(bytes.to_vec());
        let err = Handshake::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, PeerError::HandshakeInvalidProtocol));
    }

    #[test]
    fn validate_rejects_mismatched_info_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let err = hs.validate([9u8; 20]).unwrap_err();
        assert!(matches!(err, PeerError::HandshakeInfoHashMismatch { .. }));
    }
}
