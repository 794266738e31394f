//! UDP tracker announce (BEP-15): the connect/announce request-response
//! pair, matched by transaction id.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::{AnnounceRequest, AnnounceResponse, Peer, TrackerError, TrackerResult};

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const EVENT_STARTED: u32 = 2;

/// Performs a full connect+announce exchange against a `udp://host:port`
/// tracker URL. `round_trip_timeout` bounds each phase (connect, announce)
/// independently.
#[instrument(skip(request), level = "debug")]
pub async fn announce(
    url: &str,
    request: &AnnounceRequest,
    round_trip_timeout: Duration,
) -> TrackerResult<AnnounceResponse> {
    let addr = resolve(url).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;

    let connection_id = connect(&socket, round_trip_timeout).await?;
    let response = send_announce(&socket, connection_id, request, round_trip_timeout).await?;
    Ok(response)
}

async fn resolve(url: &str) -> TrackerResult<SocketAddr> {
    let without_scheme = url.trim_start_matches("udp://");
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    tokio::net::lookup_host(host_port)
        .await?
        .next()
        .ok_or_else(|| TrackerError::UnsupportedScheme(url.to_string()))
}

async fn connect(socket: &UdpSocket, round_trip_timeout: Duration) -> TrackerResult<u64> {
    let transaction_id: u32 = rand::rng().random();
    let mut request = [0u8; 16];
    BigEndian::write_u64(&mut request[0..8], PROTOCOL_MAGIC);
    BigEndian::write_u32(&mut request[8..12], ACTION_CONNECT);
    BigEndian::write_u32(&mut request[12..16], transaction_id);

    timeout(round_trip_timeout, socket.send(&request))
        .await
        .map_err(|_| TrackerError::Timeout)??;

    let mut buf = [0u8; 16];
    let n = timeout(round_trip_timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| TrackerError::Timeout)??;

    if n < 16 {
        return Err(TrackerError::ResponseTooShort { got: n, need: 16 });
    }

    let action = BigEndian::read_u32(&buf[0..4]);
    let got_transaction_id = BigEndian::read_u32(&buf[4..8]);
    if got_transaction_id != transaction_id {
        return Err(TrackerError::TransactionIdMismatch {
            expected: transaction_id,
            got: got_transaction_id,
        });
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::ActionMismatch {
            expected: ACTION_CONNECT,
            got: action,
        });
    }

    Ok(BigEndian::read_u64(&buf[8..16]))
}

async fn send_announce(
    socket: &UdpSocket,
    connection_id: u64,
    request: &AnnounceRequest,
    round_trip_timeout: Duration,
) -> TrackerResult<AnnounceResponse> {
    let transaction_id: u32 = rand::rng().random();
    let mut buf = [0u8; 98];
    BigEndian::write_u64(&mut buf[0..8], connection_id);
    BigEndian::write_u32(&mut buf[8..12], ACTION_ANNOUNCE);
    BigEndian::write_u32(&mut buf[12..16], transaction_id);
    buf[16..36].copy_from_slice(&request.info_hash);
    buf[36..56].copy_from_slice(&request.peer_id);
    BigEndian::write_u64(&mut buf[56..64], request.downloaded as u64);
    BigEndian::write_u64(&mut buf[64..72], request.left as u64);
    BigEndian::write_u64(&mut buf[72..80], request.uploaded as u64);
    BigEndian::write_u32(&mut buf[80..84], EVENT_STARTED);
    BigEndian::write_u32(&mut buf[84..88], 0); // ip = 0 (let the tracker use the source address)
    BigEndian::write_u32(&mut buf[88..92], rand::rng().random()); // key
    BigEndian::write_i32(&mut buf[92..96], request.num_want);
    BigEndian::write_u16(&mut buf[96..98], request.port);

    timeout(round_trip_timeout, socket.send(&buf))
        .await
        .map_err(|_| TrackerError::Timeout)??;

    let mut resp = vec![0u8; 20 + 6 * (request.num_want.max(0) as usize + 8)];
    let n = timeout(round_trip_timeout, socket.recv(&mut resp))
        .await
        .map_err(|_| TrackerError::Timeout)??;
    resp.truncate(n);

    parse_announce_response(&resp, transaction_id)
}

fn parse_announce_response(bytes: &[u8], expected_transaction_id: u32) -> TrackerResult<AnnounceResponse> {
    if bytes.len() < 20 {
        return Err(TrackerError::ResponseTooShort { got: bytes.len(), need: 20 });
    }

    let action = BigEndian::read_u32(&bytes[0..4]);
    let transaction_id = BigEndian::read_u32(&bytes[4..8]);
    if transaction_id != expected_transaction_id {
        return Err(TrackerError::TransactionIdMismatch {
            expected: expected_transaction_id,
            got: transaction_id,
        });
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::ActionMismatch {
            expected: ACTION_ANNOUNCE,
            got: action,
        });
    }

    let interval = BigEndian::read_u32(&bytes[8..12]) as i64;
    debug!(leechers = BigEndian::read_u32(&bytes[12..16]), seeders = BigEndian::read_u32(&bytes[16..20]), "udp announce response");

    let peers = bytes[20..]
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer {
                ip: IpAddr::V4(ip),
                port,
            }
        })
        .collect();

    Ok(AnnounceResponse { interval, peers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_peer_records() {
        let mut body = vec![0u8; 20];
        BigEndian::write_u32(&mut body[0..4], ACTION_ANNOUNCE);
        BigEndian::write_u32(&mut body[4..8], 42);
        BigEndian::write_u32(&mut body[8..12], 1800);
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);

        let parsed = parse_announce_response(&body, 42).unwrap();
        assert_eq!(parsed.interval, 1800);
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].port, 0x1ae1);
    }

    #[test]
    fn rejects_mismatched_transaction_id() {
        let mut body = vec![0u8; 20];
        BigEndian::write_u32(&mut body[0..4], ACTION_ANNOUNCE);
        BigEndian::write_u32(&mut body[4..8], 1);
        let err = parse_announce_response(&body, 2).unwrap_err();
        assert!(matches!(err, TrackerError::TransactionIdMismatch { .. }));
    }

    #[test]
    fn rejects_action_mismatch() {
        let mut body = vec![0u8; 20];
        BigEndian::write_u32(&mut body[0..4], ACTION_CONNECT);
        BigEndian::write_u32(&mut body[4..8], 5);
        let err = parse_announce_response(&body, 5).unwrap_err();
        assert!(matches!(err, TrackerError::ActionMismatch { .. }));
    }
}
