//! HTTP tracker announce (BEP-3): compact and non-compact peer list forms.
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{url_encode, AnnounceRequest, AnnounceResponse, Peer, TrackerError, TrackerResult};

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: Peers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(Vec<u8>),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// Issues one GET announce against an HTTP(S) tracker URL. `timeout` bounds
/// the whole request (connect + response body), mirroring the UDP path's
/// per-phase `round_trip_timeout` discipline. A non-2xx response is
/// rejected before its body is handed to the bencode decoder.
pub async fn announce(url: &str, request: &AnnounceRequest, timeout: Duration) -> TrackerResult<AnnounceResponse> {
    let mut parsed = url::Url::parse(url)?;
    let params = [
        ("info_hash", url_encode(&request.info_hash)),
        ("peer_id", url_encode(&request.peer_id)),
        ("port", request.port.to_string()),
        ("uploaded", request.uploaded.to_string()),
        ("downloaded", request.downloaded.to_string()),
        ("left", request.left.to_string()),
        ("compact", "1".to_string()),
        ("numwant", request.num_want.to_string()),
        ("event", "started".to_string()),
    ];
    parsed.query_pairs_mut().extend_pairs(&params).finish();

    let client = reqwest::Client::builder().timeout(timeout).build()?;

    debug!(%parsed, "making HTTP announce request");
    let response = client.get(parsed).send().await?;
    if !response.status().is_success() {
        return Err(TrackerError::HttpStatus(response.status().as_u16()));
    }
    let bytes = response.bytes().await?;
    parse_announce_response(&bytes)
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let tracker_response: TrackerResponse = serde_bencode::from_bytes(bytes)?;

    if let Some(reason) = tracker_response.failure_reason {
        return Err(TrackerError::FailureReason(reason));
    }

    let peers = match tracker_response.peers {
        Peers::Compact(bytes) => bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Peer {
                    ip: IpAddr::V4(ip),
                    port,
                }
            })
            .collect(),
        Peers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip.parse::<IpAddr>().ok().map(|ip| Peer { ip, port: dict.port })
            })
            .collect(),
    };

    Ok(AnnounceResponse {
        interval: tracker_response.interval,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]);
        body.push(b'e');
        let parsed = parse_announce_response(&body).unwrap();
        assert_eq!(parsed.interval, 1800);
        assert_eq!(parsed.peers.len(), 2);
        assert_eq!(parsed.peers[0].port, 0x1ae1);
    }

    #[test]
    fn surfaces_failure_reason() {
        let body = b"d14:failure reason11:bad requeste";
        let err = parse_announce_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::FailureReason(_)));
    }
}
