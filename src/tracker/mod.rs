//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - HTTP announce requests and responses (BEP-3, compact and non-compact peers)
//! - UDP announce requests and responses (BEP-15)
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the client to discover peers for a torrent.
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::torrent::file::TorrentFile;

pub mod http;
pub mod udp;

/// Default candidate-peer ceiling: the scan stops once this many distinct
/// peers have been collected across every tracker tried.
pub const DEFAULT_PEER_CEILING: usize = 50;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("bencode decode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker returned failure reason: {0}")]
    FailureReason(String),

    #[error("unsupported tracker URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("UDP transaction id mismatch: expected {expected:08x}, got {got:08x}")]
    TransactionIdMismatch { expected: u32, got: u32 },

    #[error("UDP tracker response too short: got {got} bytes, need at least {need}")]
    ResponseTooShort { got: usize, need: usize },

    #[error("UDP tracker action mismatch: expected {expected}, got {got}")]
    ActionMismatch { expected: u32, got: u32 },

    #[error("tracker round-trip timed out")]
    Timeout,

    #[error("tracker returned non-success HTTP status {0}")]
    HttpStatus(u16),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A peer address as handed back by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// Parameters for one announce, independent of transport (HTTP or UDP).
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub left: i64,
    pub num_want: i32,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

/// A client communicating with BitTorrent trackers on behalf of one
/// download. `peer_id` is generated exactly once at process startup and
/// passed in here, never regenerated per tracker or per client.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
    udp_timeout: Duration,
    http_timeout: Duration,
}

impl Client {
    pub fn new(peer_id: [u8; 20], port: u16, udp_timeout: Duration, http_timeout: Duration) -> Self {
        Self { peer_id, port, udp_timeout, http_timeout }
    }

    /// Tries every tracker URL in `torrent`'s announce/announce-list, in
    /// order, deduplicating tiers, until `ceiling` distinct peers have been
    /// collected or every tracker has been tried. One tracker failing
    /// (timeout, DNS failure, non-2xx, bencode error, transaction id
    /// mismatch) never aborts the scan.
    #[instrument(skip(self, torrent), level = "debug")]
    pub async fn discover_peers(&self, torrent: &TorrentFile, ceiling: usize) -> HashSet<Peer> {
        let mut peers = HashSet::new();
        let mut tried = HashSet::new();

        for url in self.tracker_urls(torrent) {
            if peers.len() >= ceiling {
                break;
            }
            if !tried.insert(url.clone()) {
                continue;
            }

            let request = AnnounceRequest {
                info_hash: torrent.info_hash,
                peer_id: self.peer_id,
                port: self.port,
                uploaded: 0,
                downloaded: 0,
                left: torrent.total_length(),
                num_want: DEFAULT_PEER_CEILING as i32,
            };

            let result = self.announce_one(&url, &request).await;
            match result {
                Ok(response) => {
                    for p in response.peers {
                        peers.insert(p);
                    }
                }
                Err(e) => warn!(url, error = %e, "tracker announce failed, continuing scan"),
            }
        }

        peers
    }

    fn tracker_urls(&self, torrent: &TorrentFile) -> Vec<String> {
        let mut urls = Vec::new();
        urls.push(torrent.announce.clone());
        for tier in &torrent.announce_list {
            for url in tier {
                urls.push(url.clone());
            }
        }
        urls
    }

    async fn announce_one(&self, url: &str, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        if url.starts_with("http://") || url.starts_with("https://") {
            http::announce(url, request, self.http_timeout).await
        } else if url.starts_with("udp://") {
            udp::announce(url, request, self.udp_timeout).await
        } else {
            Err(TrackerError::UnsupportedScheme(url.to_string()))
        }
    }
}

/// Generates a unique peer ID for this process: a 9-byte client prefix
/// followed by 11 random bytes. Called exactly once at startup; the result
/// is threaded explicitly into the tracker client and every handshake.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// URL-encodes a byte slice per RFC 3986, as required for `info_hash` and
/// `peer_id` query parameters (which are raw bytes, not valid UTF-8).
pub fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_peer_id_has_expected_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RT0001-");
    }

    #[test]
    fn url_encode_leaves_unreserved_bytes_alone() {
        assert_eq!(url_encode(b"abc-._~"), "abc-._~");
    }

    #[test]
    fn url_encode_percent_encodes_other_bytes() {
        assert_eq!(url_encode(&[0xff, b' ']), "%FF%20");
    }

    #[test]
    fn tracker_urls_includes_announce_and_flattened_announce_list() {
        use crate::torrent::file::{FileDict, InfoDict};
        let torrent = TorrentFile {
            announce: "http://a.example/announce".to_string(),
            announce_list: vec![
                vec!["http://a.example/announce".to_string()],
                vec!["udp://b.example:80".to_string()],
            ],
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            info: InfoDict {
                piece_length: 16384,
                pieces: Vec::new(),
                private: false,
                name: "x".to_string(),
                length: Some(16384),
                files: Vec::<FileDict>::new(),
                is_directory: false,
            },
            info_hash: [0u8; 20],
            pieces_hash: vec![[0u8; 20]],
        };
        let client = Client::new([1u8; 20], 6881, Duration::from_secs(10), Duration::from_secs(10));
        let urls = client.tracker_urls(&torrent);
        assert_eq!(
            urls,
            vec![
                "http://a.example/announce".to_string(),
                "http://a.example/announce".to_string(),
                "udp://b.example:80".to_string(),
            ]
        );
    }
}
