//! Runtime configuration: every tunable named in the concurrency and
//! resource model, collected into one struct built once at startup and
//! passed down by reference, never a global.
use std::time::Duration;

use crate::peer::session::SessionLimits;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Bounded TCP connect timeout for a new peer session.
    pub connect_timeout: Duration,
    /// Time allowed for the handshake read after a successful connect.
    pub handshake_timeout: Duration,
    /// No inbound byte within this window closes the session.
    pub peer_inactivity_timeout: Duration,
    /// Send a `KeepAlive` after this much outbound silence.
    pub keepalive_interval: Duration,
    /// Per-phase round-trip timeout for UDP tracker connect/announce.
    pub udp_tracker_timeout: Duration,
    /// Request timeout for a single HTTP tracker announce.
    pub http_tracker_timeout: Duration,
    /// A `Pending` block older than this is reclaimed back to `Free`.
    pub block_pending_timeout: Duration,
    /// How often the download driver ticks.
    pub driver_tick_interval: Duration,
    /// Max outstanding `Request`s per peer session.
    pub pipeline_depth: usize,
    /// A driver-level pending-request record older than this is dropped.
    pub pending_request_timeout: Duration,
    /// Per-session receive buffer cap; exceeding it closes the session.
    pub receive_buffer_cap: usize,
    /// Stop collecting tracker peers once this many distinct candidates
    /// have been seen.
    pub tracker_peer_ceiling: usize,
    /// Local listening port advertised to trackers.
    pub listening_port: u16,
    /// Cap on a single peer-wire message's payload length.
    pub max_message_payload_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            peer_inactivity_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(120),
            udp_tracker_timeout: Duration::from_secs(10),
            http_tracker_timeout: Duration::from_secs(10),
            block_pending_timeout: Duration::from_secs(10),
            driver_tick_interval: Duration::from_millis(200),
            pipeline_depth: 5,
            pending_request_timeout: Duration::from_secs(45),
            receive_buffer_cap: 16 * 1024 * 1024,
            tracker_peer_ceiling: 50,
            listening_port: 6881,
            max_message_payload_len: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            inactivity_timeout: self.peer_inactivity_timeout,
            keepalive_interval: self.keepalive_interval,
            receive_buffer_cap: self.receive_buffer_cap,
            max_payload_len: self.max_message_payload_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.peer_inactivity_timeout, Duration::from_secs(120));
        assert_eq!(cfg.pipeline_depth, 5);
        assert_eq!(cfg.tracker_peer_ceiling, 50);
        assert_eq!(cfg.listening_port, 6881);
    }
}
