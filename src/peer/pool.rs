//! The peer pool: tracks one task per remote peer and exposes the
//! selection/inbound-routing/garbage-collection surface the download
//! driver needs.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::session::{SessionCommand, SessionEvent, SessionLimits, SessionState};
use super::PeerMessage;

/// Deadline after which a session stuck outside `Active` is reclaimed.
const NON_ACTIVE_DEADLINE: Duration = Duration::from_secs(20);

/// What `PeerPool::route_inbound` observed in one drain of the event queue.
#[derive(Debug, Default)]
pub struct InboundUpdate {
    pub messages: Vec<(SocketAddr, PeerMessage)>,
    pub closed_bitfields: Vec<Vec<bool>>,
}

struct PoolEntry {
    state: SessionState,
    remote_bitfield: Vec<bool>,
    peer_choking: bool,
    am_interested: bool,
    last_outbound_request: Option<Instant>,
    joined_at: Instant,
    commands: mpsc::Sender<SessionCommand>,
    handle: JoinHandle<()>,
}

impl PoolEntry {
    fn is_eligible_for(&self, piece_index: usize) -> bool {
        self.state == SessionState::Active
            && !self.peer_choking
            && self.am_interested
            && self.remote_bitfield.get(piece_index).copied().unwrap_or(false)
            && self
                .last_outbound_request
                .map_or(true, |t| t.elapsed() >= Duration::from_millis(100))
    }
}

/// Multiplexes every peer session this download has open, keyed by
/// socket address.
pub struct PeerPool {
    sessions: HashMap<SocketAddr, PoolEntry>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    num_pieces: usize,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    limits: SessionLimits,
}

impl PeerPool {
    pub fn new(num_pieces: usize, info_hash: [u8; 20], peer_id: [u8; 20], limits: SessionLimits) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Self {
            sessions: HashMap::new(),
            events_tx,
            events_rx,
            num_pieces,
            info_hash,
            peer_id,
            limits,
        }
    }

    /// Spawns a connection task for `addr` if one isn't already tracked.
    #[instrument(level = "debug", skip(self))]
    pub fn add(&mut self, addr: SocketAddr) {
        if self.sessions.contains_key(&addr) {
            return;
        }
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let events_tx = self.events_tx.clone();
        let num_pieces = self.num_pieces;
        let info_hash = self.info_hash;
        let peer_id = self.peer_id;
        let limits = self.limits;

        let handle = tokio::spawn(async move {
            super::session::PeerSession::run(
                addr, num_pieces, info_hash, peer_id, limits, events_tx, commands_rx,
            )
            .await;
        });

        self.sessions.insert(
            addr,
            PoolEntry {
                state: SessionState::Connecting,
                remote_bitfield: vec![false; num_pieces],
                peer_choking: true,
                am_interested: false,
                last_outbound_request: None,
                joined_at: Instant::now(),
                commands: commands_tx,
                handle,
            },
        );
    }

    /// Uniformly random choice among eligible sessions that have `piece_index`.
    pub fn pick_peer_having(&self, piece_index: usize) -> Option<SocketAddr> {
        self.sessions
            .iter()
            .filter(|(_, entry)| entry.is_eligible_for(piece_index))
            .map(|(addr, _)| *addr)
            .choose(&mut rand::rng())
    }

    /// Sends a block request to a specific peer, recording the timestamp
    /// used by the eligibility spacing rule.
    pub async fn request_block(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        length: u32,
    ) -> bool {
        let Some(entry) = self.sessions.get_mut(&addr) else {
            return false;
        };
        entry.last_outbound_request = Some(Instant::now());
        entry
            .commands
            .send(SessionCommand::Request { index, begin, length })
            .await
            .is_ok()
    }

    /// Drains every pending `SessionEvent`, folding connection/handshake/
    /// message/close events into per-entry state, and returns the inbound
    /// peer messages plus the last-known bitfield of every session that
    /// closed this round, so the driver can feed both to the assembler.
    pub async fn route_inbound(&mut self) -> InboundUpdate {
        let mut delivered = Vec::new();
        let mut closed_bitfields = Vec::new();

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                SessionEvent::Connected { addr } => {
                    if let Some(entry) = self.sessions.get_mut(&addr) {
                        entry.state = SessionState::Handshaking;
                    }
                }
                SessionEvent::HandshakeOk { addr, .. } => {
                    if let Some(entry) = self.sessions.get_mut(&addr) {
                        entry.state = SessionState::Active;
                        entry.am_interested = true;
                        info!(%addr, "peer session active");
                    }
                }
                SessionEvent::Message { addr, message } => {
                    self.apply_message(addr, &message);
                    delivered.push((addr, message));
                }
                SessionEvent::Closed { addr, reason } => {
                    warn!(%addr, %reason, "peer session closed");
                    if let Some(entry) = self.sessions.remove(&addr) {
                        closed_bitfields.push(entry.remote_bitfield);
                    }
                }
            }
        }

        InboundUpdate { messages: delivered, closed_bitfields }
    }

    fn apply_message(&mut self, addr: SocketAddr, message: &PeerMessage) {
        let Some(entry) = self.sessions.get_mut(&addr) else {
            return;
        };
        match message {
            PeerMessage::Choke => entry.peer_choking = true,
            PeerMessage::Unchoke => entry.peer_choking = false,
            PeerMessage::Have { piece_index } => {
                if let Some(slot) = entry.remote_bitfield.get_mut(*piece_index as usize) {
                    *slot = true;
                }
            }
            PeerMessage::Bitfield(bits) => {
                entry.remote_bitfield = super::unpack_bitfield(bits, self.num_pieces);
            }
            _ => {}
        }
    }

    /// Drops sessions that have sat outside `Active` past their deadline,
    /// aborting their tasks.
    pub fn gc(&mut self) {
        let stuck: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, entry)| {
                entry.state != SessionState::Active && entry.joined_at.elapsed() > NON_ACTIVE_DEADLINE
            })
            .map(|(addr, _)| *addr)
            .collect();

        for addr in stuck {
            if let Some(entry) = self.sessions.remove(&addr) {
                entry.handle.abort();
                warn!(%addr, "garbage-collected stuck session");
            }
        }
    }

    /// Socket addresses of every session currently `Active`.
    pub fn active_addresses(&self) -> Vec<SocketAddr> {
        self.sessions
            .iter()
            .filter(|(_, e)| e.state == SessionState::Active)
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub fn has_piece(&self, addr: SocketAddr, piece_index: usize) -> bool {
        self.sessions
            .get(&addr)
            .map(|e| e.remote_bitfield.get(piece_index).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|e| e.state == SessionState::Active)
            .count()
    }

    pub fn piece_availability(&self, piece_index: usize) -> usize {
        self.sessions
            .values()
            .filter(|e| e.remote_bitfield.get(piece_index).copied().unwrap_or(false))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_empty() {
        let pool = PeerPool::new(10, [0u8; 20], [1u8; 20], SessionLimits::default());
        assert_eq!(pool.connected_count(), 0);
        assert!(pool.pick_peer_having(0).is_none());
    }
}
