//! The per-peer session state machine.
//!
//! One `PeerSession` owns one TCP connection and runs as its own tokio
//! task, reading length-prefixed frames and posting typed events to the
//! pool rather than sharing mutable state across sessions.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::message::{PeerMessage, DEFAULT_MAX_PAYLOAD_LEN};
use super::{Handshake, PeerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// An event a session posts to its owner as it makes progress.
#[derive(Debug)]
pub enum SessionEvent {
    Connected { addr: SocketAddr },
    HandshakeOk { addr: SocketAddr, peer_id: [u8; 20] },
    Message { addr: SocketAddr, message: PeerMessage },
    Closed { addr: SocketAddr, reason: String },
}

/// A command the pool/driver sends down to a running session task.
#[derive(Debug)]
pub enum SessionCommand {
    Request { index: u32, begin: u32, length: u32 },
}

/// Timing and size knobs a session needs; distinct from the crate-wide
/// `Config` so this module has no dependency on it.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub keepalive_interval: Duration,
    pub receive_buffer_cap: usize,
    pub max_payload_len: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(120),
            receive_buffer_cap: 16 * 1024 * 1024,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// A single remote peer's connection and protocol state.
pub struct PeerSession {
    pub addr: SocketAddr,
    pub state: SessionState,
    pub remote_bitfield: Vec<bool>,
    pub peer_choking: bool,
    pub am_interested: bool,
    pub am_choking: bool,
    pub peer_interested: bool,
    pub last_activity: Instant,
    pub last_outbound: Instant,
    pub last_outbound_request: Option<Instant>,
    num_pieces: usize,
}

impl PeerSession {
    pub fn new(addr: SocketAddr, num_pieces: usize) -> Self {
        let now = Instant::now();
        Self {
            addr,
            state: SessionState::Disconnected,
            remote_bitfield: vec![false; num_pieces],
            peer_choking: true,
            am_interested: false,
            am_choking: true,
            peer_interested: false,
            last_activity: now,
            last_outbound: now,
            last_outbound_request: None,
            num_pieces,
        }
    }

    /// True iff the driver may issue this session a block `Request` right
    /// now: active, handshaked, unchoked, interested, and at least 100 ms
    /// since the last outbound request.
    pub fn is_eligible(&self) -> bool {
        self.state == SessionState::Active
            && !self.peer_choking
            && self.am_interested
            && self
                .last_outbound_request
                .map_or(true, |t| t.elapsed() >= Duration::from_millis(100))
    }

    fn apply_bitfield(&mut self, bits: &[u8]) -> PeerResult<()> {
        let expected = (self.num_pieces + 7) / 8;
        if bits.len() != expected {
            return Err(super::PeerError::InvalidBitfieldLength {
                got: bits.len(),
                expected,
            });
        }
        self.remote_bitfield = super::unpack_bitfield(bits, self.num_pieces);
        Ok(())
    }

    fn apply_have(&mut self, piece_index: u32) {
        if let Some(slot) = self.remote_bitfield.get_mut(piece_index as usize) {
            *slot = true;
        }
    }

    /// Drives one session end to end: connect, handshake, then the
    /// read/write loop, posting `SessionEvent`s to `events` until closed.
    #[instrument(level = "debug", skip(events, commands, peer_id), fields(addr = %addr))]
    pub async fn run(
        addr: SocketAddr,
        num_pieces: usize,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        limits: SessionLimits,
        events: mpsc::Sender<SessionEvent>,
        commands: mpsc::Receiver<SessionCommand>,
    ) {
        let mut session = PeerSession::new(addr, num_pieces);
        session.state = SessionState::Connecting;

        let result = session.connect_and_handshake(info_hash, peer_id, &limits, &events).await;
        let (stream, remote_peer_id) = match result {
            Ok(pair) => pair,
            Err(e) => {
                session.state = SessionState::Closed;
                let _ = events
                    .send(SessionEvent::Closed {
                        addr,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        session.state = SessionState::Active;
        let _ = events
            .send(SessionEvent::HandshakeOk {
                addr,
                peer_id: remote_peer_id,
            })
            .await;

        let reason = session.read_loop(stream, &limits, &events, commands).await;
        session.state = SessionState::Closed;
        let _ = events.send(SessionEvent::Closed { addr, reason }).await;
    }

    async fn connect_and_handshake(
        &mut self,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        limits: &SessionLimits,
        events: &mpsc::Sender<SessionEvent>,
    ) -> PeerResult<(TcpStream, [u8; 20])> {
        self.state = SessionState::Handshaking;
        let (stream, their_handshake) = Handshake::perform(
            self.addr,
            info_hash,
            peer_id,
            limits.connect_timeout,
            limits.handshake_timeout,
        )
        .await?;
        self.last_activity = Instant::now();
        let _ = events.send(SessionEvent::Connected { addr: self.addr }).await;
        Ok((stream, their_handshake.peer_id))
    }

    async fn read_loop(
        &mut self,
        stream: TcpStream,
        limits: &SessionLimits,
        events: &mpsc::Sender<SessionEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) -> String {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::with_capacity(limits.receive_buffer_cap, read_half);

        if write_half.write_all(&PeerMessage::Interested.encode()).await.is_err() {
            return "write error sending Interested".to_string();
        }
        self.am_interested = true;
        self.last_outbound = Instant::now();

        loop {
            let idle = self.last_activity.elapsed();
            if idle >= limits.inactivity_timeout {
                return "inactivity timeout".to_string();
            }
            let remaining = limits.inactivity_timeout - idle;

            tokio::select! {
                read_result = tokio::time::timeout(
                    remaining,
                    PeerMessage::read_from(&mut reader, limits.max_payload_len),
                ) => {
                    let message = match read_result {
                        Err(_) => return "inactivity timeout".to_string(),
                        Ok(Err(e)) => return format!("protocol error: {e}"),
                        Ok(Ok(m)) => m,
                    };

                    self.last_activity = Instant::now();
                    if let Err(e) = self.apply_message(&message) {
                        return format!("protocol error: {e}");
                    }

                    if let Err(e) = self.maybe_send_keepalive(&mut write_half, limits).await {
                        return format!("write error: {e}");
                    }

                    if events
                        .send(SessionEvent::Message { addr: self.addr, message })
                        .await
                        .is_err()
                    {
                        return "event channel closed".to_string();
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Request { index, begin, length }) => {
                            if let Err(e) = self.send_request(&mut write_half, index, begin, length).await {
                                return format!("write error: {e}");
                            }
                        }
                        None => return "command channel closed".to_string(),
                    }
                }
            }
        }
    }

    fn apply_message(&mut self, message: &PeerMessage) -> PeerResult<()> {
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.peer_choking = true,
            PeerMessage::Unchoke => self.peer_choking = false,
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Have { piece_index } => self.apply_have(*piece_index),
            PeerMessage::Bitfield(bits) => self.apply_bitfield(bits)?,
            PeerMessage::Piece { .. } => debug!(addr = %self.addr, "received piece block"),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } | PeerMessage::Port(_) => {
                // Leecher-only design: we never seed, so these are noted and dropped.
            }
        }
        Ok(())
    }

    async fn maybe_send_keepalive(
        &mut self,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        limits: &SessionLimits,
    ) -> std::io::Result<()> {
        if self.last_outbound.elapsed() >= limits.keepalive_interval {
            write_half.write_all(&PeerMessage::KeepAlive.encode()).await?;
            self.last_outbound = Instant::now();
        }
        Ok(())
    }

    /// Sends a `Request` for one block, recording the outbound timestamp
    /// used by the eligibility predicate's 100 ms spacing rule.
    pub async fn send_request(
        &mut self,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        index: u32,
        begin: u32,
        length: u32,
    ) -> PeerResult<()> {
        if !self.is_eligible() {
            warn!(addr = %self.addr, "send_request called on an ineligible session");
        }
        let msg = PeerMessage::Request { index, begin, length };
        write_half.write_all(&msg.encode()).await?;
        let now = Instant::now();
        self.last_outbound = now;
        self.last_outbound_request = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn new_session_starts_choked_and_disinterested() {
        let s = PeerSession::new(addr(), 10);
        assert_eq!(s.state, SessionState::Disconnected);
        assert!(s.peer_choking);
        assert!(!s.am_interested);
        assert!(!s.is_eligible());
    }

    #[test]
    fn eligibility_requires_active_unchoked_and_interested() {
        let mut s = PeerSession::new(addr(), 10);
        s.state = SessionState::Active;
        s.peer_choking = false;
        s.am_interested = true;
        assert!(s.is_eligible());

        s.peer_choking = true;
        assert!(!s.is_eligible());
    }

    #[test]
    fn eligibility_respects_100ms_request_spacing() {
        let mut s = PeerSession::new(addr(), 10);
        s.state = SessionState::Active;
        s.peer_choking = false;
        s.am_interested = true;
        s.last_outbound_request = Some(Instant::now());
        assert!(!s.is_eligible());
    }

    #[test]
    fn bitfield_and_have_update_remote_bitfield() {
        let mut s = PeerSession::new(addr(), 9);
        s.apply_bitfield(&[0b1010_0000, 0b0000_0001]).unwrap();
        assert!(s.remote_bitfield[0]);
        assert!(!s.remote_bitfield[1]);
        assert!(s.remote_bitfield[2]);
        assert!(s.remote_bitfield[8]);

        s.apply_have(5);
        assert!(s.remote_bitfield[5]);
    }

    #[test]
    fn rejects_bitfield_of_wrong_length() {
        let mut s = PeerSession::new(addr(), 9);
        let err = s.apply_bitfield(&[0xff]).unwrap_err();
        assert!(matches!(
            err,
            super::super::PeerError::InvalidBitfieldLength { got: 1, expected: 2 }
        ));
    }

    #[test]
    fn choke_and_unchoke_toggle_peer_choking() {
        let mut s = PeerSession::new(addr(), 4);
        s.apply_message(&PeerMessage::Unchoke).unwrap();
        assert!(!s.peer_choking);
        s.apply_message(&PeerMessage::Choke).unwrap();
        assert!(s.peer_choking);
    }
}
