//! The periodic driver tick: reclaims stale blocks, routes inbound peer
//! messages into the assembler, and pipelines new block requests.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, instrument};

use crate::config::Config;
use crate::peer::PeerMessage;

use super::Shared;

type PendingKey = (SocketAddr, u32, u32);

/// Runs until `stop` is notified or the download completes.
#[instrument(skip_all, level = "debug")]
pub async fn run(shared: Arc<Mutex<Shared>>, stop: Arc<Notify>, config: Config) {
    let mut pending: HashMap<PendingKey, Instant> = HashMap::new();
    let mut gc_ticks = 0u32;

    loop {
        tokio::select! {
            _ = stop.notified() => {
                debug!("download driver stopped");
                return;
            }
            _ = tokio::time::sleep(config.driver_tick_interval) => {}
        }

        let mut guard = shared.lock().await;

        let update = guard.pool.route_inbound().await;
        for (addr, message) in update.messages {
            match message {
                PeerMessage::Piece { index, begin, block } => {
                    let key = (addr, index, begin);
                    pending.remove(&key);
                    if let Err(e) = guard.assembler.on_block(index as usize, begin, block).await {
                        tracing::warn!(%addr, error = %e, "failed to apply delivered block");
                    }
                }
                PeerMessage::Have { piece_index } => {
                    guard.assembler.rarest_mut().on_have(piece_index as usize);
                }
                PeerMessage::Bitfield(bits) => {
                    let num_pieces = guard.assembler.num_pieces();
                    let bools = crate::peer::unpack_bitfield(&bits, num_pieces);
                    guard.assembler.rarest_mut().on_bitfield(&bools);
                }
                _ => {}
            }
        }
        for bitfield in update.closed_bitfields {
            guard.assembler.rarest_mut().on_session_closed(&bitfield);
        }

        guard.assembler.reclaim_stale_blocks();
        pending.retain(|_, issued_at| issued_at.elapsed() < config.pending_request_timeout);

        gc_ticks += 1;
        if gc_ticks % 50 == 0 {
            guard.pool.gc();
        }

        if guard.assembler.is_done() {
            debug!("all pieces complete, driver exiting");
            return;
        }

        pipeline_requests(&mut guard, &mut pending, &config).await;
    }
}

async fn pipeline_requests(guard: &mut Shared, pending: &mut HashMap<PendingKey, Instant>, config: &Config) {
    let active = guard.pool.active_addresses();
    if active.is_empty() {
        return;
    }

    let in_flight_for = |pending: &HashMap<PendingKey, Instant>, addr: SocketAddr| {
        pending.keys().filter(|(a, _, _)| *a == addr).count()
    };

    let total_budget: usize = active
        .iter()
        .map(|&addr| config.pipeline_depth.saturating_sub(in_flight_for(pending, addr)))
        .sum();

    for _ in 0..total_budget {
        let mut unservable = std::collections::HashSet::new();
        let (piece_index, addr) = loop {
            let Some(piece_index) = guard.assembler.rarest_mut().rarest_excluding(&unservable) else {
                return;
            };
            match guard.pool.pick_peer_having(piece_index) {
                Some(addr) => break (piece_index, addr),
                None => {
                    // No eligible peer has this piece right now; try the
                    // next-rarest instead of giving up on the whole tick.
                    unservable.insert(piece_index);
                }
            }
        };
        if in_flight_for(pending, addr) >= config.pipeline_depth {
            continue;
        }
        let Some((index, offset, length)) = guard.assembler.next_block_request(piece_index) else {
            continue;
        };
        if !guard.pool.request_block(addr, index as u32, offset, length).await {
            continue;
        }
        pending.insert((addr, index as u32, offset), Instant::now());
    }
}
