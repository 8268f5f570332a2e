use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::Config;
use crate::peer::PeerConnection;

/// How long a connection counts as "new" for the optimistic pick.
const NEW_PEER_AGE: Duration = Duration::from_secs(60);
/// New peers are this many times more likely to win the optimistic slot.
const NEW_PEER_WEIGHT: u32 = 3;

/// Tit-for-tat choking with one rotating optimistic slot.
///
/// Every choke interval the interested peers are ranked by the rate we
/// download from them (upload to them once we seed); the top
/// `max_upload_slots - 1` hold regular slots. The optimistic slot rotates
/// on its own slower interval and is biased towards freshly connected
/// peers so they get a chance to prove themselves.
#[derive(Debug, Default)]
pub struct UnchokeAlgorithm {
    last_rechoke: Option<Instant>,
    last_optimistic: Option<Instant>,
    optimistic: Option<Uuid>,
}

impl UnchokeAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(&self) -> Option<Uuid> {
        self.optimistic
    }

    /// Choke/unchoke transitions to apply, empty between intervals.
    pub fn maybe_rechoke(
        &mut self,
        peers: &HashMap<Uuid, PeerConnection>,
        we_are_seed: bool,
        config: &Config,
        now: Instant,
    ) -> Vec<(Uuid, bool)> {
        let rechoke_due = self
            .last_rechoke
            .is_none_or(|at| now.saturating_duration_since(at) >= config.choke_interval);
        let rotation_due = self
            .last_optimistic
            .is_none_or(|at| now.saturating_duration_since(at) >= config.optimistic_interval);
        if !rechoke_due && !rotation_due {
            return Vec::new();
        }
        self.last_rechoke = Some(now);

        if config.max_upload_slots == 0 {
            // pure leecher: everyone stays choked
            self.optimistic = None;
            return peers
                .values()
                .filter(|p| !p.am_choking)
                .map(|p| (p.id, true))
                .collect();
        }

        let mut ranked: Vec<&PeerConnection> =
            peers.values().filter(|p| p.peer_interested).collect();
        ranked.sort_unstable_by_key(|p| {
            let rate = if we_are_seed {
                p.upload_rate.bytes_per_second()
            } else {
                p.download_rate.bytes_per_second()
            };
            std::cmp::Reverse(rate)
        });

        let regular_slots = config.max_upload_slots.saturating_sub(1);
        let regular: HashSet<Uuid> = ranked.iter().take(regular_slots).map(|p| p.id).collect();

        let optimistic_valid = self.optimistic.is_some_and(|id| {
            peers.get(&id).is_some_and(|p| p.peer_interested) && !regular.contains(&id)
        });
        if rotation_due || !optimistic_valid {
            let previous = self.optimistic;
            self.optimistic = pick_optimistic(&ranked, &regular, previous, now);
            if rotation_due {
                self.last_optimistic = Some(now);
            }
        }

        let mut unchoked = regular;
        if let Some(optimistic) = self.optimistic {
            unchoked.insert(optimistic);
        }
        debug_assert!(unchoked.len() <= config.max_upload_slots);

        peers
            .values()
            .filter_map(|p| {
                let should_choke = !unchoked.contains(&p.id);
                (p.am_choking != should_choke).then_some((p.id, should_choke))
            })
            .collect()
    }

    pub fn on_peer_disconnected(&mut self, peer: Uuid) {
        if self.optimistic == Some(peer) {
            self.optimistic = None;
        }
    }
}

fn pick_optimistic(
    ranked: &[&PeerConnection],
    regular: &HashSet<Uuid>,
    previous: Option<Uuid>,
    now: Instant,
) -> Option<Uuid> {
    let candidates: Vec<(&&PeerConnection, u32)> = ranked
        .iter()
        .filter(|p| !regular.contains(&p.id) && Some(p.id) != previous)
        .map(|p| {
            let weight = if now.saturating_duration_since(p.connected_at) <= NEW_PEER_AGE {
                NEW_PEER_WEIGHT
            } else {
                1
            };
            (p, weight)
        })
        .collect();
    if candidates.is_empty() {
        // nothing else to rotate to; keep the previous pick if it is still
        // interested
        return previous.filter(|id| ranked.iter().any(|p| p.id == *id));
    }
    let total: u32 = candidates.iter().map(|(_, w)| w).sum();
    let mut roll = rand::random_range(0..total);
    for (peer, weight) in candidates {
        if roll < weight {
            return Some(peer.id);
        }
        roll -= weight;
    }
    unreachable!("roll is bounded by the total weight")
}
