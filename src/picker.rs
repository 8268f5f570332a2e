use std::collections::HashSet;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::active_pieces::ActivePieceManager;
use crate::bitfield::BitField;
use crate::peer::PeerConnection;
use crate::protocol::{Block, BLOCK_LENGTH};

/// Per piece user priority. Skipped pieces are never picked and do not
/// count toward interest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum PiecePriority {
    Skip = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl PiecePriority {
    pub fn is_skip(&self) -> bool {
        *self == PiecePriority::Skip
    }
}

/// Rarest-first piece selection with speed affinity.
///
/// Availability counts non-seed peers only; seeds contribute through the
/// `seed_count` scalar, which adds uniformly to every piece and therefore
/// only matters relative to torrents, not pieces. Fast peers claim pieces
/// exclusively so slow peers cannot fragment their work.
#[derive(Debug)]
pub struct PiecePicker {
    availability: Vec<u16>,
    seed_count: u32,
    priorities: Vec<PiecePriority>,
    /// Lowest piece we still need with priority above skip.
    first_needed: u32,
    num_pieces: u32,
}

impl PiecePicker {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            availability: vec![0; num_pieces as usize],
            seed_count: 0,
            priorities: vec![PiecePriority::default(); num_pieces as usize],
            first_needed: 0,
            num_pieces,
        }
    }

    pub fn availability(&self) -> &[u16] {
        &self.availability
    }

    pub fn seed_count(&self) -> u32 {
        self.seed_count
    }

    pub fn priorities(&self) -> &[PiecePriority] {
        &self.priorities
    }

    pub fn set_priority(&mut self, piece: u32, priority: PiecePriority) {
        if let Some(slot) = self.priorities.get_mut(piece as usize) {
            *slot = priority;
        }
        if priority != PiecePriority::Skip && piece < self.first_needed {
            self.first_needed = piece;
        }
    }

    /// Register a connected peer's full bitfield.
    pub fn add_peer_bitfield(&mut self, bitfield: &BitField, is_seed: bool) {
        if is_seed {
            self.seed_count += 1;
            return;
        }
        for piece in bitfield.pieces() {
            if let Some(count) = self.availability.get_mut(piece as usize) {
                *count += 1;
            }
        }
    }

    /// Reverse a disconnecting peer's contribution.
    pub fn remove_peer_bitfield(&mut self, bitfield: &BitField, is_seed: bool) {
        if is_seed {
            self.seed_count = self.seed_count.saturating_sub(1);
            return;
        }
        for piece in bitfield.pieces() {
            if let Some(count) = self.availability.get_mut(piece as usize) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn on_peer_have(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    /// A HAVE completed the peer's bitfield: its per piece contributions
    /// move into the seed scalar.
    pub fn on_peer_became_seed(&mut self, bitfield: &BitField) {
        self.remove_peer_bitfield(bitfield, false);
        self.seed_count += 1;
    }

    pub fn advance_first_needed(&mut self, have: &BitField) {
        while self.first_needed < self.num_pieces
            && (have.get(self.first_needed)
                || self.priorities[self.first_needed as usize].is_skip())
        {
            self.first_needed += 1;
        }
    }

    pub fn first_needed(&self) -> u32 {
        self.first_needed
    }

    /// Whether a peer's rate finishes a whole piece inside the window.
    pub fn classify_fast(rate_bps: u64, piece_length: u32, window: Duration) -> bool {
        rate_bps.saturating_mul(window.as_secs()) > piece_length as u64
    }

    /// Fill the peer's request pipeline. Phase 1 extends active partials
    /// rarest first under the ownership rules; phase 2 starts new pieces
    /// unless the partial cap says the swarm should finish what it started.
    pub fn request_pieces(
        &self,
        peer: &mut PeerConnection,
        pieces: &mut ActivePieceManager,
        have: &BitField,
        fast_peers: &HashSet<Uuid>,
        connected_peers: usize,
        now: Instant,
    ) -> Vec<Block> {
        let mut requested = Vec::new();
        let mut budget = peer.pipeline_budget();
        if budget == 0 {
            return requested;
        }

        for index in pieces.partials_rarest_first(&self.availability, self.seed_count) {
            if budget == 0 {
                break;
            }
            if !peer.is_seed && !peer.bitfield.get(index) {
                continue;
            }
            let piece = pieces.get(index).expect("partial index is live");
            let owner = piece.exclusive_peer();
            let owner_is_fast = owner.is_some_and(|o| fast_peers.contains(&o));
            if !piece.can_request_from(peer.id, peer.is_fast, owner_is_fast) {
                continue;
            }
            if peer.is_fast && owner.is_none() {
                pieces.claim(index, peer.id);
            }
            self.take_blocks(index, peer, pieces, &mut budget, &mut requested, now);
        }

        if budget == 0 || pieces.should_prioritize_partials(connected_peers) {
            return requested;
        }
        let max_new = pieces
            .max_partials(connected_peers)
            .saturating_sub(pieces.partial_count());
        if max_new == 0 {
            return requested;
        }

        // candidates: (priority, availability, index), capped at twice what
        // we may start so the scan stays cheap on large torrents
        let mut candidates = Vec::new();
        for index in self.first_needed..self.num_pieces {
            if candidates.len() == 2 * max_new {
                break;
            }
            if have.get(index) || self.priorities[index as usize].is_skip() {
                continue;
            }
            if !peer.is_seed && !peer.bitfield.get(index) {
                continue;
            }
            if pieces.contains(index) {
                continue;
            }
            let availability = self.availability[index as usize] as u32 + self.seed_count;
            candidates.push((self.priorities[index as usize], availability, index));
        }
        candidates.sort_unstable_by_key(|(priority, availability, _)| {
            (std::cmp::Reverse(*priority), *availability)
        });
        candidates.truncate(max_new);

        for (_, _, index) in candidates {
            if budget == 0 {
                break;
            }
            let Ok(piece) = pieces.get_or_create(index, now) else {
                continue;
            };
            if peer.is_fast && piece.exclusive_peer().is_none() {
                piece.claim(peer.id);
            }
            self.take_blocks(index, peer, pieces, &mut budget, &mut requested, now);
        }
        requested
    }

    fn take_blocks(
        &self,
        index: u32,
        peer: &mut PeerConnection,
        pieces: &mut ActivePieceManager,
        budget: &mut u32,
        requested: &mut Vec<Block>,
        now: Instant,
    ) {
        let piece = pieces.get(index).expect("piece is live");
        // fast peers drain the whole piece, slow peers stay within budget;
        // the pipeline bound applies to both
        let take = *budget as usize;
        let blocks: Vec<(u32, u32)> = piece
            .unrequested_blocks()
            .take(take)
            .map(|b| (b, piece.block_length(b)))
            .collect();
        for (block, length) in blocks {
            if pieces.add_request(index, block, peer.id, now).is_err() {
                break;
            }
            peer.note_request_sent();
            *budget -= 1;
            requested.push(Block {
                piece: index,
                offset: block * BLOCK_LENGTH,
                length,
            });
        }
    }
}
