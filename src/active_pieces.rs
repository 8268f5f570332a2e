use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::bitfield::BitField;
use crate::chunked_buffer::ChunkedBuffer;
use crate::protocol::BLOCK_LENGTH;

/// Where an active piece currently lives inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Has unrequested blocks.
    Partial,
    /// Every block requested, not all arrived.
    Full,
    /// Every block arrived, awaiting hash verification.
    Pending,
}

#[derive(Debug)]
enum PieceData {
    Filling(BytesMut),
    Ready(Bytes),
}

/// Mutable in-flight piece. Owned by exactly one [`ActivePieceManager`];
/// all state transitions go through the manager.
#[derive(Debug)]
pub struct ActivePiece {
    index: u32,
    piece_length: u32,
    blocks_needed: u32,
    received: BitField,
    received_count: u32,
    requests: HashMap<u32, Vec<Uuid>>,
    request_times: HashMap<u32, Instant>,
    unrequested_count: u32,
    exclusive_peer: Option<Uuid>,
    activated_at: Instant,
    contributors: HashSet<Uuid>,
    data: PieceData,
}

impl ActivePiece {
    fn new(index: u32, piece_length: u32, now: Instant) -> Self {
        let blocks_needed = piece_length.div_ceil(BLOCK_LENGTH);
        Self {
            index,
            piece_length,
            blocks_needed,
            received: BitField::empty(blocks_needed),
            received_count: 0,
            requests: HashMap::new(),
            request_times: HashMap::new(),
            unrequested_count: blocks_needed,
            exclusive_peer: None,
            activated_at: now,
            contributors: HashSet::new(),
            // single allocation per piece, reused for every block
            data: PieceData::Filling(BytesMut::zeroed(piece_length as usize)),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn blocks_needed(&self) -> u32 {
        self.blocks_needed
    }

    pub fn block_length(&self, block: u32) -> u32 {
        if block + 1 == self.blocks_needed {
            self.piece_length - BLOCK_LENGTH * (self.blocks_needed - 1)
        } else {
            BLOCK_LENGTH
        }
    }

    pub fn has_unrequested_blocks(&self) -> bool {
        self.unrequested_count > 0
    }

    pub fn unrequested_count(&self) -> u32 {
        self.unrequested_count
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn completion_ratio(&self) -> f32 {
        self.received_count as f32 / self.blocks_needed as f32
    }

    pub fn exclusive_peer(&self) -> Option<Uuid> {
        self.exclusive_peer
    }

    pub fn claim(&mut self, peer: Uuid) {
        self.exclusive_peer = Some(peer);
    }

    pub fn activated_at(&self) -> Instant {
        self.activated_at
    }

    pub fn unrequested_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.blocks_needed)
            .filter(|b| !self.received.get(*b) && !self.requests.contains_key(b))
    }

    /// Ownership rule for the picker. Unclaimed pieces are open to anyone,
    /// the owner may always continue, fast peers do not poach pieces owned
    /// by someone else, and slow peers only join pieces whose owner is not
    /// fast.
    pub fn can_request_from(&self, peer: Uuid, peer_is_fast: bool, owner_is_fast: bool) -> bool {
        match self.exclusive_peer {
            None => true,
            Some(owner) if owner == peer => true,
            Some(_) if peer_is_fast => false,
            Some(_) => !owner_is_fast,
        }
    }

    pub fn requesters_of(&self, block: u32) -> &[Uuid] {
        self.requests.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every in-flight request as `(block, requesters)`.
    pub fn active_requests(&self) -> Vec<(u32, Vec<Uuid>)> {
        self.requests
            .iter()
            .map(|(block, requesters)| (*block, requesters.clone()))
            .collect()
    }

    /// Snapshot of the received blocks for session persistence. Sealed
    /// (fully received) pieces are not snapshotted; they re-download if
    /// their verification never completed.
    pub fn snapshot(&self) -> Option<crate::session::PartialPieceSnapshot> {
        match &self.data {
            PieceData::Filling(staging) if self.received_count > 0 => {
                Some(crate::session::PartialPieceSnapshot {
                    index: self.index,
                    received: self.received.as_bytes().to_vec(),
                    data: staging.to_vec(),
                })
            }
            _ => None,
        }
    }
}

/// Outcome of routing one received block into its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReceipt {
    /// False for duplicates of blocks that already arrived.
    pub newly_received: bool,
    /// Whether this peer had an in-flight request for the block.
    pub had_request: bool,
    /// The piece just became pending; its data is ready for hashing.
    pub piece_completed: bool,
}

/// Three disjoint maps of in-flight pieces keyed by piece index. Every
/// active piece is in exactly one of partial / full / pending; promotions
/// and demotions happen only inside `add_request`, `cancel_request` and
/// `write_block`.
#[derive(Debug)]
pub struct ActivePieceManager {
    partial: HashMap<u32, ActivePiece>,
    full: HashMap<u32, ActivePiece>,
    pending: HashMap<u32, ActivePiece>,
    piece_length: u32,
    total_length: u64,
    num_pieces: u32,
}

impl ActivePieceManager {
    pub fn new(piece_length: u32, total_length: u64, num_pieces: u32) -> Self {
        Self {
            partial: HashMap::new(),
            full: HashMap::new(),
            pending: HashMap::new(),
            piece_length,
            total_length,
            num_pieces,
        }
    }

    pub fn piece_length_of(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_length);
        (end - start) as u32
    }

    pub fn blocks_per_piece(&self) -> u32 {
        self.piece_length.div_ceil(BLOCK_LENGTH)
    }

    pub fn state(&self, index: u32) -> Option<PieceState> {
        if self.partial.contains_key(&index) {
            Some(PieceState::Partial)
        } else if self.full.contains_key(&index) {
            Some(PieceState::Full)
        } else if self.pending.contains_key(&index) {
            Some(PieceState::Pending)
        } else {
            None
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.state(index).is_some()
    }

    pub fn get(&self, index: u32) -> Option<&ActivePiece> {
        self.partial
            .get(&index)
            .or_else(|| self.full.get(&index))
            .or_else(|| self.pending.get(&index))
    }

    fn get_requestable_mut(&mut self, index: u32) -> Option<(&mut ActivePiece, PieceState)> {
        if let Some(piece) = self.partial.get_mut(&index) {
            return Some((piece, PieceState::Partial));
        }
        self.full.get_mut(&index).map(|p| (p, PieceState::Full))
    }

    pub fn partial_count(&self) -> usize {
        self.partial.len()
    }

    pub fn full_count(&self) -> usize {
        self.full.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.partial.len() + self.full.len() + self.pending.len()
    }

    pub fn active_indices(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .partial
            .keys()
            .chain(self.full.keys())
            .chain(self.pending.keys())
            .copied()
            .collect();
        out.sort_unstable();
        out
    }

    pub fn claim(&mut self, index: u32, peer: Uuid) {
        if let Some((piece, _)) = self.get_requestable_mut(index) {
            piece.claim(peer);
        }
    }

    pub fn get_or_create(&mut self, index: u32, now: Instant) -> anyhow::Result<&mut ActivePiece> {
        anyhow::ensure!(index < self.num_pieces, "piece {index} does not exist");
        if self.contains(index) {
            // pending pieces are never handed back out for requesting
            return self
                .get_requestable_mut(index)
                .map(|(p, _)| p)
                .context("piece is pending verification");
        }
        let piece = ActivePiece::new(index, self.piece_length_of(index), now);
        Ok(self.partial.entry(index).or_insert(piece))
    }

    /// Record an in-flight request. Moves the piece from partial to full
    /// when its last unrequested block gets taken.
    pub fn add_request(&mut self, index: u32, block: u32, peer: Uuid, now: Instant) -> anyhow::Result<()> {
        let (piece, state) = self
            .get_requestable_mut(index)
            .with_context(|| format!("piece {index} is not requestable"))?;
        anyhow::ensure!(block < piece.blocks_needed, "block {block} out of range");
        anyhow::ensure!(!piece.received.get(block), "block {block} already received");
        let requesters = piece.requests.entry(block).or_default();
        if requesters.contains(&peer) {
            return Ok(());
        }
        let first_request = requesters.is_empty();
        requesters.push(peer);
        if first_request {
            piece.request_times.insert(block, now);
            piece.unrequested_count -= 1;
            if piece.unrequested_count == 0 && state == PieceState::Partial {
                let piece = self.partial.remove(&index).expect("piece was just borrowed");
                self.full.insert(index, piece);
            }
        }
        Ok(())
    }

    /// Withdraw a request. When the peer was the only requester the block
    /// becomes unrequested again, demoting a full piece back to partial.
    pub fn cancel_request(&mut self, index: u32, block: u32, peer: Uuid) -> bool {
        let Some((piece, state)) = self.get_requestable_mut(index) else {
            return false;
        };
        let Some(requesters) = piece.requests.get_mut(&block) else {
            return false;
        };
        let Some(pos) = requesters.iter().position(|p| *p == peer) else {
            return false;
        };
        requesters.swap_remove(pos);
        if piece.exclusive_peer == Some(peer) {
            piece.exclusive_peer = None;
        }
        if requesters.is_empty() {
            piece.requests.remove(&block);
            piece.request_times.remove(&block);
            piece.unrequested_count += 1;
            if piece.unrequested_count == 1 && state == PieceState::Full {
                let piece = self.full.remove(&index).expect("piece was just borrowed");
                self.partial.insert(index, piece);
            }
        }
        true
    }

    /// Route a received block payload straight from the receive buffer into
    /// the piece staging area (the single copy of the PIECE path).
    pub fn write_block(
        &mut self,
        index: u32,
        begin: u32,
        src: &ChunkedBuffer,
        src_offset: usize,
        len: usize,
        from: Uuid,
    ) -> anyhow::Result<BlockReceipt> {
        let (piece, _) = self
            .get_requestable_mut(index)
            .with_context(|| format!("piece {index} is not active"))?;
        anyhow::ensure!(begin % BLOCK_LENGTH == 0, "block offset {begin} is unaligned");
        let block = begin / BLOCK_LENGTH;
        anyhow::ensure!(block < piece.blocks_needed, "block {block} out of range");
        anyhow::ensure!(
            len as u32 == piece.block_length(block),
            "block {block} length {len} does not match expected {}",
            piece.block_length(block)
        );

        let had_request = piece
            .requests
            .get(&block)
            .is_some_and(|requesters| requesters.contains(&from));
        if piece.received.get(block) {
            return Ok(BlockReceipt {
                newly_received: false,
                had_request,
                piece_completed: false,
            });
        }

        let PieceData::Filling(staging) = &mut piece.data else {
            return Err(anyhow!("piece {index} staging area already sealed"));
        };
        let dst = &mut staging[begin as usize..begin as usize + len];
        src.copy_out(src_offset, dst)
            .context("block payload is truncated")?;

        piece.received.set(block, true)?;
        piece.received_count += 1;
        piece.contributors.insert(from);
        // a received block leaves the request tracking entirely
        if piece.requests.remove(&block).is_none() {
            piece.unrequested_count -= 1;
        }
        piece.request_times.remove(&block);

        let completed = piece.received_count == piece.blocks_needed;
        if completed {
            debug_assert_eq!(piece.unrequested_count, 0);
            debug_assert!(piece.requests.is_empty());
            if let PieceData::Filling(staging) = std::mem::replace(&mut piece.data, PieceData::Ready(Bytes::new())) {
                piece.data = PieceData::Ready(staging.freeze());
            }
            let piece = self
                .partial
                .remove(&index)
                .or_else(|| self.full.remove(&index))
                .expect("piece was just borrowed");
            self.pending.insert(index, piece);
        }
        Ok(BlockReceipt {
            newly_received: true,
            had_request,
            piece_completed: completed,
        })
    }

    /// Assembled bytes of a pending piece, cheap to clone into a hash job.
    pub fn assembled(&self, index: u32) -> Option<Bytes> {
        match &self.pending.get(&index)?.data {
            PieceData::Ready(bytes) => Some(bytes.clone()),
            PieceData::Filling(_) => None,
        }
    }

    pub fn contributors(&self, index: u32) -> Vec<Uuid> {
        self.get(index)
            .map(|p| p.contributors.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop a piece from the manager entirely (verified, wiped or
    /// abandoned). Its blocks may be re-requested fresh afterwards.
    pub fn remove(&mut self, index: u32) -> Option<ActivePiece> {
        self.partial
            .remove(&index)
            .or_else(|| self.full.remove(&index))
            .or_else(|| self.pending.remove(&index))
    }

    /// Cancel every in-flight request of a disconnecting peer, demoting
    /// full pieces and clearing its piece ownership. Returns the cancelled
    /// `(piece, block)` pairs.
    pub fn clear_requests_for_peer(&mut self, peer: Uuid) -> Vec<(u32, u32)> {
        let mut cancelled = Vec::new();
        for map in [&mut self.partial, &mut self.full] {
            for (index, piece) in map.iter_mut() {
                if piece.exclusive_peer == Some(peer) {
                    piece.exclusive_peer = None;
                }
                let blocks: Vec<u32> = piece
                    .requests
                    .iter()
                    .filter(|(_, requesters)| requesters.contains(&peer))
                    .map(|(block, _)| *block)
                    .collect();
                for block in blocks {
                    let requesters = piece.requests.get_mut(&block).expect("block was just seen");
                    requesters.retain(|p| *p != peer);
                    if requesters.is_empty() {
                        piece.requests.remove(&block);
                        piece.request_times.remove(&block);
                        piece.unrequested_count += 1;
                    }
                    cancelled.push((*index, block));
                }
            }
        }
        self.demote_fulls();
        cancelled
    }

    fn demote_fulls(&mut self) {
        let demote: Vec<u32> = self
            .full
            .iter()
            .filter(|(_, piece)| piece.unrequested_count > 0)
            .map(|(index, _)| *index)
            .collect();
        for index in demote {
            let piece = self.full.remove(&index).expect("index was just collected");
            self.partial.insert(index, piece);
        }
    }

    /// Requests older than `timeout`, as `(piece, block, requesters)`.
    /// The caller decides whether to cancel.
    pub fn check_timeouts(&self, now: Instant, timeout: Duration) -> Vec<(u32, u32, Vec<Uuid>)> {
        let mut stale = Vec::new();
        for piece in self.partial.values().chain(self.full.values()) {
            for (block, requested_at) in &piece.request_times {
                if now.saturating_duration_since(*requested_at) >= timeout {
                    stale.push((piece.index, *block, piece.requests[block].clone()));
                }
            }
        }
        stale
    }

    /// Partial and full pieces that have lingered past `timeout` without
    /// reaching half completion.
    pub fn abandoned_pieces(&self, now: Instant, timeout: Duration) -> Vec<u32> {
        self.partial
            .values()
            .chain(self.full.values())
            .filter(|piece| {
                now.saturating_duration_since(piece.activated_at) >= timeout
                    && piece.completion_ratio() < 0.5
            })
            .map(|piece| piece.index)
            .collect()
    }

    /// The partial cap. Counts only partials; full and pending do not
    /// contribute.
    pub fn max_partials(&self, connected_peer_count: usize) -> usize {
        let by_peers = connected_peer_count * 3 / 2;
        let by_memory = (2048 / self.blocks_per_piece().max(1)) as usize;
        by_peers.min(by_memory)
    }

    pub fn should_prioritize_partials(&self, connected_peer_count: usize) -> bool {
        self.partial.len() > self.max_partials(connected_peer_count)
    }

    /// Recreate a piece from a session snapshot, its received blocks
    /// pre-filled.
    pub fn restore_partial(
        &mut self,
        snapshot: &crate::session::PartialPieceSnapshot,
        now: Instant,
    ) -> anyhow::Result<()> {
        let index = snapshot.index;
        anyhow::ensure!(index < self.num_pieces, "piece {index} does not exist");
        anyhow::ensure!(!self.contains(index), "piece {index} is already active");
        let mut piece = ActivePiece::new(index, self.piece_length_of(index), now);
        let received = BitField::from_bytes(&snapshot.received, piece.blocks_needed)?;
        anyhow::ensure!(
            snapshot.data.len() == piece.piece_length as usize,
            "snapshot data length {} does not match piece length {}",
            snapshot.data.len(),
            piece.piece_length
        );
        let received_count = received.pieces().count() as u32;
        anyhow::ensure!(
            received_count < piece.blocks_needed,
            "sealed pieces are never snapshotted"
        );
        let PieceData::Filling(staging) = &mut piece.data else {
            unreachable!("fresh pieces are always filling");
        };
        staging.copy_from_slice(&snapshot.data);
        piece.received = received;
        piece.received_count = received_count;
        piece.unrequested_count = piece.blocks_needed - received_count;
        self.partial.insert(index, piece);
        Ok(())
    }

    /// Snapshots of every piece worth persisting.
    pub fn partial_snapshots(&self) -> Vec<crate::session::PartialPieceSnapshot> {
        let mut out: Vec<_> = self
            .partial
            .values()
            .chain(self.full.values())
            .filter_map(ActivePiece::snapshot)
            .collect();
        out.sort_unstable_by_key(|s| s.index);
        out
    }

    /// Partial piece indices ordered rarest first, ties broken towards the
    /// more complete piece.
    pub fn partials_rarest_first(&self, availability: &[u16], seed_count: u32) -> Vec<u32> {
        let mut indices: Vec<u32> = self.partial.keys().copied().collect();
        indices.sort_unstable_by_key(|i| {
            let piece = &self.partial[i];
            let avail = availability.get(*i as usize).copied().unwrap_or(0) as u32 + seed_count;
            let completion = piece.received_count * 1000 / piece.blocks_needed;
            (avail, std::cmp::Reverse(completion))
        });
        indices
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        for (state, map) in [
            (PieceState::Partial, &self.partial),
            (PieceState::Full, &self.full),
            (PieceState::Pending, &self.pending),
        ] {
            for (index, piece) in map {
                assert_eq!(*index, piece.index);
                let requested = piece.requests.len() as u32;
                assert_eq!(
                    piece.unrequested_count + requested + piece.received_count,
                    piece.blocks_needed,
                    "block state partition broken for piece {index}"
                );
                match state {
                    PieceState::Partial => assert!(piece.unrequested_count > 0),
                    PieceState::Full => {
                        assert_eq!(piece.unrequested_count, 0);
                        assert!(piece.received_count < piece.blocks_needed);
                    }
                    PieceState::Pending => assert_eq!(piece.received_count, piece.blocks_needed),
                }
            }
        }
    }
}
