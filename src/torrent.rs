use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use crate::active_pieces::{ActivePieceManager, PieceState};
use crate::bitfield::BitField;
use crate::config::Config;
use crate::engine::{EngineNotification, TorrentStateEvent};
use crate::metrics::TorrentTickStats;
use crate::peer::{PeerConnection, PeerError};
use crate::picker::{PiecePicker, PiecePriority};
use crate::protocol::{Block, Frame, PeerMessage, BLOCK_LENGTH};
use crate::rate::TokenBucket;
use crate::session::TorrentSnapshot;
use crate::storage::{HashJob, HashResult, Hasher, ReadRequest, StorageFeedback, WriteRequest};
use crate::swarm::{DisconnectReason, PeerSource, Swarm};
use crate::transport::TcpSocket;
use crate::unchoke::UnchokeAlgorithm;
use crate::uploader::{EnqueueOutcome, Uploader};
use crate::{InfoHash, TorrentInfo, UserState};

/// Score penalty for a peer that contributed to a hash-failed piece.
const HASH_FAIL_PENALTY: i32 = 50;
/// Score penalty for a peer that sent a malformed frame.
const MALFORMED_PENALTY: i32 = 100;
/// Connect attempts with no transport verdict after this long are written
/// off so they stop holding a connection slot.
const CONNECT_ATTEMPT_SWEEP: Duration = Duration::from_secs(30);

/// Everything one torrent tick hands back to the engine: disk writes to
/// batch, reads to issue, connects to start, notifications to surface.
pub(crate) struct TickContext<'a> {
    pub config: &'a Config,
    pub hasher: &'a mut Hasher,
    pub disk: &'a mut Vec<WriteRequest>,
    pub reads: &'a mut Vec<ReadRequest>,
    pub connects: &'a mut Vec<(InfoHash, SocketAddr)>,
    pub global_upload_bucket: &'a mut TokenBucket,
    pub notifications: &'a mut Vec<EngineNotification>,
}

/// Per torrent four-phase tick: drain peer buffers, process verification
/// and choking, emit requests and uploads, then clean up.
#[derive(Debug)]
pub(crate) struct Torrent {
    info: TorrentInfo,
    pub(crate) have: BitField,
    pub(crate) user_state: UserState,
    error: Option<String>,

    pub(crate) peers: HashMap<Uuid, PeerConnection>,
    by_endpoint: HashMap<SocketAddr, Uuid>,
    connecting: HashMap<SocketAddr, Instant>,

    pub(crate) pieces: ActivePieceManager,
    pub(crate) picker: PiecePicker,
    pub(crate) uploader: Uploader,
    unchoke: UnchokeAlgorithm,
    pub(crate) swarm: Swarm,

    hash_results: Vec<HashResult>,
    storage_feedback: Vec<StorageFeedback>,
    /// Verified piece data kept around until the write succeeds, for the
    /// single retry the error policy allows.
    write_data: HashMap<u32, Bytes>,
    write_retried: HashSet<u32>,

    pub(crate) downloaded_bytes: u64,
    pub(crate) uploaded_bytes: u64,
    tick_num: u64,
    completed_announced: bool,
    session_dirty: bool,
    pub(crate) stats: TorrentTickStats,
}

impl Torrent {
    pub fn new(info: TorrentInfo, config: &Config, user_state: UserState, now: Instant) -> Self {
        let num_pieces = info.num_pieces();
        Self {
            have: BitField::empty(num_pieces),
            user_state,
            error: None,
            peers: HashMap::new(),
            by_endpoint: HashMap::new(),
            connecting: HashMap::new(),
            pieces: ActivePieceManager::new(info.piece_length, info.total_length, num_pieces),
            picker: PiecePicker::new(num_pieces),
            uploader: Uploader::new(config, now),
            unchoke: UnchokeAlgorithm::new(),
            swarm: Swarm::new(config.min_reconnect_time),
            hash_results: Vec::new(),
            storage_feedback: Vec::new(),
            write_data: HashMap::new(),
            write_retried: HashSet::new(),
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            tick_num: 0,
            completed_announced: false,
            session_dirty: false,
            stats: TorrentTickStats::default(),
            info,
        }
    }

    /// Rebuild have-state from a session snapshot. Any inconsistency drops
    /// the snapshot and the torrent starts from scratch.
    pub fn restore(&mut self, snapshot: &TorrentSnapshot, now: Instant) -> anyhow::Result<()> {
        let have = BitField::from_bytes(&snapshot.bitfield, self.info.num_pieces())?;
        for partial in &snapshot.partials {
            anyhow::ensure!(
                !have.get(partial.index),
                "snapshot has piece {} both finished and partial",
                partial.index
            );
            self.pieces.restore_partial(partial, now)?;
        }
        self.downloaded_bytes = have
            .pieces()
            .map(|i| self.info.piece_length_of(i) as u64)
            .sum();
        self.user_state = snapshot.user_state;
        self.have = have;
        self.picker.advance_first_needed(&self.have);
        Ok(())
    }

    pub fn snapshot(&mut self) -> TorrentSnapshot {
        TorrentSnapshot {
            user_state: self.user_state,
            bitfield: self.have.as_bytes().to_vec(),
            partials: self.pieces.partial_snapshots(),
        }
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_runnable(&self) -> bool {
        self.user_state == UserState::Active && self.error.is_none()
    }

    pub fn take_session_dirty(&mut self) -> bool {
        std::mem::take(&mut self.session_dirty)
    }

    pub fn buffered_recv_bytes(&self) -> usize {
        self.peers.values().map(|p| p.buffered_len()).sum()
    }

    // ---- event intake (routed by the engine before the tick) ----

    pub fn on_peer_connected(
        &mut self,
        endpoint: SocketAddr,
        socket: Box<dyn TcpSocket>,
        config: &Config,
        now: Instant,
    ) {
        self.connecting.remove(&endpoint);
        let mut socket = socket;
        if !self.is_runnable() || self.peers.len() >= config.max_connections_per_torrent {
            socket.close();
            return;
        }
        if self.by_endpoint.contains_key(&endpoint) {
            tracing::warn!(%endpoint, "Duplicate connection, closing the new one");
            socket.close();
            return;
        }
        self.swarm.on_connect_success(endpoint, now);
        let mut peer = PeerConnection::new(endpoint, socket, self.info.num_pieces(), config, now);
        if self.have.count() > 0 {
            peer.send(&PeerMessage::Bitfield {
                payload: Bytes::copy_from_slice(self.have.as_bytes()),
            });
        }
        tracing::debug!(%endpoint, peer = %peer.id, "Peer connected");
        self.by_endpoint.insert(endpoint, peer.id);
        self.peers.insert(peer.id, peer);
    }

    pub fn on_inbound_peer(
        &mut self,
        endpoint: SocketAddr,
        socket: Box<dyn TcpSocket>,
        config: &Config,
        now: Instant,
    ) {
        self.swarm.add_candidate(endpoint, PeerSource::Incoming);
        self.on_peer_connected(endpoint, socket, config, now);
    }

    pub fn on_connect_failed(&mut self, endpoint: SocketAddr, now: Instant) {
        self.connecting.remove(&endpoint);
        self.swarm.on_connect_failure(endpoint, now);
    }

    pub fn on_peer_data(&mut self, endpoint: SocketAddr, bytes: Bytes, now: Instant) {
        let Some(id) = self.by_endpoint.get(&endpoint) else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(id) {
            peer.handle_data(bytes, now);
        }
    }

    pub fn on_socket_closed(&mut self, endpoint: SocketAddr, now: Instant) {
        if let Some(id) = self.by_endpoint.get(&endpoint).copied() {
            self.disconnect_peer(id, DisconnectReason::Remote, now);
        }
    }

    pub fn on_hash_result(&mut self, result: HashResult) {
        self.hash_results.push(result);
    }

    pub fn on_storage_feedback(&mut self, feedback: StorageFeedback) {
        self.storage_feedback.push(feedback);
    }

    pub fn add_candidates(&mut self, endpoints: &[SocketAddr], source: PeerSource) -> usize {
        endpoints
            .iter()
            .filter(|ep| self.swarm.add_candidate(**ep, source))
            .count()
    }

    pub fn set_user_state(&mut self, state: UserState, now: Instant) {
        if self.user_state == state {
            return;
        }
        tracing::info!(torrent = %self.info.hex_hash(), ?state, "User state change");
        self.user_state = state;
        self.session_dirty = true;
        if state == UserState::Stopped {
            let ids: Vec<Uuid> = self.peers.keys().copied().collect();
            for id in ids {
                self.disconnect_peer(id, DisconnectReason::Requested, now);
            }
        }
    }

    pub fn set_piece_priority(&mut self, piece: u32, priority: PiecePriority) {
        self.picker.set_priority(piece, priority);
        self.picker.advance_first_needed(&self.have);
    }

    /// Connection slots worth filling right now. Used by the per-tick
    /// cleanup phase and by the cold-start edge fills.
    pub fn fill_peer_slots(&mut self, config: &Config, now: Instant) -> Vec<SocketAddr> {
        if !self.is_runnable() {
            return Vec::new();
        }
        let busy = self.peers.len() + self.connecting.len();
        let budget = config.max_connections_per_torrent.saturating_sub(busy);
        let mut out = Vec::new();
        for _ in 0..budget {
            let Some(endpoint) = self.swarm.next_connect_peer(now) else {
                break;
            };
            self.swarm.mark_connecting(endpoint, now);
            self.connecting.insert(endpoint, now);
            out.push(endpoint);
        }
        out
    }

    // ---- the tick ----

    pub fn tick(&mut self, now: Instant, ctx: &mut TickContext) {
        self.tick_num += 1;
        tracing::trace!(torrent = %self.info.hex_hash(), tick = self.tick_num, "Torrent tick");

        // 1. Drain: parse everything the transport delivered since the
        //    last tick, then the storage completions.
        let mut ids: Vec<Uuid> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        let mut failed = Vec::new();
        for id in &ids {
            if let Err(error) = self.drain_peer(*id, now, ctx) {
                failed.push((*id, error));
            }
        }
        for (id, error) in failed {
            tracing::warn!(%error, "Disconnecting misbehaving peer");
            if let Some(peer) = self.peers.get(&id) {
                self.swarm.apply_penalty(peer.endpoint, MALFORMED_PENALTY);
            }
            self.disconnect_peer(id, DisconnectReason::Malformed, now);
        }
        let feedback = std::mem::take(&mut self.storage_feedback);
        for item in feedback {
            self.handle_storage_feedback(item, ctx, now);
        }

        // 2. Process: verification verdicts, choking, the stuck sweep.
        self.process_hash_results(ctx);
        let we_are_seed = self.have.is_full();
        let decisions = self
            .unchoke
            .maybe_rechoke(&self.peers, we_are_seed, ctx.config, now);
        for (id, choke) in decisions {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.am_choking = choke;
                peer.send(if choke {
                    &PeerMessage::Choke
                } else {
                    &PeerMessage::Unchoke
                });
                if choke {
                    self.uploader.purge_peer(id);
                }
            }
        }
        if self.tick_num % ctx.config.stuck_sweep_ticks == 0 {
            self.cleanup_stuck_pieces(now, ctx.config);
        }

        // 3. Output: requests, coalesced HAVEs, uploads, one socket write
        //    per peer.
        self.request_pieces_all(now);
        self.flush_haves();
        let drained = self.uploader.drain(ctx.global_upload_bucket, now);
        for piece in drained.reads {
            ctx.reads.push(ReadRequest {
                info_hash: self.info.info_hash,
                piece,
                offset: piece as u64 * self.info.piece_length as u64,
                length: self.info.piece_length_of(piece),
            });
        }
        for (peer_id, block, data) in drained.serves {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.uploaded_total += data.len() as u64;
                self.uploaded_bytes += data.len() as u64;
                peer.send(&PeerMessage::Piece {
                    index: block.piece,
                    begin: block.offset,
                    block: data,
                });
            }
        }
        for peer in self.peers.values_mut() {
            peer.maybe_send_keepalive(now, ctx.config.keepalive_interval);
            peer.flush(now);
        }

        // 4. Cleanup: idle peers, rate upkeep, reclassification, refills.
        let idle: Vec<Uuid> = self
            .peers
            .values()
            .filter(|p| p.is_idle(now, ctx.config.idle_timeout))
            .map(|p| p.id)
            .collect();
        for id in idle {
            let error = PeerError::timeout("no traffic for the idle window");
            tracing::debug!(peer = %id, %error, "Disconnecting idle peer");
            self.disconnect_peer(id, DisconnectReason::Idle, now);
        }
        self.connecting.retain(|endpoint, started| {
            let expired = now.saturating_duration_since(*started) >= CONNECT_ATTEMPT_SWEEP;
            if expired {
                tracing::debug!(%endpoint, "Writing off a connect attempt without a verdict");
            }
            !expired
        });
        for peer in self.peers.values_mut() {
            peer.end_of_tick(ctx.config, now);
            peer.is_fast = PiecePicker::classify_fast(
                peer.download_rate.bytes_per_second(),
                self.info.piece_length,
                ctx.config.fast_piece_window,
            );
            peer.update_interest(&self.have, self.picker.priorities());
        }
        for endpoint in self.fill_peer_slots(ctx.config, now) {
            ctx.connects.push((self.info.info_hash, endpoint));
        }

        if !self.completed_announced && self.have.is_full() {
            self.completed_announced = true;
            tracing::info!(torrent = %self.info.hex_hash(), "Torrent complete");
            ctx.notifications.push(EngineNotification::TorrentCompleted {
                info_hash: self.info.info_hash,
            });
        }
        self.update_stats();
        ctx.notifications
            .push(EngineNotification::TorrentState(self.state_event()));
    }

    fn drain_peer(
        &mut self,
        id: Uuid,
        now: Instant,
        ctx: &mut TickContext,
    ) -> Result<(), PeerError> {
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };
        let endpoint = peer.endpoint;
        let pending = peer.take_pending_bytes();
        if pending > 0 {
            self.swarm.record_downloaded(endpoint, pending);
        }
        loop {
            let peer = self.peers.get(&id).expect("drained peer is connected");
            let frame = peer
                .next_frame()
                .map_err(|e| PeerError::protocol(e.to_string()))?;
            let Some((frame, frame_len)) = frame else {
                return Ok(());
            };
            self.handle_frame(id, frame, ctx)?;
            let peer = self.peers.get_mut(&id).expect("drained peer is connected");
            peer.consume(frame_len);
        }
    }

    fn handle_frame(
        &mut self,
        id: Uuid,
        frame: Frame,
        ctx: &mut TickContext,
    ) -> Result<(), PeerError> {
        let num_pieces = self.info.num_pieces();
        match frame {
            Frame::Message(PeerMessage::KeepAlive) => {}
            Frame::Message(PeerMessage::Choke) => {
                // outstanding requests are dead on choke
                let cancelled = self.pieces.clear_requests_for_peer(id);
                let peer = self.peers.get_mut(&id).expect("peer is connected");
                peer.peer_choking = true;
                peer.requests_outstanding = 0;
                if !cancelled.is_empty() {
                    tracing::trace!(peer = %id, count = cancelled.len(), "Choke cancelled in-flight requests");
                }
            }
            Frame::Message(PeerMessage::Unchoke) => {
                self.peers.get_mut(&id).expect("peer is connected").peer_choking = false;
            }
            Frame::Message(PeerMessage::Interested) => {
                self.peers.get_mut(&id).expect("peer is connected").peer_interested = true;
            }
            Frame::Message(PeerMessage::NotInterested) => {
                self.peers.get_mut(&id).expect("peer is connected").peer_interested = false;
            }
            Frame::Message(PeerMessage::Have { index }) => {
                if index >= num_pieces {
                    return Err(PeerError::protocol(format!(
                        "HAVE for piece {index} out of range"
                    )));
                }
                let peer = self.peers.get_mut(&id).expect("peer is connected");
                let was_seed = peer.is_seed;
                let newly = peer
                    .mark_have(index)
                    .map_err(|e| PeerError::protocol(e.to_string()))?;
                if newly {
                    self.picker.on_peer_have(index);
                    if peer.is_seed && !was_seed {
                        self.picker.on_peer_became_seed(&peer.bitfield);
                    }
                    peer.update_interest(&self.have, self.picker.priorities());
                }
            }
            Frame::Message(PeerMessage::Bitfield { payload }) => {
                let bitfield = BitField::from_bytes(&payload, num_pieces)
                    .map_err(|e| PeerError::protocol(e.to_string()))?;
                let peer = self.peers.get_mut(&id).expect("peer is connected");
                self.picker.remove_peer_bitfield(&peer.bitfield, peer.is_seed);
                peer.set_bitfield(bitfield);
                self.picker.add_peer_bitfield(&peer.bitfield, peer.is_seed);
                peer.update_interest(&self.have, self.picker.priorities());
            }
            Frame::Message(PeerMessage::Request(block)) => {
                self.handle_upload_request(id, block);
            }
            Frame::Message(PeerMessage::Cancel(block)) => {
                self.uploader.cancel(id, block);
            }
            Frame::Message(PeerMessage::Port { port }) => {
                let peer = self.peers.get(&id).expect("peer is connected");
                ctx.notifications.push(EngineNotification::DhtNode {
                    endpoint: SocketAddr::new(peer.endpoint.ip(), port),
                });
            }
            Frame::Message(PeerMessage::Piece { .. }) => {
                unreachable!("piece payloads arrive as Frame::PieceBlock")
            }
            Frame::PieceBlock {
                index,
                begin,
                data_offset,
                data_len,
            } => {
                self.handle_piece_block(id, index, begin, data_offset, data_len, ctx)?;
            }
        }
        Ok(())
    }

    fn handle_upload_request(&mut self, id: Uuid, block: Block) {
        let peer = self.peers.get_mut(&id).expect("peer is connected");
        if peer.am_choking {
            // the peer raced our choke; silently ignored
            return;
        }
        let valid = block.piece < self.info.num_pieces()
            && self.have.get(block.piece)
            && block.length > 0
            && block.length <= BLOCK_LENGTH
            && block
                .offset
                .checked_add(block.length)
                .is_some_and(|end| end <= self.info.piece_length_of(block.piece));
        if !valid {
            tracing::trace!(peer = %id, %block, "Dropping unserviceable request");
            return;
        }
        match self.uploader.enqueue(id, block) {
            EnqueueOutcome::Accepted => {}
            EnqueueOutcome::Dropped => {
                tracing::trace!(peer = %id, "Upload queue for peer is full, request dropped");
            }
            EnqueueOutcome::OverCommitted => {
                tracing::debug!(peer = %id, "Upload queue over-committed, choking");
                peer.am_choking = true;
                peer.send(&PeerMessage::Choke);
                self.uploader.purge_peer(id);
            }
        }
    }

    fn handle_piece_block(
        &mut self,
        id: Uuid,
        index: u32,
        begin: u32,
        data_offset: usize,
        data_len: usize,
        ctx: &mut TickContext,
    ) -> Result<(), PeerError> {
        if index >= self.info.num_pieces() {
            return Err(PeerError::protocol(format!(
                "PIECE for piece {index} out of range"
            )));
        }
        if !matches!(
            self.pieces.state(index),
            Some(PieceState::Partial | PieceState::Full)
        ) {
            // late block for a piece we finished, wiped or abandoned
            tracing::trace!(piece = index, begin, "Discarding stale block");
            return Ok(());
        }
        let peer = self.peers.get(&id).expect("peer is connected");
        let receipt = self
            .pieces
            .write_block(index, begin, peer.recv_buffer(), data_offset, data_len, id)
            .map_err(|e| PeerError::protocol(e.to_string()))?;
        if receipt.had_request {
            let peer = self.peers.get_mut(&id).expect("peer is connected");
            peer.note_request_resolved();
        }
        if receipt.piece_completed {
            let data = self
                .pieces
                .assembled(index)
                .expect("completed piece has sealed data");
            ctx.hasher.pend_job(HashJob {
                info_hash: self.info.info_hash,
                piece: index,
                expected: self.info.piece_hashes[index as usize],
                data,
            });
        }
        Ok(())
    }

    fn process_hash_results(&mut self, ctx: &mut TickContext) {
        for result in std::mem::take(&mut self.hash_results) {
            let index = result.piece;
            if self.pieces.state(index) != Some(PieceState::Pending) {
                tracing::trace!(piece = index, "Dropping verdict for a piece no longer pending");
                continue;
            }
            if !result.is_verified {
                let contributors = self.pieces.contributors(index);
                self.pieces.remove(index);
                self.stats.pieces_failed += 1;
                tracing::warn!(
                    piece = index,
                    contributors = contributors.len(),
                    "Piece failed verification, wiping it"
                );
                for peer_id in contributors {
                    if let Some(peer) = self.peers.get(&peer_id) {
                        self.swarm.apply_penalty(peer.endpoint, HASH_FAIL_PENALTY);
                    }
                }
                continue;
            }
            self.pieces.remove(index);
            if let Err(e) = self.have.set(index, true) {
                tracing::error!("Verified piece out of range: {e}");
                continue;
            }
            self.downloaded_bytes += result.data.len() as u64;
            self.stats.pieces_verified += 1;
            self.picker.advance_first_needed(&self.have);
            for peer in self.peers.values_mut() {
                peer.queue_have(index);
            }
            self.write_data.insert(index, result.data.clone());
            ctx.disk.push(WriteRequest {
                info_hash: self.info.info_hash,
                piece: index,
                offset: index as u64 * self.info.piece_length as u64,
                data: result.data,
                expected_hash: self.info.piece_hashes[index as usize],
            });
        }
    }

    fn handle_storage_feedback(
        &mut self,
        feedback: StorageFeedback,
        ctx: &mut TickContext,
        now: Instant,
    ) {
        match feedback {
            StorageFeedback::Written { piece, .. } => {
                self.write_retried.remove(&piece);
                self.write_data.remove(&piece);
                // have-state is durable only once the write landed
                self.session_dirty = true;
            }
            StorageFeedback::WriteFailed { piece, kind, .. } => {
                if self.write_retried.insert(piece) {
                    tracing::warn!(piece, %kind, "Piece write failed, retrying once");
                    if let Some(data) = self.write_data.get(&piece) {
                        ctx.disk.push(WriteRequest {
                            info_hash: self.info.info_hash,
                            piece,
                            offset: piece as u64 * self.info.piece_length as u64,
                            data: data.clone(),
                            expected_hash: self.info.piece_hashes[piece as usize],
                        });
                    }
                } else {
                    self.enter_error_state(
                        format!("storage write for piece {piece} failed twice: {kind}"),
                        now,
                        ctx,
                    );
                }
            }
            StorageFeedback::Data { piece, bytes, .. } => {
                self.uploader.on_piece_data(piece, bytes);
            }
            StorageFeedback::ReadFailed { piece, kind, .. } => {
                tracing::warn!(piece, %kind, "Upload read failed");
                self.uploader.on_read_failed(piece);
            }
        }
    }

    fn enter_error_state(&mut self, message: String, now: Instant, ctx: &mut TickContext) {
        tracing::error!(torrent = %self.info.hex_hash(), "{message}");
        if self.error.is_some() {
            return;
        }
        self.error = Some(message.clone());
        let ids: Vec<Uuid> = self.peers.keys().copied().collect();
        for id in ids {
            self.disconnect_peer(id, DisconnectReason::Requested, now);
        }
        ctx.notifications.push(EngineNotification::TorrentError {
            info_hash: self.info.info_hash,
            message,
        });
    }

    /// Every `stuck_sweep_ticks`: cancel block requests past their timeout
    /// and drop pieces that have gone nowhere for too long.
    fn cleanup_stuck_pieces(&mut self, now: Instant, config: &Config) {
        for (index, block, requesters) in
            self.pieces.check_timeouts(now, config.block_request_timeout)
        {
            let Some(length) = self.pieces.get(index).map(|p| p.block_length(block)) else {
                continue;
            };
            for peer_id in requesters {
                self.pieces.cancel_request(index, block, peer_id);
                self.stats.stuck_blocks_cancelled += 1;
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    tracing::debug!(peer = %peer_id, piece = index, block, "Request timed out, cancelling");
                    peer.send(&PeerMessage::Cancel(Block {
                        piece: index,
                        offset: block * BLOCK_LENGTH,
                        length,
                    }));
                    peer.note_request_resolved();
                    peer.on_block_timeout(config);
                }
            }
        }

        for index in self
            .pieces
            .abandoned_pieces(now, config.piece_abandon_timeout)
        {
            let Some(piece) = self.pieces.remove(index) else {
                continue;
            };
            tracing::debug!(piece = index, "Abandoning piece that made no progress");
            self.stats.abandoned_pieces += 1;
            for (block, requesters) in piece.active_requests() {
                for peer_id in requesters {
                    if let Some(peer) = self.peers.get_mut(&peer_id) {
                        peer.send(&PeerMessage::Cancel(Block {
                            piece: index,
                            offset: block * BLOCK_LENGTH,
                            length: piece.block_length(block),
                        }));
                        peer.note_request_resolved();
                    }
                }
            }
        }
    }

    fn request_pieces_all(&mut self, now: Instant) {
        let fast_peers: HashSet<Uuid> = self
            .peers
            .values()
            .filter(|p| p.is_fast)
            .map(|p| p.id)
            .collect();
        let connected = self.peers.len();
        // seeds get first pick of the request budget
        let mut ids: Vec<(bool, Uuid)> =
            self.peers.values().map(|p| (!p.is_seed, p.id)).collect();
        ids.sort_unstable();
        for (_, id) in ids {
            let peer = self.peers.get_mut(&id).expect("peer is connected");
            if peer.peer_choking || !peer.am_interested || peer.pipeline_budget() == 0 {
                continue;
            }
            let blocks = self.picker.request_pieces(
                peer,
                &mut self.pieces,
                &self.have,
                &fast_peers,
                connected,
                now,
            );
            for block in blocks {
                peer.send(&PeerMessage::Request(block));
            }
        }
    }

    fn flush_haves(&mut self) {
        for peer in self.peers.values_mut() {
            for piece in peer.take_have_queue() {
                peer.send(&PeerMessage::Have { index: piece });
            }
        }
    }

    fn disconnect_peer(&mut self, id: Uuid, reason: DisconnectReason, now: Instant) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        tracing::debug!(peer = %id, endpoint = %peer.endpoint, ?reason, "Peer disconnected");
        self.by_endpoint.remove(&peer.endpoint);
        let cancelled = self.pieces.clear_requests_for_peer(id);
        if !cancelled.is_empty() {
            tracing::trace!(peer = %id, count = cancelled.len(), "Released in-flight requests");
        }
        self.picker.remove_peer_bitfield(&peer.bitfield, peer.is_seed);
        self.uploader.purge_peer(id);
        self.unchoke.on_peer_disconnected(id);
        self.swarm
            .on_disconnect(peer.endpoint, peer.session_duration(now), reason, now);
        peer.close();
    }

    fn update_stats(&mut self) {
        self.stats.partial_pieces = self.pieces.partial_count();
        self.stats.full_pieces = self.pieces.full_count();
        self.stats.pending_pieces = self.pieces.pending_count();
        self.stats.connected_peers = self.peers.len();
        self.stats.outstanding_requests =
            self.peers.values().map(|p| p.requests_outstanding).sum();
    }

    fn state_event(&mut self) -> TorrentStateEvent {
        let download_rate_bps: u64 = self
            .peers
            .values()
            .map(|p| p.download_rate.bytes_per_second())
            .sum();
        let upload_rate_bps: u64 = self
            .peers
            .values()
            .map(|p| p.upload_rate.bytes_per_second())
            .sum();
        let remaining = self.info.total_length.saturating_sub(self.downloaded_bytes);
        let eta_seconds = if remaining == 0 {
            Some(0)
        } else if download_rate_bps > 0 {
            Some(remaining / download_rate_bps)
        } else {
            None
        };
        TorrentStateEvent {
            info_hash: self.info.info_hash,
            name: self.info.name.clone(),
            total_bytes: self.info.total_length,
            downloaded_bytes: self.downloaded_bytes,
            uploaded_bytes: self.uploaded_bytes,
            download_rate_bps,
            upload_rate_bps,
            piece_have_bitfield_hex: hex::encode(self.have.as_bytes()),
            active_piece_indices: self.pieces.active_indices(),
            peer_count: self.peers.len(),
            seed_count: self.picker.seed_count(),
            eta_seconds,
            user_state: self.user_state,
            error: self.error.clone(),
            tick_num: self.tick_num,
        }
    }
}
