use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::Instant;

use bytes::Bytes;
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{Block, BLOCK_LENGTH};
use crate::rate::{Consume, TokenBucket};

/// Pieces kept in memory for serving; consecutive block requests on one
/// piece cost a single storage read.
const PIECE_CACHE_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
struct QueuedRequest {
    peer: Uuid,
    block: Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Aggregate queue is full; the requester should be choked.
    OverCommitted,
    /// Per peer bound hit; the request is dropped silently.
    Dropped,
}

/// What one drain pass produced: blocks ready to go on the wire and piece
/// reads to hand to storage.
#[derive(Debug, Default)]
pub struct UploadDrain {
    pub serves: Vec<(Uuid, Block, Bytes)>,
    pub reads: Vec<u32>,
}

/// REQUEST queue with token-bucket gating and a small piece read cache.
///
/// Requests wait in FIFO order. A request whose piece is cached is served
/// as soon as the rate limiters allow; otherwise the request parks until
/// the piece read completes on a later tick and then rejoins the front of
/// the queue.
#[derive(Debug)]
pub struct Uploader {
    queue: VecDeque<QueuedRequest>,
    parked: HashMap<u32, Vec<QueuedRequest>>,
    per_peer: HashMap<Uuid, usize>,
    bucket: TokenBucket,
    cache: lru::LruCache<u32, Bytes>,
    max_queue: usize,
    max_queue_per_peer: usize,
    pub uploaded_total: u64,
}

impl Uploader {
    pub fn new(config: &Config, now: Instant) -> Self {
        let rate = config.torrent_upload_rate_limit;
        let burst = rate.max(BLOCK_LENGTH as u64 * 4);
        Self {
            queue: VecDeque::new(),
            parked: HashMap::new(),
            per_peer: HashMap::new(),
            bucket: TokenBucket::new(rate, burst, now),
            cache: lru::LruCache::new(NonZeroUsize::new(PIECE_CACHE_SIZE).unwrap()),
            max_queue: config.max_upload_queue,
            max_queue_per_peer: config.max_upload_queue_per_peer,
            uploaded_total: 0,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len() + self.parked.values().map(Vec::len).sum::<usize>()
    }

    pub fn enqueue(&mut self, peer: Uuid, block: Block) -> EnqueueOutcome {
        if self.queue_len() >= self.max_queue {
            return EnqueueOutcome::OverCommitted;
        }
        let count = self.per_peer.entry(peer).or_insert(0);
        if *count >= self.max_queue_per_peer {
            return EnqueueOutcome::Dropped;
        }
        *count += 1;
        self.queue.push_back(QueuedRequest { peer, block });
        EnqueueOutcome::Accepted
    }

    /// Drop one queued request (CANCEL).
    pub fn cancel(&mut self, peer: Uuid, block: Block) {
        let matches = |r: &QueuedRequest| r.peer == peer && r.block == block;
        if let Some(pos) = self.queue.iter().position(matches) {
            self.queue.remove(pos);
            self.release_peer_slot(peer);
            return;
        }
        for parked in self.parked.values_mut() {
            if let Some(pos) = parked.iter().position(matches) {
                parked.remove(pos);
                self.release_peer_slot(peer);
                return;
            }
        }
    }

    /// A peer got choked or disconnected: its queue entries are purged.
    pub fn purge_peer(&mut self, peer: Uuid) {
        self.queue.retain(|r| r.peer != peer);
        for parked in self.parked.values_mut() {
            parked.retain(|r| r.peer != peer);
        }
        self.per_peer.remove(&peer);
    }

    fn release_peer_slot(&mut self, peer: Uuid) {
        if let Some(count) = self.per_peer.get_mut(&peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_peer.remove(&peer);
            }
        }
    }

    /// Serve what the rate limit allows, park what needs a disk read.
    pub fn drain(&mut self, global_bucket: &mut TokenBucket, now: Instant) -> UploadDrain {
        let mut out = UploadDrain::default();
        while let Some(request) = self.queue.front().copied() {
            let piece = request.block.piece;
            // cheap refcount clone; releases the cache borrow
            let cached = self.cache.get(&piece).cloned();
            let Some(cached) = cached else {
                // park until the read completes on a later tick
                self.queue.pop_front();
                let parked = self.parked.entry(piece).or_default();
                if parked.is_empty() {
                    out.reads.push(piece);
                }
                parked.push(request);
                continue;
            };
            let length = request.block.length as u64;
            match self.bucket.try_consume(length, now) {
                Consume::Granted => {}
                Consume::RetryAfter(_) => break,
            }
            if let Consume::RetryAfter(_) = global_bucket.try_consume(length, now) {
                self.bucket.refund(length);
                break;
            }
            let start = request.block.offset as usize;
            let end = start + request.block.length as usize;
            if end > cached.len() {
                tracing::warn!(
                    piece,
                    offset = request.block.offset,
                    "Dropping upload request outside the piece bounds"
                );
                self.queue.pop_front();
                self.release_peer_slot(request.peer);
                self.bucket.refund(length);
                global_bucket.refund(length);
                continue;
            }
            let data = cached.slice(start..end);
            self.queue.pop_front();
            self.release_peer_slot(request.peer);
            self.uploaded_total += length;
            out.serves.push((request.peer, request.block, data));
        }
        out
    }

    /// A storage read completed: cache the piece and requeue its waiters
    /// ahead of everyone else.
    pub fn on_piece_data(&mut self, piece: u32, bytes: Bytes) {
        self.cache.put(piece, bytes);
        if let Some(parked) = self.parked.remove(&piece) {
            for request in parked.into_iter().rev() {
                self.queue.push_front(request);
            }
        }
    }

    /// The read failed; the parked requests are dropped.
    pub fn on_read_failed(&mut self, piece: u32) {
        if let Some(parked) = self.parked.remove(&piece) {
            for request in parked {
                self.release_peer_slot(request.peer);
            }
        }
    }
}
