use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::bitfield::BitField;
use crate::chunked_buffer::ChunkedBuffer;
use crate::config::Config;
use crate::picker::PiecePriority;
use crate::protocol::{self, Frame, PeerMessage};
use crate::rate::RateEstimator;
use crate::transport::TcpSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorCause {
    Timeout,
    Protocol,
}

/// Per connection error. Always isolated to that connection; the torrent
/// disconnects the peer and carries on.
#[derive(Debug, Clone)]
pub struct PeerError {
    pub msg: String,
    pub cause: PeerErrorCause,
}

impl PeerError {
    pub fn new(cause: PeerErrorCause, msg: impl Into<String>) -> Self {
        Self {
            cause,
            msg: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(PeerErrorCause::Protocol, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(PeerErrorCause::Timeout, msg)
    }
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.cause, self.msg)
    }
}

/// Protocol state of one fully handshaken peer connection.
///
/// The receive path is split in two: `handle_data` only appends to the
/// chunked buffer, and the tick loop later walks complete frames with
/// `next_frame` / `consume`. PIECE payloads never leave the buffer here;
/// the tick loop copies them straight into piece staging.
#[derive(Debug)]
pub struct PeerConnection {
    pub id: Uuid,
    pub endpoint: SocketAddr,
    socket: Box<dyn TcpSocket>,

    pub bitfield: BitField,
    pub is_seed: bool,
    pub have_count: u32,
    num_pieces: u32,

    pub am_choking: bool,
    pub peer_choking: bool,
    pub am_interested: bool,
    pub peer_interested: bool,

    recv_buffer: ChunkedBuffer,
    pending_bytes: u64,
    send_queue: BytesMut,
    have_queue: Vec<u32>,

    pub requests_outstanding: u32,
    pub pipeline_depth: u32,
    /// Reclassified on tick boundaries only.
    pub is_fast: bool,

    pub download_rate: RateEstimator,
    pub upload_rate: RateEstimator,
    pub downloaded_total: u64,
    pub uploaded_total: u64,
    bytes_this_tick: u64,
    uploaded_snapshot: u64,

    pub connected_at: Instant,
    last_recv_at: Instant,
    last_send_at: Instant,
}

impl PeerConnection {
    pub fn new(
        endpoint: SocketAddr,
        socket: Box<dyn TcpSocket>,
        num_pieces: u32,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            socket,
            bitfield: BitField::empty(num_pieces),
            is_seed: false,
            have_count: 0,
            num_pieces,
            am_choking: true,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
            recv_buffer: ChunkedBuffer::new(),
            pending_bytes: 0,
            send_queue: BytesMut::new(),
            have_queue: Vec::new(),
            requests_outstanding: 0,
            pipeline_depth: config.pipeline_initial,
            is_fast: false,
            download_rate: RateEstimator::new(config.rate_half_life),
            upload_rate: RateEstimator::new(config.rate_half_life),
            downloaded_total: 0,
            uploaded_total: 0,
            bytes_this_tick: 0,
            uploaded_snapshot: 0,
            connected_at: now,
            last_recv_at: now,
            last_send_at: now,
        }
    }

    /// Append transport bytes. No parsing happens here.
    pub fn handle_data(&mut self, bytes: Bytes, now: Instant) {
        self.pending_bytes += bytes.len() as u64;
        self.last_recv_at = now;
        self.recv_buffer.push(bytes);
    }

    /// One accounting event per drain: bytes received since the last one.
    pub fn take_pending_bytes(&mut self) -> u64 {
        let pending = self.pending_bytes;
        self.pending_bytes = 0;
        self.bytes_this_tick += pending;
        pending
    }

    pub fn buffered_len(&self) -> usize {
        self.recv_buffer.len()
    }

    pub fn recv_buffer(&self) -> &ChunkedBuffer {
        &self.recv_buffer
    }

    pub fn next_frame(&self) -> anyhow::Result<Option<(Frame, usize)>> {
        protocol::peek_frame(&self.recv_buffer)
    }

    pub fn consume(&mut self, frame_len: usize) {
        self.recv_buffer.discard(frame_len);
    }

    /// Frame a message into the send queue; flushed once per tick.
    pub fn send(&mut self, message: &PeerMessage) {
        message.write_frame(&mut self.send_queue);
    }

    pub fn queue_have(&mut self, piece: u32) {
        self.have_queue.push(piece);
    }

    pub fn take_have_queue(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.have_queue)
    }

    /// One socket write per tick.
    pub fn flush(&mut self, now: Instant) {
        if self.send_queue.is_empty() {
            return;
        }
        let frame = self.send_queue.split().freeze();
        self.socket.send(frame);
        self.last_send_at = now;
    }

    pub fn close(&mut self) {
        self.socket.close();
    }

    pub fn maybe_send_keepalive(&mut self, now: Instant, interval: Duration) {
        if self.send_queue.is_empty()
            && now.saturating_duration_since(self.last_send_at) >= interval
        {
            self.send(&PeerMessage::KeepAlive);
        }
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_recv_at) >= timeout
    }

    /// Remaining REQUEST budget this tick.
    pub fn pipeline_budget(&self) -> u32 {
        self.pipeline_depth.saturating_sub(self.requests_outstanding)
    }

    pub fn note_request_sent(&mut self) {
        self.requests_outstanding += 1;
    }

    pub fn note_request_resolved(&mut self) {
        self.requests_outstanding = self.requests_outstanding.saturating_sub(1);
    }

    /// A request of ours timed out; back the pipeline off.
    pub fn on_block_timeout(&mut self, config: &Config) {
        self.pipeline_depth = (self.pipeline_depth / 2).max(config.pipeline_min);
    }

    /// End of tick rate upkeep. Grows the pipeline additively while the
    /// peer keeps the wire busy.
    pub fn end_of_tick(&mut self, config: &Config, now: Instant) {
        let bytes = std::mem::take(&mut self.bytes_this_tick);
        self.downloaded_total += bytes;
        self.download_rate.record(bytes, now);
        let uploaded = self.uploaded_total - self.uploaded_snapshot;
        self.uploaded_snapshot = self.uploaded_total;
        self.upload_rate.record(uploaded, now);
        let saturated = self.requests_outstanding * 2 >= self.pipeline_depth;
        if bytes > 0 && saturated {
            self.pipeline_depth = (self.pipeline_depth + config.pipeline_growth).min(config.pipeline_max);
        }
    }

    pub fn mark_have(&mut self, piece: u32) -> anyhow::Result<bool> {
        if self.bitfield.get(piece) {
            return Ok(false);
        }
        self.bitfield.set(piece, true)?;
        self.have_count += 1;
        if self.have_count == self.num_pieces {
            self.is_seed = true;
        }
        Ok(true)
    }

    /// Replace the bitfield wholesale (BITFIELD frame).
    pub fn set_bitfield(&mut self, mut bitfield: BitField) {
        self.have_count = bitfield.count();
        self.is_seed = self.have_count == self.num_pieces;
        self.bitfield = bitfield;
    }

    /// Recompute interest: we want any piece we lack, the peer has, and the
    /// user did not skip. Returns the transition to announce, if any.
    pub fn update_interest(
        &mut self,
        have: &BitField,
        priorities: &[PiecePriority],
    ) -> Option<bool> {
        let interested = (0..self.num_pieces).any(|i| {
            !have.get(i)
                && (self.is_seed || self.bitfield.get(i))
                && priorities
                    .get(i as usize)
                    .is_some_and(|p| *p != PiecePriority::Skip)
        });
        if interested == self.am_interested {
            return None;
        }
        self.am_interested = interested;
        let message = if interested {
            PeerMessage::Interested
        } else {
            PeerMessage::NotInterested
        };
        self.send(&message);
        Some(interested)
    }

    pub fn session_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connected_at)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use bytes::BytesMut;

    use crate::bitfield::BitField;
    use crate::config::Config;
    use crate::picker::PiecePriority;
    use crate::protocol::{Frame, PeerMessage};
    use crate::test_support::{decode_frames, test_addr, LoopbackSocket};

    use super::PeerConnection;

    fn peer_of(num_pieces: u32) -> (PeerConnection, LoopbackSocket) {
        let socket = LoopbackSocket::new();
        let peer = PeerConnection::new(
            test_addr(1, 6881),
            Box::new(socket.clone()),
            num_pieces,
            &Config::default(),
            Instant::now(),
        );
        (peer, socket)
    }

    #[test]
    fn handle_data_buffers_without_parsing() {
        let (mut peer, _) = peer_of(8);
        let now = Instant::now();
        let mut bytes = BytesMut::new();
        PeerMessage::Have { index: 3 }.write_frame(&mut bytes);
        let bytes = bytes.freeze();
        peer.handle_data(bytes.slice(..5), now);
        assert_eq!(peer.take_pending_bytes(), 5);
        assert!(peer.next_frame().unwrap().is_none());
        peer.handle_data(bytes.slice(5..), now);
        let (frame, frame_len) = peer.next_frame().unwrap().unwrap();
        assert_eq!(frame, Frame::Message(PeerMessage::Have { index: 3 }));
        peer.consume(frame_len);
        assert_eq!(peer.buffered_len(), 0);
    }

    #[test]
    fn flush_writes_queued_frames_once() {
        let (mut peer, socket) = peer_of(8);
        peer.send(&PeerMessage::Interested);
        peer.send(&PeerMessage::Have { index: 1 });
        assert!(socket.sent_bytes().is_empty());
        peer.flush(Instant::now());
        assert_eq!(
            decode_frames(&socket.sent_bytes()),
            vec![PeerMessage::Interested, PeerMessage::Have { index: 1 }]
        );
        socket.clear();
        peer.flush(Instant::now());
        assert!(socket.sent_bytes().is_empty());
    }

    #[test]
    fn pipeline_halves_on_timeout_and_grows_when_saturated() {
        let config = Config::default();
        let (mut peer, _) = peer_of(8);
        assert_eq!(peer.pipeline_depth, 64);
        peer.on_block_timeout(&config);
        assert_eq!(peer.pipeline_depth, 32);
        for _ in 0..20 {
            peer.on_block_timeout(&config);
        }
        assert_eq!(peer.pipeline_depth, config.pipeline_min);

        let mut now = Instant::now();
        peer.requests_outstanding = peer.pipeline_depth;
        loop {
            peer.handle_data(bytes::Bytes::from_static(&[0u8; 100]), now);
            peer.take_pending_bytes();
            peer.end_of_tick(&config, now);
            peer.requests_outstanding = peer.pipeline_depth;
            now += Duration::from_millis(100);
            if peer.pipeline_depth == config.pipeline_max {
                break;
            }
        }
        // further growth is clamped
        peer.handle_data(bytes::Bytes::from_static(&[0u8; 100]), now);
        peer.take_pending_bytes();
        peer.end_of_tick(&config, now);
        assert_eq!(peer.pipeline_depth, config.pipeline_max);
    }

    #[test]
    fn seed_detection_via_haves_and_bitfield() {
        let (mut peer, _) = peer_of(3);
        assert!(peer.mark_have(0).unwrap());
        assert!(!peer.mark_have(0).unwrap());
        assert!(!peer.is_seed);
        peer.mark_have(1).unwrap();
        peer.mark_have(2).unwrap();
        assert!(peer.is_seed);

        let (mut peer, _) = peer_of(3);
        peer.set_bitfield(BitField::from_bytes(&[0b11100000], 3).unwrap());
        assert!(peer.is_seed);
        assert_eq!(peer.have_count, 3);
    }

    #[test]
    fn interest_transitions_emit_messages() {
        let (mut peer, socket) = peer_of(2);
        let mut have = BitField::empty(2);
        let priorities = vec![PiecePriority::Normal; 2];

        assert_eq!(peer.update_interest(&have, &priorities), None);
        peer.mark_have(1).unwrap();
        assert_eq!(peer.update_interest(&have, &priorities), Some(true));
        // no duplicate INTERESTED while nothing changed
        assert_eq!(peer.update_interest(&have, &priorities), None);

        have.set(1, true).unwrap();
        assert_eq!(peer.update_interest(&have, &priorities), Some(false));
        peer.flush(Instant::now());
        assert_eq!(
            decode_frames(&socket.sent_bytes()),
            vec![PeerMessage::Interested, PeerMessage::NotInterested]
        );
    }

    #[test]
    fn skipped_pieces_do_not_create_interest() {
        let (mut peer, _) = peer_of(1);
        peer.mark_have(0).unwrap();
        let have = BitField::empty(1);
        assert_eq!(peer.update_interest(&have, &[PiecePriority::Skip]), None);
        assert!(!peer.am_interested);
    }

    #[test]
    fn keepalive_and_idle_tracking() {
        let config = Config::default();
        let (mut peer, socket) = peer_of(1);
        let start = Instant::now();
        peer.maybe_send_keepalive(start + Duration::from_secs(10), config.keepalive_interval);
        peer.flush(start + Duration::from_secs(10));
        assert!(socket.sent_bytes().is_empty());

        peer.maybe_send_keepalive(start + Duration::from_secs(91), config.keepalive_interval);
        peer.flush(start + Duration::from_secs(91));
        assert_eq!(decode_frames(&socket.sent_bytes()), vec![PeerMessage::KeepAlive]);

        assert!(!peer.is_idle(start + Duration::from_secs(119), config.idle_timeout));
        assert!(peer.is_idle(start + Duration::from_secs(121), config.idle_timeout));
    }
}
