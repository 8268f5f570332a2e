//! Core BitTorrent download engine.
//!
//! Everything runs on a single engine thread driven by a fixed 100 ms tick:
//! socket bytes, disk completions and hash results are queued by their
//! producers and drained at the start of a tick, all piece selection and
//! protocol output happens inside the tick, and nothing in the core ever
//! blocks or awaits mid-tick. Hosts plug in transport, content storage and
//! a session key/value store through the traits in [`transport`],
//! [`storage`] and [`session`].

mod active_pieces;
mod bitfield;
mod chunked_buffer;
mod config;
mod engine;
mod metrics;
mod peer;
mod picker;
mod protocol;
mod rate;
mod session;
mod storage;
mod swarm;
#[cfg(test)]
mod test_support;
mod torrent;
mod transport;
mod unchoke;
mod uploader;

pub use bitfield::BitField;
pub use chunked_buffer::ChunkedBuffer;
pub use config::Config;
pub use engine::{Engine, EngineNotification, EventConsumer, TorrentStateEvent};
pub use metrics::{EngineMetrics, TickMetrics, TorrentTickStats};
pub use picker::PiecePriority;
pub use protocol::{Block, PeerMessage, BLOCK_LENGTH};
pub use session::{PartialPieceSnapshot, SessionStore, TorrentSnapshot};
pub use storage::{
    ContentStorage, ReadRequest, StorageErrorKind, StorageFeedback, WriteRequest,
};
pub use swarm::{DisconnectReason, PeerSource};
pub use transport::{
    event_queue, EventSink, SocketFactory, TcpSocket, TransportEvent, UdpSocket,
};

pub type InfoHash = [u8; 20];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Active,
    Stopped,
}

/// Immutable torrent geometry, known once the info dictionary is resolved.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl TorrentInfo {
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Piece length with consideration of the shorter last piece.
    pub fn piece_length_of(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_length);
        (end - start) as u32
    }

    pub fn hex_hash(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.piece_length > 0, "piece length must be non-zero");
        let expected = self.total_length.div_ceil(self.piece_length as u64);
        anyhow::ensure!(
            expected == self.piece_hashes.len() as u64,
            "{} piece hashes do not cover {} bytes with {} byte pieces",
            self.piece_hashes.len(),
            self.total_length,
            self.piece_length
        );
        Ok(())
    }
}
