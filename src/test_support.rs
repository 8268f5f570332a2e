//! In-memory transport, storage and session fakes shared by the tick loop
//! and engine tests. Everything is synchronous and deterministic.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::chunked_buffer::ChunkedBuffer;
use crate::protocol::{peek_frame, Frame, PeerMessage};
use crate::session::SessionStore;
use crate::storage::{ContentStorage, ReadRequest, StorageErrorKind, StorageFeedback, WriteRequest};
use crate::transport::{SocketFactory, TcpSocket, UdpSocket};
use crate::InfoHash;

pub fn test_addr(host: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), port)
}

pub fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Parse a raw outgoing byte stream back into messages, materializing PIECE
/// payloads, so tests can assert on what a peer was sent.
pub fn decode_frames(bytes: &Bytes) -> Vec<PeerMessage> {
    let mut buf = ChunkedBuffer::new();
    buf.push(bytes.clone());
    let mut out = Vec::new();
    while let Some((frame, frame_len)) = peek_frame(&buf).expect("emitted frames are well formed") {
        match frame {
            Frame::Message(message) => out.push(message),
            Frame::PieceBlock {
                index,
                begin,
                data_offset,
                data_len,
            } => out.push(PeerMessage::Piece {
                index,
                begin,
                block: buf.peek_bytes(data_offset, data_len).unwrap(),
            }),
        }
        buf.discard(frame_len);
    }
    assert!(buf.is_empty(), "trailing bytes after the last frame");
    out
}

#[derive(Debug, Default)]
struct SocketState {
    sent: BytesMut,
    closed: bool,
}

/// Records everything the engine writes to it.
#[derive(Debug, Clone, Default)]
pub struct LoopbackSocket {
    state: Arc<Mutex<SocketState>>,
}

impl LoopbackSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().unwrap().sent)
    }

    pub fn sent_messages(&self) -> Vec<PeerMessage> {
        decode_frames(&self.sent_bytes())
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl TcpSocket for LoopbackSocket {
    fn send(&mut self, bytes: Bytes) {
        self.state.lock().unwrap().sent.extend_from_slice(&bytes);
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    connects: Vec<(InfoHash, SocketAddr)>,
    backpressure: bool,
    bound_udp: Vec<u16>,
    listening: Vec<u16>,
}

/// Records connect attempts and the backpressure toggle.
#[derive(Debug, Clone, Default)]
pub struct LoopbackFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_attempts(&self) -> Vec<(InfoHash, SocketAddr)> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn backpressure(&self) -> bool {
        self.state.lock().unwrap().backpressure
    }
}

#[derive(Debug)]
pub struct LoopbackUdp;

impl UdpSocket for LoopbackUdp {
    fn send_to(&mut self, _dst: SocketAddr, _bytes: Bytes) {}
    fn close(&mut self) {}
}

impl SocketFactory for LoopbackFactory {
    fn connect_tcp(&mut self, info_hash: InfoHash, endpoint: SocketAddr) {
        self.state.lock().unwrap().connects.push((info_hash, endpoint));
    }

    fn bind_udp(&mut self, port: u16) -> Box<dyn UdpSocket> {
        self.state.lock().unwrap().bound_udp.push(port);
        Box::new(LoopbackUdp)
    }

    fn listen_tcp(&mut self, port: u16) {
        self.state.lock().unwrap().listening.push(port);
    }

    fn set_backpressure(&mut self, active: bool) {
        self.state.lock().unwrap().backpressure = active;
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: HashMap<String, Vec<u8>>,
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Vec<u8>) {
        self.values.insert(key.to_string(), value);
    }

    fn delete(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn keys(&self, prefix: &str) -> Vec<String> {
        self.values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// In-memory content storage that completes every request instantly; the
/// feedback still crosses the channel and is observed next tick, matching
/// the asynchronous contract.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    pieces: Arc<Mutex<HashMap<(InfoHash, u32), Bytes>>>,
    feedback: mpsc::Sender<StorageFeedback>,
    batch_calls: Arc<Mutex<usize>>,
    pub fail_writes: Arc<Mutex<usize>>,
}

impl MemoryStorage {
    pub fn new() -> (Self, mpsc::Receiver<StorageFeedback>) {
        let (tx, rx) = mpsc::channel(1024);
        (
            Self {
                pieces: Arc::new(Mutex::new(HashMap::new())),
                feedback: tx,
                batch_calls: Arc::new(Mutex::new(0)),
                fail_writes: Arc::new(Mutex::new(0)),
            },
            rx,
        )
    }

    pub fn piece(&self, info_hash: InfoHash, piece: u32) -> Option<Bytes> {
        self.pieces.lock().unwrap().get(&(info_hash, piece)).cloned()
    }

    pub fn written_count(&self) -> usize {
        self.pieces.lock().unwrap().len()
    }

    pub fn write_batch_calls(&self) -> usize {
        *self.batch_calls.lock().unwrap()
    }
}

impl ContentStorage for MemoryStorage {
    fn write_batch(&mut self, batch: Vec<WriteRequest>) {
        *self.batch_calls.lock().unwrap() += 1;
        for request in batch {
            let mut failures = self.fail_writes.lock().unwrap();
            let feedback = if *failures > 0 {
                *failures -= 1;
                StorageFeedback::WriteFailed {
                    info_hash: request.info_hash,
                    piece: request.piece,
                    kind: StorageErrorKind::Io,
                }
            } else {
                self.pieces
                    .lock()
                    .unwrap()
                    .insert((request.info_hash, request.piece), request.data);
                StorageFeedback::Written {
                    info_hash: request.info_hash,
                    piece: request.piece,
                }
            };
            let _ = self.feedback.try_send(feedback);
        }
    }

    fn read(&mut self, request: ReadRequest) {
        let stored = self
            .pieces
            .lock()
            .unwrap()
            .get(&(request.info_hash, request.piece))
            .cloned();
        let feedback = match stored {
            Some(bytes) => StorageFeedback::Data {
                info_hash: request.info_hash,
                piece: request.piece,
                bytes,
            },
            None => StorageFeedback::ReadFailed {
                info_hash: request.info_hash,
                piece: request.piece,
                kind: StorageErrorKind::MissingPiece,
            },
        };
        let _ = self.feedback.try_send(feedback);
    }
}
