use std::fmt::Debug;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::InfoHash;

/// Byte-stream half of a fully handshaken peer connection. Implemented by
/// the host's transport adapter; the engine only ever writes whole frames
/// and closes. Inbound bytes arrive as [`TransportEvent::Data`].
pub trait TcpSocket: Send + Debug {
    fn send(&mut self, bytes: Bytes);
    fn close(&mut self);
}

/// Datagram socket for peer-source integrations (trackers, DHT). Inbound
/// datagrams arrive as [`TransportEvent::Datagram`].
pub trait UdpSocket: Send + Debug {
    fn send_to(&mut self, dst: SocketAddr, bytes: Bytes);
    fn close(&mut self);
}

/// Factory the engine drives to open connections and throttle reads.
///
/// `connect_tcp` starts a connect plus BitTorrent handshake; the result
/// surfaces later as `Connected` or `ConnectFailed` on the event queue.
/// Listening sockets deliver handshaken inbound peers as `Inbound`.
pub trait SocketFactory: Send + Debug {
    fn connect_tcp(&mut self, info_hash: InfoHash, endpoint: SocketAddr);
    fn bind_udp(&mut self, port: u16) -> Box<dyn UdpSocket>;
    fn listen_tcp(&mut self, port: u16);
    /// Pause or resume reads on every socket. The engine never drops
    /// buffered data; it only throttles the producer.
    fn set_backpressure(&mut self, active: bool);
}

/// Everything the transport pushes into the engine. Drained at the start
/// of each tick; ordering per socket is the delivery order.
#[derive(Debug)]
pub enum TransportEvent {
    Connected {
        info_hash: InfoHash,
        endpoint: SocketAddr,
        socket: Box<dyn TcpSocket>,
    },
    ConnectFailed {
        info_hash: InfoHash,
        endpoint: SocketAddr,
        reason: String,
    },
    /// Inbound connection that already completed its handshake.
    Inbound {
        info_hash: InfoHash,
        endpoint: SocketAddr,
        socket: Box<dyn TcpSocket>,
    },
    Data {
        info_hash: InfoHash,
        endpoint: SocketAddr,
        bytes: Bytes,
    },
    Closed {
        info_hash: InfoHash,
        endpoint: SocketAddr,
    },
    Datagram {
        src: SocketAddr,
        bytes: Bytes,
    },
}

/// Cloneable handle transport adapters push events through.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: flume::Sender<TransportEvent>,
}

impl EventSink {
    pub fn push(&self, event: TransportEvent) {
        // the queue is unbounded; overload is handled by backpressure, not
        // by dropping events
        let _ = self.tx.send(event);
    }
}

pub fn event_queue() -> (EventSink, flume::Receiver<TransportEvent>) {
    let (tx, rx) = flume::unbounded();
    (EventSink { tx }, rx)
}
