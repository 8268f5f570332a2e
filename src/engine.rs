use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::{EngineMetrics, TickMetrics};
use crate::picker::PiecePriority;
use crate::rate::TokenBucket;
use crate::session::{self, SessionStore, TorrentSnapshot};
use crate::storage::{ContentStorage, Hasher, StorageFeedback, WriteRequest};
use crate::swarm::PeerSource;
use crate::torrent::{TickContext, Torrent};
use crate::transport::{event_queue, EventSink, SocketFactory, TransportEvent, UdpSocket};
use crate::{InfoHash, TorrentInfo, UserState};

/// Per torrent status snapshot, emitted at most once per tick.
#[derive(Debug, Clone)]
pub struct TorrentStateEvent {
    pub info_hash: InfoHash,
    pub name: String,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub download_rate_bps: u64,
    pub upload_rate_bps: u64,
    pub piece_have_bitfield_hex: String,
    pub active_piece_indices: Vec<u32>,
    pub peer_count: usize,
    pub seed_count: u32,
    pub eta_seconds: Option<u64>,
    pub user_state: UserState,
    pub error: Option<String>,
    pub tick_num: u64,
}

/// Everything the engine surfaces to its host.
#[derive(Debug)]
pub enum EngineNotification {
    TorrentState(TorrentStateEvent),
    TorrentCompleted { info_hash: InfoHash },
    TorrentError { info_hash: InfoHash, message: String },
    /// A peer advertised its DHT port (PORT message).
    DhtNode { endpoint: SocketAddr },
    /// Datagram for the host's tracker/DHT integrations.
    Datagram { src: SocketAddr, bytes: Bytes },
    Tick(TickMetrics),
}

/// Host side sink for engine notifications. Any `FnMut` works; channel
/// senders are wrapped in a closure at the call site.
pub trait EventConsumer: Send + 'static {
    fn consume(&mut self, notification: EngineNotification);
}

impl<F: FnMut(EngineNotification) + Send + 'static> EventConsumer for F {
    fn consume(&mut self, notification: EngineNotification) {
        self(notification)
    }
}

/// Owner of the tick timer and every torrent. All core state is mutated
/// from the tick; transport adapters, the hash pool and storage only ever
/// push events into queues the tick drains.
pub struct Engine {
    config: Config,
    factory: Box<dyn SocketFactory>,
    storage: Box<dyn ContentStorage>,
    storage_rx: mpsc::Receiver<StorageFeedback>,
    session: Box<dyn SessionStore>,
    consumer: Box<dyn EventConsumer>,

    event_sink: EventSink,
    events_rx: flume::Receiver<TransportEvent>,
    hasher: Hasher,
    torrents: HashMap<InfoHash, Torrent>,

    upload_bucket: TokenBucket,
    backpressure: bool,
    tick_num: u64,
    pub metrics: EngineMetrics,
    cancellation_token: CancellationToken,
}

impl Engine {
    pub fn new(
        config: Config,
        factory: Box<dyn SocketFactory>,
        storage: Box<dyn ContentStorage>,
        storage_rx: mpsc::Receiver<StorageFeedback>,
        session: Box<dyn SessionStore>,
        consumer: impl EventConsumer,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let (event_sink, events_rx) = event_queue();
        let hasher = match config.hash_workers {
            Some(workers) => Hasher::new(workers),
            None => Hasher::auto(),
        };
        let now = Instant::now();
        let upload_rate = config.upload_rate_limit;
        let burst = upload_rate.max(crate::protocol::BLOCK_LENGTH as u64 * 8);
        Ok(Self {
            factory,
            storage,
            storage_rx,
            session,
            consumer: Box::new(consumer),
            event_sink,
            events_rx,
            hasher,
            torrents: HashMap::new(),
            upload_bucket: TokenBucket::new(upload_rate, burst, now),
            backpressure: false,
            tick_num: 0,
            metrics: EngineMetrics::default(),
            cancellation_token: CancellationToken::new(),
            config,
        })
    }

    /// Handle the transport adapters push their events through.
    pub fn event_sink(&self) -> EventSink {
        self.event_sink.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn listen_tcp(&mut self, port: u16) {
        self.factory.listen_tcp(port);
    }

    pub fn bind_udp(&mut self, port: u16) -> Box<dyn UdpSocket> {
        self.factory.bind_udp(port)
    }

    /// Register a torrent, restoring persisted session state when present.
    pub fn add_torrent(&mut self, info: TorrentInfo) -> anyhow::Result<()> {
        info.validate()?;
        let info_hash = info.info_hash;
        anyhow::ensure!(
            !self.torrents.contains_key(&info_hash),
            "torrent {} is already registered",
            info.hex_hash()
        );
        let now = Instant::now();
        let mut torrent = Torrent::new(info.clone(), &self.config, UserState::Active, now);
        if let Some(snapshot) = self.load_snapshot(info_hash, info.num_pieces()) {
            if let Err(e) = torrent.restore(&snapshot, now) {
                tracing::warn!(
                    torrent = %info.hex_hash(),
                    "Dropping corrupt session state, redownloading from scratch: {e}"
                );
                self.drop_session(info_hash);
                torrent = Torrent::new(info.clone(), &self.config, UserState::Active, now);
            } else {
                tracing::info!(
                    torrent = %info.hex_hash(),
                    partials = snapshot.partials.len(),
                    "Restored torrent session"
                );
            }
        }
        tracing::info!(torrent = %info.hex_hash(), name = %info.name, "Added torrent");
        self.torrents.insert(info_hash, torrent);
        Ok(())
    }

    pub fn remove_torrent(&mut self, info_hash: InfoHash, drop_session: bool) {
        if self.torrents.remove(&info_hash).is_some() && drop_session {
            self.drop_session(info_hash);
        }
    }

    pub fn pause_torrent(&mut self, info_hash: InfoHash) {
        let now = Instant::now();
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            torrent.set_user_state(UserState::Stopped, now);
        }
    }

    pub fn resume_torrent(&mut self, info_hash: InfoHash) {
        let now = Instant::now();
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            torrent.set_user_state(UserState::Active, now);
        }
    }

    pub fn set_piece_priority(&mut self, info_hash: InfoHash, piece: u32, priority: PiecePriority) {
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            torrent.set_piece_priority(piece, priority);
        }
    }

    /// Feed discovered peers in. Cold-start sources (tracker responses,
    /// DHT lookups, manual adds) may fill connection slots immediately;
    /// PEX and the rest wait for the next tick so per-tick work stays
    /// bounded.
    pub fn add_peer_candidates(
        &mut self,
        info_hash: InfoHash,
        endpoints: &[SocketAddr],
        source: PeerSource,
    ) {
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let added = torrent.add_candidates(endpoints, source);
        tracing::debug!(?source, added, "Added peer candidates");
        let cold_start = matches!(
            source,
            PeerSource::Tracker | PeerSource::Dht | PeerSource::Manual
        );
        if cold_start {
            let now = Instant::now();
            for endpoint in torrent.fill_peer_slots(&self.config, now) {
                self.factory.connect_tcp(info_hash, endpoint);
            }
        }
    }

    /// Drive the tick timer until cancelled. The tick body never awaits.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.config.tick_interval, "Engine started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Instant::now());
                }
                _ = self.cancellation_token.cancelled() => {
                    self.shutdown();
                    return Ok(());
                }
            }
        }
    }

    pub fn shutdown(&mut self) {
        tracing::info!("Engine shutting down");
        let hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for info_hash in hashes {
            self.persist_torrent(info_hash, true);
        }
    }

    /// One full engine tick. Public so hosts and tests can drive the
    /// engine with their own clock.
    pub fn tick(&mut self, now: Instant) {
        let started = Instant::now();
        self.tick_num += 1;
        let mut tick = TickMetrics {
            tick_num: self.tick_num,
            ..Default::default()
        };

        // 1. Route everything that queued up since the last tick.
        while let Ok(event) = self.events_rx.try_recv() {
            tick.events_drained += 1;
            self.route_transport_event(event, now);
        }
        while let Some(result) = self.hasher.try_recv() {
            tick.hash_results_drained += 1;
            if let Some(torrent) = self.torrents.get_mut(&result.info_hash) {
                torrent.on_hash_result(result);
            }
        }
        while let Ok(feedback) = self.storage_rx.try_recv() {
            tick.storage_events_drained += 1;
            let info_hash = match &feedback {
                StorageFeedback::Written { info_hash, .. }
                | StorageFeedback::WriteFailed { info_hash, .. }
                | StorageFeedback::Data { info_hash, .. }
                | StorageFeedback::ReadFailed { info_hash, .. } => *info_hash,
            };
            if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                torrent.on_storage_feedback(feedback);
            }
        }

        // 2. Backpressure before we burn the tick budget on parsing.
        tick.buffered_recv_bytes = self
            .torrents
            .values()
            .map(Torrent::buffered_recv_bytes)
            .sum();
        self.check_backpressure(tick.buffered_recv_bytes);
        tick.backpressure = self.backpressure;

        // 3. Tick every runnable torrent, collecting their outputs.
        let mut disk: Vec<WriteRequest> = Vec::new();
        let mut reads = Vec::new();
        let mut connects = Vec::new();
        let mut notifications = Vec::new();
        for torrent in self.torrents.values_mut() {
            if !torrent.is_runnable() {
                continue;
            }
            let mut ctx = TickContext {
                config: &self.config,
                hasher: &mut self.hasher,
                disk: &mut disk,
                reads: &mut reads,
                connects: &mut connects,
                global_upload_bucket: &mut self.upload_bucket,
                notifications: &mut notifications,
            };
            torrent.tick(now, &mut ctx);
        }

        // 4. One batched disk flush per tick; reads and connects follow.
        tick.disk_writes_flushed = disk.len();
        if !disk.is_empty() {
            self.storage.write_batch(disk);
        }
        for read in reads {
            self.storage.read(read);
        }
        for (info_hash, endpoint) in connects {
            self.factory.connect_tcp(info_hash, endpoint);
        }

        // 5. Persist whatever changed durably this tick.
        let dirty: Vec<InfoHash> = self
            .torrents
            .iter_mut()
            .filter_map(|(hash, torrent)| torrent.take_session_dirty().then_some(*hash))
            .collect();
        for info_hash in dirty {
            self.persist_torrent(info_hash, false);
        }

        for notification in notifications {
            self.consumer.consume(notification);
        }
        tick.duration = started.elapsed();
        self.metrics.record(tick);
        self.consumer
            .consume(EngineNotification::Tick(self.metrics.last.clone()));
    }

    fn route_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected {
                info_hash,
                endpoint,
                socket,
            } => match self.torrents.get_mut(&info_hash) {
                Some(torrent) => torrent.on_peer_connected(endpoint, socket, &self.config, now),
                None => {
                    let mut socket = socket;
                    socket.close();
                }
            },
            TransportEvent::ConnectFailed {
                info_hash,
                endpoint,
                reason,
            } => {
                tracing::debug!(%endpoint, reason, "Connect attempt failed");
                if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                    torrent.on_connect_failed(endpoint, now);
                }
            }
            TransportEvent::Inbound {
                info_hash,
                endpoint,
                socket,
            } => match self.torrents.get_mut(&info_hash) {
                Some(torrent) => torrent.on_inbound_peer(endpoint, socket, &self.config, now),
                None => {
                    let mut socket = socket;
                    socket.close();
                }
            },
            TransportEvent::Data {
                info_hash,
                endpoint,
                bytes,
            } => {
                if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                    torrent.on_peer_data(endpoint, bytes, now);
                }
            }
            TransportEvent::Closed {
                info_hash,
                endpoint,
            } => {
                if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                    torrent.on_socket_closed(endpoint, now);
                }
            }
            TransportEvent::Datagram { src, bytes } => {
                self.consumer
                    .consume(EngineNotification::Datagram { src, bytes });
            }
        }
    }

    /// Hysteresis on the aggregate receive buffers: pause reads above the
    /// high water mark, resume below the low one. Data is never dropped.
    fn check_backpressure(&mut self, buffered: usize) {
        if !self.backpressure && buffered > self.config.backpressure_high_water {
            tracing::warn!(buffered, "Engaging transport backpressure");
            self.backpressure = true;
            self.factory.set_backpressure(true);
        } else if self.backpressure && buffered < self.config.backpressure_low_water {
            tracing::info!(buffered, "Releasing transport backpressure");
            self.backpressure = false;
            self.factory.set_backpressure(false);
        }
    }

    fn load_snapshot(&self, info_hash: InfoHash, num_pieces: u32) -> Option<TorrentSnapshot> {
        let state = self.session.get(&session::state_key(info_hash));
        let bitfield = self.session.get(&session::bitfield_key(info_hash));
        let partials = self.session.get(&session::partials_key(info_hash));
        if state.is_none() && bitfield.is_none() && partials.is_none() {
            return None;
        }
        let user_state = state
            .as_deref()
            .map(session::decode_user_state)
            .transpose()
            .unwrap_or_else(|e| {
                tracing::warn!("Corrupt user state in session store: {e}");
                None
            })
            .unwrap_or(UserState::Active);
        let bitfield = bitfield
            .unwrap_or_else(|| vec![0; (num_pieces as usize).div_ceil(8).max(1)]);
        let partials = partials
            .as_deref()
            .map(session::decode_partials)
            .transpose()
            .unwrap_or_else(|e| {
                tracing::warn!("Corrupt partial snapshots in session store: {e}");
                None
            })
            .unwrap_or_default();
        Some(TorrentSnapshot {
            user_state,
            bitfield,
            partials,
        })
    }

    fn drop_session(&mut self, info_hash: InfoHash) {
        self.session.delete(&session::state_key(info_hash));
        self.session.delete(&session::bitfield_key(info_hash));
        self.session.delete(&session::partials_key(info_hash));
    }

    fn persist_torrent(&mut self, info_hash: InfoHash, include_partials: bool) {
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let snapshot = torrent.snapshot();
        self.session.set(
            &session::state_key(info_hash),
            session::encode_user_state(snapshot.user_state),
        );
        self.session
            .set(&session::bitfield_key(info_hash), snapshot.bitfield);
        if include_partials || snapshot.user_state == UserState::Stopped {
            self.session.set(
                &session::partials_key(info_hash),
                session::encode_partials(snapshot.partials),
            );
        }
    }
}
