use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Where a candidate endpoint was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Lsd,
    Manual,
    Incoming,
}

impl PeerSource {
    fn bit(self) -> u8 {
        match self {
            PeerSource::Tracker => 1 << 0,
            PeerSource::Dht => 1 << 1,
            PeerSource::Pex => 1 << 2,
            PeerSource::Lsd => 1 << 3,
            PeerSource::Manual => 1 << 4,
            PeerSource::Incoming => 1 << 5,
        }
    }

    fn score(self) -> i32 {
        match self {
            PeerSource::Tracker => 10,
            PeerSource::Dht => -5,
            PeerSource::Pex => 0,
            PeerSource::Lsd => 15,
            PeerSource::Manual => 20,
            PeerSource::Incoming => 5,
        }
    }

    const ALL: [PeerSource; 6] = [
        PeerSource::Tracker,
        PeerSource::Dht,
        PeerSource::Pex,
        PeerSource::Lsd,
        PeerSource::Manual,
        PeerSource::Incoming,
    ];
}

/// Set of sources an endpoint was reported by. Duplicate adds union here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSet(u8);

impl SourceSet {
    pub fn add(&mut self, source: PeerSource) {
        self.0 |= source.bit();
    }

    pub fn contains(&self, source: PeerSource) -> bool {
        self.0 & source.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PeerSource> + '_ {
        PeerSource::ALL.into_iter().filter(|s| self.contains(*s))
    }

    fn best_score(&self) -> i32 {
        self.iter().map(PeerSource::score).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Remote,
    Idle,
    Malformed,
    Timeout,
    Requested,
}

#[derive(Debug)]
pub struct SwarmPeer {
    pub endpoint: SocketAddr,
    pub sources: SourceSet,
    pub state: PeerState,
    pub fail_count: u32,
    pub last_attempt_at: Option<Instant>,
    pub last_connected_at: Option<Instant>,
    pub last_disconnect_reason: Option<DisconnectReason>,
    /// Disconnects within 30 seconds of connecting.
    pub quick_disconnect_count: u32,
    pub downloaded_total: u64,
    penalty: i32,
    cached_score: Option<i32>,
    score_version: u32,
}

impl SwarmPeer {
    pub fn penalty(&self) -> i32 {
        self.penalty
    }

    fn new(endpoint: SocketAddr, source: PeerSource) -> Self {
        let mut sources = SourceSet::default();
        sources.add(source);
        Self {
            endpoint,
            sources,
            state: PeerState::Idle,
            fail_count: 0,
            last_attempt_at: None,
            last_connected_at: None,
            last_disconnect_reason: None,
            quick_disconnect_count: 0,
            downloaded_total: 0,
            penalty: 0,
            cached_score: None,
            score_version: 0,
        }
    }

    fn compute_score(&self) -> i32 {
        let mut score = 100;
        score += match self.endpoint.port() {
            0 => -1000,
            1 | 25 | 53 | 113 => -500,
            _ => 0,
        };
        if self.last_connected_at.is_some() {
            score += 50;
        }
        score -= self.fail_count as i32 * 20;
        // log-scale history bonus, saturates around 16 MiB downloaded
        if let Some(magnitude) = self.downloaded_total.checked_ilog2() {
            score += ((magnitude as i32 + 1) * 2).min(50);
        }
        score += self.sources.best_score();
        score -= (self.quick_disconnect_count as i32 * 10).min(30);
        score - self.penalty
    }
}

const CANDIDATE_CACHE_SIZE: usize = 20;
const MAX_SCAN_PER_REPLENISH: usize = 300;
const QUICK_DISCONNECT_WINDOW: Duration = Duration::from_secs(30);

/// Directory of every peer endpoint known for one torrent, with connection
/// candidate selection. Entries persist across disconnects; the directory
/// is the memory that backoff and scoring are computed from.
#[derive(Debug)]
pub struct Swarm {
    peers: Vec<SwarmPeer>,
    index: HashMap<SocketAddr, usize>,
    /// Candidate indices ascending by nudged score; `pop()` yields the best.
    candidate_cache: Vec<usize>,
    cache_valid: bool,
    round_robin_pos: usize,
    score_version: u32,
    min_reconnect_time: Duration,
}

impl Swarm {
    pub fn new(min_reconnect_time: Duration) -> Self {
        Self {
            peers: Vec::new(),
            index: HashMap::new(),
            candidate_cache: Vec::new(),
            cache_valid: false,
            round_robin_pos: 0,
            score_version: 0,
            min_reconnect_time,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, endpoint: SocketAddr) -> Option<&SwarmPeer> {
        self.index.get(&endpoint).map(|i| &self.peers[*i])
    }

    fn get_mut(&mut self, endpoint: SocketAddr) -> Option<&mut SwarmPeer> {
        self.index.get(&endpoint).map(|i| &mut self.peers[*i])
    }

    /// Create or update a directory entry. Idempotent on endpoint:
    /// duplicates union their source sets and keep the existing history.
    pub fn add_candidate(&mut self, endpoint: SocketAddr, source: PeerSource) -> bool {
        if let Some(peer) = self.get_mut(endpoint) {
            let before = peer.sources;
            peer.sources.add(source);
            if peer.sources != before {
                peer.cached_score = None;
            }
            return false;
        }
        let idx = self.peers.len();
        self.peers.push(SwarmPeer::new(endpoint, source));
        self.index.insert(endpoint, idx);
        self.invalidate_candidate_cache();
        true
    }

    pub fn mark_connecting(&mut self, endpoint: SocketAddr, now: Instant) {
        if let Some(peer) = self.get_mut(endpoint) {
            peer.state = PeerState::Connecting;
            peer.last_attempt_at = Some(now);
        }
    }

    pub fn on_connect_success(&mut self, endpoint: SocketAddr, now: Instant) {
        self.bump_score_version();
        let Some(peer) = self.get_mut(endpoint) else {
            return;
        };
        peer.state = PeerState::Connected;
        peer.fail_count = 0;
        peer.last_connected_at = Some(now);
        peer.cached_score = None;
    }

    pub fn on_connect_failure(&mut self, endpoint: SocketAddr, now: Instant) {
        self.bump_score_version();
        if let Some(peer) = self.get_mut(endpoint) {
            peer.state = PeerState::Failed;
            peer.fail_count += 1;
            peer.last_attempt_at = Some(now);
        }
        self.invalidate_candidate_cache();
    }

    pub fn on_disconnect(
        &mut self,
        endpoint: SocketAddr,
        session_duration: Duration,
        reason: DisconnectReason,
        now: Instant,
    ) {
        self.bump_score_version();
        if let Some(peer) = self.get_mut(endpoint) {
            peer.state = PeerState::Idle;
            peer.last_attempt_at = Some(now);
            peer.last_disconnect_reason = Some(reason);
            if session_duration < QUICK_DISCONNECT_WINDOW {
                peer.quick_disconnect_count += 1;
            }
        }
        self.invalidate_candidate_cache();
    }

    pub fn record_downloaded(&mut self, endpoint: SocketAddr, bytes: u64) {
        if let Some(peer) = self.get_mut(endpoint) {
            peer.downloaded_total += bytes;
        }
    }

    /// Score penalty for misbehavior (malformed frames, hash mismatch
    /// contributions).
    pub fn apply_penalty(&mut self, endpoint: SocketAddr, points: i32) {
        self.bump_score_version();
        if let Some(peer) = self.get_mut(endpoint) {
            peer.penalty += points;
        }
    }

    pub fn invalidate_candidate_cache(&mut self) {
        self.cache_valid = false;
    }

    fn bump_score_version(&mut self) {
        self.score_version += 1;
    }

    fn score_of(&mut self, idx: usize) -> i32 {
        let version = self.score_version;
        let peer = &mut self.peers[idx];
        if peer.score_version != version {
            peer.cached_score = None;
            peer.score_version = version;
        }
        match peer.cached_score {
            Some(score) => score,
            None => {
                let score = peer.compute_score();
                peer.cached_score = Some(score);
                score
            }
        }
    }

    fn is_eligible(&self, idx: usize, now: Instant) -> bool {
        let peer = &self.peers[idx];
        if !matches!(peer.state, PeerState::Idle | PeerState::Failed) {
            return false;
        }
        match peer.last_attempt_at {
            None => true,
            Some(at) => {
                let backoff = self.min_reconnect_time * (peer.fail_count + 1);
                now.saturating_duration_since(at) >= backoff
            }
        }
    }

    /// One connection candidate, best score first. Internally backed by a
    /// small cache replenished only when empty or invalidated, scanning at
    /// most 300 directory entries round-robin per replenish.
    pub fn next_connect_peer(&mut self, now: Instant) -> Option<SocketAddr> {
        if !self.cache_valid || self.candidate_cache.is_empty() {
            self.replenish_candidates(now);
        }
        while let Some(idx) = self.candidate_cache.pop() {
            // eligibility may have changed since the cache was built
            if self.is_eligible(idx, now) {
                return Some(self.peers[idx].endpoint);
            }
        }
        None
    }

    fn replenish_candidates(&mut self, now: Instant) {
        self.candidate_cache.clear();
        self.cache_valid = true;
        if self.peers.is_empty() {
            return;
        }
        let scan = self.peers.len().min(MAX_SCAN_PER_REPLENISH);
        // (nudged score, index), ascending so pop() returns the best
        let mut best: Vec<(i32, usize)> = Vec::with_capacity(CANDIDATE_CACHE_SIZE);
        for step in 0..scan {
            let idx = (self.round_robin_pos + step) % self.peers.len();
            if !self.is_eligible(idx, now) {
                continue;
            }
            let score = self.score_of(idx) + rand::random_range(0..10);
            if best.len() == CANDIDATE_CACHE_SIZE && score <= best[0].0 {
                continue;
            }
            let pos = best.partition_point(|(s, _)| *s < score);
            best.insert(pos, (score, idx));
            if best.len() > CANDIDATE_CACHE_SIZE {
                best.remove(0);
            }
        }
        self.round_robin_pos = (self.round_robin_pos + scan) % self.peers.len();
        self.candidate_cache.extend(best.into_iter().map(|(_, idx)| idx));
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::{Duration, Instant};

    use super::{DisconnectReason, PeerSource, PeerState, Swarm};

    fn addr(host: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), port)
    }

    fn swarm() -> Swarm {
        Swarm::new(Duration::from_secs(60))
    }

    #[test]
    fn add_candidate_is_idempotent_on_endpoint() {
        let mut swarm = swarm();
        let endpoint = addr(1, 6881);
        assert!(swarm.add_candidate(endpoint, PeerSource::Tracker));
        assert!(!swarm.add_candidate(endpoint, PeerSource::Pex));
        assert_eq!(swarm.len(), 1);
        let peer = swarm.get(endpoint).unwrap();
        assert!(peer.sources.contains(PeerSource::Tracker));
        assert!(peer.sources.contains(PeerSource::Pex));
        assert!(!peer.sources.contains(PeerSource::Dht));
    }

    #[test]
    fn next_connect_prefers_higher_scores() {
        let mut swarm = swarm();
        let now = Instant::now();
        let good = addr(1, 6881);
        let suspicious = addr(2, 53);
        swarm.add_candidate(good, PeerSource::Tracker);
        swarm.add_candidate(suspicious, PeerSource::Tracker);
        assert_eq!(swarm.next_connect_peer(now), Some(good));
        swarm.mark_connecting(good, now);
        assert_eq!(swarm.next_connect_peer(now), Some(suspicious));
        swarm.mark_connecting(suspicious, now);
        assert_eq!(swarm.next_connect_peer(now), None);
    }

    #[test]
    fn backoff_scales_with_failures() {
        let mut swarm = swarm();
        let now = Instant::now();
        let endpoint = addr(1, 6881);
        swarm.add_candidate(endpoint, PeerSource::Dht);
        assert_eq!(swarm.next_connect_peer(now), Some(endpoint));
        swarm.mark_connecting(endpoint, now);
        swarm.on_connect_failure(endpoint, now);
        assert_eq!(swarm.get(endpoint).unwrap().fail_count, 1);

        // one failure: (1 + 1) * 60s backoff
        assert_eq!(swarm.next_connect_peer(now + Duration::from_secs(119)), None);
        let later = now + Duration::from_secs(120);
        assert_eq!(swarm.next_connect_peer(later), Some(endpoint));
    }

    #[test]
    fn connect_success_resets_failures() {
        let mut swarm = swarm();
        let now = Instant::now();
        let endpoint = addr(1, 6881);
        swarm.add_candidate(endpoint, PeerSource::Manual);
        swarm.mark_connecting(endpoint, now);
        swarm.on_connect_failure(endpoint, now);
        swarm.on_connect_success(endpoint, now);
        let peer = swarm.get(endpoint).unwrap();
        assert_eq!(peer.fail_count, 0);
        assert_eq!(peer.state, PeerState::Connected);
        assert!(peer.last_connected_at.is_some());
    }

    #[test]
    fn quick_disconnects_are_counted_and_penalized() {
        let mut swarm = swarm();
        let now = Instant::now();
        let flaky = addr(1, 6881);
        let solid = addr(2, 6881);
        swarm.add_candidate(flaky, PeerSource::Tracker);
        swarm.add_candidate(solid, PeerSource::Tracker);
        for peer in [flaky, solid] {
            swarm.mark_connecting(peer, now);
            swarm.on_connect_success(peer, now);
        }
        swarm.on_disconnect(flaky, Duration::from_secs(5), DisconnectReason::Remote, now);
        swarm.on_disconnect(solid, Duration::from_secs(300), DisconnectReason::Remote, now);
        assert_eq!(swarm.get(flaky).unwrap().quick_disconnect_count, 1);
        assert_eq!(swarm.get(solid).unwrap().quick_disconnect_count, 0);

        // after backoff both are eligible again; the solid one wins
        let later = now + Duration::from_secs(61);
        assert_eq!(swarm.next_connect_peer(later), Some(solid));
    }

    #[test]
    fn penalties_lower_candidate_priority() {
        let mut swarm = swarm();
        let now = Instant::now();
        let bad = addr(1, 6881);
        let neutral = addr(2, 6881);
        swarm.add_candidate(bad, PeerSource::Tracker);
        swarm.add_candidate(neutral, PeerSource::Tracker);
        swarm.apply_penalty(bad, 200);
        assert_eq!(swarm.next_connect_peer(now), Some(neutral));
    }
}
