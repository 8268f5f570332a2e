use std::time::Duration;

use crate::protocol::BLOCK_LENGTH;

/// Engine wide configuration. Defaults are tuned for a mobile host; every
/// knob the tick loop, picker or uploader consults lives here so embedders
/// can override it in one place.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cadence of the engine tick timer.
    pub tick_interval: Duration,
    /// Stuck piece sweep runs every this many ticks.
    pub stuck_sweep_ticks: u64,
    /// A block request older than this is cancelled and re-requested.
    pub block_request_timeout: Duration,
    /// A piece active longer than this with less than half its blocks is
    /// dropped from the manager entirely.
    pub piece_abandon_timeout: Duration,

    /// Initial per peer request pipeline depth.
    pub pipeline_initial: u32,
    pub pipeline_min: u32,
    pub pipeline_max: u32,
    /// Additive pipeline growth per saturated tick.
    pub pipeline_growth: u32,
    /// A peer is "fast" if its rate downloads a whole piece within this.
    pub fast_piece_window: Duration,
    /// Half-life of the per peer transfer rate EWMA.
    pub rate_half_life: Duration,

    pub choke_interval: Duration,
    pub optimistic_interval: Duration,
    /// Upload slots including the optimistic one. 0 = pure leecher.
    pub max_upload_slots: usize,
    pub max_upload_queue_per_peer: usize,
    pub max_upload_queue: usize,
    /// Global upload rate limit in bytes per second. 0 = unlimited.
    pub upload_rate_limit: u64,
    /// Per torrent upload rate limit in bytes per second. 0 = unlimited.
    pub torrent_upload_rate_limit: u64,

    pub max_connections_per_torrent: usize,
    /// Base reconnect backoff; scaled by `fail_count + 1` per peer.
    pub min_reconnect_time: Duration,
    /// Send a keepalive after this much outbound silence.
    pub keepalive_interval: Duration,
    /// Disconnect a peer after this much inbound silence.
    pub idle_timeout: Duration,

    /// Pause transport reads above this many aggregate buffered bytes.
    pub backpressure_high_water: usize,
    /// Resume transport reads below this.
    pub backpressure_low_water: usize,

    /// Hash worker threads. `None` sizes the pool from the machine's
    /// physical cores; `Some(0)` hashes inline on the engine thread.
    pub hash_workers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            stuck_sweep_ticks: 5,
            block_request_timeout: Duration::from_secs(10),
            piece_abandon_timeout: Duration::from_secs(30),
            pipeline_initial: 64,
            pipeline_min: 8,
            pipeline_max: 500,
            pipeline_growth: 16,
            fast_piece_window: Duration::from_secs(30),
            rate_half_life: Duration::from_secs(5),
            choke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            max_upload_slots: 4,
            max_upload_queue_per_peer: 256,
            max_upload_queue: 4096,
            upload_rate_limit: 0,
            torrent_upload_rate_limit: 0,
            max_connections_per_torrent: 50,
            min_reconnect_time: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(120),
            backpressure_high_water: 16 * 1024 * 1024,
            backpressure_low_water: 4 * 1024 * 1024,
            hash_workers: None,
        }
    }
}

impl Config {
    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.tick_interval.is_zero(), "tick interval must be non-zero");
        anyhow::ensure!(self.stuck_sweep_ticks > 0, "stuck sweep cadence must be non-zero");
        anyhow::ensure!(
            self.pipeline_min <= self.pipeline_initial && self.pipeline_initial <= self.pipeline_max,
            "pipeline bounds must satisfy min <= initial <= max"
        );
        anyhow::ensure!(self.pipeline_min > 0, "pipeline depth must stay positive");
        anyhow::ensure!(
            self.backpressure_low_water < self.backpressure_high_water,
            "backpressure low water {} must be below high water {}",
            self.backpressure_low_water,
            self.backpressure_high_water
        );
        anyhow::ensure!(
            self.backpressure_high_water >= BLOCK_LENGTH as usize,
            "high water mark cannot be smaller than one block"
        );
        anyhow::ensure!(
            self.max_upload_queue_per_peer <= self.max_upload_queue,
            "per peer upload queue cannot exceed the aggregate bound"
        );
        anyhow::ensure!(
            !self.block_request_timeout.is_zero() && !self.piece_abandon_timeout.is_zero(),
            "request timeouts must be non-zero"
        );
        anyhow::ensure!(
            self.max_connections_per_torrent > 0,
            "at least one connection per torrent is required"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut config = Config::default();
        config.backpressure_low_water = config.backpressure_high_water;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_pipeline_bounds() {
        let mut config = Config::default();
        config.pipeline_initial = config.pipeline_max + 1;
        assert!(config.validate().is_err());
        let mut config = Config::default();
        config.pipeline_min = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_tick() {
        let mut config = Config::default();
        config.tick_interval = std::time::Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
