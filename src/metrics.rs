use std::time::Duration;

/// Soft budget for one full engine tick. Overruns are recorded, never
/// enforced; the loop is cooperative.
pub const TICK_BUDGET: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone)]
pub struct TickMetrics {
    pub tick_num: u64,
    pub duration: Duration,
    pub budget_overrun: bool,
    pub events_drained: usize,
    pub hash_results_drained: usize,
    pub storage_events_drained: usize,
    pub disk_writes_flushed: usize,
    pub buffered_recv_bytes: usize,
    pub backpressure: bool,
}

/// Aggregate engine health counters, emitted once per tick.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub ticks: u64,
    pub max_tick_duration: Duration,
    pub budget_overruns: u64,
    pub last: TickMetrics,
}

impl EngineMetrics {
    pub fn record(&mut self, mut tick: TickMetrics) {
        tick.budget_overrun = tick.duration > TICK_BUDGET;
        self.ticks += 1;
        self.max_tick_duration = self.max_tick_duration.max(tick.duration);
        if tick.budget_overrun {
            self.budget_overruns += 1;
            tracing::warn!(took = ?tick.duration, tick = tick.tick_num, "Tick exceeded its soft budget");
        }
        self.last = tick;
    }
}

/// Per torrent, per tick counters feeding the state event and the stuck
/// piece diagnostics.
#[derive(Debug, Default, Clone)]
pub struct TorrentTickStats {
    pub partial_pieces: usize,
    pub full_pieces: usize,
    pub pending_pieces: usize,
    pub connected_peers: usize,
    pub outstanding_requests: u32,
    pub stuck_blocks_cancelled: u64,
    pub abandoned_pieces: u64,
    pub pieces_verified: u64,
    pub pieces_failed: u64,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{EngineMetrics, TickMetrics};

    #[test]
    fn records_overruns_and_maximum() {
        let mut metrics = EngineMetrics::default();
        metrics.record(TickMetrics {
            duration: Duration::from_millis(10),
            ..Default::default()
        });
        metrics.record(TickMetrics {
            duration: Duration::from_millis(80),
            ..Default::default()
        });
        metrics.record(TickMetrics {
            duration: Duration::from_millis(20),
            ..Default::default()
        });
        assert_eq!(metrics.ticks, 3);
        assert_eq!(metrics.budget_overruns, 1);
        assert_eq!(metrics.max_tick_duration, Duration::from_millis(80));
        assert!(!metrics.last.budget_overrun);
    }
}
