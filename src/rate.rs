use std::time::{Duration, Instant};

/// Outcome of a token bucket consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    Granted,
    /// Not enough tokens; retry after the given duration.
    RetryAfter(Duration),
}

/// Byte rate limiter with burst capacity. Rate `0` means unlimited.
#[derive(Debug)]
pub struct TokenBucket {
    rate_bps: u64,
    burst_bytes: u64,
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_bps: u64, burst_bytes: u64, now: Instant) -> Self {
        Self {
            rate_bps,
            burst_bytes,
            tokens: burst_bytes,
            last_refill: now,
        }
    }

    pub fn set_rate(&mut self, rate_bps: u64, burst_bytes: u64) {
        self.rate_bps = rate_bps;
        self.burst_bytes = burst_bytes;
        self.tokens = self.tokens.min(burst_bytes);
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_bps == 0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = (elapsed.as_millis() as u64).saturating_mul(self.rate_bps) / 1000;
        if earned > 0 {
            self.tokens = self.burst_bytes.min(self.tokens + earned);
            self.last_refill = now;
        }
    }

    /// Return tokens taken by an operation that did not happen after all.
    pub fn refund(&mut self, n: u64) {
        if self.rate_bps == 0 {
            return;
        }
        self.tokens = self.burst_bytes.min(self.tokens + n);
    }

    pub fn try_consume(&mut self, n: u64, now: Instant) -> Consume {
        if self.rate_bps == 0 {
            return Consume::Granted;
        }
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            return Consume::Granted;
        }
        let missing = n - self.tokens;
        let millis = (missing * 1000).div_ceil(self.rate_bps);
        Consume::RetryAfter(Duration::from_millis(millis))
    }
}

/// Exponentially weighted moving average of a byte rate, fed once per tick
/// with the bytes observed since the previous sample.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    half_life: Duration,
    rate_bps: f64,
    last_sample: Option<Instant>,
}

impl RateEstimator {
    pub fn new(half_life: Duration) -> Self {
        Self {
            half_life,
            rate_bps: 0.0,
            last_sample: None,
        }
    }

    pub fn record(&mut self, bytes: u64, now: Instant) {
        let Some(last) = self.last_sample else {
            self.last_sample = Some(now);
            return;
        };
        let dt = now.saturating_duration_since(last).as_secs_f64();
        if dt <= 0.0 {
            return;
        }
        self.last_sample = Some(now);
        let instant_rate = bytes as f64 / dt;
        let decay = 0.5f64.powf(dt / self.half_life.as_secs_f64());
        self.rate_bps = self.rate_bps * decay + instant_rate * (1.0 - decay);
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.rate_bps as u64
    }

    /// Force the estimate; used when restoring state and in tests.
    pub fn set_bytes_per_second(&mut self, rate: u64) {
        self.rate_bps = rate as f64;
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{Consume, RateEstimator, TokenBucket};

    #[test]
    fn zero_rate_is_unlimited() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(0, 0, now);
        assert_eq!(bucket.try_consume(u64::MAX, now), Consume::Granted);
    }

    #[test]
    fn burst_then_throttle() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1000, 500, now);
        assert_eq!(bucket.try_consume(500, now), Consume::Granted);
        let Consume::RetryAfter(wait) = bucket.try_consume(250, now) else {
            panic!("bucket should be empty");
        };
        assert_eq!(wait, Duration::from_millis(250));
        // quarter of a second refills a quarter of the rate
        let later = now + Duration::from_millis(250);
        assert_eq!(bucket.try_consume(250, later), Consume::Granted);
    }

    #[test]
    fn refill_caps_at_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1_000_000, 100, now);
        assert_eq!(bucket.try_consume(100, now), Consume::Granted);
        let later = now + Duration::from_secs(60);
        assert_eq!(bucket.try_consume(100, later), Consume::Granted);
        assert!(matches!(bucket.try_consume(101, later), Consume::RetryAfter(_)));
    }

    #[test]
    fn estimator_converges_to_steady_rate() {
        let mut now = Instant::now();
        let mut est = RateEstimator::new(Duration::from_secs(5));
        est.record(0, now);
        for _ in 0..200 {
            now += Duration::from_millis(100);
            est.record(1000, now);
        }
        let rate = est.bytes_per_second();
        assert!((9_000..=10_500).contains(&rate), "rate was {rate}");
    }

    #[test]
    fn estimator_decays_when_idle() {
        let mut now = Instant::now();
        let mut est = RateEstimator::new(Duration::from_secs(5));
        est.record(0, now);
        for _ in 0..100 {
            now += Duration::from_millis(100);
            est.record(10_000, now);
        }
        let busy = est.bytes_per_second();
        for _ in 0..100 {
            now += Duration::from_millis(100);
            est.record(0, now);
        }
        assert!(est.bytes_per_second() < busy / 3);
    }
}
