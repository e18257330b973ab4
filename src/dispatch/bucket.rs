use std::time::Duration;

use chrono::{DateTime, Utc};

/// Continuous-refill token bucket. Time is always passed in, never read.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last: DateTime<Utc>,
}

impl TokenBucket {
    /// Starts full. `refill_per_sec` must be positive.
    pub fn new(capacity: f64, refill_per_sec: f64, now: DateTime<Utc>) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            tokens: capacity,
            last: now,
        }
    }

    pub fn per_second(n: u32, now: DateTime<Utc>) -> Self {
        Self::new(n as f64, n as f64, now)
    }

    pub fn per_minute(n: u32, now: DateTime<Utc>) -> Self {
        Self::new(n as f64, n as f64 / 60.0, now)
    }

    pub fn per_day(n: u64, now: DateTime<Utc>) -> Self {
        Self::new(n as f64, n as f64 / 86_400.0, now)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        if now <= self.last {
            return;
        }
        let elapsed = (now - self.last).num_milliseconds() as f64 / 1_000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
    }

    pub fn available(&mut self, now: DateTime<Utc>) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Requests above capacity are clamped to capacity, so they wait for a full
    /// bucket instead of never running.
    fn clamp(&self, n: f64) -> f64 {
        n.min(self.capacity)
    }

    pub fn has(&mut self, n: f64, now: DateTime<Utc>) -> bool {
        let n = self.clamp(n);
        self.available(now) >= n
    }

    pub fn try_take(&mut self, n: f64, now: DateTime<Utc>) -> bool {
        let n = self.clamp(n);
        if self.available(now) >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Unconditional withdrawal; the balance may go negative.
    pub fn debit(&mut self, n: f64, now: DateTime<Utc>) {
        self.refill(now);
        self.tokens -= n;
    }

    /// Give back an over-estimate. Never exceeds capacity.
    pub fn credit(&mut self, n: f64, now: DateTime<Utc>) {
        self.refill(now);
        self.tokens = (self.tokens + n).min(self.capacity);
    }

    /// Empty the bucket, e.g. after the upstream said "slow down".
    pub fn drain(&mut self, now: DateTime<Utc>) {
        self.refill(now);
        self.tokens = self.tokens.min(0.0);
    }

    /// How long until `n` tokens are available, rounded up to whole milliseconds.
    pub fn time_until(&mut self, n: f64, now: DateTime<Utc>) -> Duration {
        let n = self.clamp(n);
        let have = self.available(now);
        if have >= n {
            return Duration::ZERO;
        }
        let secs = ((n - have) / self.refill_per_sec).min(86_400.0 * 365.0);
        // Epsilon keeps float noise from adding a millisecond.
        let ms = (secs * 1_000.0 - 1e-6).ceil().max(1.0);
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 17, 0, 0, 0).unwrap()
    }

    #[test]
    fn per_minute_refills_continuously() {
        let mut b = TokenBucket::per_minute(2, t0());
        assert!(b.try_take(1.0, t0()));
        assert!(b.try_take(1.0, t0()));
        assert!(!b.try_take(1.0, t0()));
        assert!((b.time_until(1.0, t0()).as_secs_f64() - 30.0).abs() < 1e-2);

        let t = t0() + chrono::Duration::seconds(31);
        assert!(b.try_take(1.0, t));
    }

    #[test]
    fn debit_can_go_negative_and_drain_empties() {
        let mut b = TokenBucket::per_second(4, t0());
        b.debit(6.0, t0());
        assert!(b.available(t0()) < 0.0);
        assert_eq!(b.time_until(1.0, t0()), Duration::from_millis(750));

        let mut b = TokenBucket::per_second(4, t0());
        b.drain(t0());
        assert_eq!(b.available(t0()), 0.0);
        b.credit(100.0, t0());
        assert_eq!(b.available(t0()), 4.0);
    }

    #[test]
    fn oversized_requests_wait_for_full_bucket() {
        let mut b = TokenBucket::per_day(1_000, t0());
        assert!(b.has(5_000.0, t0()));
        assert!(b.try_take(5_000.0, t0()));
        assert!(!b.has(1.0, t0()));
    }
}
