// src/notify/antiflutter.rs
use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Per-kind cooldown gate to prevent alert spam.
/// - First alert of a kind is always allowed.
/// - Inside that kind's cooldown, further alerts of the same kind are suppressed.
/// - Other kinds are unaffected.
/// - State is updated explicitly via `record_alert` after a successful send.
#[derive(Debug, Clone, Default)]
pub struct AntiFlutter {
    cooldown: ChronoDuration,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl AntiFlutter {
    /// `cooldown_secs` < 0 is treated as 0 (no cooldown).
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.max(0)),
            last_alert: HashMap::new(),
        }
    }

    /// Check if we may alert at `now` for `kind`. Does NOT mutate state.
    pub fn should_alert(&self, kind: &str, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(kind) {
            None => true,
            Some(ts) => now.signed_duration_since(*ts) >= self.cooldown,
        }
    }

    pub fn record_alert(&mut self, kind: &str, now: DateTime<Utc>) {
        self.last_alert.insert(kind.to_string(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cooldown_is_per_kind() {
        let mut af = AntiFlutter::new(600);
        let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        assert!(af.should_alert("budget_exhausted", t0));
        af.record_alert("budget_exhausted", t0);

        let t1 = t0 + ChronoDuration::seconds(120);
        assert!(!af.should_alert("budget_exhausted", t1));
        assert!(af.should_alert("delivery_failed", t1));

        let t2 = t0 + ChronoDuration::seconds(600);
        assert!(af.should_alert("budget_exhausted", t2));
    }

    #[test]
    fn negative_cooldown_never_blocks() {
        let mut af = AntiFlutter::new(-5);
        let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        af.record_alert("queue_timeout", t0);
        assert!(af.should_alert("queue_timeout", t0));
    }
}
