//! Daily spend ceiling for summarizer calls.
//!
//! Spend is tracked per UTC day and, when a path is given, persisted as JSON
//! (tmp file + rename) so a restart does not hand out a fresh budget.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BudgetState {
    day: NaiveDate,
    spent_usd: f64,
}

impl BudgetState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            spent_usd: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct DailyBudget {
    /// `None` means no ceiling.
    ceiling_usd: Option<f64>,
    state: BudgetState,
    path: Option<PathBuf>,
    warned: bool,
}

impl DailyBudget {
    /// In-memory budget, nothing persisted.
    pub fn new(ceiling_usd: Option<f64>, now: DateTime<Utc>) -> Self {
        Self {
            ceiling_usd,
            state: BudgetState::fresh(now),
            path: None,
            warned: false,
        }
    }

    /// Budget persisted at `path`. A missing or unreadable file starts from zero.
    pub fn load(path: impl Into<PathBuf>, ceiling_usd: Option<f64>, now: DateTime<Utc>) -> Self {
        let path = path.into();
        let state = match read_state(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BudgetState::fresh(now),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "budget state unreadable, starting from zero");
                BudgetState::fresh(now)
            }
        };
        let mut b = Self {
            ceiling_usd,
            state,
            path: Some(path),
            warned: false,
        };
        b.roll(now);
        b
    }

    pub fn ceiling(&self) -> Option<f64> {
        self.ceiling_usd
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.state.day != today {
            tracing::info!(
                previous_day = %self.state.day,
                spent_usd = self.state.spent_usd,
                "daily budget reset"
            );
            self.state = BudgetState::fresh(now);
            self.warned = false;
            self.persist();
        }
    }

    pub fn spent(&mut self, now: DateTime<Utc>) -> f64 {
        self.roll(now);
        self.state.spent_usd
    }

    pub fn remaining(&mut self, now: DateTime<Utc>) -> Option<f64> {
        let spent = self.spent(now);
        self.ceiling_usd.map(|c| (c - spent).max(0.0))
    }

    /// True once today's spend reached the ceiling. Warns once per day at 80%.
    pub fn is_exhausted(&mut self, now: DateTime<Utc>) -> bool {
        self.roll(now);
        let Some(ceiling) = self.ceiling_usd else {
            return false;
        };
        let spent = self.state.spent_usd;
        if spent >= ceiling {
            return true;
        }
        if spent >= ceiling * 0.8 && !self.warned {
            tracing::warn!(
                target: "operator",
                spent_usd = spent,
                ceiling_usd = ceiling,
                "approaching daily budget ceiling (80%+)"
            );
            self.warned = true;
        }
        false
    }

    pub fn record(&mut self, cost_usd: f64, now: DateTime<Utc>) {
        self.roll(now);
        self.state.spent_usd += cost_usd.max(0.0);
        gauge!("dispatch_spend_usd").set(self.state.spent_usd);
        self.persist();
    }

    fn persist(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = write_state(path, &self.state) {
                tracing::warn!(error = %e, path = %path.display(), "failed to persist budget state");
            }
        }
    }
}

fn read_state(path: &Path) -> io::Result<BudgetState> {
    let s = fs::read_to_string(path)?;
    serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_state(path: &Path, state: &BudgetState) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string(state).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(json.as_bytes())?;
    f.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 17, 22, 0, 0).unwrap()
    }

    #[test]
    fn exhausted_until_utc_midnight() {
        let mut b = DailyBudget::new(Some(0.10), t0());
        assert!(!b.is_exhausted(t0()));
        b.record(0.06, t0());
        assert!(!b.is_exhausted(t0()));
        b.record(0.05, t0());
        assert!(b.is_exhausted(t0() + Duration::hours(1)));
        assert!(!b.is_exhausted(t0() + Duration::hours(2)));
        assert_eq!(b.spent(t0() + Duration::hours(2)), 0.0);
    }

    #[test]
    fn no_ceiling_never_exhausts() {
        let mut b = DailyBudget::new(None, t0());
        b.record(1_000.0, t0());
        assert!(!b.is_exhausted(t0()));
        assert!(b.remaining(t0()).is_none());
    }

    #[test]
    fn spend_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/budget.json");
        let mut b = DailyBudget::load(&path, Some(1.0), t0());
        b.record(0.4, t0());
        drop(b);

        let mut b = DailyBudget::load(&path, Some(1.0), t0() + Duration::minutes(5));
        assert!((b.spent(t0()) - 0.4).abs() < 1e-9);

        // Next day starts from zero.
        let mut b = DailyBudget::load(&path, Some(1.0), t0() + Duration::hours(3));
        assert_eq!(b.spent(t0() + Duration::hours(3)), 0.0);
    }
}
