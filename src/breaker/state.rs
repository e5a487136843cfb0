//! Single-resource circuit breaker.
//!
//! A `Breaker` tracks a sliding window of outcomes bounded by both count and
//! age. Once the window holds `min_calls` outcomes, a failure rate at or above
//! the threshold trips it Open. Open rejects until its cooldown elapses; the
//! cooldown is exponential in the trip level, jittered, and fixed at trip
//! time. After cooldown the breaker goes HalfOpen and admits up to
//! `probe_budget` concurrent probes. `probe_successes` consecutive probe
//! successes close it; a probe failure re-opens it one level higher.
//!
//! All time-dependent methods take `now` explicitly so the state machine is
//! deterministic under test. The manager passes `Utc::now()`.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::config::BreakerSettings;

/// Breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerStatus::Closed => write!(f, "closed"),
            BreakerStatus::Open => write!(f, "open"),
            BreakerStatus::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// One outcome in the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowOutcome {
    pub at: DateTime<Utc>,
    pub success: bool,
}

/// Persistable state of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub resource_key: String,
    pub status: BreakerStatus,
    pub window: VecDeque<WindowOutcome>,
    pub opened_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    pub trip_level: u32,
    pub probe_budget: u32,
    pub probes_in_flight: u32,
    pub probe_successes: u32,
    pub updated_at: DateTime<Utc>,
}

impl BreakerState {
    pub fn closed(resource_key: &str, probe_budget: u32) -> Self {
        Self {
            resource_key: resource_key.to_string(),
            status: BreakerStatus::Closed,
            window: VecDeque::new(),
            opened_at: None,
            open_until: None,
            trip_level: 0,
            probe_budget,
            probes_in_flight: 0,
            probe_successes: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn failures(&self) -> usize {
        self.window.iter().filter(|o| !o.success).count()
    }

    /// Failure rate over the current window (0.0 when empty).
    pub fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.failures() as f64 / self.window.len() as f64
    }
}

/// Admission decision for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// `probe` is set when the call was admitted as a HalfOpen probe.
    Allowed { probe: bool },
    Rejected(String),
}

/// A status change, reported to the manager for events and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: BreakerStatus,
    pub to: BreakerStatus,
    pub at: DateTime<Utc>,
}

/// Cooldown for a trip level: `min(base × multiplier^level, max) × (1 + jitter × unit)`.
///
/// `unit` is drawn uniformly from `[-1, 1]`; passing it in keeps this pure.
pub fn cooldown_for(settings: &BreakerSettings, trip_level: u32, unit: f64) -> Duration {
    let base = settings.cooldown_base_ms as f64;
    let max = settings.cooldown_max_ms as f64;
    let nominal = (base * settings.cooldown_multiplier.powi(trip_level as i32)).min(max);
    let jittered = nominal * (1.0 + settings.jitter_fraction * unit.clamp(-1.0, 1.0));
    Duration::from_millis(jittered.max(0.0).round() as u64)
}

#[derive(Debug, Clone)]
pub struct Breaker {
    state: BreakerState,
    settings: BreakerSettings,
}

impl Breaker {
    pub fn new(resource_key: &str, settings: BreakerSettings) -> Self {
        Self {
            state: BreakerState::closed(resource_key, settings.probe_budget),
            settings,
        }
    }

    /// Rebuild from a persisted snapshot. Probes in flight are forgotten.
    pub fn from_snapshot(mut state: BreakerState, settings: BreakerSettings) -> Self {
        state.probes_in_flight = 0;
        state.probe_budget = settings.probe_budget;
        Self { state, settings }
    }

    pub fn status(&self) -> BreakerStatus {
        self.state.status
    }

    pub fn snapshot(&self) -> BreakerState {
        self.state.clone()
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Whether the breaker is Open and was opened at or after `since`.
    pub fn opened_since(&self, since: DateTime<Utc>) -> bool {
        self.state.status == BreakerStatus::Open
            && self.state.opened_at.is_some_and(|at| at >= since)
    }

    /// Decide whether a call may proceed.
    pub fn check_at(&mut self, now: DateTime<Utc>) -> (Admission, Option<Transition>) {
        match self.state.status {
            BreakerStatus::Closed => (Admission::Allowed { probe: false }, None),
            BreakerStatus::Open => {
                let cooled = self.state.open_until.map_or(true, |until| now >= until);
                if !cooled {
                    let until = self
                        .state
                        .open_until
                        .map(|u| u.to_rfc3339())
                        .unwrap_or_default();
                    return (Admission::Rejected(format!("open until {until}")), None);
                }
                let transition = self.set_status(BreakerStatus::HalfOpen, now);
                self.state.probes_in_flight = 1;
                self.state.probe_successes = 0;
                (Admission::Allowed { probe: true }, transition)
            }
            BreakerStatus::HalfOpen => {
                if self.state.probes_in_flight < self.settings.probe_budget {
                    self.state.probes_in_flight += 1;
                    (Admission::Allowed { probe: true }, None)
                } else {
                    (
                        Admission::Rejected(format!(
                            "half-open, {} probe(s) in flight",
                            self.state.probes_in_flight
                        )),
                        None,
                    )
                }
            }
        }
    }

    /// Give back a probe slot admitted by `check_at` whose call never ran.
    pub fn release_probe(&mut self) {
        if self.state.status == BreakerStatus::HalfOpen {
            self.state.probes_in_flight = self.state.probes_in_flight.saturating_sub(1);
        }
    }

    /// Record the outcome of a call. `probe` is whether `check_at` admitted
    /// the call as a HalfOpen probe; only those decide a HalfOpen breaker.
    pub fn record_at(&mut self, success: bool, probe: bool, now: DateTime<Utc>) -> Option<Transition> {
        self.state.updated_at = now;
        match self.state.status {
            BreakerStatus::Closed => {
                self.state.window.push_back(WindowOutcome { at: now, success });
                self.prune(now);
                if self.state.window.len() >= self.settings.min_calls
                    && self.state.failure_rate() >= self.settings.failure_rate_threshold
                {
                    self.open(now)
                } else {
                    None
                }
            }
            // Late outcomes from calls admitted before the trip.
            BreakerStatus::Open => None,
            // Late outcome of a call admitted before the trip.
            BreakerStatus::HalfOpen if !probe => None,
            BreakerStatus::HalfOpen => {
                self.state.probes_in_flight = self.state.probes_in_flight.saturating_sub(1);
                if success {
                    self.state.probe_successes += 1;
                    if self.state.probe_successes >= self.settings.probe_successes {
                        self.close(now)
                    } else {
                        None
                    }
                } else {
                    self.state.trip_level += 1;
                    self.open(now)
                }
            }
        }
    }

    /// Force the breaker Open, one level higher when it is already tripped.
    pub fn trip_at(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.state.status != BreakerStatus::Closed {
            self.state.trip_level += 1;
        }
        self.open(now)
    }

    /// Force the breaker Closed and clear its history.
    pub fn reset_at(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.close(now)
    }

    fn open(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        let unit = if self.settings.jitter_fraction > 0.0 {
            rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        let cooldown = cooldown_for(&self.settings, self.state.trip_level, unit);
        let cooldown = chrono::Duration::milliseconds(cooldown.as_millis() as i64);

        self.state.opened_at = Some(now);
        self.state.open_until = Some(now + cooldown);
        self.state.probes_in_flight = 0;
        self.state.probe_successes = 0;
        self.set_status(BreakerStatus::Open, now)
    }

    fn close(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.state.window.clear();
        self.state.opened_at = None;
        self.state.open_until = None;
        self.state.trip_level = 0;
        self.state.probes_in_flight = 0;
        self.state.probe_successes = 0;
        self.set_status(BreakerStatus::Closed, now)
    }

    fn set_status(&mut self, to: BreakerStatus, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.state.status;
        self.state.status = to;
        self.state.updated_at = now;
        // Open -> Open happens on re-trips and still reports, so the new
        // cooldown gets persisted.
        if from == to && to != BreakerStatus::Open {
            return None;
        }
        Some(Transition { from, to, at: now })
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = chrono::Duration::seconds(self.settings.window_secs as i64);
        while let Some(front) = self.state.window.front() {
            if now - front.at > window || self.state.window.len() > self.settings.window_calls {
                self.state.window.pop_front();
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_rate_threshold: 0.5,
            window_calls: 10,
            window_secs: 60,
            min_calls: 10,
            cooldown_base_ms: 1_000,
            cooldown_multiplier: 2.0,
            cooldown_max_ms: 8_000,
            jitter_fraction: 0.0,
            probe_budget: 1,
            probe_successes: 2,
        }
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_interleaved_half_failures_trip_exactly_once() {
        let mut b = Breaker::new("tx-submit:chain-1", settings());
        let t0 = Utc::now();
        let mut trips = 0;
        for i in 0..10 {
            if let Some(t) = b.record_at(i % 2 == 0, false, t0) {
                assert_eq!(t.to, BreakerStatus::Open);
                trips += 1;
            }
        }
        assert_eq!(trips, 1);
        assert_eq!(b.status(), BreakerStatus::Open);
        assert!(matches!(b.check_at(t0).0, Admission::Rejected(_)));
        assert!(matches!(
            b.check_at(t0 + chrono::Duration::milliseconds(999)).0,
            Admission::Rejected(_)
        ));
    }

    #[test]
    fn test_below_min_calls_never_trips() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        for _ in 0..9 {
            assert!(b.record_at(false, false, t0).is_none());
        }
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn test_window_bounded_by_count_and_age() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        for _ in 0..15 {
            b.record_at(true, false, t0);
        }
        assert_eq!(b.snapshot().window.len(), 10);

        // Old successes age out, so nine fresh failures plus one are a full window.
        let later = t0 + secs(120);
        for _ in 0..9 {
            b.record_at(false, false, later);
        }
        assert_eq!(b.snapshot().window.len(), 9);
        assert_eq!(b.status(), BreakerStatus::Closed);
        b.record_at(false, false, later);
        assert_eq!(b.status(), BreakerStatus::Open);
    }

    #[test]
    fn test_half_open_probe_cycle_closes() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        b.trip_at(t0);

        let after = t0 + secs(1);
        let (admission, transition) = b.check_at(after);
        assert_eq!(admission, Admission::Allowed { probe: true });
        assert_eq!(transition.map(|t| t.to), Some(BreakerStatus::HalfOpen));

        // Budget of one probe.
        assert!(matches!(b.check_at(after).0, Admission::Rejected(_)));

        assert!(b.record_at(true, true, after).is_none());
        assert_eq!(b.check_at(after).0, Admission::Allowed { probe: true });
        let closed = b.record_at(true, true, after);
        assert_eq!(closed.map(|t| t.to), Some(BreakerStatus::Closed));
        assert_eq!(b.snapshot().trip_level, 0);
    }

    #[test]
    fn test_probe_failure_reopens_with_longer_cooldown() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        b.trip_at(t0);
        let first_until = b.snapshot().open_until.unwrap();
        assert_eq!(first_until - t0, secs(1));

        let t1 = t0 + secs(1);
        b.check_at(t1);
        let reopened = b.record_at(false, true, t1);
        assert_eq!(reopened.map(|t| t.to), Some(BreakerStatus::Open));
        let snap = b.snapshot();
        assert_eq!(snap.trip_level, 1);
        assert_eq!(snap.open_until.unwrap() - t1, secs(2));
    }

    #[test]
    fn test_cooldown_capped_and_jittered() {
        let s = BreakerSettings {
            jitter_fraction: 0.1,
            ..settings()
        };
        assert_eq!(cooldown_for(&s, 0, 0.0), Duration::from_millis(1_000));
        assert_eq!(cooldown_for(&s, 10, 0.0), Duration::from_millis(8_000));
        assert_eq!(cooldown_for(&s, 10, 1.0), Duration::from_millis(8_800));
        assert_eq!(cooldown_for(&s, 10, -1.0), Duration::from_millis(7_200));
    }

    #[test]
    fn test_release_probe_returns_slot() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        b.trip_at(t0);
        b.check_at(t0 + secs(1));
        b.release_probe();
        assert_eq!(b.snapshot().probes_in_flight, 0);
        assert_eq!(
            b.check_at(t0 + secs(1)).0,
            Admission::Allowed { probe: true }
        );
    }

    #[test]
    fn test_snapshot_restore_forgets_probes() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        b.trip_at(t0);
        b.check_at(t0 + secs(1));
        let snap = b.snapshot();
        assert_eq!(snap.probes_in_flight, 1);

        let restored = Breaker::from_snapshot(snap, settings());
        assert_eq!(restored.status(), BreakerStatus::HalfOpen);
        assert_eq!(restored.snapshot().probes_in_flight, 0);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        b.trip_at(t0);
        b.trip_at(t0);
        assert_eq!(b.snapshot().trip_level, 1);
        let t = b.reset_at(t0);
        assert_eq!(t.map(|t| t.to), Some(BreakerStatus::Closed));
        let snap = b.snapshot();
        assert!(snap.window.is_empty());
        assert!(snap.opened_at.is_none());
        assert_eq!(snap.trip_level, 0);
    }

    #[test]
    fn test_half_open_ignores_calls_admitted_before_trip() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        b.trip_at(t0);
        let after = t0 + secs(1);
        assert_eq!(b.check_at(after).0, Admission::Allowed { probe: true });

        // Calls admitted while Closed finish after the breaker went HalfOpen.
        assert!(b.record_at(false, false, after).is_none());
        assert!(b.record_at(true, false, after).is_none());
        let snap = b.snapshot();
        assert_eq!(snap.status, BreakerStatus::HalfOpen);
        assert_eq!(snap.probes_in_flight, 1);
        assert_eq!(snap.probe_successes, 0);

        b.record_at(true, true, after);
        assert_eq!(b.check_at(after).0, Admission::Allowed { probe: true });
        let closed = b.record_at(true, true, after);
        assert_eq!(closed.map(|t| t.to), Some(BreakerStatus::Closed));
    }

    #[test]
    fn test_outcomes_while_open_ignored() {
        let mut b = Breaker::new("rpc:a", settings());
        let t0 = Utc::now();
        b.trip_at(t0);
        assert!(b.record_at(false, false, t0).is_none());
        assert_eq!(b.snapshot().trip_level, 0);
    }
}
