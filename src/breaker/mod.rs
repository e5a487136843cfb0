//! Circuit breaker registry with cascade detection.
//!
//! Breakers are keyed by open-ended resource strings (`tx-submit:chain-8453`,
//! `rpc:alchemy`, `mempool-feed`) and created on first use with settings
//! resolved by longest-prefix override. Each lives behind its own mutex in a
//! concurrent map, so unrelated resources never contend.
//!
//! On top sits the `system:protection` breaker. It trips when enough
//! correlated breakers open inside the cascade window, and while it is open
//! every check is rejected. Tripping it cancels the current protection token,
//! which in-flight coordinators observe.
//!
//! Transitions are reported to the observer and handed to a writer task that
//! persists snapshots, so a restart never reopens a tripped breaker early.

pub mod state;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{BreakersConfig, CascadeConfig};
use crate::events::{ExecutionEvent, ExecutionObserver};
use crate::storage::StateStore;
use state::{Admission, Breaker, BreakerState, BreakerStatus, Transition};

/// Key of the derived cascade breaker.
pub const PROTECTION_KEY: &str = "system:protection";

/// Resource key helpers.
pub mod keys {
    use crate::types::ChainId;

    pub const MEMPOOL_FEED: &str = "mempool-feed";

    pub fn tx_submit(chain_id: ChainId) -> String {
        format!("tx-submit:chain-{chain_id}")
    }

    pub fn rpc(provider: &str) -> String {
        format!("rpc:{provider}")
    }
}

/// Admission of one call. Hand it back to `complete` with the outcome so
/// HalfOpen breakers count only the probes they admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permit {
    probe: bool,
    protection_probe: bool,
}

impl Permit {
    pub fn is_probe(&self) -> bool {
        self.probe || self.protection_probe
    }
}

/// Result of `check`.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckResult {
    Allowed(Permit),
    Rejected(String),
}

impl CheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CheckResult::Allowed(_))
    }
}

/// Whether `key` matches a correlated pattern (exact, or `prefix*`).
fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<Mutex<Breaker>>>,
    protection: Mutex<Breaker>,
    protection_token: Mutex<CancellationToken>,
    config: BreakersConfig,
    cascade: CascadeConfig,
    observer: Arc<dyn ExecutionObserver>,
    persist_tx: Mutex<Option<mpsc::UnboundedSender<BreakerState>>>,
}

impl CircuitBreakerManager {
    pub fn new(
        config: BreakersConfig,
        cascade: CascadeConfig,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Self {
        let protection = Breaker::new(PROTECTION_KEY, config.resolve(PROTECTION_KEY).clone());
        Self {
            breakers: DashMap::new(),
            protection: Mutex::new(protection),
            protection_token: Mutex::new(CancellationToken::new()),
            config,
            cascade,
            observer,
            persist_tx: Mutex::new(None),
        }
    }

    /// Persist every transition through `store` from a background writer.
    ///
    /// Must be called inside a tokio runtime. The writer drains its queue and
    /// exits once `close_persistence` is called or the manager is dropped.
    pub fn with_persistence(self, store: Arc<dyn StateStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BreakerState>();
        let handle = tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                if let Err(e) = store.save_breaker(&state).await {
                    error!(
                        resource_key = %state.resource_key,
                        error = %e,
                        "Failed to persist breaker state"
                    );
                }
            }
            debug!("Breaker persistence writer stopped");
        });
        *self.persist_tx.lock() = Some(tx);
        (self, handle)
    }

    /// Stop handing transitions to the writer. Snapshots already queued are
    /// still written; await the writer handle, then `persist_all`.
    pub fn close_persistence(&self) {
        if self.persist_tx.lock().take().is_some() {
            debug!("Breaker persistence closed");
        }
    }

    /// Load persisted snapshots. Call before the first `check`.
    pub async fn restore(&self, store: &dyn StateStore) -> anyhow::Result<usize> {
        let snapshots = store.load_breakers().await?;
        let count = snapshots.len();
        for snapshot in snapshots {
            let settings = self.config.resolve(&snapshot.resource_key).clone();
            if snapshot.status != BreakerStatus::Closed {
                info!(
                    resource_key = %snapshot.resource_key,
                    status = %snapshot.status,
                    open_until = ?snapshot.open_until,
                    "Restored tripped breaker"
                );
            }
            if snapshot.resource_key == PROTECTION_KEY {
                *self.protection.lock() = Breaker::from_snapshot(snapshot, settings);
            } else {
                let key = snapshot.resource_key.clone();
                self.breakers.insert(
                    key,
                    Arc::new(Mutex::new(Breaker::from_snapshot(snapshot, settings))),
                );
            }
        }
        Ok(count)
    }

    /// Write every current snapshot through `store`. At shutdown, call it
    /// after the writer has drained so no older snapshot lands on top.
    pub async fn persist_all(&self, store: &dyn StateStore) -> anyhow::Result<()> {
        for snapshot in self.snapshot_all() {
            store.save_breaker(&snapshot).await?;
        }
        Ok(())
    }

    /// Token cancelled when system protection next trips.
    pub fn protection_token(&self) -> CancellationToken {
        self.protection_token.lock().clone()
    }

    pub fn check(&self, resource_key: &str) -> CheckResult {
        self.check_at(resource_key, Utc::now())
    }

    pub fn check_at(&self, resource_key: &str, now: DateTime<Utc>) -> CheckResult {
        let protection_probe = match self.check_protection(now) {
            Ok(probe) => probe,
            Err(reason) => return CheckResult::Rejected(reason),
        };

        let breaker = self.breaker(resource_key);
        let (admission, transition) = {
            let mut guard = breaker.lock();
            let (admission, transition) = guard.check_at(now);
            (admission, transition.map(|t| (t, guard.snapshot())))
        };
        if let Some((t, snapshot)) = transition {
            self.publish(&t, snapshot);
        }

        match admission {
            Admission::Allowed { probe } => CheckResult::Allowed(Permit {
                probe,
                protection_probe,
            }),
            Admission::Rejected(reason) => {
                if protection_probe {
                    self.protection.lock().release_probe();
                }
                debug!(resource_key, reason = %reason, "Breaker rejected call");
                CheckResult::Rejected(format!("{resource_key}: {reason}"))
            }
        }
    }

    /// Record an outcome for a call that was not admitted through `check`.
    pub fn record_outcome(&self, resource_key: &str, success: bool) {
        self.record_outcome_at(resource_key, Permit::default(), success, Utc::now())
    }

    /// Record the outcome of a call admitted by `check`.
    pub fn complete(&self, resource_key: &str, permit: Permit, success: bool) {
        self.record_outcome_at(resource_key, permit, success, Utc::now())
    }

    pub fn record_outcome_at(
        &self,
        resource_key: &str,
        permit: Permit,
        success: bool,
        now: DateTime<Utc>,
    ) {
        let breaker = self.breaker(resource_key);
        let transition = {
            let mut guard = breaker.lock();
            guard
                .record_at(success, permit.probe, now)
                .map(|t| (t, guard.snapshot()))
        };

        let tripped = match transition {
            Some((t, snapshot)) => {
                let opened = t.to == BreakerStatus::Open;
                self.publish(&t, snapshot);
                opened
            }
            None => false,
        };

        // Protection probes may come from any key.
        let probe_transition = if permit.protection_probe {
            let mut protection = self.protection.lock();
            protection
                .record_at(success, true, now)
                .map(|t| (t, protection.snapshot()))
        } else {
            None
        };
        if let Some((t, snapshot)) = probe_transition {
            if t.to == BreakerStatus::Open {
                warn!("System protection probe failed, re-opening");
                self.rotate_protection_token();
            }
            self.publish(&t, snapshot);
        }

        if tripped && self.cascade.enabled && self.is_correlated(resource_key) {
            self.evaluate_cascade(now);
        }
    }

    /// Current state of a breaker (a fresh Closed state if never used).
    pub fn get_state(&self, resource_key: &str) -> BreakerState {
        if resource_key == PROTECTION_KEY {
            return self.protection.lock().snapshot();
        }
        match self.breakers.get(resource_key) {
            Some(entry) => entry.value().lock().snapshot(),
            None => BreakerState::closed(
                resource_key,
                self.config.resolve(resource_key).probe_budget,
            ),
        }
    }

    /// Force a breaker Closed.
    pub fn reset(&self, resource_key: &str) {
        if resource_key == PROTECTION_KEY {
            return self.reset_protection();
        }
        let breaker = self.breaker(resource_key);
        let transition = {
            let mut guard = breaker.lock();
            guard.reset_at(Utc::now()).map(|t| (t, guard.snapshot()))
        };
        if let Some((t, snapshot)) = transition {
            info!(resource_key, "Breaker manually reset");
            self.publish(&t, snapshot);
        }
    }

    /// Manually clear system protection.
    pub fn reset_protection(&self) {
        let transition = {
            let mut guard = self.protection.lock();
            guard.reset_at(Utc::now()).map(|t| (t, guard.snapshot()))
        };
        if let Some((t, snapshot)) = transition {
            info!("System protection manually reset");
            self.publish(&t, snapshot);
        }
    }

    /// Snapshots of every breaker, protection included.
    pub fn snapshot_all(&self) -> Vec<BreakerState> {
        let mut out: Vec<BreakerState> = self
            .breakers
            .iter()
            .map(|e| e.value().lock().snapshot())
            .collect();
        out.push(self.protection.lock().snapshot());
        out.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        out
    }

    /// Keys of breakers currently Open.
    pub fn open_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .breakers
            .iter()
            .filter(|e| e.value().lock().status() == BreakerStatus::Open)
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    // -- Internals -------------------------------------------------------

    fn breaker(&self, resource_key: &str) -> Arc<Mutex<Breaker>> {
        if let Some(entry) = self.breakers.get(resource_key) {
            return Arc::clone(entry.value());
        }
        let entry = self
            .breakers
            .entry(resource_key.to_string())
            .or_insert_with(|| {
                let settings = self.config.resolve(resource_key).clone();
                Arc::new(Mutex::new(Breaker::new(resource_key, settings)))
            });
        Arc::clone(entry.value())
    }

    /// `Ok(true)` when the call was admitted as a protection probe.
    fn check_protection(&self, now: DateTime<Utc>) -> Result<bool, String> {
        let mut protection = self.protection.lock();
        match protection.status() {
            BreakerStatus::Closed => Ok(false),
            BreakerStatus::Open => {
                let cooled = protection
                    .snapshot()
                    .open_until
                    .map_or(true, |until| now >= until);
                if !cooled {
                    return Err("system protection open".to_string());
                }
                // Lock order: protection, then individual breakers.
                let open = self.correlated_open_since(now);
                if open.len() >= self.cascade.threshold {
                    let transition = protection.trip_at(now);
                    let snapshot = protection.snapshot();
                    drop(protection);
                    warn!(open = open.len(), "Cascade still active, protection extended");
                    self.rotate_protection_token();
                    if let Some(t) = transition {
                        self.publish(&t, snapshot);
                    }
                    return Err("system protection open (cascade ongoing)".to_string());
                }
                let (admission, transition) = protection.check_at(now);
                let snapshot = protection.snapshot();
                drop(protection);
                if let Some(t) = transition {
                    self.publish(&t, snapshot);
                }
                match admission {
                    Admission::Allowed { probe } => Ok(probe),
                    Admission::Rejected(reason) => Err(format!("system protection {reason}")),
                }
            }
            BreakerStatus::HalfOpen => match protection.check_at(now).0 {
                Admission::Allowed { probe } => Ok(probe),
                Admission::Rejected(reason) => Err(format!("system protection {reason}")),
            },
        }
    }

    fn is_correlated(&self, resource_key: &str) -> bool {
        self.cascade
            .correlated
            .iter()
            .any(|p| matches_pattern(p, resource_key))
    }

    fn correlated_open_since(&self, now: DateTime<Utc>) -> Vec<String> {
        let since = now - chrono::Duration::seconds(self.cascade.window_secs as i64);
        let mut keys: Vec<String> = self
            .breakers
            .iter()
            .filter(|e| self.is_correlated(e.key()))
            .filter(|e| e.value().lock().opened_since(since))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn evaluate_cascade(&self, now: DateTime<Utc>) {
        let open = self.correlated_open_since(now);
        if open.len() < self.cascade.threshold {
            return;
        }

        let transition = {
            let mut protection = self.protection.lock();
            if protection.status() == BreakerStatus::Open {
                return;
            }
            protection.trip_at(now).map(|t| (t, protection.snapshot()))
        };

        error!(
            open = open.len(),
            threshold = self.cascade.threshold,
            keys = ?open,
            "Cascade detected, tripping system protection"
        );
        self.rotate_protection_token();
        self.observer.on_event(&ExecutionEvent::CascadeTripped {
            open_keys: open,
            at: now,
        });
        if let Some((t, snapshot)) = transition {
            self.publish(&t, snapshot);
        }
    }

    fn rotate_protection_token(&self) {
        let mut token = self.protection_token.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    fn publish(&self, transition: &Transition, snapshot: BreakerState) {
        self.observer.on_event(&ExecutionEvent::BreakerTransition {
            resource_key: snapshot.resource_key.clone(),
            from: transition.from,
            to: transition.to,
            trip_level: snapshot.trip_level,
            open_until: snapshot.open_until,
            at: transition.at,
        });
        match self.persist_tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(snapshot).is_err() {
                    warn!("Breaker persistence writer gone, transition not persisted");
                }
            }
            None => debug!(
                resource_key = %snapshot.resource_key,
                "Breaker persistence closed, transition left for persist_all"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerSettings;
    use crate::events::CollectingObserver;
    use crate::storage::MemoryStore;
    use std::collections::BTreeMap;

    fn quick_settings() -> BreakerSettings {
        BreakerSettings {
            failure_rate_threshold: 0.5,
            window_calls: 10,
            window_secs: 60,
            min_calls: 2,
            cooldown_base_ms: 60_000,
            cooldown_multiplier: 2.0,
            cooldown_max_ms: 600_000,
            jitter_fraction: 0.0,
            probe_budget: 1,
            probe_successes: 1,
        }
    }

    fn manager(observer: Arc<CollectingObserver>) -> CircuitBreakerManager {
        let config = BreakersConfig {
            default: quick_settings(),
            overrides: BTreeMap::new(),
        };
        let cascade = CascadeConfig {
            enabled: true,
            correlated: vec!["svc:*".to_string()],
            threshold: 3,
            window_secs: 60,
        };
        CircuitBreakerManager::new(config, cascade, observer)
    }

    fn trip(m: &CircuitBreakerManager, key: &str, now: DateTime<Utc>) {
        m.record_outcome_at(key, Permit::default(), false, now);
        m.record_outcome_at(key, Permit::default(), false, now);
        assert_eq!(m.get_state(key).status, BreakerStatus::Open, "{key}");
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("rpc:*", "rpc:alchemy"));
        assert!(!matches_pattern("rpc:*", "tx-submit:chain-1"));
        assert!(matches_pattern("mempool-feed", "mempool-feed"));
        assert!(!matches_pattern("mempool-feed", "mempool-feed-2"));
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(keys::tx_submit(8453), "tx-submit:chain-8453");
        assert_eq!(keys::rpc("alchemy"), "rpc:alchemy");
    }

    #[test]
    fn test_threshold_trip_rejects_until_cooldown() {
        let observer = Arc::new(CollectingObserver::default());
        let config = BreakersConfig {
            default: BreakerSettings {
                min_calls: 10,
                ..quick_settings()
            },
            overrides: BTreeMap::new(),
        };
        let m = CircuitBreakerManager::new(config, CascadeConfig::default(), observer.clone());
        let t0 = Utc::now();
        for i in 0..10 {
            let CheckResult::Allowed(permit) = m.check_at("rpc:a", t0) else {
                panic!("closed breaker must admit");
            };
            m.record_outcome_at("rpc:a", permit, i % 2 == 1, t0);
        }
        let opened = observer.count(|e| {
            matches!(e, ExecutionEvent::BreakerTransition { to: BreakerStatus::Open, .. })
        });
        assert_eq!(opened, 1);
        assert!(!m.check_at("rpc:a", t0 + chrono::Duration::seconds(59)).is_allowed());
        assert!(m.check_at("rpc:a", t0 + chrono::Duration::seconds(60)).is_allowed());
        assert_eq!(m.get_state("rpc:a").status, BreakerStatus::HalfOpen);
    }

    #[test]
    fn test_prefix_override_applies() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "tx-submit:".to_string(),
            BreakerSettings {
                min_calls: 1,
                ..quick_settings()
            },
        );
        let config = BreakersConfig {
            default: BreakerSettings {
                min_calls: 5,
                ..quick_settings()
            },
            overrides,
        };
        let m = CircuitBreakerManager::new(
            config,
            CascadeConfig::default(),
            Arc::new(CollectingObserver::default()),
        );
        m.record_outcome("tx-submit:chain-1", false);
        m.record_outcome("rpc:a", false);
        assert_eq!(m.get_state("tx-submit:chain-1").status, BreakerStatus::Open);
        assert_eq!(m.get_state("rpc:a").status, BreakerStatus::Closed);
    }

    #[test]
    fn test_cascade_trips_protection_and_rejects_everyone() {
        let observer = Arc::new(CollectingObserver::default());
        let m = manager(observer.clone());
        let token = m.protection_token();
        let now = Utc::now();

        let keys = ["svc:1", "svc:2", "svc:3", "svc:4", "svc:5"];
        for key in &keys {
            assert!(m.check_at(key, now).is_allowed());
        }
        trip(&m, keys[0], now);
        trip(&m, keys[1], now);
        assert_eq!(m.get_state(PROTECTION_KEY).status, BreakerStatus::Closed);
        assert!(!token.is_cancelled());

        trip(&m, keys[2], now);
        assert_eq!(m.get_state(PROTECTION_KEY).status, BreakerStatus::Open);
        assert!(token.is_cancelled());
        assert!(!m.protection_token().is_cancelled());

        assert!(!m.check_at(keys[3], now).is_allowed());
        assert!(!m.check_at(keys[4], now).is_allowed());
        assert!(!m.check_at("unrelated", now).is_allowed());
        assert_eq!(
            observer.count(|e| matches!(e, ExecutionEvent::CascadeTripped { .. })),
            1
        );
    }

    #[test]
    fn test_uncorrelated_keys_do_not_cascade() {
        let m = manager(Arc::new(CollectingObserver::default()));
        let now = Utc::now();
        for key in ["other:1", "other:2", "other:3"] {
            trip(&m, key, now);
        }
        assert_eq!(m.get_state(PROTECTION_KEY).status, BreakerStatus::Closed);
    }

    #[test]
    fn test_old_trips_fall_outside_cascade_window() {
        let m = manager(Arc::new(CollectingObserver::default()));
        let t0 = Utc::now();
        trip(&m, "svc:1", t0);
        trip(&m, "svc:2", t0);
        trip(&m, "svc:3", t0 + chrono::Duration::seconds(61));
        assert_eq!(m.get_state(PROTECTION_KEY).status, BreakerStatus::Closed);
    }

    #[test]
    fn test_protection_recovers_after_cooldown_when_cascade_clears() {
        let m = manager(Arc::new(CollectingObserver::default()));
        let t0 = Utc::now();
        for key in ["svc:1", "svc:2", "svc:3"] {
            trip(&m, key, t0);
        }
        for key in ["svc:1", "svc:2", "svc:3"] {
            m.reset(key);
        }

        let later = t0 + chrono::Duration::seconds(61);
        let CheckResult::Allowed(permit) = m.check_at("svc:1", later) else {
            panic!("cooled protection must admit a trial call");
        };
        assert!(permit.is_probe());
        assert_eq!(m.get_state(PROTECTION_KEY).status, BreakerStatus::HalfOpen);
        m.record_outcome_at("svc:1", permit, true, later);
        assert_eq!(m.get_state(PROTECTION_KEY).status, BreakerStatus::Closed);
    }

    #[test]
    fn test_late_outcome_does_not_decide_half_open_protection() {
        let m = manager(Arc::new(CollectingObserver::default()));
        let t0 = Utc::now();
        let CheckResult::Allowed(early) = m.check_at("svc:9", t0) else {
            panic!("closed breaker must admit");
        };
        assert!(!early.is_probe());
        for key in ["svc:1", "svc:2", "svc:3"] {
            trip(&m, key, t0);
        }
        for key in ["svc:1", "svc:2", "svc:3"] {
            m.reset(key);
        }

        let later = t0 + chrono::Duration::seconds(61);
        let CheckResult::Allowed(trial) = m.check_at("svc:1", later) else {
            panic!("cooled protection must admit a trial call");
        };
        // The call admitted before the trip finishes now and fails.
        m.record_outcome_at("svc:9", early, false, later);
        let state = m.get_state(PROTECTION_KEY);
        assert_eq!(state.status, BreakerStatus::HalfOpen);
        assert_eq!(state.probes_in_flight, 1);

        m.record_outcome_at("svc:1", trial, true, later);
        assert_eq!(m.get_state(PROTECTION_KEY).status, BreakerStatus::Closed);
    }

    #[test]
    fn test_protection_extends_while_cascade_holds() {
        let m = manager(Arc::new(CollectingObserver::default()));
        let t0 = Utc::now();
        for key in ["svc:1", "svc:2", "svc:3"] {
            trip(&m, key, t0);
        }
        // Protection cooldown is 60s but the correlated trips are still in the window.
        let at = t0 + chrono::Duration::seconds(60);
        assert!(!m.check_at("svc:4", at).is_allowed());
        let state = m.get_state(PROTECTION_KEY);
        assert_eq!(state.status, BreakerStatus::Open);
        assert_eq!(state.trip_level, 1);
    }

    #[test]
    fn test_manual_reset_protection() {
        let m = manager(Arc::new(CollectingObserver::default()));
        let now = Utc::now();
        for key in ["svc:1", "svc:2", "svc:3"] {
            trip(&m, key, now);
        }
        m.reset_protection();
        assert_eq!(m.get_state(PROTECTION_KEY).status, BreakerStatus::Closed);
        assert!(m.check_at("fresh", now).is_allowed());
    }

    #[test]
    fn test_rejected_key_returns_protection_probe() {
        let m = manager(Arc::new(CollectingObserver::default()));
        let t0 = Utc::now();
        for key in ["svc:1", "svc:2", "svc:3"] {
            trip(&m, key, t0);
        }
        m.reset("svc:2");
        m.reset("svc:3");

        // other:x is open: its rejection must not consume the protection probe.
        let later = t0 + chrono::Duration::seconds(61);
        trip(&m, "other:x", later);
        assert!(!m.check_at("other:x", later).is_allowed());
        assert_eq!(m.get_state(PROTECTION_KEY).probes_in_flight, 0);
        assert!(m.check_at("svc:2", later).is_allowed());
    }

    #[tokio::test]
    async fn test_transitions_persist_and_restore() {
        let store = Arc::new(MemoryStore::default());
        let (m, writer) = manager(Arc::new(CollectingObserver::default()))
            .with_persistence(store.clone());
        let now = Utc::now();
        trip(&m, "svc:1", now);
        drop(m);
        writer.await.unwrap();

        let restored = manager(Arc::new(CollectingObserver::default()));
        assert_eq!(restored.restore(store.as_ref()).await.unwrap(), 1);
        let state = restored.get_state("svc:1");
        assert_eq!(state.status, BreakerStatus::Open);
        assert!(!restored.check_at("svc:1", now).is_allowed());
    }

    #[tokio::test]
    async fn test_close_drains_queue_before_final_persist() {
        let store = Arc::new(MemoryStore::default());
        let (m, writer) = manager(Arc::new(CollectingObserver::default()))
            .with_persistence(store.clone());
        let now = Utc::now();
        trip(&m, "svc:1", now);
        m.reset("svc:1");

        m.close_persistence();
        writer.await.unwrap();
        m.persist_all(store.as_ref()).await.unwrap();

        let saved = store.load_breakers().await.unwrap();
        let svc = saved.iter().find(|s| s.resource_key == "svc:1").unwrap();
        assert_eq!(svc.status, BreakerStatus::Closed);

        // Transitions after close are only reachable through persist_all.
        trip(&m, "svc:2", now);
        let saved = store.load_breakers().await.unwrap();
        assert!(saved.iter().all(|s| s.resource_key != "svc:2"));
    }

    #[tokio::test]
    async fn test_persist_all_includes_protection() {
        let store = MemoryStore::default();
        let m = manager(Arc::new(CollectingObserver::default()));
        m.check("svc:1");
        m.persist_all(&store).await.unwrap();
        let keys: Vec<String> = store
            .load_breakers()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.resource_key)
            .collect();
        assert!(keys.contains(&PROTECTION_KEY.to_string()));
        assert!(keys.contains(&"svc:1".to_string()));
    }
}
