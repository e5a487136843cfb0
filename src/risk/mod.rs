//! Pre-computed risk scores keyed by opportunity fingerprint.
//!
//! The risk collaborator pushes batches through `set_many`; the coordinator
//! reads with `get`. Expiry is lazy: the read that finds an expired entry
//! evicts it, and every write sweeps out entries that expired unread. A lookup reports one of three answers (fresh, stale but usable,
//! or missing) and leaves the fail-fast vs. refresh decision to the caller.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::RiskCacheConfig;
use crate::types::RiskScore;

/// Risk collaborator.
#[async_trait]
pub trait RiskSource: Send + Sync {
    async fn get_risk_score(&self, fingerprint: &str) -> Result<RiskScore>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskEntry {
    pub fingerprint: String,
    pub score: Decimal,
    pub categories: BTreeMap<String, Decimal>,
    pub computed_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl RiskEntry {
    pub fn from_score(fingerprint: &str, score: RiskScore, ttl: Duration) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            score: score.score,
            categories: score.categories,
            computed_at: score.computed_at,
            ttl,
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.computed_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Absent,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskLookup {
    Fresh(RiskEntry),
    /// Inside its TTL but past the staleness threshold.
    Stale(RiskEntry),
    Miss(MissReason),
}

pub struct RiskCache {
    entries: DashMap<String, RiskEntry>,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    ttl: Duration,
    stale_after_fraction: f64,
}

impl RiskCache {
    pub fn new(config: &RiskCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            refresh_locks: DashMap::new(),
            ttl: config.ttl(),
            stale_after_fraction: config.stale_after_fraction,
        }
    }

    pub fn get(&self, fingerprint: &str) -> RiskLookup {
        self.get_at(fingerprint, Utc::now())
    }

    pub fn get_at(&self, fingerprint: &str, now: DateTime<Utc>) -> RiskLookup {
        let entry = match self.entries.get(fingerprint) {
            Some(e) => e.value().clone(),
            None => return RiskLookup::Miss(MissReason::Absent),
        };

        let age = entry.age(now);
        if age >= entry.ttl {
            // Only evict the entry we judged; a concurrent set may have replaced it.
            self.entries
                .remove_if(fingerprint, |_, e| e.computed_at == entry.computed_at);
            debug!(fingerprint, age_ms = age.as_millis() as u64, "Risk entry expired");
            return RiskLookup::Miss(MissReason::Expired);
        }

        if age >= entry.ttl.mul_f64(self.stale_after_fraction) {
            RiskLookup::Stale(entry)
        } else {
            RiskLookup::Fresh(entry)
        }
    }

    pub fn set(&self, fingerprint: &str, score: RiskScore) {
        self.set_with_ttl(fingerprint, score, self.ttl);
    }

    pub fn set_with_ttl(&self, fingerprint: &str, score: RiskScore, ttl: Duration) {
        self.entries.insert(
            fingerprint.to_string(),
            RiskEntry::from_score(fingerprint, score, ttl),
        );
        self.prune_expired(Utc::now());
    }

    /// Batch population from the risk collaborator.
    pub fn set_many(&self, scores: impl IntoIterator<Item = (String, RiskScore)>) -> usize {
        let mut count = 0;
        for (fingerprint, score) in scores {
            self.entries.insert(
                fingerprint.clone(),
                RiskEntry::from_score(&fingerprint, score, self.ttl),
            );
            count += 1;
        }
        let pruned = self.prune_expired(Utc::now());
        debug!(count, pruned, "Risk scores cached");
        count
    }

    /// Fetch a score synchronously and cache it. Concurrent refreshes of the
    /// same fingerprint share a single fetch.
    pub async fn refresh(&self, source: &dyn RiskSource, fingerprint: &str) -> Result<RiskEntry> {
        let slot = RefreshSlot::join(&self.refresh_locks, fingerprint);
        let _guard = slot.lock().await;

        if let RiskLookup::Fresh(entry) = self.get(fingerprint) {
            return Ok(entry);
        }

        let score = source.get_risk_score(fingerprint).await?;
        let entry = RiskEntry::from_score(fingerprint, score, self.ttl);
        self.entries.insert(fingerprint.to_string(), entry.clone());
        Ok(entry)
    }

    /// Drop every entry past its TTL. Returns how many went.
    fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.age(now) < e.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared refresh lock for one fingerprint. The map entry goes away with
/// its last holder, however the refresh ended.
struct RefreshSlot<'a> {
    locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    fingerprint: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> RefreshSlot<'a> {
    fn join(locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>, fingerprint: &'a str) -> Self {
        let lock = locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Self {
            locks,
            fingerprint,
            lock,
        }
    }

    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for RefreshSlot<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and ours.
        self.locks
            .remove_if(self.fingerprint, |_, l| Arc::strong_count(l) <= 2);
    }
}

/// Risk source with fixed answers, for dry runs and tests.
#[derive(Debug, Default)]
pub struct StaticRiskSource {
    scores: DashMap<String, Decimal>,
    default_score: Option<Decimal>,
}

impl StaticRiskSource {
    pub fn new(default_score: Option<Decimal>) -> Self {
        Self {
            scores: DashMap::new(),
            default_score,
        }
    }

    pub fn insert(&self, fingerprint: &str, score: Decimal) {
        self.scores.insert(fingerprint.to_string(), score);
    }
}

#[async_trait]
impl RiskSource for StaticRiskSource {
    async fn get_risk_score(&self, fingerprint: &str) -> Result<RiskScore> {
        let score = self
            .scores
            .get(fingerprint)
            .map(|s| *s.value())
            .or(self.default_score)
            .ok_or_else(|| anyhow::anyhow!("No risk score for {fingerprint}"))?;
        Ok(RiskScore {
            score,
            categories: BTreeMap::new(),
            computed_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
