//! Per-account nonce allocation.
//!
//! One slot per (account, chain), each behind its own async mutex inside a
//! concurrent map: allocations for the same key are serialized and strictly
//! increasing, allocations for different keys never wait on each other.
//!
//! A slot tracks the next fresh value, the nonces currently handed out, and
//! released nonces waiting to be re-issued (lowest first, so gaps close).
//! A resync holds the slot while it asks the chain; allocations arriving in
//! the meantime wait up to `lock_timeout` and then fail with `Busy` rather
//! than hand out a stale value.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::chain::{timed, BlockTag, ProviderError, RpcProvider};
use crate::config::NonceConfig;
use crate::types::{ChainId, ExecError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NonceError {
    #[error("Nonce slot {account_id}/{chain_id} busy after {waited:?} (resync in progress)")]
    Busy {
        account_id: String,
        chain_id: ChainId,
        waited: Duration,
    },

    #[error("Nonce {nonce} is not in flight for {account_id}/{chain_id}")]
    NotInFlight {
        account_id: String,
        chain_id: ChainId,
        nonce: u64,
    },

    #[error("Nonce source failed: {0}")]
    Source(#[from] ProviderError),
}

impl From<NonceError> for ExecError {
    fn from(e: NonceError) -> Self {
        match e {
            NonceError::Busy { .. } => ExecError::Busy(e.to_string()),
            NonceError::NotInFlight { .. } => ExecError::Fatal(e.to_string()),
            NonceError::Source(_) => ExecError::Transient(e.to_string()),
        }
    }
}

#[derive(Debug)]
struct NonceSlot {
    next_value: u64,
    in_flight: BTreeSet<u64>,
    recycled: BTreeSet<u64>,
    initialized: bool,
}

impl NonceSlot {
    fn new() -> Self {
        Self {
            next_value: 0,
            in_flight: BTreeSet::new(),
            recycled: BTreeSet::new(),
            initialized: false,
        }
    }

    /// Fold a chain-observed next nonce into the slot.
    fn observe(&mut self, observed: u64) {
        if observed > self.next_value {
            self.next_value = observed;
        }
        // Anything below the chain's count was consumed on chain.
        self.recycled.retain(|&n| n >= observed);
        self.initialized = true;
    }
}

/// Read-only view of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSlotView {
    pub account_id: String,
    pub chain_id: ChainId,
    pub next_value: u64,
    pub in_flight: Vec<u64>,
    pub recycled: Vec<u64>,
}

type SlotKey = (String, ChainId);

pub struct NonceManager {
    slots: DashMap<SlotKey, Arc<Mutex<NonceSlot>>>,
    source: Option<Arc<dyn RpcProvider>>,
    lock_timeout: Duration,
    fetch_timeout: Duration,
}

impl NonceManager {
    /// `source` initialises slots and serves `resync_from`; without one,
    /// slots start at 0.
    pub fn new(config: &NonceConfig, source: Option<Arc<dyn RpcProvider>>) -> Self {
        Self {
            slots: DashMap::new(),
            source,
            lock_timeout: config.lock_timeout(),
            fetch_timeout: config.fetch_timeout(),
        }
    }

    /// Hand out the next nonce for (account, chain).
    pub async fn allocate(&self, account_id: &str, chain_id: ChainId) -> Result<u64, NonceError> {
        let slot = self.slot(account_id, chain_id);
        let mut guard = self.lock(&slot, account_id, chain_id).await?;

        if !guard.initialized {
            let start = self.fetch(account_id, chain_id).await?;
            guard.observe(start);
            info!(account = account_id, chain = chain_id, start, "Nonce slot initialised");
        }

        let nonce = match guard.recycled.pop_first() {
            Some(n) => n,
            None => {
                let n = guard.next_value;
                guard.next_value += 1;
                n
            }
        };
        guard.in_flight.insert(nonce);
        debug!(account = account_id, chain = chain_id, nonce, "Nonce allocated");
        Ok(nonce)
    }

    /// Return a nonce that was never broadcast.
    pub async fn release(
        &self,
        account_id: &str,
        chain_id: ChainId,
        nonce: u64,
    ) -> Result<(), NonceError> {
        let slot = self.slot(account_id, chain_id);
        let mut guard = slot.lock().await;

        if !guard.in_flight.remove(&nonce) {
            warn!(account = account_id, chain = chain_id, nonce, "Release of nonce not in flight");
            return Err(NonceError::NotInFlight {
                account_id: account_id.to_string(),
                chain_id,
                nonce,
            });
        }

        if nonce + 1 == guard.next_value {
            guard.next_value = nonce;
            // Collapse any recycled run that now sits at the top.
            while guard.next_value > 0 {
                let top = guard.next_value - 1;
                if guard.recycled.remove(&top) {
                    guard.next_value = top;
                } else {
                    break;
                }
            }
        } else {
            guard.recycled.insert(nonce);
        }
        debug!(account = account_id, chain = chain_id, nonce, "Nonce released");
        Ok(())
    }

    /// Mark a nonce consumed (or abandoned after broadcast). Never re-issued
    /// by this slot; `heal` reclaims it if the chain never used it.
    pub async fn settle(&self, account_id: &str, chain_id: ChainId, nonce: u64) -> bool {
        let slot = self.slot(account_id, chain_id);
        let removed = slot.lock().await.in_flight.remove(&nonce);
        if removed {
            debug!(account = account_id, chain = chain_id, nonce, "Nonce settled");
        }
        removed
    }

    /// Reconcile after discovering the chain's nonce is ahead.
    pub async fn resync(
        &self,
        account_id: &str,
        chain_id: ChainId,
        observed_chain_nonce: u64,
    ) -> Result<u64, NonceError> {
        let slot = self.slot(account_id, chain_id);
        let mut guard = self.lock(&slot, account_id, chain_id).await?;
        let before = guard.next_value;
        guard.observe(observed_chain_nonce);
        if guard.next_value != before {
            warn!(
                account = account_id,
                chain = chain_id,
                from = before,
                to = guard.next_value,
                "Nonce resynced forward"
            );
        }
        Ok(guard.next_value)
    }

    /// Resync from the chain's pending count, holding the slot while fetching.
    pub async fn resync_from(&self, account_id: &str, chain_id: ChainId) -> Result<u64, NonceError> {
        let slot = self.slot(account_id, chain_id);
        let mut guard = self.lock(&slot, account_id, chain_id).await?;
        let observed = self.fetch(account_id, chain_id).await?;
        let before = guard.next_value;
        guard.observe(observed);
        info!(
            account = account_id,
            chain = chain_id,
            observed,
            from = before,
            to = guard.next_value,
            "Nonce resynced from chain"
        );
        Ok(guard.next_value)
    }

    /// Rewind an idle slot to the chain's pending count.
    ///
    /// Only applies when nothing is in flight; returns whether the slot moved.
    pub async fn heal(
        &self,
        account_id: &str,
        chain_id: ChainId,
        observed_pending: u64,
    ) -> Result<bool, NonceError> {
        let slot = self.slot(account_id, chain_id);
        let mut guard = self.lock(&slot, account_id, chain_id).await?;

        if !guard.in_flight.is_empty() {
            debug!(
                account = account_id,
                chain = chain_id,
                in_flight = guard.in_flight.len(),
                "Nonce slot busy, heal skipped"
            );
            return Ok(false);
        }

        let before = guard.next_value;
        guard.next_value = observed_pending;
        guard.recycled.clear();
        guard.initialized = true;
        if before != observed_pending {
            warn!(
                account = account_id,
                chain = chain_id,
                from = before,
                to = observed_pending,
                "Nonce slot healed to chain pending count"
            );
        }
        Ok(before != observed_pending)
    }

    pub async fn view(&self, account_id: &str, chain_id: ChainId) -> Option<NonceSlotView> {
        let slot = self
            .slots
            .get(&(account_id.to_string(), chain_id))
            .map(|e| Arc::clone(e.value()))?;
        let guard = slot.lock().await;
        Some(NonceSlotView {
            account_id: account_id.to_string(),
            chain_id,
            next_value: guard.next_value,
            in_flight: guard.in_flight.iter().copied().collect(),
            recycled: guard.recycled.iter().copied().collect(),
        })
    }

    /// Every (account, chain) seen so far.
    pub fn keys(&self) -> Vec<(String, ChainId)> {
        let mut keys: Vec<_> = self.slots.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn slot(&self, account_id: &str, chain_id: ChainId) -> Arc<Mutex<NonceSlot>> {
        let key = (account_id.to_string(), chain_id);
        if let Some(slot) = self.slots.get(&key) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(NonceSlot::new())))
                .value(),
        )
    }

    async fn lock<'a>(
        &self,
        slot: &'a Mutex<NonceSlot>,
        account_id: &str,
        chain_id: ChainId,
    ) -> Result<MutexGuard<'a, NonceSlot>, NonceError> {
        tokio::time::timeout(self.lock_timeout, slot.lock())
            .await
            .map_err(|_| {
                warn!(account = account_id, chain = chain_id, "Nonce slot lock timed out");
                NonceError::Busy {
                    account_id: account_id.to_string(),
                    chain_id,
                    waited: self.lock_timeout,
                }
            })
    }

    async fn fetch(&self, account_id: &str, chain_id: ChainId) -> Result<u64, NonceError> {
        match &self.source {
            Some(source) => Ok(timed(
                self.fetch_timeout,
                source.get_transaction_count(chain_id, account_id, BlockTag::Pending),
            )
            .await?),
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::dry_run::DryRunChain;
    use std::collections::HashSet;

    fn config() -> NonceConfig {
        NonceConfig {
            lock_timeout_ms: 50,
            fetch_timeout_ms: 1_000,
        }
    }

    fn manager() -> NonceManager {
        NonceManager::new(&config(), None)
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_contiguous() {
        let chain = Arc::new(DryRunChain::new("dry", 1));
        chain.set_account_nonce("0xabc", 1, 40);
        let nm = Arc::new(NonceManager::new(&config(), Some(chain)));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let nm = nm.clone();
            handles.push(tokio::spawn(async move { nm.allocate("0xabc", 1).await.unwrap() }));
        }
        let mut got = HashSet::new();
        for h in handles {
            assert!(got.insert(h.await.unwrap()), "duplicate nonce");
        }
        let expected: HashSet<u64> = (40..90).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let nm = manager();
        assert_eq!(nm.allocate("a", 1).await.unwrap(), 0);
        assert_eq!(nm.allocate("a", 1).await.unwrap(), 1);
        assert_eq!(nm.allocate("b", 1).await.unwrap(), 0);
        assert_eq!(nm.allocate("a", 8453).await.unwrap(), 0);
        assert_eq!(nm.keys().len(), 3);
    }

    #[tokio::test]
    async fn test_release_highest_rolls_back() {
        let nm = manager();
        let n0 = nm.allocate("a", 1).await.unwrap();
        let n1 = nm.allocate("a", 1).await.unwrap();
        nm.release("a", 1, n1).await.unwrap();
        assert_eq!(nm.allocate("a", 1).await.unwrap(), n1);
        assert_eq!(n0, 0);
    }

    #[tokio::test]
    async fn test_released_gap_reissued_lowest_first() {
        let nm = manager();
        for _ in 0..4 {
            nm.allocate("a", 1).await.unwrap();
        }
        nm.release("a", 1, 2).await.unwrap();
        nm.release("a", 1, 1).await.unwrap();
        assert_eq!(nm.allocate("a", 1).await.unwrap(), 1);
        assert_eq!(nm.allocate("a", 1).await.unwrap(), 2);
        assert_eq!(nm.allocate("a", 1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_release_collapses_recycled_run() {
        let nm = manager();
        for _ in 0..3 {
            nm.allocate("a", 1).await.unwrap();
        }
        nm.release("a", 1, 1).await.unwrap();
        nm.release("a", 1, 2).await.unwrap();
        let view = nm.view("a", 1).await.unwrap();
        assert_eq!(view.next_value, 1);
        assert!(view.recycled.is_empty());
        assert_eq!(view.in_flight, vec![0]);
    }

    #[tokio::test]
    async fn test_release_unknown_nonce_errors() {
        let nm = manager();
        nm.allocate("a", 1).await.unwrap();
        assert!(matches!(
            nm.release("a", 1, 7).await,
            Err(NonceError::NotInFlight { nonce: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_settled_nonce_never_reissued() {
        let nm = manager();
        let n = nm.allocate("a", 1).await.unwrap();
        assert!(nm.settle("a", 1, n).await);
        assert!(!nm.settle("a", 1, n).await);
        assert_eq!(nm.allocate("a", 1).await.unwrap(), n + 1);
    }

    #[tokio::test]
    async fn test_resync_moves_forward_only() {
        let nm = manager();
        nm.allocate("a", 1).await.unwrap();
        assert_eq!(nm.resync("a", 1, 10).await.unwrap(), 10);
        assert_eq!(nm.allocate("a", 1).await.unwrap(), 10);
        assert_eq!(nm.resync("a", 1, 3).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_resync_drops_consumed_recycled() {
        let nm = manager();
        for _ in 0..5 {
            nm.allocate("a", 1).await.unwrap();
        }
        nm.release("a", 1, 1).await.unwrap();
        nm.release("a", 1, 3).await.unwrap();
        nm.resync("a", 1, 2).await.unwrap();
        assert_eq!(nm.view("a", 1).await.unwrap().recycled, vec![3]);
    }

    #[tokio::test]
    async fn test_allocate_during_resync_is_busy() {
        let chain = Arc::new(DryRunChain::new("slow", 1).with_latency(Duration::from_millis(300)));
        let nm = Arc::new(NonceManager::new(&config(), Some(chain)));

        let resyncing = {
            let nm = nm.clone();
            tokio::spawn(async move { nm.resync_from("a", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = nm.allocate("a", 1).await.unwrap_err();
        assert!(matches!(err, NonceError::Busy { .. }));
        assert!(matches!(ExecError::from(err), ExecError::Busy(_)));

        assert_eq!(resyncing.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_heal_only_when_idle() {
        let nm = manager();
        for _ in 0..3 {
            nm.allocate("a", 1).await.unwrap();
        }
        assert!(!nm.heal("a", 1, 1).await.unwrap());
        for n in 0..3 {
            nm.settle("a", 1, n).await;
        }
        assert!(nm.heal("a", 1, 1).await.unwrap());
        assert_eq!(nm.allocate("a", 1).await.unwrap(), 1);
    }
}
