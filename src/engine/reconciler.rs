//! Repair of records nobody is watching.
//!
//! Runs once at startup over everything restored from persistence, then
//! periodically for records whose coordinator gave up monitoring. Records
//! whose nonce is still held by a live coordinator are left alone.

use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::classify;
use super::ExecutionServices;
use crate::breaker::{keys, CheckResult};
use crate::chain::{timed, BlockTag, ProviderError, ReceiptStatus};
use crate::storage::{StoreError, TransitionMeta};
use crate::types::{ErrorKind, TransactionRecord, TxStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub still_pending: usize,
    /// Skipped because a live coordinator owns the nonce.
    pub owned: usize,
    pub healed_slots: usize,
    pub errors: usize,
}

/// What the chain says about one record.
enum Verdict {
    Confirmed(String),
    Reverted(String),
    Replaced,
    NeverSent,
    Unknown,
}

pub struct Reconciler {
    services: Arc<ExecutionServices>,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(services: Arc<ExecutionServices>) -> Self {
        let call_timeout = Duration::from_millis(services.config.retry.call_timeout_ms);
        Self {
            services,
            call_timeout,
        }
    }

    /// One pass over unresolved records and idle nonce slots.
    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let store = &self.services.store;

        let mut unresolved: Vec<TransactionRecord> = store
            .all()
            .await
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();
        unresolved.sort_by_key(|r| (r.account_id.clone(), r.chain_id, r.nonce));

        for record in unresolved {
            report.examined += 1;
            if self.is_owned(&record).await {
                report.owned += 1;
                continue;
            }
            match self.reconcile(&record).await {
                Ok(TxStatus::Confirmed) => report.confirmed += 1,
                Ok(TxStatus::Failed) => report.failed += 1,
                Ok(TxStatus::Abandoned) => report.abandoned += 1,
                Ok(_) => report.still_pending += 1,
                Err(e) => {
                    warn!(tx_id = %record.id, error = %e, "Reconcile failed");
                    report.errors += 1;
                }
            }
        }

        let slots = self.services.nonces.keys();
        let provider = &self.services.provider;
        let counts = join_all(slots.iter().map(|(account_id, chain_id)| {
            self.rpc(provider.get_transaction_count(*chain_id, account_id, BlockTag::Pending))
        }))
        .await;
        for ((account_id, chain_id), count) in slots.into_iter().zip(counts) {
            let observed = match count {
                Ok(n) => n,
                Err(e) => {
                    debug!(account = %account_id, chain = chain_id, error = %e, "Pending count unavailable");
                    report.errors += 1;
                    continue;
                }
            };
            match self.services.nonces.heal(&account_id, chain_id, observed).await {
                Ok(true) => report.healed_slots += 1,
                Ok(false) => {}
                Err(e) => debug!(account = %account_id, chain = chain_id, error = %e, "Heal skipped"),
            }
        }

        if report != ReconcileReport::default() {
            info!(
                examined = report.examined,
                confirmed = report.confirmed,
                failed = report.failed,
                abandoned = report.abandoned,
                still_pending = report.still_pending,
                healed_slots = report.healed_slots,
                errors = report.errors,
                "Reconcile pass complete"
            );
        }
        report
    }

    /// Reconcile every `interval` until `shutdown` fires.
    pub async fn run_until(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; startup runs its own pass.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
        debug!("Reconciler stopped");
    }

    async fn is_owned(&self, record: &TransactionRecord) -> bool {
        self.services
            .nonces
            .view(&record.account_id, record.chain_id)
            .await
            .is_some_and(|v| v.in_flight.contains(&record.nonce))
    }

    async fn reconcile(&self, record: &TransactionRecord) -> Result<TxStatus, StoreError> {
        let verdict = match record.status {
            TxStatus::Built => Verdict::NeverSent,
            TxStatus::Submitted | TxStatus::Pending => self.inspect(record).await,
            status => return Ok(status),
        };

        let store = &self.services.store;
        let updated = match verdict {
            Verdict::Confirmed(hash) => {
                let meta = TransitionMeta::none().with_hash(hash);
                let record = match record.status {
                    // Accepted but never recorded as such.
                    TxStatus::Submitted => store.transition(record.id, TxStatus::Pending, meta.clone()).await?,
                    _ => record.clone(),
                };
                store.transition(record.id, TxStatus::Confirmed, meta).await?
            }
            Verdict::Reverted(hash) => {
                let meta = TransitionMeta::none()
                    .with_hash(hash)
                    .with_error(ErrorKind::Fatal, "reverted on chain");
                store.transition(record.id, TxStatus::Failed, meta).await?
            }
            Verdict::Replaced => {
                let meta = TransitionMeta::none().with_error(
                    ErrorKind::NonceConflict,
                    format!("nonce {} consumed by another transaction", record.nonce),
                );
                store.transition(record.id, TxStatus::Failed, meta).await?
            }
            Verdict::NeverSent if record.status != TxStatus::Pending => {
                let meta = TransitionMeta::none()
                    .with_error(ErrorKind::Cancelled, "never reached the chain before restart");
                store.transition(record.id, TxStatus::Abandoned, meta).await?
            }
            Verdict::NeverSent | Verdict::Unknown => return Ok(record.status),
        };

        info!(
            tx_id = %updated.id,
            from = %record.status,
            to = %updated.status,
            nonce = updated.nonce,
            "Record reconciled"
        );
        Ok(updated.status)
    }

    async fn inspect(&self, record: &TransactionRecord) -> Verdict {
        let provider = &self.services.provider;

        // Any recorded bid may be the one that got mined.
        let mut inconclusive = false;
        for hash in record.candidate_hashes() {
            match self.rpc(provider.get_receipt(record.chain_id, &hash)).await {
                Ok(ReceiptStatus::Confirmed(receipt)) if receipt.success => {
                    return Verdict::Confirmed(receipt.tx_hash)
                }
                Ok(ReceiptStatus::Confirmed(receipt)) => return Verdict::Reverted(receipt.tx_hash),
                Ok(ReceiptStatus::Pending) => inconclusive = true,
                Ok(ReceiptStatus::NotFound) => {}
                Err(e) => {
                    debug!(tx_id = %record.id, tx_hash = %hash, error = %e, "Receipt lookup failed");
                    inconclusive = true;
                }
            }
        }
        if inconclusive {
            return Verdict::Unknown;
        }

        let latest = match self
            .rpc(provider.get_transaction_count(record.chain_id, &record.account_id, BlockTag::Latest))
            .await
        {
            Ok(n) => n,
            Err(_) => return Verdict::Unknown,
        };
        if latest > record.nonce {
            return Verdict::Replaced;
        }
        if record.status == TxStatus::Pending {
            return Verdict::Unknown;
        }

        match self
            .rpc(provider.get_transaction_count(record.chain_id, &record.account_id, BlockTag::Pending))
            .await
        {
            Ok(pending) if pending <= record.nonce => Verdict::NeverSent,
            _ => Verdict::Unknown,
        }
    }

    /// Timed provider call that reports to the provider's breaker.
    async fn rpc<T, F>(&self, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let key = keys::rpc(self.services.provider.name());
        let permit = match self.services.breakers.check(&key) {
            CheckResult::Allowed(permit) => permit,
            CheckResult::Rejected(reason) => return Err(ProviderError::Transport(reason)),
        };
        let result = timed(self.call_timeout, call).await;
        let healthy = match &result {
            Ok(_) => true,
            Err(e) => !classify(e).is_resource_failure(),
        };
        self.services.breakers.complete(&key, permit, healthy);
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::dry_run::{DryRunChain, DryRunSigner};
    use crate::chain::{RpcProvider, SignedTx};
    use crate::engine::testkit::{self, ACCOUNT, CHAIN};
    use crate::storage::{MemoryStore, StateStore};

    struct Fixture {
        chain: Arc<DryRunChain>,
        persistence: Arc<dyn StateStore>,
        services: Arc<ExecutionServices>,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(DryRunChain::new("dry", u32::MAX));
        let persistence: Arc<dyn StateStore> = Arc::new(MemoryStore::default());
        let (services, _) = testkit::build(
            testkit::config(),
            chain.clone(),
            Arc::new(DryRunSigner),
            None,
            persistence.clone(),
        );
        Fixture {
            chain,
            persistence,
            services,
        }
    }

    impl Fixture {
        /// Fresh services over the same persistence, as after a restart.
        async fn restart(&self) -> Arc<ExecutionServices> {
            let (services, _) = testkit::build(
                testkit::config(),
                self.chain.clone(),
                Arc::new(DryRunSigner),
                None,
                self.persistence.clone(),
            );
            services.store.restore().await.unwrap();
            services
        }

        /// Built record moved to `Pending` with a broadcast on the dry chain.
        async fn pending_record(&self, fingerprint: &str) -> TransactionRecord {
            let record = testkit::built_record(&self.services, fingerprint).await;
            let store = &self.services.store;
            store
                .transition(record.id, TxStatus::Submitted, TransitionMeta::none())
                .await
                .unwrap();
            let hash = self
                .chain
                .broadcast(&SignedTx {
                    chain_id: CHAIN,
                    account_id: ACCOUNT.to_string(),
                    nonce: record.nonce,
                    raw: format!("0xraw{}", record.nonce),
                    hash: None,
                })
                .await
                .unwrap();
            store
                .transition(record.id, TxStatus::Pending, TransitionMeta::none().with_hash(hash))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_mined_pending_record_confirmed_after_restart() {
        let fx = fixture();
        let record = fx.pending_record("opp-1").await;
        fx.chain.mine_all();

        let services = fx.restart().await;
        let report = Reconciler::new(services.clone()).run_once().await;
        assert_eq!(report.confirmed, 1);
        assert_eq!(services.store.get(record.id).await.unwrap().status, TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_earlier_bid_mined_confirms_record() {
        let fx = fixture();
        let record = fx.pending_record("opp-1").await;
        let first = record.tx_hash.clone().unwrap();

        // A replacement bid was accepted, but the first one is mined.
        fx.chain.mine_replaced_next();
        let second = fx
            .chain
            .broadcast(&SignedTx {
                chain_id: CHAIN,
                account_id: ACCOUNT.to_string(),
                nonce: record.nonce,
                raw: "0xbeef".to_string(),
                hash: None,
            })
            .await
            .unwrap();
        fx.services
            .store
            .transition(record.id, TxStatus::Pending, TransitionMeta::none().with_hash(second.clone()))
            .await
            .unwrap();
        assert_eq!(fx.chain.get_receipt(CHAIN, &second).await.unwrap(), ReceiptStatus::NotFound);

        let services = fx.restart().await;
        let report = Reconciler::new(services.clone()).run_once().await;
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.failed, 0);
        let record = services.store.get(record.id).await.unwrap();
        assert_eq!(record.status, TxStatus::Confirmed);
        assert_eq!(record.tx_hash, Some(first));
    }

    #[tokio::test]
    async fn test_built_record_abandoned_after_restart() {
        let fx = fixture();
        let record = testkit::built_record(&fx.services, "opp-1").await;

        let services = fx.restart().await;
        let report = Reconciler::new(services.clone()).run_once().await;
        assert_eq!(report.abandoned, 1);
        let record = services.store.get(record.id).await.unwrap();
        assert_eq!(record.status, TxStatus::Abandoned);
        assert_eq!(record.last_error().unwrap().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_replaced_nonce_fails_record() {
        let fx = fixture();
        let record = fx.pending_record("opp-1").await;
        fx.chain.drop_all_pending();
        // Something else used nonce 0.
        fx.chain.set_account_nonce(ACCOUNT, CHAIN, 1);

        let services = fx.restart().await;
        let report = Reconciler::new(services.clone()).run_once().await;
        assert_eq!(report.failed, 1);
        let record = services.store.get(record.id).await.unwrap();
        assert_eq!(record.status, TxStatus::Failed);
        assert_eq!(record.last_error().unwrap().kind, ErrorKind::NonceConflict);
    }

    #[tokio::test]
    async fn test_in_mempool_record_stays_pending() {
        let fx = fixture();
        fx.pending_record("opp-1").await;

        let services = fx.restart().await;
        let report = Reconciler::new(services).run_once().await;
        assert_eq!(report.still_pending, 1);
        assert_eq!(report.confirmed + report.failed + report.abandoned, 0);
    }

    #[tokio::test]
    async fn test_owned_records_skipped() {
        let fx = fixture();
        testkit::built_record(&fx.services, "opp-1").await;

        let report = Reconciler::new(fx.services.clone()).run_once().await;
        assert_eq!(report.owned, 1);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test]
    async fn test_idle_slot_healed_to_chain() {
        let fx = fixture();
        let nonces = &fx.services.nonces;
        for _ in 0..3 {
            let n = nonces.allocate(ACCOUNT, CHAIN).await.unwrap();
            nonces.settle(ACCOUNT, CHAIN, n).await;
        }
        // Only nonce 0 ever reached the chain.
        fx.chain.set_account_nonce(ACCOUNT, CHAIN, 1);

        let report = Reconciler::new(fx.services.clone()).run_once().await;
        assert_eq!(report.healed_slots, 1);
        assert_eq!(nonces.allocate(ACCOUNT, CHAIN).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let fx = fixture();
        let shutdown = CancellationToken::new();
        let reconciler = Reconciler::new(fx.services.clone());
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { reconciler.run_until(Duration::from_millis(5), shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
