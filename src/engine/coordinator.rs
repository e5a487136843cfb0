//! Per-opportunity execution state machine.
//!
//! `Idle → RiskCheck → GasCompute → NonceAllocate → Submit → AwaitConfirm → {Done | Failed}`
//!
//! The store is consulted first: an opportunity that already reached a
//! terminal record is replayed without touching the chain, and one whose
//! transaction is pending resumes at AwaitConfirm. Confirmation monitoring
//! feeds back into Submit when the transaction is dropped or takes too long.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::retry::{classify, AttemptChain, RetryOrchestrator, RetryPolicy};
use super::{ExecutionContext, ExecutionServices};
use crate::breaker::{keys, CheckResult};
use crate::chain::{timed, RawTx, Receipt, ReceiptStatus};
use crate::events::{ExecutionEvent, ExecutionObserver};
use crate::risk::{RiskEntry, RiskLookup};
use crate::storage::{StoreError, TransitionMeta};
use crate::types::{
    ErrorKind, ExecError, GasQuote, Lane, Opportunity, RetryAttempt, TransactionRecord, TxStatus,
};

/// Consecutive `NotFound` polls before a transaction counts as dropped.
const NOT_FOUND_POLLS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    RiskCheck,
    GasCompute,
    NonceAllocate,
    Submit,
    AwaitConfirm,
    Done,
    Failed,
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Confirmed,
    Failed,
    /// Nothing reached the chain.
    Abandoned,
    /// The transaction is on the wire but nobody watches it any more; the
    /// reconciler settles it later.
    MonitoringAbandoned,
}

impl Resolution {
    fn of(status: TxStatus) -> Self {
        match status {
            TxStatus::Confirmed => Resolution::Confirmed,
            TxStatus::Failed => Resolution::Failed,
            TxStatus::Abandoned | TxStatus::Built => Resolution::Abandoned,
            TxStatus::Submitted | TxStatus::Pending => Resolution::MonitoringAbandoned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

/// Terminal result of one opportunity.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub fingerprint: String,
    pub resolution: Resolution,
    /// `Done` or `Failed`.
    pub final_stage: Stage,
    /// Stage that was active when execution stopped.
    pub stopped_at: Stage,
    pub record: Option<TransactionRecord>,
    pub attempts: Vec<RetryAttempt>,
    pub error: Option<ExecError>,
    pub timings: Vec<StageTiming>,
    /// The outcome came from an existing record; nothing was sent.
    pub replayed: bool,
}

/// Stage bookkeeping for one execution.
struct Run<'a> {
    fingerprint: String,
    observer: &'a dyn ExecutionObserver,
    stage: Stage,
    entered: Instant,
    timings: Vec<StageTiming>,
}

impl<'a> Run<'a> {
    fn new(fingerprint: &str, observer: &'a dyn ExecutionObserver) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            observer,
            stage: Stage::Idle,
            entered: Instant::now(),
            timings: Vec::new(),
        }
    }

    fn enter(&mut self, next: Stage) {
        let elapsed_ms = self.entered.elapsed().as_millis() as u64;
        self.observer.on_event(&ExecutionEvent::StageCompleted {
            fingerprint: self.fingerprint.clone(),
            stage: self.stage,
            elapsed_ms,
        });
        self.timings.push(StageTiming {
            stage: self.stage,
            elapsed_ms,
        });
        debug!(fingerprint = %self.fingerprint, from = ?self.stage, to = ?next, elapsed_ms, "Stage change");
        self.stage = next;
        self.entered = Instant::now();
    }

    fn finish(
        &mut self,
        resolution: Resolution,
        record: Option<TransactionRecord>,
        attempts: Vec<RetryAttempt>,
        error: Option<ExecError>,
        replayed: bool,
    ) -> ExecutionOutcome {
        let stopped_at = self.stage;
        let final_stage = match resolution {
            Resolution::Confirmed => Stage::Done,
            _ => Stage::Failed,
        };
        self.enter(final_stage);
        ExecutionOutcome {
            fingerprint: self.fingerprint.clone(),
            resolution,
            final_stage,
            stopped_at,
            record,
            attempts,
            error,
            timings: std::mem::take(&mut self.timings),
            replayed,
        }
    }

    fn abandon(&mut self, error: ExecError) -> ExecutionOutcome {
        self.finish(Resolution::Abandoned, None, Vec::new(), Some(error), false)
    }
}

enum Confirmation {
    Confirmed(Receipt),
    Reverted(Receipt),
    Dropped,
    TimedOut,
    Cancelled(&'static str),
}

pub struct ExecutionCoordinator {
    services: Arc<ExecutionServices>,
    retry: RetryOrchestrator,
    policy: RetryPolicy,
    max_risk_score: Decimal,
    confirm_timeout: Duration,
    confirm_poll: Duration,
}

impl ExecutionCoordinator {
    pub fn new(services: Arc<ExecutionServices>) -> Self {
        let engine = &services.config.engine;
        Self {
            retry: RetryOrchestrator::new(services.clone()),
            policy: RetryPolicy::from_config(&services.config.retry),
            max_risk_score: engine.max_risk_score,
            confirm_timeout: engine.confirm_timeout(),
            confirm_poll: engine.confirm_poll(),
            services,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Run one opportunity to a terminal outcome.
    pub async fn execute(&self, opp: &Opportunity, ctx: &ExecutionContext) -> ExecutionOutcome {
        let mut run = Run::new(&opp.fingerprint, self.services.observer.as_ref());
        let outcome = self.drive(opp, ctx, &mut run).await;

        self.services.observer.on_event(&ExecutionEvent::Terminal {
            fingerprint: outcome.fingerprint.clone(),
            resolution: outcome.resolution,
            transaction_id: outcome.record.as_ref().map(|r| r.id),
            attempts: outcome.attempts.len(),
            error: outcome.error.as_ref().map(|e| e.to_string()),
        });
        outcome
    }

    async fn drive(&self, opp: &Opportunity, ctx: &ExecutionContext, run: &mut Run<'_>) -> ExecutionOutcome {
        let store = &self.services.store;

        if let Some(existing) = store.find_by_opportunity(&opp.fingerprint).await {
            let status = existing.status;
            return match status {
                TxStatus::Pending => {
                    info!(fingerprint = %opp.fingerprint, tx_id = %existing.id, "Resuming pending transaction");
                    self.resume(opp, existing, ctx, run).await
                }
                status if status.is_terminal() => {
                    info!(fingerprint = %opp.fingerprint, tx_id = %existing.id, status = %status, "Replaying finished opportunity");
                    run.finish(Resolution::of(status), Some(existing), Vec::new(), None, true)
                }
                status => {
                    warn!(fingerprint = %opp.fingerprint, tx_id = %existing.id, status = %status, "Opportunity already in progress");
                    run.finish(
                        Resolution::Abandoned,
                        Some(existing),
                        Vec::new(),
                        Some(ExecError::Busy(format!("transaction for {} is already {status}", opp.fingerprint))),
                        true,
                    )
                }
            };
        }

        // ---- Risk ----
        run.enter(Stage::RiskCheck);
        let entry = match self.check_risk(opp).await {
            Ok(entry) => entry,
            Err(e) => {
                info!(fingerprint = %opp.fingerprint, reason = %e, "Opportunity rejected by risk check");
                return run.abandon(e);
            }
        };
        debug!(fingerprint = %opp.fingerprint, score = %entry.score, "Risk accepted");

        // ---- Gas ----
        if let Some(reason) = ctx.cancel_reason() {
            return run.abandon(ExecError::Cancelled(reason.to_string()));
        }
        run.enter(Stage::GasCompute);
        let (gas, call) = match self.compute_gas(opp).await {
            Ok(v) => v,
            Err(e) => {
                warn!(fingerprint = %opp.fingerprint, error = %e, "Gas computation failed");
                let resolution = match e.kind() {
                    ErrorKind::GasCeilingExceeded | ErrorKind::Fatal => Resolution::Failed,
                    _ => Resolution::Abandoned,
                };
                return run.finish(resolution, None, Vec::new(), Some(e), false);
            }
        };

        // ---- Nonce ----
        if let Some(reason) = ctx.cancel_reason() {
            return run.abandon(ExecError::Cancelled(reason.to_string()));
        }
        run.enter(Stage::NonceAllocate);
        let nonces = &self.services.nonces;
        let nonce = match nonces.allocate(&opp.account_id, opp.chain_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(fingerprint = %opp.fingerprint, error = %e, "Nonce allocation failed");
                return run.abandon(e.into());
            }
        };

        let record = TransactionRecord::built(opp, nonce, gas);
        if let Err(e) = store.create(record.clone()).await {
            self.release_nonce(&record).await;
            return match e {
                StoreError::Duplicate { .. } => match store.find_by_opportunity(&opp.fingerprint).await {
                    Some(existing) => {
                        let resolution = Resolution::of(existing.status);
                        run.finish(resolution, Some(existing), Vec::new(), None, true)
                    }
                    None => run.abandon(e.into()),
                },
                other => run.finish(Resolution::Failed, None, Vec::new(), Some(other.into()), false),
            };
        }
        info!(
            fingerprint = %opp.fingerprint,
            tx_id = %record.id,
            nonce,
            max_fee = %record.gas.as_ref().map(|g| g.max_fee_per_gas).unwrap_or_default(),
            "Transaction built"
        );

        // ---- Submit / confirm ----
        run.enter(Stage::Submit);
        let chain = match self.retry.begin(&record) {
            Ok(chain) => chain,
            Err(e) => return self.terminate(run, &record, Vec::new(), false, e).await,
        };
        self.submit_and_confirm(chain, &call, ctx, run).await
    }

    /// Pick up a transaction that is already on the wire.
    async fn resume(
        &self,
        opp: &Opportunity,
        record: TransactionRecord,
        ctx: &ExecutionContext,
        run: &mut Run<'_>,
    ) -> ExecutionOutcome {
        let prepared = self
            .services
            .encoder
            .encode_swap(&opp.swap)
            .map_err(|e| ExecError::Fatal(format!("swap encoding failed: {e}")))
            .and_then(|call| self.retry.begin(&record).map(|chain| (chain, call)));
        match prepared {
            Ok((chain, call)) => {
                run.enter(Stage::AwaitConfirm);
                self.confirm_loop(chain, record, &call, ctx, run).await
            }
            Err(e) => run.finish(Resolution::MonitoringAbandoned, Some(record), Vec::new(), Some(e), true),
        }
    }

    async fn submit_and_confirm(
        &self,
        mut chain: AttemptChain,
        call: &RawTx,
        ctx: &ExecutionContext,
        run: &mut Run<'_>,
    ) -> ExecutionOutcome {
        let record = match self.retry.run(&mut chain, call, &self.policy, ctx).await {
            Ok(record) => record,
            Err(e) => return self.fail_chain(run, chain, e).await,
        };
        run.enter(Stage::AwaitConfirm);
        self.confirm_loop(chain, record, call, ctx, run).await
    }

    /// Poll for confirmation, re-entering Submit when the transaction is
    /// dropped or confirmation times out.
    async fn confirm_loop(
        &self,
        mut chain: AttemptChain,
        mut record: TransactionRecord,
        call: &RawTx,
        ctx: &ExecutionContext,
        run: &mut Run<'_>,
    ) -> ExecutionOutcome {
        let store = &self.services.store;
        loop {
            match self.await_confirmation(&record, ctx).await {
                Confirmation::Confirmed(receipt) => {
                    let meta = TransitionMeta::none().with_hash(receipt.tx_hash.clone());
                    let result = store.transition(record.id, TxStatus::Confirmed, meta).await;
                    self.settle_nonce(&record).await;
                    return match result {
                        Ok(confirmed) => {
                            info!(
                                fingerprint = %run.fingerprint,
                                tx_id = %confirmed.id,
                                block = receipt.block_number,
                                tx_hash = %receipt.tx_hash,
                                "Transaction confirmed"
                            );
                            run.finish(Resolution::Confirmed, Some(confirmed), chain.attempts, None, false)
                        }
                        Err(e) => run.finish(
                            Resolution::MonitoringAbandoned,
                            Some(record),
                            chain.attempts,
                            Some(e.into()),
                            false,
                        ),
                    };
                }
                Confirmation::Reverted(receipt) => {
                    let message = format!("reverted in block {}", receipt.block_number);
                    warn!(fingerprint = %run.fingerprint, tx_id = %record.id, tx_hash = %receipt.tx_hash, "Transaction reverted");
                    let meta = TransitionMeta::none().with_error(ErrorKind::Fatal, message.clone());
                    let result = store.transition(record.id, TxStatus::Failed, meta).await;
                    self.settle_nonce(&record).await;
                    let record = result.unwrap_or(record);
                    return run.finish(
                        Resolution::Failed,
                        Some(record),
                        chain.attempts,
                        Some(ExecError::Fatal(message)),
                        false,
                    );
                }
                Confirmation::Cancelled(reason) => {
                    warn!(fingerprint = %run.fingerprint, tx_id = %record.id, reason, "Confirmation monitoring abandoned");
                    self.settle_nonce(&record).await;
                    return run.finish(
                        Resolution::MonitoringAbandoned,
                        Some(record),
                        chain.attempts,
                        Some(ExecError::Cancelled(reason.to_string())),
                        false,
                    );
                }
                Confirmation::Dropped => {
                    warn!(fingerprint = %run.fingerprint, tx_id = %record.id, tx_hash = ?record.tx_hash, "Transaction dropped from mempool");
                    chain.reenter(ErrorKind::MempoolDrop);
                }
                Confirmation::TimedOut => {
                    warn!(
                        fingerprint = %run.fingerprint,
                        tx_id = %record.id,
                        timeout_ms = self.confirm_timeout.as_millis() as u64,
                        "Confirmation timed out"
                    );
                    chain.reenter(ErrorKind::Transient);
                }
            }

            run.enter(Stage::Submit);
            record = match self.retry.run(&mut chain, call, &self.policy, ctx).await {
                Ok(record) => record,
                Err(e) => return self.fail_chain(run, chain, e).await,
            };
            run.enter(Stage::AwaitConfirm);
        }
    }

    /// Poll every bid at the record's nonce. Whichever gets mined decides;
    /// the record counts as dropped only once the node knows none of them.
    async fn await_confirmation(&self, record: &TransactionRecord, ctx: &ExecutionContext) -> Confirmation {
        let hashes = record.candidate_hashes();
        if hashes.is_empty() {
            return Confirmation::Dropped;
        }
        let provider = &self.services.provider;
        let breakers = &self.services.breakers;
        let rpc_key = keys::rpc(provider.name());
        let deadline = Instant::now() + self.confirm_timeout;
        let mut not_found = 0;

        loop {
            if let Some(reason) = ctx.cancel_reason() {
                return Confirmation::Cancelled(reason);
            }

            let mut unknown = 0;
            let mut in_mempool = false;
            for hash in &hashes {
                let CheckResult::Allowed(permit) = breakers.check(&rpc_key) else {
                    break;
                };
                match timed(self.policy.call_timeout, provider.get_receipt(record.chain_id, hash)).await {
                    Ok(status) => {
                        breakers.complete(&rpc_key, permit, true);
                        match status {
                            ReceiptStatus::Confirmed(receipt) if receipt.success => {
                                return Confirmation::Confirmed(receipt)
                            }
                            ReceiptStatus::Confirmed(receipt) => return Confirmation::Reverted(receipt),
                            ReceiptStatus::Pending => in_mempool = true,
                            ReceiptStatus::NotFound => unknown += 1,
                        }
                    }
                    Err(e) => {
                        let kind = classify(&e);
                        breakers.complete(&rpc_key, permit, !kind.is_resource_failure());
                        debug!(tx_id = %record.id, tx_hash = %hash, error = %e, "Receipt poll failed");
                    }
                }
            }
            if in_mempool {
                not_found = 0;
            } else if unknown == hashes.len() {
                not_found += 1;
                if not_found >= NOT_FOUND_POLLS {
                    return Confirmation::Dropped;
                }
            }

            if Instant::now() >= deadline {
                return Confirmation::TimedOut;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.confirm_poll) => {}
                _ = ctx.cancelled() => {
                    return Confirmation::Cancelled(ctx.cancel_reason().unwrap_or("cancelled"));
                }
            }
        }
    }

    async fn fail_chain(&self, run: &mut Run<'_>, chain: AttemptChain, error: ExecError) -> ExecutionOutcome {
        let record = match self.services.store.get(chain.transaction_id).await {
            Ok(record) => record,
            Err(e) => {
                return run.finish(Resolution::Failed, None, chain.attempts, Some(e.into()), false);
            }
        };
        let on_wire = chain.maybe_on_wire();
        self.terminate(run, &record, chain.attempts, on_wire, error).await
    }

    /// Settle the record after the attempt chain ended without acceptance.
    ///
    /// A `Pending` record may still be mined, so it stays `Pending` and only
    /// monitoring ends. The same holds for a `Submitted` record whose bid may
    /// have reached a node: it stays `Submitted` and the reconciler decides
    /// it from the recorded hashes. A record that never left the process is
    /// abandoned when the stop was external (cancellation, open circuit),
    /// failed otherwise.
    async fn terminate(
        &self,
        run: &mut Run<'_>,
        record: &TransactionRecord,
        attempts: Vec<RetryAttempt>,
        maybe_on_wire: bool,
        error: ExecError,
    ) -> ExecutionOutcome {
        let kind = error.kind();
        match record.status {
            TxStatus::Pending => {
                warn!(tx_id = %record.id, error = %error, "Giving up on pending transaction");
                self.settle_nonce(record).await;
                run.finish(Resolution::MonitoringAbandoned, Some(record.clone()), attempts, Some(error), false)
            }
            TxStatus::Submitted if maybe_on_wire => {
                warn!(
                    tx_id = %record.id,
                    hashes = record.broadcast_hashes.len(),
                    error = %error,
                    "Giving up on a broadcast that may still land"
                );
                let meta = TransitionMeta::none().with_error(kind, error.to_string());
                let updated = match self.services.store.transition(record.id, TxStatus::Submitted, meta).await {
                    Ok(updated) => updated,
                    Err(e) => {
                        warn!(tx_id = %record.id, error = %e, "Failed to record monitoring stop");
                        record.clone()
                    }
                };
                self.settle_nonce(record).await;
                run.finish(Resolution::MonitoringAbandoned, Some(updated), attempts, Some(error), false)
            }
            TxStatus::Built | TxStatus::Submitted => {
                let (status, resolution) = match error {
                    ExecError::Cancelled(_) | ExecError::CircuitOpen { .. } => {
                        (TxStatus::Abandoned, Resolution::Abandoned)
                    }
                    _ => (TxStatus::Failed, Resolution::Failed),
                };
                let meta = TransitionMeta::none().with_error(kind, error.to_string());
                let updated = match self.services.store.transition(record.id, status, meta).await {
                    Ok(updated) => updated,
                    Err(e) => {
                        warn!(tx_id = %record.id, error = %e, "Failed to record terminal status");
                        record.clone()
                    }
                };
                self.release_nonce(&updated).await;
                info!(tx_id = %record.id, status = %status, error = %error, "Transaction ended before acceptance");
                run.finish(resolution, Some(updated), attempts, Some(error), false)
            }
            status => {
                let resolution = Resolution::of(status);
                run.finish(resolution, Some(record.clone()), attempts, Some(error), false)
            }
        }
    }

    async fn check_risk(&self, opp: &Opportunity) -> Result<RiskEntry, ExecError> {
        let cache = &self.services.risk;
        let entry = match (opp.lane, cache.get(&opp.fingerprint)) {
            (_, RiskLookup::Fresh(entry)) => entry,
            (Lane::Fast, RiskLookup::Stale(entry)) => entry,
            (Lane::Fast, RiskLookup::Miss(reason)) => {
                return Err(ExecError::Risk(format!(
                    "no cached risk score on the fast lane ({reason:?})"
                )));
            }
            (Lane::Smart, lookup) => match &self.services.risk_source {
                Some(source) => cache
                    .refresh(source.as_ref(), &opp.fingerprint)
                    .await
                    .map_err(|e| ExecError::Risk(format!("risk refresh failed: {e:#}")))?,
                None => match lookup {
                    RiskLookup::Stale(entry) => entry,
                    _ => {
                        return Err(ExecError::Risk(
                            "no cached risk score and no risk source".to_string(),
                        ))
                    }
                },
            },
        };

        if entry.score > self.max_risk_score {
            return Err(ExecError::Risk(format!(
                "risk score {} above limit {}",
                entry.score, self.max_risk_score
            )));
        }
        Ok(entry)
    }

    async fn compute_gas(&self, opp: &Opportunity) -> Result<(GasQuote, RawTx), ExecError> {
        let provider = &self.services.provider;
        let breakers = &self.services.breakers;
        let rpc_key = keys::rpc(provider.name());

        let permit = match breakers.check(&rpc_key) {
            CheckResult::Allowed(permit) => permit,
            CheckResult::Rejected(reason) => {
                return Err(ExecError::CircuitOpen {
                    resource_key: rpc_key,
                    reason,
                })
            }
        };
        let fees = match timed(self.policy.call_timeout, provider.get_fee_data(opp.chain_id)).await {
            Ok(fees) => {
                breakers.complete(&rpc_key, permit, true);
                fees
            }
            Err(e) => {
                let kind = classify(&e);
                breakers.complete(&rpc_key, permit, !kind.is_resource_failure());
                return Err(ExecError::from_kind(kind, format!("fee lookup failed: {e}")));
            }
        };

        let gas = self.services.gas.quote(opp.chain_id, opp.urgency, &fees)?;
        let call = self
            .services
            .encoder
            .encode_swap(&opp.swap)
            .map_err(|e| ExecError::Fatal(format!("swap encoding failed: {e}")))?;
        Ok((gas, call))
    }

    async fn release_nonce(&self, record: &TransactionRecord) {
        if let Err(e) = self
            .services
            .nonces
            .release(&record.account_id, record.chain_id, record.nonce)
            .await
        {
            debug!(tx_id = %record.id, error = %e, "Nonce not released");
        }
    }

    async fn settle_nonce(&self, record: &TransactionRecord) {
        self.services
            .nonces
            .settle(&record.account_id, record.chain_id, record.nonce)
            .await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
