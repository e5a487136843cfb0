//! Submission attempts for one transaction.
//!
//! Every attempt goes through the `tx-submit:chain-{id}` breaker first; a
//! rejection ends the chain with `CircuitOpen` and is not counted. Failures
//! are classified and handled per kind:
//!
//! - Transient: back off, re-submit with +15%
//! - GasTooLow: back off, re-submit with +15%
//! - MempoolDrop: re-submit with +50%
//! - NonceConflict: resync, re-allocate, re-submit immediately
//! - Fatal: abort
//!
//! The chain ends when an attempt is accepted or when the attempt count or
//! elapsed-time budget runs out, whichever comes first.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExecutionContext, ExecutionServices};
use crate::breaker::{keys, CheckResult};
use crate::chain::{timed, ProviderError, RawTx, ReceiptStatus, UnsignedTx};
use crate::config::RetryConfig;
use crate::events::ExecutionEvent;
use crate::storage::TransitionMeta;
use crate::types::{
    AttemptOutcome, ChainId, ErrorKind, ExecError, GasQuote, RetryAttempt, TransactionRecord,
    TxStatus,
};

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `min(base × 2^retry, cap) × (1 ± jitter)`, re-capped.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_fraction: f64,
}

impl Backoff {
    /// Delay before retry `retry` (0-based) without jitter.
    pub fn nominal(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }

    /// `unit` in `[-1, 1]` picks the point inside the jitter band.
    pub fn delay_with(&self, retry: u32, unit: f64) -> Duration {
        let nominal = self.nominal(retry).as_secs_f64();
        let jittered = nominal * (1.0 + self.jitter_fraction * unit.clamp(-1.0, 1.0));
        Duration::from_secs_f64(jittered.max(0.0)).min(self.cap)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let unit = if self.jitter_fraction > 0.0 {
            rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with(retry, unit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    /// Per network call, independent of `max_elapsed`.
    pub call_timeout: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_elapsed: Duration::from_secs(config.max_elapsed_secs),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            backoff: Backoff {
                base: Duration::from_millis(config.base_delay_ms),
                cap: Duration::from_millis(config.max_delay_ms),
                jitter_fraction: config.jitter_fraction,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

const GAS_TOO_LOW: &[&str] = &[
    "underpriced",
    "fee too low",
    "less than block base fee",
    "fee cap less than",
];

const NONCE_CONFLICT: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "nonce has already been used",
    "invalid nonce",
];

const FATAL: &[&str] = &[
    "revert",
    "insufficient funds",
    "invalid signature",
    "invalid sender",
    "intrinsic gas too low",
    "exceeds block gas limit",
];

/// Map a collaborator failure onto the error taxonomy.
pub fn classify(err: &ProviderError) -> ErrorKind {
    match err {
        ProviderError::Timeout(_) | ProviderError::Transport(_) | ProviderError::Malformed(_) => {
            ErrorKind::Transient
        }
        ProviderError::Signer(_)
        | ProviderError::Encoding(_)
        | ProviderError::UnsupportedChain(_) => ErrorKind::Fatal,
        ProviderError::Rpc { message, .. } => {
            let message = message.to_lowercase();
            let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));
            if has(GAS_TOO_LOW) {
                ErrorKind::GasTooLow
            } else if has(NONCE_CONFLICT) {
                ErrorKind::NonceConflict
            } else if has(FATAL) {
                ErrorKind::Fatal
            } else {
                // Rate limits, "already known" without a hash, node hiccups.
                ErrorKind::Transient
            }
        }
    }
}

fn escalates(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Transient | ErrorKind::GasTooLow | ErrorKind::MempoolDrop
    )
}

// ---------------------------------------------------------------------------
// Attempt chain
// ---------------------------------------------------------------------------

/// Attempts made for one transaction, carried across confirmation re-entries.
#[derive(Debug, Clone)]
pub struct AttemptChain {
    pub transaction_id: Uuid,
    pub account_id: String,
    pub chain_id: ChainId,
    pub resource_key: String,
    pub nonce: u64,
    pub gas: GasQuote,
    pub attempts: Vec<RetryAttempt>,
    started: Instant,
    next_reason: Option<ErrorKind>,
    reentered: bool,
    maybe_on_wire: bool,
}

impl AttemptChain {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether some attempt at the current nonce may have reached a node.
    pub fn maybe_on_wire(&self) -> bool {
        self.maybe_on_wire
    }

    pub fn last_kind(&self) -> Option<ErrorKind> {
        self.attempts.last().and_then(|a| match a.classified_outcome {
            AttemptOutcome::Failed(kind) => Some(kind),
            AttemptOutcome::Accepted => None,
        })
    }

    /// Send the transaction through the retry path again after confirmation
    /// monitoring gave up on it.
    pub fn reenter(&mut self, reason: ErrorKind) {
        self.next_reason = Some(reason);
        self.reentered = true;
    }
}

/// Why a single attempt failed.
struct AttemptFailure {
    kind: ErrorKind,
    message: String,
    reached_node: bool,
    /// Hash of the signed payload, when signing got that far.
    hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct RetryOrchestrator {
    services: Arc<ExecutionServices>,
}

impl RetryOrchestrator {
    pub fn new(services: Arc<ExecutionServices>) -> Self {
        Self { services }
    }

    /// Start an attempt chain for a stored record.
    pub fn begin(&self, record: &TransactionRecord) -> Result<AttemptChain, ExecError> {
        let gas = record
            .gas
            .clone()
            .ok_or_else(|| ExecError::Fatal(format!("record {} has no gas quote", record.id)))?;
        Ok(AttemptChain {
            transaction_id: record.id,
            account_id: record.account_id.clone(),
            chain_id: record.chain_id,
            resource_key: keys::tx_submit(record.chain_id),
            nonce: record.nonce,
            gas,
            attempts: Vec::new(),
            started: Instant::now(),
            next_reason: None,
            reentered: false,
            maybe_on_wire: record.status.may_be_broadcast(),
        })
    }

    /// Submit until a node accepts the transaction, returning the `Pending` record.
    pub async fn run(
        &self,
        chain: &mut AttemptChain,
        call: &RawTx,
        policy: &RetryPolicy,
        ctx: &ExecutionContext,
    ) -> Result<TransactionRecord, ExecError> {
        let store = &self.services.store;
        loop {
            if let Some(reason) = ctx.cancel_reason() {
                return Err(ExecError::Cancelled(reason.to_string()));
            }

            let delay = Self::next_delay(chain, policy);
            Self::ensure_budget(chain, policy, delay)?;
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancelled() => {
                        let reason = ctx.cancel_reason().unwrap_or("cancelled");
                        return Err(ExecError::Cancelled(reason.to_string()));
                    }
                }
            }

            let attempt_number = chain.attempt_count() + 1;
            if let Some(reason) = chain.next_reason.filter(|k| escalates(*k)) {
                chain.gas = self.services.gas.escalate(&chain.gas, attempt_number, reason)?;
            }
            chain.reentered = false;

            let mut record = store.get(chain.transaction_id).await?;
            if record.status == TxStatus::Built {
                record = store
                    .transition(
                        record.id,
                        TxStatus::Submitted,
                        TransitionMeta::none().with_gas(chain.gas.clone()),
                    )
                    .await?;
            }

            let permit = match self.services.breakers.check(&chain.resource_key) {
                CheckResult::Allowed(permit) => permit,
                CheckResult::Rejected(reason) => {
                    warn!(
                        tx_id = %chain.transaction_id,
                        resource_key = %chain.resource_key,
                        reason = %reason,
                        "Submission blocked by circuit breaker"
                    );
                    return Err(ExecError::CircuitOpen {
                        resource_key: chain.resource_key.clone(),
                        reason,
                    });
                }
            };

            debug!(
                tx_id = %chain.transaction_id,
                attempt = attempt_number,
                nonce = chain.nonce,
                gas = %chain.gas,
                "Broadcasting"
            );

            match self.attempt(chain, call, policy).await {
                Ok(hash) => {
                    self.services.breakers.complete(&chain.resource_key, permit, true);
                    chain.maybe_on_wire = true;
                    chain.next_reason = None;
                    self.push_attempt(chain, attempt_number, delay, AttemptOutcome::Accepted, Some(hash.clone()), None);
                    let record = store
                        .transition(
                            record.id,
                            TxStatus::Pending,
                            TransitionMeta::none()
                                .with_hash(hash)
                                .with_gas(chain.gas.clone()),
                        )
                        .await?;
                    return Ok(record);
                }
                Err(failure) => {
                    let kind = failure.kind;
                    self.services
                        .breakers
                        .complete(&chain.resource_key, permit, !kind.is_resource_failure());
                    let on_wire = failure.reached_node && kind == ErrorKind::Transient;
                    if on_wire {
                        chain.maybe_on_wire = true;
                    }
                    self.push_attempt(
                        chain,
                        attempt_number,
                        delay,
                        AttemptOutcome::Failed(kind),
                        None,
                        Some(failure.message.clone()),
                    );

                    // An accepted bid stays on the record; failed re-bids do not replace it.
                    let mut meta = TransitionMeta::none().with_error(kind, failure.message.clone());
                    if record.status == TxStatus::Submitted {
                        meta = meta.with_gas(chain.gas.clone());
                    }
                    // The node may still mine a bid whose broadcast timed out.
                    if let Some(hash) = failure.hash.filter(|_| on_wire) {
                        meta = meta.with_unconfirmed_hash(hash);
                    }
                    let record = store.transition(record.id, record.status, meta).await?;

                    match kind {
                        ErrorKind::Fatal => return Err(ExecError::Fatal(failure.message)),
                        ErrorKind::NonceConflict => {
                            if let Some(record) = self.resolve_nonce_conflict(chain, &record, policy).await? {
                                return Ok(record);
                            }
                        }
                        _ => {}
                    }
                    chain.next_reason = Some(kind);
                }
            }
        }
    }

    /// Sign and broadcast once under per-call timeouts.
    async fn attempt(
        &self,
        chain: &AttemptChain,
        call: &RawTx,
        policy: &RetryPolicy,
    ) -> Result<String, AttemptFailure> {
        let unsigned = UnsignedTx {
            chain_id: chain.chain_id,
            from: chain.account_id.clone(),
            nonce: chain.nonce,
            call: call.clone(),
            max_fee_per_gas: chain.gas.max_fee_per_gas,
            max_priority_fee_per_gas: chain.gas.priority_fee,
        };

        let signed = timed(
            policy.call_timeout,
            self.services.signer.sign(&unsigned, &chain.account_id),
        )
        .await
        .map_err(|e| AttemptFailure {
            kind: classify(&e),
            message: e.to_string(),
            reached_node: false,
            hash: None,
        })?;

        match timed(policy.call_timeout, self.services.provider.broadcast(&signed)).await {
            Ok(hash) => Ok(hash),
            Err(e) => match (&e, signed.hash) {
                // The node already holds this exact transaction.
                (ProviderError::Rpc { message, .. }, Some(hash))
                    if message.to_lowercase().contains("already known") =>
                {
                    Ok(hash)
                }
                (_, hash) => Err(AttemptFailure {
                    kind: classify(&e),
                    message: e.to_string(),
                    reached_node: true,
                    hash,
                }),
            },
        }
    }

    /// Returns the record when the conflict turns out to be one of our own
    /// attempts holding the nonce; otherwise moves the chain to a fresh nonce.
    async fn resolve_nonce_conflict(
        &self,
        chain: &mut AttemptChain,
        record: &TransactionRecord,
        policy: &RetryPolicy,
    ) -> Result<Option<TransactionRecord>, ExecError> {
        // Any bid at this nonce, accepted or timed out, may be the holder.
        for hash in record.candidate_hashes() {
            let status = timed(
                policy.call_timeout,
                self.services.provider.get_receipt(chain.chain_id, &hash),
            )
            .await;
            let holder = match status {
                Ok(ReceiptStatus::Confirmed(receipt)) => receipt.tx_hash,
                Ok(ReceiptStatus::Pending) => hash,
                Ok(ReceiptStatus::NotFound) => continue,
                Err(e) => {
                    debug!(tx_id = %chain.transaction_id, tx_hash = %hash, error = %e, "Receipt lookup failed");
                    continue;
                }
            };
            info!(tx_id = %chain.transaction_id, tx_hash = %holder, "Earlier attempt holds the nonce");
            chain.maybe_on_wire = true;
            let record = self
                .services
                .store
                .transition(record.id, TxStatus::Pending, TransitionMeta::none().with_hash(holder))
                .await?;
            return Ok(Some(record));
        }

        if record.status == TxStatus::Pending {
            // The accepted broadcast owns the nonce; confirmation decides what happened.
            return Ok(Some(record.clone()));
        }

        let nonces = &self.services.nonces;
        let old = chain.nonce;
        nonces.settle(&chain.account_id, chain.chain_id, old).await;
        nonces.resync_from(&chain.account_id, chain.chain_id).await?;
        let nonce = nonces.allocate(&chain.account_id, chain.chain_id).await?;
        self.services.store.reassign_nonce(record.id, nonce).await?;

        warn!(
            tx_id = %chain.transaction_id,
            old_nonce = old,
            new_nonce = nonce,
            "Nonce conflict resolved by re-allocation"
        );
        chain.nonce = nonce;
        chain.maybe_on_wire = false;
        Ok(None)
    }

    fn next_delay(chain: &AttemptChain, policy: &RetryPolicy) -> Duration {
        match chain.next_reason {
            None | Some(ErrorKind::NonceConflict) => Duration::ZERO,
            Some(_) if chain.reentered => Duration::ZERO,
            Some(_) => policy
                .backoff
                .delay(chain.attempt_count().saturating_sub(1)),
        }
    }

    fn ensure_budget(
        chain: &AttemptChain,
        policy: &RetryPolicy,
        delay: Duration,
    ) -> Result<(), ExecError> {
        let attempts = chain.attempt_count();
        let elapsed = chain.elapsed();
        if attempts < policy.max_attempts && elapsed + delay <= policy.max_elapsed {
            return Ok(());
        }

        let last_kind = chain
            .next_reason
            .or_else(|| chain.last_kind())
            .unwrap_or(ErrorKind::Transient);
        let message = chain
            .attempts
            .iter()
            .rev()
            .find_map(|a| a.message.clone())
            .unwrap_or_else(|| format!("{last_kind} after {attempts} attempts"));
        warn!(
            tx_id = %chain.transaction_id,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            last_kind = %last_kind,
            "Retry budget exhausted"
        );
        Err(ExecError::RetryBudgetExhausted {
            attempts,
            elapsed_ms: elapsed.as_millis() as u64,
            last_kind,
            message,
        })
    }

    fn push_attempt(
        &self,
        chain: &mut AttemptChain,
        attempt_number: u32,
        delay: Duration,
        outcome: AttemptOutcome,
        tx_hash: Option<String>,
        message: Option<String>,
    ) {
        let attempt = RetryAttempt {
            transaction_id: chain.transaction_id,
            attempt_number,
            nonce: chain.nonce,
            delay_ms: delay.as_millis() as u64,
            gas_escalation_pct: chain.gas.cumulative_escalation_pct,
            classified_outcome: outcome,
            tx_hash,
            message,
            at: Utc::now(),
        };
        self.services
            .observer
            .on_event(&ExecutionEvent::RetryAttempted(attempt.clone()));
        chain.attempts.push(attempt);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
