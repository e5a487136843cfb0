//! Shared types for the FASTLANE execution core.
//!
//! These types form the data model used across all modules. They are kept
//! free of component logic so that the cache, nonce, gas, breaker, storage
//! and engine modules can all depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Numeric chain identifier (EIP-155).
pub type ChainId = u64;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Fee urgency tier requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

impl Urgency {
    pub const ALL: &'static [Urgency] = &[Urgency::Low, Urgency::Normal, Urgency::High];
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Normal => write!(f, "normal"),
            Urgency::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Urgency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "slow" => Ok(Urgency::Low),
            "normal" | "standard" | "medium" => Ok(Urgency::Normal),
            "high" | "fast" | "urgent" => Ok(Urgency::High),
            _ => Err(anyhow::anyhow!("Unknown urgency tier: {s}")),
        }
    }
}

/// Execution lane an opportunity was detected on.
///
/// The Fast lane relies exclusively on pre-cached risk data; the Smart lane
/// may wait for a synchronous score from the risk collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    #[default]
    Fast,
    Smart,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Fast => write!(f, "fast"),
            Lane::Smart => write!(f, "smart"),
        }
    }
}

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// Swap parameters handed to the DEX/router collaborator for encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapParams {
    pub router: String,
    pub token_in: String,
    pub token_out: String,
    pub amount_in: Decimal,
    pub min_amount_out: Decimal,
    /// Pre-encoded calldata, when the detector already produced it.
    #[serde(default)]
    pub calldata: Option<String>,
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

/// A detected trading opportunity, the unit of work for one coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    /// Stable fingerprint; doubles as the idempotency key.
    pub fingerprint: String,
    pub account_id: String,
    pub chain_id: ChainId,
    #[serde(default)]
    pub lane: Lane,
    #[serde(default)]
    pub urgency: Urgency,
    pub swap: SwapParams,
    #[serde(default = "Utc::now")]
    pub detected_at: DateTime<Utc>,
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} -> {} on chain {} ({} lane, {})",
            self.fingerprint,
            self.swap.amount_in,
            self.swap.token_in,
            self.swap.token_out,
            self.chain_id,
            self.lane,
            self.urgency,
        )
    }
}

// ---------------------------------------------------------------------------
// Gas
// ---------------------------------------------------------------------------

/// Fee bid for a single submission attempt. Units are gwei.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasQuote {
    pub chain_id: ChainId,
    pub urgency: Urgency,
    pub base_fee: Decimal,
    pub priority_fee: Decimal,
    /// Attempt number this bid was computed for (0 = initial quote).
    pub escalation_step: u32,
    /// Compounded escalation over the initial priority fee, in percent.
    pub cumulative_escalation_pct: Decimal,
    /// Chain fee ceiling (max fee per gas) this quote must stay under.
    pub ceiling: Decimal,
    /// EIP-1559 `maxFeePerGas`.
    pub max_fee_per_gas: Decimal,
}

impl GasQuote {
    /// Effective bid: base fee plus priority fee.
    pub fn bid(&self) -> Decimal {
        self.base_fee + self.priority_fee
    }
}

impl fmt::Display for GasQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chain={} base={} prio={} max={} step={} esc={}%",
            self.chain_id,
            self.base_fee,
            self.priority_fee,
            self.max_fee_per_gas,
            self.escalation_step,
            self.cumulative_escalation_pct,
        )
    }
}

// ---------------------------------------------------------------------------
// Transaction lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Built,
    Submitted,
    Pending,
    Confirmed,
    Failed,
    Abandoned,
}

impl TxStatus {
    /// Whether `next` is an allowed edge from `self`.
    ///
    /// Self-edges are only allowed on `Submitted` and `Pending`, where they
    /// carry metadata (a re-broadcast hash or an error entry).
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Built, Submitted)
                | (Built, Failed)
                | (Built, Abandoned)
                | (Submitted, Submitted)
                | (Submitted, Pending)
                | (Submitted, Failed)
                | (Submitted, Abandoned)
                | (Pending, Pending)
                | (Pending, Confirmed)
                | (Pending, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed | TxStatus::Abandoned)
    }

    /// Whether a transaction in this status may already be on the wire.
    pub fn may_be_broadcast(self) -> bool {
        matches!(self, TxStatus::Submitted | TxStatus::Pending | TxStatus::Confirmed)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Built => "built",
            TxStatus::Submitted => "submitted",
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// One entry in a record's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Durable record of one transaction, the single source of truth for
/// "has this trade already happened".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    /// Fingerprint of the opportunity that produced this transaction.
    pub opportunity_id: String,
    pub account_id: String,
    pub chain_id: ChainId,
    pub nonce: u64,
    pub status: TxStatus,
    /// Hash of the latest accepted bid.
    pub tx_hash: Option<String>,
    /// Every bid at the current nonce that may have reached a node, oldest
    /// first. Any one of them can be the one that gets mined.
    #[serde(default)]
    pub broadcast_hashes: Vec<String>,
    pub gas: Option<GasQuote>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error_history: Vec<ErrorEntry>,
}

impl TransactionRecord {
    /// Fresh record in `Built` status.
    pub fn built(opportunity: &Opportunity, nonce: u64, gas: GasQuote) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            opportunity_id: opportunity.fingerprint.clone(),
            account_id: opportunity.account_id.clone(),
            chain_id: opportunity.chain_id,
            nonce,
            status: TxStatus::Built,
            tx_hash: None,
            broadcast_hashes: Vec::new(),
            gas: Some(gas),
            created_at: now,
            submitted_at: None,
            confirmed_at: None,
            updated_at: now,
            error_history: Vec::new(),
        }
    }

    pub fn last_error(&self) -> Option<&ErrorEntry> {
        self.error_history.last()
    }

    /// Hashes to look up on chain, latest accepted bid first.
    pub fn candidate_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.tx_hash.iter().cloned().collect();
        for hash in self.broadcast_hashes.iter().rev() {
            if !hashes.contains(hash) {
                hashes.push(hash.clone());
            }
        }
        hashes
    }
}

impl fmt::Display for TransactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}/{} nonce={} hash={} errors={}",
            self.id,
            self.status,
            self.account_id,
            self.chain_id,
            self.nonce,
            self.tx_hash.as_deref().unwrap_or("-"),
            self.error_history.len(),
        )
    }
}

/// Classified result of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Accepted,
    Failed(ErrorKind),
}

/// Append-only audit entry for one submission attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub transaction_id: Uuid,
    pub attempt_number: u32,
    pub nonce: u64,
    /// Backoff slept before this attempt.
    pub delay_ms: u64,
    /// Cumulative gas escalation in effect for this attempt, in percent.
    pub gas_escalation_pct: Decimal,
    pub classified_outcome: AttemptOutcome,
    pub tx_hash: Option<String>,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Score returned by the risk collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScore {
    pub score: Decimal,
    #[serde(default)]
    pub categories: BTreeMap<String, Decimal>,
    pub computed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Error taxonomy shared by every component of the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transient,
    NonceConflict,
    MempoolDrop,
    GasTooLow,
    GasCeilingExceeded,
    CircuitOpen,
    Fatal,
    Busy,
    Cancelled,
}

impl ErrorKind {
    /// Kinds the retry orchestrator handles itself, up to the retry budget.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::NonceConflict
                | ErrorKind::MempoolDrop
                | ErrorKind::GasTooLow
        )
    }

    /// Whether this kind counts as a failure of the resource it came from.
    pub fn is_resource_failure(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Fatal)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::NonceConflict => "nonce_conflict",
            ErrorKind::MempoolDrop => "mempool_drop",
            ErrorKind::GasTooLow => "gas_too_low",
            ErrorKind::GasCeilingExceeded => "gas_ceiling_exceeded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Busy => "busy",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Domain-specific error for the execution pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    #[error("Transaction dropped from mempool: {0}")]
    MempoolDrop(String),

    #[error("Gas bid too low: {0}")]
    GasTooLow(String),

    #[error("Gas ceiling exceeded: {0}")]
    GasCeilingExceeded(String),

    #[error("Circuit open for {resource_key}: {reason}")]
    CircuitOpen { resource_key: String, reason: String },

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Nonce manager busy: {0}")]
    Busy(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Risk check failed: {0}")]
    Risk(String),

    #[error("Retry budget exhausted after {attempts} attempts in {elapsed_ms}ms (last: {last_kind}): {message}")]
    RetryBudgetExhausted {
        attempts: u32,
        elapsed_ms: u64,
        last_kind: ErrorKind,
        message: String,
    },
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Transient(_) => ErrorKind::Transient,
            ExecError::NonceConflict(_) => ErrorKind::NonceConflict,
            ExecError::MempoolDrop(_) => ErrorKind::MempoolDrop,
            ExecError::GasTooLow(_) => ErrorKind::GasTooLow,
            ExecError::GasCeilingExceeded(_) => ErrorKind::GasCeilingExceeded,
            ExecError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ExecError::Fatal(_) | ExecError::Risk(_) => ErrorKind::Fatal,
            ExecError::Busy(_) => ErrorKind::Busy,
            ExecError::Cancelled(_) => ErrorKind::Cancelled,
            ExecError::RetryBudgetExhausted { last_kind, .. } => *last_kind,
        }
    }

    /// Build an error of the given kind from a message.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Transient => ExecError::Transient(message),
            ErrorKind::NonceConflict => ExecError::NonceConflict(message),
            ErrorKind::MempoolDrop => ExecError::MempoolDrop(message),
            ErrorKind::GasTooLow => ExecError::GasTooLow(message),
            ErrorKind::GasCeilingExceeded => ExecError::GasCeilingExceeded(message),
            ErrorKind::CircuitOpen => ExecError::CircuitOpen {
                resource_key: String::new(),
                reason: message,
            },
            ErrorKind::Fatal => ExecError::Fatal(message),
            ErrorKind::Busy => ExecError::Busy(message),
            ErrorKind::Cancelled => ExecError::Cancelled(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
