//! Transaction lifecycle store.
//!
//! Owns every `TransactionRecord` and is the single answer to "has this trade
//! already happened". Each record sits behind its own async mutex so a
//! transition (validate, persist, commit) is atomic per record; different
//! records never contend. Every successful write goes through to the
//! persistence backend before it becomes visible in memory.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::StateStore;
use crate::types::{
    ChainId, ErrorEntry, ErrorKind, ExecError, GasQuote, TransactionRecord, TxStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: TxStatus, to: TxStatus },

    #[error("Transaction not found: {0}")]
    NotFound(Uuid),

    #[error("Opportunity {fingerprint} already has transaction {existing}")]
    Duplicate { fingerprint: String, existing: Uuid },

    #[error("Persistence failed: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

// The pipeline cannot continue without a durable record.
impl From<StoreError> for ExecError {
    fn from(e: StoreError) -> Self {
        ExecError::Fatal(e.to_string())
    }
}

/// Metadata carried by a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    /// Accepted bid; becomes the record's `tx_hash`.
    pub tx_hash: Option<String>,
    /// Bid that may have reached a node without an answer.
    pub unconfirmed_hash: Option<String>,
    pub error: Option<ErrorEntry>,
    pub gas: Option<GasQuote>,
}

impl TransitionMeta {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.tx_hash = Some(hash.into());
        self
    }

    pub fn with_unconfirmed_hash(mut self, hash: impl Into<String>) -> Self {
        self.unconfirmed_hash = Some(hash.into());
        self
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error = Some(ErrorEntry {
            at: Utc::now(),
            kind,
            message: message.into(),
        });
        self
    }

    pub fn with_gas(mut self, gas: GasQuote) -> Self {
        self.gas = Some(gas);
        self
    }
}

type NonceKey = (String, ChainId, u64);

pub struct TransactionStateStore {
    records: DashMap<Uuid, Arc<Mutex<TransactionRecord>>>,
    by_nonce: DashMap<NonceKey, Uuid>,
    by_opportunity: DashMap<String, Uuid>,
    persistence: Arc<dyn StateStore>,
}

impl TransactionStateStore {
    pub fn new(persistence: Arc<dyn StateStore>) -> Self {
        Self {
            records: DashMap::new(),
            by_nonce: DashMap::new(),
            by_opportunity: DashMap::new(),
            persistence,
        }
    }

    /// Insert a new record. One record per opportunity fingerprint.
    pub async fn create(&self, record: TransactionRecord) -> Result<Uuid, StoreError> {
        let id = record.id;
        let fingerprint = record.opportunity_id.clone();

        match self.by_opportunity.entry(fingerprint.clone()) {
            Entry::Occupied(e) => {
                return Err(StoreError::Duplicate {
                    fingerprint,
                    existing: *e.get(),
                })
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        if let Err(e) = self.persistence.save_transaction(&record).await {
            self.by_opportunity.remove(&fingerprint);
            return Err(StoreError::Persistence(e));
        }

        self.by_nonce.insert(
            (record.account_id.clone(), record.chain_id, record.nonce),
            id,
        );
        debug!(tx_id = %id, fingerprint = %fingerprint, nonce = record.nonce, "Record created");
        self.records.insert(id, Arc::new(Mutex::new(record)));
        Ok(id)
    }

    /// Move a record to `to`, validated against the lifecycle graph.
    pub async fn transition(
        &self,
        id: Uuid,
        to: TxStatus,
        meta: TransitionMeta,
    ) -> Result<TransactionRecord, StoreError> {
        let slot = self.slot(id)?;
        let mut current = slot.lock().await;

        let from = current.status;
        if !from.can_transition_to(to) {
            error!(tx_id = %id, from = %from, to = %to, "Invalid transaction transition");
            return Err(StoreError::InvalidTransition { id, from, to });
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.status = to;
        next.updated_at = now;
        for hash in meta.unconfirmed_hash.iter().chain(meta.tx_hash.iter()) {
            if !next.broadcast_hashes.contains(hash) {
                next.broadcast_hashes.push(hash.clone());
            }
        }
        if let Some(hash) = meta.tx_hash {
            next.tx_hash = Some(hash);
        }
        if let Some(gas) = meta.gas {
            next.gas = Some(gas);
        }
        if let Some(entry) = meta.error {
            next.error_history.push(entry);
        }
        match to {
            TxStatus::Submitted if next.submitted_at.is_none() => next.submitted_at = Some(now),
            TxStatus::Confirmed => next.confirmed_at = Some(now),
            _ => {}
        }

        self.persistence.save_transaction(&next).await?;
        *current = next.clone();

        if from != to {
            info!(
                tx_id = %id,
                from = %from,
                to = %to,
                nonce = next.nonce,
                tx_hash = ?next.tx_hash,
                "Transaction transition"
            );
        }
        Ok(next)
    }

    /// Move a not-yet-accepted record to a new nonce after a nonce conflict.
    pub async fn reassign_nonce(
        &self,
        id: Uuid,
        nonce: u64,
    ) -> Result<TransactionRecord, StoreError> {
        let slot = self.slot(id)?;
        let mut current = slot.lock().await;

        if !matches!(current.status, TxStatus::Built | TxStatus::Submitted) {
            error!(tx_id = %id, status = %current.status, "Nonce reassignment on accepted record");
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: current.status,
            });
        }

        let old = current.nonce;
        let mut next = current.clone();
        next.nonce = nonce;
        // Bids signed for the old nonce can no longer land for this record.
        next.tx_hash = None;
        next.broadcast_hashes.clear();
        next.updated_at = Utc::now();
        self.persistence.save_transaction(&next).await?;

        let account = next.account_id.clone();
        let chain = next.chain_id;
        self.by_nonce
            .remove_if(&(account.clone(), chain, old), |_, owner| *owner == id);
        self.by_nonce.insert((account, chain, nonce), id);
        *current = next.clone();

        info!(tx_id = %id, old_nonce = old, new_nonce = nonce, "Nonce reassigned");
        Ok(next)
    }

    pub async fn get(&self, id: Uuid) -> Result<TransactionRecord, StoreError> {
        let slot = self.slot(id)?;
        let record = slot.lock().await;
        Ok(record.clone())
    }

    pub async fn find_by_nonce(
        &self,
        account_id: &str,
        chain_id: ChainId,
        nonce: u64,
    ) -> Option<TransactionRecord> {
        let id = *self
            .by_nonce
            .get(&(account_id.to_string(), chain_id, nonce))?;
        self.get(id).await.ok()
    }

    pub async fn find_by_opportunity(&self, fingerprint: &str) -> Option<TransactionRecord> {
        let id = *self.by_opportunity.get(fingerprint)?;
        self.get(id).await.ok()
    }

    /// Records that may be on the wire and are not yet terminal.
    pub async fn pending(&self) -> Vec<TransactionRecord> {
        let mut out = Vec::new();
        for slot in self.slots() {
            let record = slot.lock().await;
            if matches!(record.status, TxStatus::Submitted | TxStatus::Pending) {
                out.push(record.clone());
            }
        }
        out.sort_by_key(|r| (r.account_id.clone(), r.chain_id, r.nonce));
        out
    }

    pub async fn all(&self) -> Vec<TransactionRecord> {
        let mut out = Vec::with_capacity(self.records.len());
        for slot in self.slots() {
            out.push(slot.lock().await.clone());
        }
        out.sort_by_key(|r| r.created_at);
        out
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reload every record from persistence, rebuilding the indexes.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let mut records = self.persistence.load_transactions().await?;
        records.sort_by_key(|r| r.created_at);

        let count = records.len();
        for record in records {
            let id = record.id;
            self.by_opportunity.insert(record.opportunity_id.clone(), id);
            self.by_nonce
                .insert((record.account_id.clone(), record.chain_id, record.nonce), id);
            self.records.insert(id, Arc::new(Mutex::new(record)));
        }

        info!(
            records = count,
            backend = self.persistence.backend(),
            "Transaction records restored"
        );
        Ok(count)
    }

    fn slot(&self, id: Uuid) -> Result<Arc<Mutex<TransactionRecord>>, StoreError> {
        self.records
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(StoreError::NotFound(id))
    }

    fn slots(&self) -> Vec<Arc<Mutex<TransactionRecord>>> {
        self.records.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
