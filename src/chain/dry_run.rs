//! Simulated chain.
//!
//! Implements the provider and signer contracts in memory. A broadcast lands
//! in a simulated mempool and is mined after a configurable number of
//! receipt polls. Tests script failures (queued broadcast errors, mempool
//! drops, reverts, external nonce bumps) to drive the retry paths.

use alloy_primitives::hex;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{
    tx_hash_of, BlockTag, FeeData, ProviderError, Receipt, ReceiptStatus, RpcProvider, SignedTx,
    TransactionSigner, UnsignedTx,
};
use crate::types::ChainId;

#[derive(Debug, Clone)]
struct MempoolTx {
    chain_id: ChainId,
    account_id: String,
    nonce: u64,
    polls: u32,
    revert: bool,
}

#[derive(Debug, Default)]
struct ChainState {
    /// Next nonce including mempool transactions.
    pending_nonce: HashMap<(String, ChainId), u64>,
    /// Next nonce counting mined transactions only.
    mined_nonce: HashMap<(String, ChainId), u64>,
    mempool: HashMap<String, MempoolTx>,
    mined: HashMap<String, Receipt>,
    block_number: u64,
    broadcast_errors: VecDeque<ProviderError>,
    fee_errors: VecDeque<ProviderError>,
    revert_next: bool,
    replaced_bid_wins: bool,
    base_fee: Decimal,
    priority_fee: Decimal,
    broadcasts: u64,
}

pub struct DryRunChain {
    name: String,
    confirm_after_polls: u32,
    latency: Duration,
    hash_seq: AtomicU64,
    state: Mutex<ChainState>,
}

impl DryRunChain {
    pub fn new(name: &str, confirm_after_polls: u32) -> Self {
        Self {
            name: name.to_string(),
            confirm_after_polls,
            latency: Duration::ZERO,
            hash_seq: AtomicU64::new(1),
            state: Mutex::new(ChainState {
                block_number: 1,
                base_fee: dec!(20),
                priority_fee: dec!(2),
                ..ChainState::default()
            }),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_fees(&self, base_fee: Decimal, priority_fee: Decimal) {
        let mut state = self.state.lock();
        state.base_fee = base_fee;
        state.priority_fee = priority_fee;
    }

    /// Queue errors returned by the next broadcasts, in order.
    pub fn fail_next_broadcasts(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.state.lock().broadcast_errors.extend(errors);
    }

    /// Queue errors returned by the next fee lookups, in order.
    pub fn fail_next_fee_lookups(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.state.lock().fee_errors.extend(errors);
    }

    /// The next accepted broadcast will revert when mined.
    pub fn revert_next(&self) {
        self.state.lock().revert_next = true;
    }

    /// The next same-nonce replacement is accepted, but the bid it replaces
    /// is the one that gets mined.
    pub fn mine_replaced_next(&self) {
        self.state.lock().replaced_bid_wins = true;
    }

    /// Evict a transaction from the mempool without mining it.
    pub fn drop_from_mempool(&self, tx_hash: &str) -> bool {
        let mut state = self.state.lock();
        match state.mempool.remove(tx_hash) {
            Some(tx) => {
                let key = (tx.account_id.clone(), tx.chain_id);
                let mined = state.mined_nonce.get(&key).copied().unwrap_or(0);
                state.pending_nonce.insert(key, mined.max(tx.nonce));
                true
            }
            None => false,
        }
    }

    /// Evict every transaction currently in the mempool.
    pub fn drop_all_pending(&self) -> usize {
        let hashes: Vec<String> = self.state.lock().mempool.keys().cloned().collect();
        hashes.iter().filter(|h| self.drop_from_mempool(h)).count()
    }

    /// Simulate transactions sent from outside this process.
    pub fn set_account_nonce(&self, account_id: &str, chain_id: ChainId, nonce: u64) {
        let mut state = self.state.lock();
        let key = (account_id.to_string(), chain_id);
        state.pending_nonce.insert(key.clone(), nonce);
        state.mined_nonce.insert(key, nonce);
    }

    pub fn broadcast_count(&self) -> u64 {
        self.state.lock().broadcasts
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().mempool.len()
    }

    /// Mine everything in the mempool immediately.
    pub fn mine_all(&self) -> usize {
        let mut state = self.state.lock();
        let hashes: Vec<String> = state.mempool.keys().cloned().collect();
        for hash in &hashes {
            Self::mine(&mut state, hash);
        }
        hashes.len()
    }

    fn mine(state: &mut ChainState, hash: &str) -> Option<Receipt> {
        let tx = state.mempool.remove(hash)?;
        state.block_number += 1;
        let key = (tx.account_id.clone(), tx.chain_id);
        let mined = state.mined_nonce.entry(key).or_insert(0);
        *mined = (*mined).max(tx.nonce + 1);

        let receipt = Receipt {
            tx_hash: hash.to_string(),
            block_number: state.block_number,
            success: !tx.revert,
            gas_used: 150_000,
            effective_gas_price: Some(state.base_fee + state.priority_fee),
        };
        state.mined.insert(hash.to_string(), receipt.clone());
        Some(receipt)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn next_hash(&self) -> String {
        format!("0x{:064x}", self.hash_seq.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl RpcProvider for DryRunChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_fee_data(&self, _chain_id: ChainId) -> Result<FeeData, ProviderError> {
        self.delay().await;
        let mut state = self.state.lock();
        if let Some(err) = state.fee_errors.pop_front() {
            return Err(err);
        }
        Ok(FeeData {
            base_fee: state.base_fee,
            suggested_priority: state.priority_fee,
            observed_at: Utc::now(),
        })
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String, ProviderError> {
        self.delay().await;
        let hash = tx.hash.clone().unwrap_or_else(|| self.next_hash());
        let mut state = self.state.lock();
        state.broadcasts += 1;

        if let Some(err) = state.broadcast_errors.pop_front() {
            return Err(err);
        }
        if state.mempool.contains_key(&hash) {
            return Err(ProviderError::Rpc {
                code: -32000,
                message: "already known".to_string(),
            });
        }

        let key = (tx.account_id.clone(), tx.chain_id);
        let mined = state.mined_nonce.get(&key).copied().unwrap_or(0);
        if tx.nonce < mined {
            return Err(ProviderError::Rpc {
                code: -32000,
                message: format!("nonce too low: next nonce {mined}, tx nonce {}", tx.nonce),
            });
        }

        // Same-nonce replacement evicts the older transaction.
        let replaced: Vec<String> = state
            .mempool
            .iter()
            .filter(|(_, m)| m.account_id == tx.account_id && m.chain_id == tx.chain_id && m.nonce == tx.nonce)
            .map(|(h, _)| h.clone())
            .collect();
        if !replaced.is_empty() && std::mem::take(&mut state.replaced_bid_wins) {
            for h in &replaced {
                Self::mine(&mut state, h);
            }
            debug!(chain = tx.chain_id, nonce = tx.nonce, tx_hash = %hash, "Dry-run replacement lost to the earlier bid");
            return Ok(hash);
        }
        for h in replaced {
            state.mempool.remove(&h);
        }

        let revert = std::mem::take(&mut state.revert_next);
        state.mempool.insert(
            hash.clone(),
            MempoolTx {
                chain_id: tx.chain_id,
                account_id: tx.account_id.clone(),
                nonce: tx.nonce,
                polls: 0,
                revert,
            },
        );
        let pending = state.pending_nonce.entry(key).or_insert(0);
        *pending = (*pending).max(tx.nonce + 1);

        debug!(chain = tx.chain_id, nonce = tx.nonce, tx_hash = %hash, "Dry-run broadcast");
        Ok(hash)
    }

    async fn get_receipt(
        &self,
        _chain_id: ChainId,
        tx_hash: &str,
    ) -> Result<ReceiptStatus, ProviderError> {
        self.delay().await;
        let mut state = self.state.lock();
        if let Some(receipt) = state.mined.get(tx_hash) {
            return Ok(ReceiptStatus::Confirmed(receipt.clone()));
        }

        let Some(tx) = state.mempool.get_mut(tx_hash) else {
            return Ok(ReceiptStatus::NotFound);
        };
        tx.polls += 1;
        if tx.polls >= self.confirm_after_polls {
            if let Some(receipt) = Self::mine(&mut state, tx_hash) {
                return Ok(ReceiptStatus::Confirmed(receipt));
            }
        }
        Ok(ReceiptStatus::Pending)
    }

    async fn get_transaction_count(
        &self,
        chain_id: ChainId,
        account: &str,
        tag: BlockTag,
    ) -> Result<u64, ProviderError> {
        self.delay().await;
        let state = self.state.lock();
        let key = (account.to_string(), chain_id);
        let map = match tag {
            BlockTag::Latest => &state.mined_nonce,
            BlockTag::Pending => &state.pending_nonce,
        };
        Ok(map.get(&key).copied().unwrap_or(0))
    }
}

/// Signer that wraps the unsigned transaction as JSON hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunSigner;

#[async_trait]
impl TransactionSigner for DryRunSigner {
    async fn sign(&self, tx: &UnsignedTx, account_id: &str) -> Result<SignedTx, ProviderError> {
        let json =
            serde_json::to_vec(tx).map_err(|e| ProviderError::Signer(e.to_string()))?;
        let raw = hex::encode_prefixed(&json);
        Ok(SignedTx {
            chain_id: tx.chain_id,
            account_id: account_id.to_string(),
            nonce: tx.nonce,
            hash: Some(tx_hash_of(&raw)?),
            raw,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
