//! Mock chain for integration testing.
//!
//! Provides a deterministic `RpcProvider` and `TransactionSigner` pair.
//! Broadcast results can be scripted one call at a time; every accepted
//! broadcast is recorded with the fee it carried so tests can check the
//! bids the engine actually sent.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use fastlane::chain::{
    BlockTag, FeeData, ProviderError, Receipt, ReceiptStatus, RpcProvider, SignedTx,
    TransactionSigner, UnsignedTx,
};
use fastlane::types::ChainId;

/// One broadcast the chain saw.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub nonce: u64,
    pub priority_fee: Decimal,
    pub accepted: bool,
}

#[derive(Default)]
struct Inner {
    scripted: VecDeque<ProviderError>,
    broadcasts: Vec<Broadcast>,
    /// hash -> (nonce, polls so far)
    mempool: HashMap<String, (u64, u32)>,
    mined: HashMap<String, Receipt>,
    next_nonce: u64,
    block: u64,
}

/// A mock chain with a single account.
///
/// All state is in-memory and fully controllable from test code.
pub struct MockChain {
    name: String,
    /// Receipt polls before a transaction confirms; `None` never confirms.
    confirm_after: Option<u32>,
    base_fee: Decimal,
    priority_fee: Decimal,
    inner: Arc<Mutex<Inner>>,
}

impl MockChain {
    pub fn new(name: &str, confirm_after: Option<u32>) -> Self {
        Self {
            name: name.to_string(),
            confirm_after,
            base_fee: dec!(20),
            priority_fee: dec!(2),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Fail the next broadcasts with these RPC messages, in order.
    pub fn script_failures(&self, messages: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        for m in messages {
            inner.scripted.push_back(ProviderError::Rpc {
                code: -32000,
                message: m.to_string(),
            });
        }
    }

    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.inner.lock().unwrap().broadcasts.clone()
    }

    pub fn accepted_nonces(&self) -> Vec<u64> {
        self.broadcasts()
            .iter()
            .filter(|b| b.accepted)
            .map(|b| b.nonce)
            .collect()
    }

    /// Mine everything waiting in the mempool.
    pub fn mine_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let hashes: Vec<String> = inner.mempool.keys().cloned().collect();
        for hash in hashes {
            Self::mine(&mut inner, &hash);
        }
    }

    fn mine(inner: &mut Inner, hash: &str) -> Option<Receipt> {
        let (nonce, _) = inner.mempool.remove(hash)?;
        inner.block += 1;
        inner.next_nonce = inner.next_nonce.max(nonce + 1);
        let receipt = Receipt {
            tx_hash: hash.to_string(),
            block_number: inner.block,
            success: true,
            gas_used: 120_000,
            effective_gas_price: None,
        };
        inner.mined.insert(hash.to_string(), receipt.clone());
        Some(receipt)
    }
}

#[async_trait]
impl RpcProvider for MockChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_fee_data(&self, _chain_id: ChainId) -> Result<FeeData, ProviderError> {
        Ok(FeeData {
            base_fee: self.base_fee,
            suggested_priority: self.priority_fee,
            observed_at: Utc::now(),
        })
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String, ProviderError> {
        let priority_fee = tx
            .raw
            .rsplit(':')
            .next()
            .and_then(|p| Decimal::from_str(p).ok())
            .unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();

        if let Some(err) = inner.scripted.pop_front() {
            inner.broadcasts.push(Broadcast {
                nonce: tx.nonce,
                priority_fee,
                accepted: false,
            });
            return Err(err);
        }

        inner.broadcasts.push(Broadcast {
            nonce: tx.nonce,
            priority_fee,
            accepted: true,
        });
        let hash = tx
            .hash
            .clone()
            .unwrap_or_else(|| format!("0x{:064x}", inner.broadcasts.len()));
        inner.mempool.retain(|_, (n, _)| *n != tx.nonce);
        inner.mempool.insert(hash.clone(), (tx.nonce, 0));
        Ok(hash)
    }

    async fn get_receipt(
        &self,
        _chain_id: ChainId,
        tx_hash: &str,
    ) -> Result<ReceiptStatus, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(receipt) = inner.mined.get(tx_hash) {
            return Ok(ReceiptStatus::Confirmed(receipt.clone()));
        }
        let Some((_, polls)) = inner.mempool.get_mut(tx_hash) else {
            return Ok(ReceiptStatus::NotFound);
        };
        *polls += 1;
        let polls = *polls;
        match self.confirm_after {
            Some(n) if polls >= n => Ok(Self::mine(&mut inner, tx_hash)
                .map(ReceiptStatus::Confirmed)
                .unwrap_or(ReceiptStatus::NotFound)),
            _ => Ok(ReceiptStatus::Pending),
        }
    }

    async fn get_transaction_count(
        &self,
        _chain_id: ChainId,
        _account: &str,
        tag: BlockTag,
    ) -> Result<u64, ProviderError> {
        let inner = self.inner.lock().unwrap();
        Ok(match tag {
            BlockTag::Latest => inner.next_nonce,
            BlockTag::Pending => inner
                .mempool
                .values()
                .map(|(n, _)| n + 1)
                .max()
                .unwrap_or(0)
                .max(inner.next_nonce),
        })
    }
}

/// Signer that encodes nonce and priority fee into the raw payload.
pub struct MockSigner;

#[async_trait]
impl TransactionSigner for MockSigner {
    async fn sign(&self, tx: &UnsignedTx, account_id: &str) -> Result<SignedTx, ProviderError> {
        Ok(SignedTx {
            chain_id: tx.chain_id,
            account_id: account_id.to_string(),
            nonce: tx.nonce,
            raw: format!("0xmock:{}:{}", tx.nonce, tx.max_priority_fee_per_gas),
            hash: None,
        })
    }
}
