//! Chain-facing collaborators.
//!
//! Defines the boundary contracts the core calls into (RPC/provider pool,
//! signer, DEX/router encoder) and the value types that cross them.
//! Implementations:
//! - `jsonrpc`: Ethereum JSON-RPC provider and remote signer over HTTP
//! - `dry_run`: simulated chain for dry-run mode and tests

pub mod dry_run;
pub mod jsonrpc;

use alloy_primitives::{hex, keccak256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::types::{ChainId, SwapParams};

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Live fee data for a chain. Units are gwei.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeData {
    pub base_fee: Decimal,
    pub suggested_priority: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Unsigned call produced by the router collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTx {
    pub to: String,
    /// Hex calldata, `0x`-prefixed.
    pub data: String,
    pub value_wei: u128,
    pub gas_limit: u64,
}

/// Fully specified transaction handed to the signer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub chain_id: ChainId,
    pub from: String,
    pub nonce: u64,
    pub call: RawTx,
    pub max_fee_per_gas: Decimal,
    pub max_priority_fee_per_gas: Decimal,
}

/// Signed, broadcast-ready transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTx {
    pub chain_id: ChainId,
    pub account_id: String,
    pub nonce: u64,
    /// Raw RLP payload, `0x`-prefixed hex.
    pub raw: String,
    /// Transaction hash. Signers fill it in, see `tx_hash_of`.
    pub hash: Option<String>,
}

/// Mined transaction receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: u64,
    pub effective_gas_price: Option<Decimal>,
}

/// Result of a receipt lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptStatus {
    Confirmed(Receipt),
    /// Known to the node but not yet mined.
    Pending,
    /// Unknown to the node: never seen, or dropped from the pool.
    NotFound,
}

/// Block tag for nonce lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockTag::Latest => "latest",
            BlockTag::Pending => "pending",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a chain-facing collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(ChainId),
}

/// Hash of a signed payload: keccak256 over the raw envelope bytes.
pub fn tx_hash_of(raw: &str) -> Result<String, ProviderError> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ProviderError::Signer(format!("raw payload is not hex: {e}")))?;
    Ok(hex::encode_prefixed(keccak256(&bytes)))
}

/// Run a single network call under its own timeout.
pub async fn timed<T, F>(limit: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit)),
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// RPC/provider pool.
#[async_trait]
pub trait RpcProvider: Send + Sync {
    /// Provider label, used for breaker keys and logs.
    fn name(&self) -> &str;

    async fn get_fee_data(&self, chain_id: ChainId) -> Result<FeeData, ProviderError>;

    /// Broadcast a signed transaction, returning its hash.
    async fn broadcast(&self, tx: &SignedTx) -> Result<String, ProviderError>;

    async fn get_receipt(
        &self,
        chain_id: ChainId,
        tx_hash: &str,
    ) -> Result<ReceiptStatus, ProviderError>;

    async fn get_transaction_count(
        &self,
        chain_id: ChainId,
        account: &str,
        tag: BlockTag,
    ) -> Result<u64, ProviderError>;
}

/// Signer/wallet collaborator.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign(&self, tx: &UnsignedTx, account_id: &str) -> Result<SignedTx, ProviderError>;
}

/// DEX/router collaborator. Encoding is CPU-only, hence synchronous.
pub trait SwapEncoder: Send + Sync {
    fn encode_swap(&self, params: &SwapParams) -> Result<RawTx, ProviderError>;
}

/// Encoder for opportunities whose detector already produced calldata.
#[derive(Debug, Clone)]
pub struct PrebuiltCalldata {
    pub default_gas_limit: u64,
}

impl Default for PrebuiltCalldata {
    fn default() -> Self {
        Self {
            default_gas_limit: 350_000,
        }
    }
}

impl SwapEncoder for PrebuiltCalldata {
    fn encode_swap(&self, params: &SwapParams) -> Result<RawTx, ProviderError> {
        let data = params
            .calldata
            .as_deref()
            .filter(|d| d.starts_with("0x") && d.len() > 2)
            .ok_or_else(|| {
                ProviderError::Encoding(format!(
                    "no prebuilt calldata for {} -> {} via {}",
                    params.token_in, params.token_out, params.router
                ))
            })?;

        Ok(RawTx {
            to: params.router.clone(),
            data: data.to_string(),
            value_wei: 0,
            gas_limit: params.gas_limit.unwrap_or(self.default_gas_limit),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
