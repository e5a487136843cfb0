//! Ethereum JSON-RPC over HTTP.
//!
//! One endpoint URL per chain. URLs usually embed an API key, so they are
//! held as secrets and never logged. Wei quantities from the node are
//! converted to gwei decimals at this boundary.
//!
//! Methods used:
//! - `eth_feeHistory` (base fee of the next block, median-ish tip)
//! - `eth_sendRawTransaction`
//! - `eth_getTransactionReceipt` / `eth_getTransactionByHash`
//! - `eth_getTransactionCount`
//! - `eth_signTransaction` (remote signer)

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    tx_hash_of, BlockTag, FeeData, ProviderError, Receipt, ReceiptStatus, RpcProvider, SignedTx,
    TransactionSigner, UnsignedTx,
};
use crate::config::{AppConfig, RpcConfig};
use crate::types::ChainId;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Transport-level ceiling; callers wrap each call in their own, tighter timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocks sampled by `eth_feeHistory`.
const FEE_HISTORY_BLOCKS: u64 = 5;

/// Reward percentile requested from `eth_feeHistory`.
const FEE_HISTORY_PERCENTILE: u32 = 50;

const WEI_PER_GWEI: u64 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeHistory {
    base_fee_per_gas: Vec<String>,
    #[serde(default)]
    reward: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: String,
    #[serde(default)]
    status: Option<String>,
    gas_used: String,
    #[serde(default)]
    effective_gas_price: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn parse_quantity(hex: &str) -> Result<u128, ProviderError> {
    let digits = hex
        .strip_prefix("0x")
        .ok_or_else(|| ProviderError::Malformed(format!("quantity without 0x prefix: {hex}")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| ProviderError::Malformed(format!("bad quantity {hex}: {e}")))
}

fn parse_u64(hex: &str) -> Result<u64, ProviderError> {
    let value = parse_quantity(hex)?;
    u64::try_from(value).map_err(|_| ProviderError::Malformed(format!("quantity overflows u64: {hex}")))
}

fn wei_to_gwei(wei: u128) -> Result<Decimal, ProviderError> {
    let wei = i128::try_from(wei)
        .map_err(|_| ProviderError::Malformed(format!("wei value out of range: {wei}")))?;
    Decimal::try_from_i128_with_scale(wei, 9)
        .map(|d| d.normalize())
        .map_err(|e| ProviderError::Malformed(format!("wei value out of range: {e}")))
}

fn gwei_to_wei(gwei: Decimal) -> Result<u128, ProviderError> {
    (gwei * Decimal::from(WEI_PER_GWEI))
        .trunc()
        .to_u128()
        .ok_or_else(|| ProviderError::Encoding(format!("fee not representable in wei: {gwei}")))
}

fn to_quantity(value: impl Into<u128>) -> String {
    format!("{:#x}", value.into())
}

fn parse_fee_history(value: Value) -> Result<FeeData, ProviderError> {
    let history: FeeHistory = serde_json::from_value(value)
        .map_err(|e| ProviderError::Malformed(format!("eth_feeHistory: {e}")))?;

    // The last entry is the base fee of the next block.
    let next_base = history
        .base_fee_per_gas
        .last()
        .ok_or_else(|| ProviderError::Malformed("eth_feeHistory: empty baseFeePerGas".into()))?;
    let base_fee = wei_to_gwei(parse_quantity(next_base)?)?;

    let mut tips = Vec::with_capacity(history.reward.len());
    for block in &history.reward {
        if let Some(tip) = block.first() {
            tips.push(parse_quantity(tip)?);
        }
    }
    tips.sort_unstable();
    let suggested = tips.get(tips.len() / 2).copied().unwrap_or(0);

    Ok(FeeData {
        base_fee,
        suggested_priority: wei_to_gwei(suggested)?,
        observed_at: Utc::now(),
    })
}

fn parse_receipt(value: Value) -> Result<Receipt, ProviderError> {
    let raw: RpcReceipt = serde_json::from_value(value)
        .map_err(|e| ProviderError::Malformed(format!("eth_getTransactionReceipt: {e}")))?;
    let effective_gas_price = match raw.effective_gas_price.as_deref() {
        Some(price) => Some(wei_to_gwei(parse_quantity(price)?)?),
        None => None,
    };
    Ok(Receipt {
        tx_hash: raw.transaction_hash,
        block_number: parse_u64(&raw.block_number)?,
        // Pre-Byzantium receipts carry no status; treat them as success.
        success: raw.status.as_deref().map_or(true, |s| s == "0x1"),
        gas_used: parse_u64(&raw.gas_used)?,
        effective_gas_price,
    })
}

fn signing_request(tx: &UnsignedTx, account_id: &str) -> Result<Value, ProviderError> {
    Ok(json!({
        "from": account_id,
        "to": tx.call.to,
        "data": tx.call.data,
        "value": to_quantity(tx.call.value_wei),
        "gas": to_quantity(tx.call.gas_limit),
        "nonce": to_quantity(tx.nonce),
        "chainId": to_quantity(tx.chain_id),
        "type": "0x2",
        "maxFeePerGas": to_quantity(gwei_to_wei(tx.max_fee_per_gas)?),
        "maxPriorityFeePerGas": to_quantity(gwei_to_wei(tx.max_priority_fee_per_gas)?),
    }))
}

/// Signers answer either with the raw payload or with `{raw, tx: {hash}}`.
/// A bare payload is hashed locally so every broadcast can be traced.
fn parse_signed(value: Value, tx: &UnsignedTx, account_id: &str) -> Result<SignedTx, ProviderError> {
    let (raw, hash) = match value {
        Value::String(raw) => {
            let hash = tx_hash_of(&raw)?;
            (raw, hash)
        }
        Value::Object(obj) => {
            let raw = obj
                .get("raw")
                .and_then(Value::as_str)
                .ok_or_else(|| ProviderError::Signer("signer response without raw payload".into()))?
                .to_string();
            let hash = obj
                .get("tx")
                .and_then(|t| t.get("hash"))
                .and_then(Value::as_str)
                .map(String::from);
            let hash = match hash {
                Some(hash) => hash,
                None => tx_hash_of(&raw)?,
            };
            (raw, hash)
        }
        other => {
            return Err(ProviderError::Signer(format!("unexpected signer response: {other}")));
        }
    };
    Ok(SignedTx {
        chain_id: tx.chain_id,
        account_id: account_id.to_string(),
        nonce: tx.nonce,
        raw,
        hash: Some(hash),
    })
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

struct RpcTransport {
    http: Client,
    next_id: AtomicU64,
}

impl RpcTransport {
    fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent("FASTLANE/0.1.0 (execution-core)")
            .build()
            .context("Failed to build HTTP client for JSON-RPC")?;
        Ok(Self {
            http,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, url: &SecretString, method: &str, params: Value) -> Result<Value, ProviderError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(method, id = request.id, "JSON-RPC request");

        let resp = self
            .http
            .post(url.expose_secret().as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(HTTP_TIMEOUT)
                } else {
                    // Drop the URL: it may carry an API key.
                    ProviderError::Transport(e.without_url().to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Transport(format!("HTTP {status}: {body}")));
        }

        let body: RpcResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("{method}: {e}")))?;

        if let Some(err) = body.error {
            warn!(method, code = err.code, message = %err.message, "JSON-RPC error");
            return Err(ProviderError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct JsonRpcProvider {
    name: String,
    transport: RpcTransport,
    endpoints: HashMap<ChainId, SecretString>,
}

impl JsonRpcProvider {
    pub fn new(name: &str, endpoints: HashMap<ChainId, SecretString>) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            transport: RpcTransport::new()?,
            endpoints,
        })
    }

    /// Build from `[rpc]`, resolving each endpoint URL from its env var.
    pub fn from_config(config: &RpcConfig) -> Result<Self> {
        let mut endpoints = HashMap::new();
        for endpoint in &config.endpoints {
            let url = AppConfig::resolve_secret(&endpoint.url_env)
                .with_context(|| format!("RPC endpoint for chain {}", endpoint.chain_id))?;
            endpoints.insert(endpoint.chain_id, url);
        }
        anyhow::ensure!(!endpoints.is_empty(), "rpc.endpoints is empty");
        info!(
            provider = %config.provider_name,
            chains = ?endpoints.keys().collect::<Vec<_>>(),
            "JSON-RPC provider configured"
        );
        Self::new(&config.provider_name, endpoints)
    }

    pub fn chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self.endpoints.keys().copied().collect();
        chains.sort_unstable();
        chains
    }

    async fn call(&self, chain_id: ChainId, method: &str, params: Value) -> Result<Value, ProviderError> {
        let url = self
            .endpoints
            .get(&chain_id)
            .ok_or(ProviderError::UnsupportedChain(chain_id))?;
        self.transport.call(url, method, params).await
    }
}

#[async_trait]
impl RpcProvider for JsonRpcProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_fee_data(&self, chain_id: ChainId) -> Result<FeeData, ProviderError> {
        let result = self
            .call(
                chain_id,
                "eth_feeHistory",
                json!([to_quantity(FEE_HISTORY_BLOCKS), "latest", [FEE_HISTORY_PERCENTILE]]),
            )
            .await?;
        parse_fee_history(result)
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String, ProviderError> {
        let result = self
            .call(tx.chain_id, "eth_sendRawTransaction", json!([tx.raw]))
            .await?;
        result
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::Malformed(format!("eth_sendRawTransaction: {result}")))
    }

    async fn get_receipt(&self, chain_id: ChainId, tx_hash: &str) -> Result<ReceiptStatus, ProviderError> {
        let receipt = self
            .call(chain_id, "eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if !receipt.is_null() {
            return Ok(ReceiptStatus::Confirmed(parse_receipt(receipt)?));
        }

        let tx = self
            .call(chain_id, "eth_getTransactionByHash", json!([tx_hash]))
            .await?;
        if tx.is_null() {
            Ok(ReceiptStatus::NotFound)
        } else {
            Ok(ReceiptStatus::Pending)
        }
    }

    async fn get_transaction_count(
        &self,
        chain_id: ChainId,
        account: &str,
        tag: BlockTag,
    ) -> Result<u64, ProviderError> {
        let result = self
            .call(chain_id, "eth_getTransactionCount", json!([account, tag.as_str()]))
            .await?;
        let hex = result
            .as_str()
            .ok_or_else(|| ProviderError::Malformed(format!("eth_getTransactionCount: {result}")))?;
        parse_u64(hex)
    }
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// Remote signer speaking `eth_signTransaction`.
pub struct JsonRpcSigner {
    transport: RpcTransport,
    url: SecretString,
}

impl JsonRpcSigner {
    pub fn new(url: SecretString) -> Result<Self> {
        Ok(Self {
            transport: RpcTransport::new()?,
            url,
        })
    }
}

#[async_trait]
impl TransactionSigner for JsonRpcSigner {
    async fn sign(&self, tx: &UnsignedTx, account_id: &str) -> Result<SignedTx, ProviderError> {
        let request = signing_request(tx, account_id)?;
        let result = self
            .transport
            .call(&self.url, "eth_signTransaction", json!([request]))
            .await
            .map_err(|e| match e {
                ProviderError::Rpc { code, message } => {
                    ProviderError::Signer(format!("{code}: {message}"))
                }
                other => other,
            })?;
        parse_signed(result, tx, account_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::RawTx;
    use rust_decimal_macros::dec;

    fn unsigned() -> UnsignedTx {
        UnsignedTx {
            chain_id: 8453,
            from: "0xabc".into(),
            nonce: 7,
            call: RawTx {
                to: "0xrouter".into(),
                data: "0x38ed1739".into(),
                value_wei: 0,
                gas_limit: 250_000,
            },
            max_fee_per_gas: dec!(0.25),
            max_priority_fee_per_gas: dec!(0.001),
        }
    }

    #[test]
    fn test_quantities() {
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert!(parse_quantity("1a").is_err());
        assert!(parse_quantity("0xzz").is_err());
        assert_eq!(to_quantity(255u64), "0xff");
        assert_eq!(to_quantity(0u64), "0x0");
    }

    #[test]
    fn test_wei_gwei_conversion() {
        assert_eq!(wei_to_gwei(1_500_000_000).unwrap(), dec!(1.5));
        assert_eq!(wei_to_gwei(1).unwrap(), dec!(0.000000001));
        assert_eq!(gwei_to_wei(dec!(26.45)).unwrap(), 26_450_000_000);
        assert!(gwei_to_wei(dec!(-1)).is_err());
    }

    #[test]
    fn test_fee_history_uses_next_base_fee_and_median_tip() {
        let fees = parse_fee_history(json!({
            "oldestBlock": "0x10",
            "baseFeePerGas": ["0x3b9aca00", "0x4a817c800", "0x4a817c800", "0x4a817c800", "0x4a817c800", "0x77359400"],
            "reward": [["0x3b9aca00"], ["0x77359400"], ["0x12a05f200"], ["0x0"], ["0x77359400"]],
        }))
        .unwrap();
        assert_eq!(fees.base_fee, dec!(2));
        assert_eq!(fees.suggested_priority, dec!(2));
    }

    #[test]
    fn test_fee_history_without_base_fee_is_malformed() {
        let err = parse_fee_history(json!({"baseFeePerGas": [], "reward": []})).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn test_receipt_parsing() {
        let receipt = parse_receipt(json!({
            "transactionHash": "0xfeed",
            "blockNumber": "0x10",
            "status": "0x0",
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x77359400",
        }))
        .unwrap();
        assert_eq!(receipt.block_number, 16);
        assert!(!receipt.success);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(receipt.effective_gas_price, Some(dec!(2)));
    }

    #[test]
    fn test_signing_request_in_wei() {
        let req = signing_request(&unsigned(), "0xabc").unwrap();
        assert_eq!(req["nonce"], "0x7");
        assert_eq!(req["chainId"], "0x2105");
        assert_eq!(req["maxFeePerGas"], "0xee6b280");
        assert_eq!(req["maxPriorityFeePerGas"], "0xf4240");
        assert_eq!(req["gas"], "0x3d090");
    }

    #[test]
    fn test_signer_response_shapes() {
        let tx = unsigned();
        let bare = parse_signed(json!("0x02f8"), &tx, "0xabc").unwrap();
        assert_eq!(bare.raw, "0x02f8");
        assert_eq!(bare.hash, Some(tx_hash_of("0x02f8").unwrap()));

        let full = parse_signed(json!({"raw": "0x02f9", "tx": {"hash": "0xbeef"}}), &tx, "0xabc").unwrap();
        assert_eq!(full.raw, "0x02f9");
        assert_eq!(full.hash.as_deref(), Some("0xbeef"));
        assert_eq!(full.nonce, 7);

        assert!(matches!(
            parse_signed(json!("0xnothex"), &tx, "0xabc"),
            Err(ProviderError::Signer(_))
        ));
        assert!(matches!(
            parse_signed(json!(42), &tx, "0xabc"),
            Err(ProviderError::Signer(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_chain_rejected_without_network() {
        let provider = JsonRpcProvider::new("test", HashMap::new()).unwrap();
        let err = provider.get_fee_data(1).await.unwrap_err();
        assert_eq!(err, ProviderError::UnsupportedChain(1));
    }
}
