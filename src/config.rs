//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section carries defaults, so a partial file (or an empty one) is valid.
//! Secrets (RPC URLs with embedded keys, the signer endpoint) are referenced
//! by env-var name in the config and resolved at runtime into `SecretString`s.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use crate::types::{ChainId, Urgency};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub risk_cache: RiskCacheConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breakers: BreakersConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    /// Use the simulated chain instead of live RPC endpoints.
    pub dry_run: bool,
    /// Upper bound on concurrently running coordinators.
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    /// Scores strictly above this abandon the opportunity.
    pub max_risk_score: Decimal,
    pub confirm_timeout_secs: u64,
    pub confirm_poll_ms: u64,
    pub reconcile_interval_secs: u64,
    /// Dry-run chain: receipt polls before a broadcast confirms.
    pub dry_run_confirm_after_polls: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "FASTLANE-001".to_string(),
            dry_run: true,
            max_concurrent: 32,
            queue_capacity: 1024,
            max_risk_score: dec!(0.7),
            confirm_timeout_secs: 60,
            confirm_poll_ms: 1000,
            reconcile_interval_secs: 30,
            dry_run_confirm_after_polls: 2,
        }
    }
}

impl EngineConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Risk cache / nonces
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskCacheConfig {
    pub ttl_secs: u64,
    /// Fraction of the TTL after which an entry is reported as stale.
    pub stale_after_fraction: f64,
}

impl Default for RiskCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            stale_after_fraction: 0.5,
        }
    }
}

impl RiskCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NonceConfig {
    /// How long an allocation waits on a slot held by a resync.
    pub lock_timeout_ms: u64,
    /// Bound on a single chain nonce lookup.
    pub fetch_timeout_ms: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2000,
            fetch_timeout_ms: 5000,
        }
    }
}

impl NonceConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Gas
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GasConfig {
    /// Cap on compounded escalation per attempt chain, in percent.
    pub max_escalation_pct: Decimal,
    pub standard_escalation_pct: Decimal,
    pub mempool_drop_escalation_pct: Decimal,
    pub urgency: UrgencyMultipliers,
    /// Used for chains without an entry in `chains`.
    pub default_chain: ChainGasConfig,
    /// Per-chain tables, keyed by chain id.
    pub chains: BTreeMap<String, ChainGasConfig>,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            max_escalation_pct: dec!(100),
            standard_escalation_pct: dec!(15),
            mempool_drop_escalation_pct: dec!(50),
            urgency: UrgencyMultipliers::default(),
            default_chain: ChainGasConfig::default(),
            chains: BTreeMap::new(),
        }
    }
}

impl GasConfig {
    /// Gas settings for a chain, falling back to `default_chain`.
    pub fn chain(&self, chain_id: ChainId) -> &ChainGasConfig {
        self.chains
            .get(&chain_id.to_string())
            .unwrap_or(&self.default_chain)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UrgencyMultipliers {
    pub low: Decimal,
    pub normal: Decimal,
    pub high: Decimal,
}

impl Default for UrgencyMultipliers {
    fn default() -> Self {
        Self {
            low: dec!(0.8),
            normal: dec!(1.0),
            high: dec!(1.5),
        }
    }
}

impl UrgencyMultipliers {
    pub fn for_urgency(&self, urgency: Urgency) -> Decimal {
        match urgency {
            Urgency::Low => self.low,
            Urgency::Normal => self.normal,
            Urgency::High => self.high,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChainGasConfig {
    pub base_fee_multiplier: Decimal,
    pub min_priority_fee: Decimal,
    /// Hard ceiling on `maxFeePerGas`, in gwei.
    pub max_fee_per_gas: Decimal,
}

impl Default for ChainGasConfig {
    fn default() -> Self {
        Self {
            base_fee_multiplier: dec!(2),
            min_priority_fee: dec!(0.01),
            max_fee_per_gas: dec!(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub max_elapsed_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
    /// Per network call, independent of the overall budget.
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_elapsed_secs: 120,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_fraction: 0.1,
            call_timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------------

/// Settings for one breaker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_rate_threshold: f64,
    /// Max outcomes kept in the sliding window.
    pub window_calls: usize,
    /// Max age of outcomes kept in the sliding window.
    pub window_secs: u64,
    pub min_calls: usize,
    pub cooldown_base_ms: u64,
    pub cooldown_multiplier: f64,
    pub cooldown_max_ms: u64,
    pub jitter_fraction: f64,
    pub probe_budget: u32,
    pub probe_successes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            window_calls: 10,
            window_secs: 60,
            min_calls: 10,
            cooldown_base_ms: 30_000,
            cooldown_multiplier: 2.0,
            cooldown_max_ms: 600_000,
            jitter_fraction: 0.1,
            probe_budget: 1,
            probe_successes: 2,
        }
    }
}

impl BreakerSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BreakersConfig {
    pub default: BreakerSettings,
    /// Overrides keyed by resource-key prefix; the longest match wins.
    pub overrides: BTreeMap<String, BreakerSettings>,
}

impl BreakersConfig {
    /// Settings for a resource key.
    pub fn resolve(&self, resource_key: &str) -> &BreakerSettings {
        self.overrides
            .iter()
            .filter(|(prefix, _)| resource_key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, settings)| settings)
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CascadeConfig {
    pub enabled: bool,
    /// Correlated keys: exact keys or `prefix*` patterns.
    pub correlated: Vec<String>,
    /// Open correlated breakers needed to trip protection.
    pub threshold: usize,
    pub window_secs: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            correlated: vec!["tx-submit:*".to_string(), "rpc:*".to_string()],
            threshold: 3,
            window_secs: 60,
        }
    }
}

impl CascadeConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

// ---------------------------------------------------------------------------
// Persistence / RPC
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// JSON state file path.
    pub path: String,
    pub sqlite_url: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Json,
            path: "data/fastlane_state.json".to_string(),
            sqlite_url: "sqlite://data/fastlane.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub chain_id: ChainId,
    /// Env var holding the endpoint URL (usually carries an API key).
    pub url_env: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RpcConfig {
    /// Provider label, used in `rpc:{name}` breaker keys.
    pub provider_name: String,
    pub endpoints: Vec<EndpointConfig>,
    /// Env var holding the remote signer URL.
    pub signer_url_env: Option<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            provider_name: "primary".to_string(),
            endpoints: Vec::new(),
            signer_url_env: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.engine.max_concurrent > 0, "engine.max_concurrent must be > 0");
        anyhow::ensure!(self.retry.max_attempts > 0, "retry.max_attempts must be > 0");
        anyhow::ensure!(
            (0.0..1.0).contains(&self.retry.jitter_fraction),
            "retry.jitter_fraction must be in [0, 1)"
        );
        anyhow::ensure!(
            self.risk_cache.stale_after_fraction > 0.0 && self.risk_cache.stale_after_fraction <= 1.0,
            "risk_cache.stale_after_fraction must be in (0, 1]"
        );
        for (key, settings) in std::iter::once(("default", &self.breakers.default)).chain(
            self.breakers
                .overrides
                .iter()
                .map(|(k, v)| (k.as_str(), v)),
        ) {
            anyhow::ensure!(
                settings.failure_rate_threshold > 0.0 && settings.failure_rate_threshold <= 1.0,
                "breakers.{key}: failure_rate_threshold must be in (0, 1]"
            );
            anyhow::ensure!(
                settings.window_calls > 0 && settings.min_calls <= settings.window_calls,
                "breakers.{key}: min_calls must not exceed window_calls"
            );
            anyhow::ensure!(
                settings.probe_budget > 0 && settings.probe_successes > 0,
                "breakers.{key}: probe_budget and probe_successes must be > 0"
            );
        }
        for key in self.gas.chains.keys() {
            key.parse::<ChainId>()
                .with_context(|| format!("gas.chains: invalid chain id {key:?}"))?;
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Resolve an environment variable holding a secret.
    pub fn resolve_secret(env_name: &str) -> Result<SecretString> {
        Self::resolve_env(env_name).map(SecretString::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config() {
        let cfg = AppConfig::parse(include_str!("../config.toml")).unwrap();
        assert_eq!(cfg.engine.name, "FASTLANE-001");
        assert!(cfg.engine.dry_run);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.gas.standard_escalation_pct, dec!(15));
        assert_eq!(cfg.gas.chain(8453).min_priority_fee, dec!(0.001));
        assert_eq!(cfg.cascade.threshold, 3);
        assert_eq!(cfg.persistence.backend, PersistenceBackend::Json);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.engine.max_concurrent, 32);
        assert_eq!(cfg.risk_cache.ttl(), Duration::from_secs(30));
        assert_eq!(cfg.breakers.default.failure_rate_threshold, 0.5);
        assert_eq!(cfg.gas.urgency.for_urgency(Urgency::High), dec!(1.5));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg = AppConfig::parse("[retry]\nmax_attempts = 9\n").unwrap();
        assert_eq!(cfg.retry.max_attempts, 9);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
    }

    #[test]
    fn test_breaker_override_longest_prefix() {
        let cfg = AppConfig::parse(
            r#"
            [breakers.overrides."tx-submit:"]
            min_calls = 4
            window_calls = 4
            [breakers.overrides."tx-submit:chain-8453"]
            min_calls = 2
            window_calls = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.breakers.resolve("tx-submit:chain-8453").min_calls, 2);
        assert_eq!(cfg.breakers.resolve("tx-submit:chain-1").min_calls, 4);
        assert_eq!(cfg.breakers.resolve("rpc:alchemy").min_calls, 10);
    }

    #[test]
    fn test_unknown_chain_falls_back_to_default() {
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.gas.chain(999).max_fee_per_gas, dec!(500));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::parse("[retry]\njitter_fraction = 1.5\n").is_err());
        assert!(AppConfig::parse("[gas.chains.mainnet]\nmin_priority_fee = \"1\"\n").is_err());
        assert!(
            AppConfig::parse("[breakers.default]\nmin_calls = 20\nwindow_calls = 10\n").is_err()
        );
    }

    #[test]
    fn test_resolve_secret_missing_env() {
        assert!(AppConfig::resolve_secret("FASTLANE_TEST_UNSET_VAR_XYZ").is_err());
    }
}
