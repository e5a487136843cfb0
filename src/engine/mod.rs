//! Execution pipeline: opportunity → risk → gas → nonce → submit → confirm.
//!
//! - `retry`: submission attempts with backoff, escalation and breaker checks
//! - `coordinator`: per-opportunity state machine
//! - `pool`: bounded worker pool feeding coordinators
//! - `reconciler`: startup and periodic repair of pending records

pub mod coordinator;
pub mod pool;
pub mod reconciler;
pub mod retry;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreakerManager;
use crate::chain::{RpcProvider, SwapEncoder, TransactionSigner};
use crate::config::AppConfig;
use crate::events::ExecutionObserver;
use crate::gas::GasOptimizer;
use crate::nonce::NonceManager;
use crate::risk::{RiskCache, RiskSource};
use crate::storage::{StateStore, TransactionStateStore};

/// External collaborators the core calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn RpcProvider>,
    pub signer: Arc<dyn TransactionSigner>,
    pub encoder: Arc<dyn SwapEncoder>,
    pub risk_source: Option<Arc<dyn RiskSource>>,
    pub observer: Arc<dyn ExecutionObserver>,
}

/// Process-wide components, shared by every coordinator.
pub struct ExecutionServices {
    pub config: AppConfig,
    pub risk: Arc<RiskCache>,
    pub risk_source: Option<Arc<dyn RiskSource>>,
    pub nonces: Arc<NonceManager>,
    pub gas: Arc<GasOptimizer>,
    pub store: Arc<TransactionStateStore>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub provider: Arc<dyn RpcProvider>,
    pub signer: Arc<dyn TransactionSigner>,
    pub encoder: Arc<dyn SwapEncoder>,
    pub observer: Arc<dyn ExecutionObserver>,
}

impl ExecutionServices {
    /// Wire every component from configuration.
    ///
    /// Breaker transitions are persisted through `persistence` by a writer
    /// task; its handle is returned so the caller can await it on shutdown
    /// after `CircuitBreakerManager::close_persistence`.
    /// Must be called inside a tokio runtime.
    pub fn assemble(
        config: AppConfig,
        collaborators: Collaborators,
        persistence: Arc<dyn StateStore>,
    ) -> (Self, JoinHandle<()>) {
        let (breakers, writer) = CircuitBreakerManager::new(
            config.breakers.clone(),
            config.cascade.clone(),
            collaborators.observer.clone(),
        )
        .with_persistence(persistence.clone());

        let services = Self {
            risk: Arc::new(RiskCache::new(&config.risk_cache)),
            risk_source: collaborators.risk_source,
            nonces: Arc::new(NonceManager::new(
                &config.nonce,
                Some(collaborators.provider.clone()),
            )),
            gas: Arc::new(GasOptimizer::new(config.gas.clone())),
            store: Arc::new(TransactionStateStore::new(persistence)),
            breakers: Arc::new(breakers),
            provider: collaborators.provider,
            signer: collaborators.signer,
            encoder: collaborators.encoder,
            observer: collaborators.observer,
            config,
        };
        (services, writer)
    }

    /// Context for a new coordinator, bound to the current protection generation.
    pub fn context(&self, shutdown: &CancellationToken) -> ExecutionContext {
        ExecutionContext::new(shutdown.clone(), self.breakers.protection_token())
    }
}

/// Cancellation scope of one coordinator.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    shutdown: CancellationToken,
    protection: CancellationToken,
}

impl ExecutionContext {
    pub fn new(shutdown: CancellationToken, protection: CancellationToken) -> Self {
        Self {
            shutdown,
            protection,
        }
    }

    /// Context that is never cancelled.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled() || self.protection.is_cancelled()
    }

    /// Why the context was cancelled, if it was.
    pub fn cancel_reason(&self) -> Option<&'static str> {
        if self.protection.is_cancelled() {
            Some("system protection tripped")
        } else if self.shutdown.is_cancelled() {
            Some("shutdown requested")
        } else {
            None
        }
    }

    /// Resolves once either token is cancelled.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.protection.cancelled() => {}
        }
    }
}
