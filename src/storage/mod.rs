//! Persistence layer.
//!
//! `StateStore` saves and loads transaction records and breaker snapshots.
//! Three backends:
//! - `MemoryStore`: process-local, for tests and throwaway runs
//! - `JsonFileStore`: one pretty-printed JSON document, replaced atomically
//! - `SqliteStore`: SQLite via sqlx, for long-running deployments
//!
//! `TransactionStateStore` sits on top and owns the transaction lifecycle.

pub mod sqlite;
pub mod transactions;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::breaker::state::BreakerState;
use crate::config::{PersistenceBackend, PersistenceConfig};
use crate::types::TransactionRecord;

pub use sqlite::SqliteStore;
pub use transactions::{StoreError, TransactionStateStore, TransitionMeta};

/// Durable storage for records and breaker snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a record by id.
    async fn save_transaction(&self, record: &TransactionRecord) -> Result<()>;

    async fn load_transactions(&self) -> Result<Vec<TransactionRecord>>;

    /// Insert or replace a breaker snapshot by resource key.
    async fn save_breaker(&self, state: &BreakerState) -> Result<()>;

    async fn load_breakers(&self) -> Result<Vec<BreakerState>>;

    fn backend(&self) -> &'static str;
}

/// Open the backend selected in the configuration.
pub async fn open_store(cfg: &PersistenceConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match cfg.backend {
        PersistenceBackend::Memory => Arc::new(MemoryStore::default()),
        PersistenceBackend::Json => Arc::new(JsonFileStore::open(&cfg.path)?),
        PersistenceBackend::Sqlite => Arc::new(SqliteStore::connect(&cfg.sqlite_url).await?),
    };
    info!(backend = store.backend(), "Persistence ready");
    Ok(store)
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<StateDocument>,
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_transaction(&self, record: &TransactionRecord) -> Result<()> {
        self.doc.lock().transactions.insert(record.id, record.clone());
        Ok(())
    }

    async fn load_transactions(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.doc.lock().transactions.values().cloned().collect())
    }

    async fn save_breaker(&self, state: &BreakerState) -> Result<()> {
        self.doc
            .lock()
            .breakers
            .insert(state.resource_key.clone(), state.clone());
        Ok(())
    }

    async fn load_breakers(&self) -> Result<Vec<BreakerState>> {
        Ok(self.doc.lock().breakers.values().cloned().collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    transactions: BTreeMap<Uuid, TransactionRecord>,
    #[serde(default)]
    breakers: BTreeMap<String, BreakerState>,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
}

/// Whole state in one JSON file. Every save rewrites the file through a
/// temp file and a rename, so a crash never leaves a torn document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    doc: tokio::sync::Mutex<StateDocument>,
}

impl JsonFileStore {
    /// Open the state file, starting fresh if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let doc = if path.exists() {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read state from {}", path.display()))?;
            let doc: StateDocument = serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse state from {}", path.display()))?;
            info!(
                path = %path.display(),
                transactions = doc.transactions.len(),
                breakers = doc.breakers.len(),
                "State loaded from disk"
            );
            doc
        } else {
            info!(path = %path.display(), "No saved state found, starting fresh");
            StateDocument::default()
        };

        Ok(Self {
            path,
            doc: tokio::sync::Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the state file (for testing or reset).
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete state file {}", self.path.display()))?;
        }
        Ok(())
    }

    async fn write(&self, doc: &mut StateDocument) -> Result<()> {
        doc.saved_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(doc).context("Failed to serialise state")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write state to {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), bytes = json.len(), "State saved");
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save_transaction(&self, record: &TransactionRecord) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        next.transactions.insert(record.id, record.clone());
        self.write(&mut next).await?;
        *doc = next;
        Ok(())
    }

    async fn load_transactions(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.doc.lock().await.transactions.values().cloned().collect())
    }

    async fn save_breaker(&self, state: &BreakerState) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        next.breakers
            .insert(state.resource_key.clone(), state.clone());
        self.write(&mut next).await?;
        *doc = next;
        Ok(())
    }

    async fn load_breakers(&self) -> Result<Vec<BreakerState>> {
        Ok(self.doc.lock().await.breakers.values().cloned().collect())
    }

    fn backend(&self) -> &'static str {
        "json"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
