//! SQLite backend.
//!
//! Records and snapshots are stored as JSON bodies next to the columns the
//! reconciler and operators query by (status, nonce, opportunity).

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use super::StateStore;
use crate::breaker::state::BreakerState;
use crate::types::TransactionRecord;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS transactions (
        id TEXT PRIMARY KEY,
        opportunity_id TEXT NOT NULL,
        account_id TEXT NOT NULL,
        chain_id INTEGER NOT NULL,
        nonce INTEGER NOT NULL,
        status TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_nonce
        ON transactions (account_id, chain_id, nonce)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_opportunity
        ON transactions (opportunity_id)",
    "CREATE TABLE IF NOT EXISTS breakers (
        resource_key TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect (creating the database file if needed) and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid SQLite URL: {url}"))?
            .create_if_missing(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        // One connection: writes are serialized and `:memory:` stays one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database: {url}"))?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply SQLite schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn save_transaction(&self, record: &TransactionRecord) -> Result<()> {
        let body = serde_json::to_string(record).context("Failed to serialise record")?;
        sqlx::query(
            "INSERT INTO transactions
                (id, opportunity_id, account_id, chain_id, nonce, status, body, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                nonce = excluded.nonce,
                status = excluded.status,
                body = excluded.body,
                updated_at = excluded.updated_at",
        )
        .bind(record.id.to_string())
        .bind(&record.opportunity_id)
        .bind(&record.account_id)
        .bind(record.chain_id as i64)
        .bind(record.nonce as i64)
        .bind(record.status.to_string())
        .bind(body)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save transaction {}", record.id))?;
        Ok(())
    }

    async fn load_transactions(&self) -> Result<Vec<TransactionRecord>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body FROM transactions ORDER BY updated_at")
                .fetch_all(&self.pool)
                .await
                .context("Failed to load transactions")?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).context("Corrupt transaction row"))
            .collect()
    }

    async fn save_breaker(&self, state: &BreakerState) -> Result<()> {
        let body = serde_json::to_string(state).context("Failed to serialise breaker")?;
        sqlx::query(
            "INSERT INTO breakers (resource_key, status, body, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(resource_key) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                updated_at = excluded.updated_at",
        )
        .bind(&state.resource_key)
        .bind(state.status.to_string())
        .bind(body)
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save breaker {}", state.resource_key))?;
        Ok(())
    }

    async fn load_breakers(&self) -> Result<Vec<BreakerState>> {
        let bodies: Vec<String> = sqlx::query_scalar("SELECT body FROM breakers")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load breakers")?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).context("Corrupt breaker row"))
            .collect()
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}
