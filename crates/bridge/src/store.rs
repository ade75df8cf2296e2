//! Local record store over SQLite.
//!
//! The store is deliberately boring: typed CRUD, count, and filtered finds
//! on the three collections the engine reconciles. Mutating calls that touch
//! sync-relevant state take a [`types::WriteOrigin`] so reconciliation-caused
//! writes are distinguishable from user edits.

use std::path::Path;

use anyhow::{bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

pub mod types;

mod deployments;
mod env_sets;
mod tenants;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
pub struct StoreClient {
    pool: Pool<Sqlite>,
}

impl StoreClient {
    /// Opens the database, creating the file if needed.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_path: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        Ok(Self { pool })
    }

    /// Opens the database, runs migrations, and verifies WAL mode.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created, migrations fail,
    /// or WAL mode is not active.
    pub async fn initialize(database_path: &str) -> Result<Self> {
        if let Some(parent_dir) = Path::new(database_path).parent() {
            std::fs::create_dir_all(parent_dir)?;
        }

        let store = Self::connect(database_path).await?;
        store.run_migrations().await?;
        store.ensure_wal_mode().await?;

        Ok(store)
    }

    /// # Errors
    /// Returns an error if a migration fails.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if WAL mode could not be enabled.
    pub async fn ensure_wal_mode(&self) -> Result<()> {
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode=WAL;")
            .fetch_one(&self.pool)
            .await?;

        if journal_mode.to_uppercase() != "WAL" {
            bail!("SQLite WAL mode is not enabled");
        }

        Ok(())
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Epoch seconds, used for the `last_synced_at` bookkeeping column.
pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
