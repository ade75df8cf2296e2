//! The reconciliation engine.
//!
//! Owns the store, the platform client, the credential resolver, and the
//! re-entrancy guard, and exposes the entry points callers dispatch to.
//! A full tenant pass runs project lifecycle, then environment variables,
//! then deployment history, under a per-record document lock.

use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::{EngineError, RemoteErrorKind};
use crate::platform::PlatformClient;
use crate::store::types::{TenantRecord, TenantStatus};
use crate::store::StoreClient;

pub mod credentials;
pub mod guard;

mod deployments;
mod envvars;
mod lifecycle;

#[cfg(test)]
mod tests;

pub use self::deployments::DeploymentOverrides;
pub use self::lifecycle::GitRepoSpec;

use self::credentials::{CredentialResolver, DefaultCredentials};
use self::guard::{LockKind, ReentrancyGuard};

/// Per-pass bookkeeping, aggregated across stages and tenants.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: usize,
}

impl SyncSummary {
    pub fn absorb(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.errors += other.errors;
    }

    /// Whether the pass changed anything remotely.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

/// What every entry point hands back: a machine-readable summary plus a
/// human-readable message. `success` is false only when errors occurred;
/// the message always says how partial the pass was.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub message: String,
    pub summary: SyncSummary,
}

impl SyncOutcome {
    fn completed(message: impl Into<String>, summary: SyncSummary) -> Self {
        Self {
            success: summary.errors == 0,
            message: message.into(),
            summary,
        }
    }

    fn skipped(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            summary: SyncSummary {
                skipped: 1,
                ..SyncSummary::default()
            },
        }
    }
}

/// Behavioral knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_credentials: DefaultCredentials,
    pub suppression_window_seconds: i64,
    pub deployment_fetch_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_credentials: DefaultCredentials::default(),
            suppression_window_seconds: 10,
            deployment_fetch_limit: 3,
        }
    }
}

/// TTLs and windows for the in-memory guard and credential cache.
#[derive(Debug, Clone, Copy)]
pub struct EngineTiming {
    pub credential_ttl: Duration,
    pub lock_ttl: Duration,
    pub debounce: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            credential_ttl: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(120),
            debounce: Duration::from_millis(1_000),
        }
    }
}

pub struct ReconcileEngine {
    store: StoreClient,
    platform: PlatformClient,
    credentials: CredentialResolver,
    guard: ReentrancyGuard,
    settings: EngineSettings,
}

impl ReconcileEngine {
    #[must_use]
    pub fn new(
        store: StoreClient,
        platform: PlatformClient,
        settings: EngineSettings,
        timing: EngineTiming,
    ) -> Self {
        Self {
            store,
            platform,
            credentials: CredentialResolver::new(timing.credential_ttl),
            guard: ReentrancyGuard::new(timing.lock_ttl, timing.debounce),
            settings,
        }
    }

    /// Builds the engine from configuration: opens the store, runs
    /// migrations, and wires the platform client.
    ///
    /// # Errors
    /// Returns an error if the store cannot be initialized or no platform
    /// base URL is configured.
    pub async fn from_config(config: &BridgeConfig) -> anyhow::Result<Self> {
        let store = StoreClient::initialize(&config.database_path()).await?;
        let base_url = config.platform_base_url().context(
            "platform base URL is not configured (platform.base_url or TENANTBRIDGE_PLATFORM_BASE_URL)",
        )?;
        let platform = PlatformClient::new(base_url);

        let settings = EngineSettings {
            default_credentials: DefaultCredentials {
                setting_token: config.platform_token(),
                setting_team_id: config.platform_team_id(),
            },
            suppression_window_seconds: config.suppression_window_seconds(),
            deployment_fetch_limit: config.deployment_fetch_limit(),
        };
        let timing = EngineTiming {
            credential_ttl: Duration::from_secs(config.credential_ttl_seconds()),
            lock_ttl: Duration::from_secs(config.lock_ttl_seconds()),
            debounce: Duration::from_millis(config.debounce_millis()),
        };

        Ok(Self::new(store, platform, settings, timing))
    }

    #[must_use]
    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    /// Runs a full reconciliation pass for every tenant. Per-tenant
    /// failures are absorbed; the outcome reports how many made it.
    ///
    /// # Errors
    /// Returns store errors from the initial listing only.
    pub async fn sync_all_tenants(&self) -> Result<SyncOutcome, EngineError> {
        let tenants = self.store.list_tenants().await?;
        let total = tenants.len();
        let mut summary = SyncSummary::default();
        let mut synced = 0_usize;

        for tenant in &tenants {
            match self.sync_tenant(&tenant.id).await {
                Ok(outcome) => {
                    if outcome.success {
                        synced += 1;
                    }
                    summary.absorb(outcome.summary);
                }
                Err(error) => {
                    warn!(tenant_id = %tenant.id, error = %error, "tenant reconciliation failed");
                    summary.errors += 1;
                }
            }
        }

        Ok(SyncOutcome::completed(
            format!("synced {synced} of {total} tenants"),
            summary,
        ))
    }

    /// Runs one tenant's full reconciliation pass under the document lock.
    /// A pass arriving while another is in flight (or within the debounce
    /// window of the previous one) is dropped and reported as skipped.
    ///
    /// # Errors
    /// Returns validation, credential, remote, or store errors; the
    /// failure is also recorded on the tenant for operators.
    pub async fn sync_tenant(&self, tenant_id: &str) -> Result<SyncOutcome, EngineError> {
        let tenant = self.require_tenant(tenant_id).await?;

        if !self.guard.try_acquire(tenant_id, LockKind::Document).await {
            info!(tenant_id, "reconciliation pass dropped; one is already in flight");
            return Ok(SyncOutcome::skipped(format!(
                "tenant {tenant_id}: reconciliation already in flight"
            )));
        }

        let result = self.run_tenant_pass(tenant).await;
        self.guard.release(tenant_id, LockKind::Document).await;

        match result {
            Ok(outcome) => {
                let status = if outcome.summary.errors == 0 { "ok" } else { "partial" };
                self.store
                    .record_sync_result(tenant_id, status, &outcome.message)
                    .await?;
                Ok(outcome)
            }
            Err(error) => {
                if let Err(store_error) = self
                    .store
                    .record_sync_result(tenant_id, "error", &error.to_string())
                    .await
                {
                    warn!(tenant_id, error = %store_error, "failed to record sync failure");
                }
                Err(error)
            }
        }
    }

    async fn run_tenant_pass(&self, tenant: TenantRecord) -> Result<SyncOutcome, EngineError> {
        if tenant.status == TenantStatus::Draft {
            return Ok(SyncOutcome::skipped(format!(
                "tenant {} is a draft; nothing to reconcile",
                tenant.id
            )));
        }

        let mut summary = SyncSummary::default();

        let tenant = match self.ensure_remote_project(&tenant, false).await? {
            Some((refreshed, lifecycle_summary)) => {
                summary.absorb(lifecycle_summary);
                refreshed
            }
            None => {
                summary.skipped += 1;
                tenant
            }
        };

        if let Some(set) = self.store.get_env_set_by_tenant(&tenant.id).await? {
            match self.reconcile_env_set(&tenant, &set, LockKind::Update).await {
                Ok(stage) => summary.absorb(stage),
                Err(error) => {
                    warn!(tenant_id = %tenant.id, error = %error, "env var stage failed");
                    summary.errors += 1;
                }
            }
        }

        if tenant.is_eligible() {
            match self.sync_tenant_deployments(&tenant).await {
                Ok(stage) => summary.absorb(stage),
                Err(error) => {
                    warn!(tenant_id = %tenant.id, error = %error, "deployment stage failed");
                    summary.errors += 1;
                }
            }
        }

        Ok(SyncOutcome::completed(
            format!("tenant {} reconciled", tenant.id),
            summary,
        ))
    }

    pub(crate) async fn require_tenant(&self, tenant_id: &str) -> Result<TenantRecord, EngineError> {
        self.store
            .get_tenant_by_id(tenant_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("tenant {tenant_id} not found")))
    }

    /// Remote-failure compensation hook: an unauthorized response evicts
    /// the tenant's cached credential so the next pass re-validates.
    pub(crate) async fn note_remote_error(&self, tenant_id: &str, error: &EngineError) {
        if error.remote_kind() == Some(RemoteErrorKind::Unauthorized) {
            self.credentials.invalidate(tenant_id).await;
        }
    }
}
