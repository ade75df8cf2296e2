//! Environment variable reconciliation.
//!
//! Planning is a pure function over `(previous, current)`; the apply stage
//! performs the remote I/O in a hard order (creates, then updates, then
//! deletes) and persists the outcome in a single guarded write.

use std::collections::{HashMap, HashSet};

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::platform::types::EnvVarWriteRequest;
use crate::store::types::{
    EnvVarEntry, EnvVarSetRecord, NewEnvVarSet, RemoteIdentity, SyncFailure, TenantRecord,
    TriggerOrigin, VarType, WriteOrigin,
};

use super::guard::LockKind;
use super::{ReconcileEngine, SyncOutcome, SyncSummary};

const SYNTHESIZED_SECRET_LEN: usize = 32;

/// Keys whose empty plain values are filled in from the tenant's own URL.
const WELL_KNOWN_URL_KEYS: [&str; 3] = ["PUBLIC_SERVER_URL", "NEXT_PUBLIC_SERVER_URL", "AUTH_URL"];

/// An entry present in the previous version but gone from the current one,
/// scheduled for remote deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredEntry {
    pub key: String,
    pub remote_id: String,
}

/// The classified work for one reconciliation pass over a set.
#[derive(Debug, Default)]
pub struct EnvVarPlan {
    pub creates: Vec<EnvVarEntry>,
    pub updates: Vec<EnvVarEntry>,
    pub deletes: Vec<RetiredEntry>,
    pub skipped: usize,
}

impl EnvVarPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Rejects duplicate keys within a set.
pub(crate) fn validate_unique_keys(entries: &[EnvVarEntry]) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.key.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate environment variable key: {}",
                entry.key
            )));
        }
    }
    Ok(())
}

/// Classifies every current entry against the previously applied version.
///
/// - no usable remote identity: create (with value synthesis);
/// - a synced identity that belonged to a different key before: rename,
///   treated as a fresh create while the delete diff retires the old key;
/// - synced and materially changed: update;
/// - synced and unchanged: skip;
/// - failed identity on an unchanged entry: skip (terminal until edited).
///
/// Keys present before but gone now, whose previous entry holds a synced
/// identity, are scheduled for deletion.
pub(crate) fn plan_env_changes(
    previous: &[EnvVarEntry],
    current: &[EnvVarEntry],
    tenant_url: Option<&str>,
) -> EnvVarPlan {
    let previous_by_key: HashMap<&str, &EnvVarEntry> = previous
        .iter()
        .map(|entry| (entry.key.as_str(), entry))
        .collect();
    let previous_key_by_remote: HashMap<&str, &str> = previous
        .iter()
        .filter_map(|entry| entry.remote.synced_id().map(|id| (id, entry.key.as_str())))
        .collect();
    let current_keys: HashSet<&str> = current.iter().map(|entry| entry.key.as_str()).collect();

    let mut plan = EnvVarPlan::default();

    for entry in current {
        match &entry.remote {
            RemoteIdentity::Unsynced => plan.creates.push(synthesized(entry, tenant_url)),
            RemoteIdentity::Failed(_) => {
                match previous_by_key.get(entry.key.as_str()) {
                    // Terminal failure: only an edit re-arms the entry.
                    Some(prev) if !materially_differs(prev, entry) => plan.skipped += 1,
                    _ => {
                        let mut fresh = synthesized(entry, tenant_url);
                        fresh.remote = RemoteIdentity::Unsynced;
                        plan.creates.push(fresh);
                    }
                }
            }
            RemoteIdentity::Synced(remote_id) => {
                let renamed = previous_key_by_remote
                    .get(remote_id.as_str())
                    .is_some_and(|previous_key| *previous_key != entry.key);

                if renamed {
                    let mut fresh = synthesized(entry, tenant_url);
                    fresh.remote = RemoteIdentity::Unsynced;
                    plan.creates.push(fresh);
                } else if let Some(prev) = previous_by_key.get(entry.key.as_str()) {
                    if materially_differs(prev, entry) {
                        plan.updates.push(entry.clone());
                    } else {
                        plan.skipped += 1;
                    }
                } else {
                    // Claims an identity the applied version never saw;
                    // push the local state to the remote entry.
                    plan.updates.push(entry.clone());
                }
            }
        }
    }

    for prev in previous {
        if current_keys.contains(prev.key.as_str()) {
            continue;
        }
        if let Some(remote_id) = prev.remote.synced_id() {
            plan.deletes.push(RetiredEntry {
                key: prev.key.clone(),
                remote_id: remote_id.to_string(),
            });
        }
    }

    plan
}

/// Field-level change detection; the remote identity itself is not compared.
fn materially_differs(a: &EnvVarEntry, b: &EnvVarEntry) -> bool {
    a.value != b.value
        || a.var_type != b.var_type
        || a.targets != b.targets
        || a.comment != b.comment
        || a.git_branch != b.git_branch
}

/// Fills in empty values where the set's conventions define them: encrypted
/// entries get a random secret, well-known URL keys get the tenant URL.
fn synthesized(entry: &EnvVarEntry, tenant_url: Option<&str>) -> EnvVarEntry {
    let mut entry = entry.clone();
    if !entry.value.is_empty() {
        return entry;
    }

    match entry.var_type {
        VarType::Encrypted => {
            entry.value = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(SYNTHESIZED_SECRET_LEN)
                .map(char::from)
                .collect();
        }
        VarType::Plain if WELL_KNOWN_URL_KEYS.contains(&entry.key.as_str()) => {
            if let Some(url) = tenant_url {
                entry.value = url.to_string();
            }
        }
        _ => {}
    }

    entry
}

fn write_request(entry: &EnvVarEntry) -> EnvVarWriteRequest {
    EnvVarWriteRequest {
        key: entry.key.clone(),
        value: entry.value.clone(),
        kind: entry.var_type.as_str().to_string(),
        target: entry
            .targets
            .iter()
            .map(|target| target.as_str().to_string())
            .collect(),
        comment: entry.comment.clone(),
        git_branch: entry.git_branch.clone(),
    }
}

fn set_entry(entries: &mut [EnvVarEntry], key: &str, apply: impl FnOnce(&mut EnvVarEntry)) {
    if let Some(entry) = entries.iter_mut().find(|entry| entry.key == key) {
        apply(entry);
    }
}

impl ReconcileEngine {
    /// Creates a tenant's environment variable set and runs the initial
    /// reconciliation when the tenant already has a remote project.
    ///
    /// # Errors
    /// Returns a validation error for duplicate keys or a second set, and
    /// store errors on persistence failure. Remote failures during the
    /// initial reconciliation are logged and left for the next pass.
    pub async fn create_env_set(
        &self,
        tenant_id: &str,
        entries: Vec<EnvVarEntry>,
        auto_deploy: bool,
    ) -> Result<EnvVarSetRecord, EngineError> {
        let tenant = self.require_tenant(tenant_id).await?;
        validate_unique_keys(&entries)?;

        let set = NewEnvVarSet {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.id.clone(),
            auto_deploy,
            entries,
        };
        self.store.insert_env_set(&set).await?;

        let record = self.loaded_env_set(&set.id).await?;
        if tenant.remote_project_id.is_some() {
            if let Err(error) = self
                .reconcile_env_set(&tenant, &record, LockKind::Create)
                .await
            {
                warn!(
                    tenant_id = %tenant.id,
                    error = %error,
                    "initial env reconciliation failed; next sync will retry"
                );
            }
            return self.loaded_env_set(&set.id).await;
        }

        Ok(record)
    }

    /// Replaces the set's entries from a user edit and reconciles.
    ///
    /// # Errors
    /// Returns validation, credential, or store errors; partial remote
    /// failures are reported through the outcome summary instead.
    pub async fn update_env_set(
        &self,
        tenant_id: &str,
        entries: Vec<EnvVarEntry>,
    ) -> Result<SyncOutcome, EngineError> {
        let tenant = self.require_tenant(tenant_id).await?;
        validate_unique_keys(&entries)?;

        let set = self
            .store
            .get_env_set_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "tenant {tenant_id} has no environment variable set"
                ))
            })?;

        self.store
            .update_env_entries(&set.id, &entries, WriteOrigin::User)
            .await?;

        let set = self.loaded_env_set(&set.id).await?;
        let summary = self
            .reconcile_env_set(&tenant, &set, LockKind::Update)
            .await?;

        Ok(SyncOutcome::completed(
            "environment variables reconciled",
            summary,
        ))
    }

    /// Reconciles one tenant's set, or every candidate tenant's set.
    ///
    /// # Errors
    /// For a single tenant: validation, credential, or store errors. For
    /// the all-tenants sweep, per-tenant failures are absorbed into the
    /// summary and the sweep continues.
    pub async fn sync_env_vars(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<SyncOutcome, EngineError> {
        if let Some(tenant_id) = tenant_id {
            let tenant = self.require_tenant(tenant_id).await?;
            let Some(set) = self.store.get_env_set_by_tenant(tenant_id).await? else {
                return Ok(SyncOutcome::skipped(format!(
                    "tenant {tenant_id} has no environment variable set"
                )));
            };

            let summary = self
                .reconcile_env_set(&tenant, &set, LockKind::Update)
                .await?;
            return Ok(SyncOutcome::completed(
                "environment variables reconciled",
                summary,
            ));
        }

        let tenants = self.store.list_tenants().await?;
        let mut summary = SyncSummary::default();
        let mut attempted = 0_usize;
        let mut synced = 0_usize;

        for tenant in tenants
            .iter()
            .filter(|tenant| tenant.remote_project_id.is_some())
        {
            let Some(set) = self.store.get_env_set_by_tenant(&tenant.id).await? else {
                continue;
            };
            attempted += 1;

            match self
                .reconcile_env_set(tenant, &set, LockKind::Update)
                .await
            {
                Ok(tenant_summary) => {
                    synced += 1;
                    summary.absorb(tenant_summary);
                }
                Err(error) => {
                    warn!(tenant_id = %tenant.id, error = %error, "env reconciliation failed");
                    summary.errors += 1;
                }
            }
        }

        Ok(SyncOutcome::completed(
            format!("environment variables reconciled for {synced} of {attempted} tenants"),
            summary,
        ))
    }

    /// Runs plan + apply for a set under the operation lock for `kind`.
    pub(crate) async fn reconcile_env_set(
        &self,
        tenant: &TenantRecord,
        set: &EnvVarSetRecord,
        kind: LockKind,
    ) -> Result<SyncSummary, EngineError> {
        validate_unique_keys(&set.entries)?;

        let Some(project_id) = tenant.remote_project_id.as_deref() else {
            return Ok(SyncSummary {
                skipped: set.entries.len(),
                ..SyncSummary::default()
            });
        };

        if !self.guard.try_acquire(&set.id, kind).await {
            debug!(set_id = %set.id, ?kind, "env reconciliation already in flight");
            return Ok(SyncSummary {
                skipped: 1,
                ..SyncSummary::default()
            });
        }

        let result = self.apply_env_reconciliation(tenant, set, project_id).await;
        self.guard.release(&set.id, kind).await;
        result
    }

    async fn apply_env_reconciliation(
        &self,
        tenant: &TenantRecord,
        set: &EnvVarSetRecord,
        project_id: &str,
    ) -> Result<SyncSummary, EngineError> {
        let plan = plan_env_changes(&set.applied_entries, &set.entries, tenant.url.as_deref());
        let mut summary = SyncSummary {
            skipped: plan.skipped,
            ..SyncSummary::default()
        };
        if plan.is_empty() {
            return Ok(summary);
        }

        let credentials = self
            .credentials
            .resolve(&self.platform, &self.settings.default_credentials, Some(tenant))
            .await?;
        let api = credentials.api();

        if !self.guard.try_acquire(&set.id, LockKind::FinalWrite).await {
            warn!(set_id = %set.id, "persistence write still pending; dropping this pass");
            summary.skipped += 1;
            return Ok(summary);
        }

        let mut entries = set.entries.clone();

        // Creates first: a rename must obtain its fresh identity before the
        // delete diff tears the old one down.
        for create in &plan.creates {
            match self
                .platform
                .create_env_var(&api, project_id, &write_request(create))
                .await
            {
                Ok(remote) => {
                    set_entry(&mut entries, &create.key, |entry| {
                        entry.value = create.value.clone();
                        entry.remote = RemoteIdentity::Synced(remote.id.clone());
                    });
                    summary.created += 1;
                }
                Err(error) => {
                    self.note_remote_error(&tenant.id, &error).await;
                    warn!(
                        tenant_id = %tenant.id,
                        key = %create.key,
                        error = %error,
                        "env var creation failed"
                    );
                    set_entry(&mut entries, &create.key, |entry| {
                        entry.remote = RemoteIdentity::Failed(SyncFailure::Creation);
                    });
                    summary.errors += 1;
                }
            }
        }

        // The update batch aborts on the first failure; the failing entry
        // and everything not yet applied is marked failed, not retried.
        let total_updates = plan.updates.len();
        let mut aborted = false;
        for (index, update) in plan.updates.iter().enumerate() {
            if aborted {
                set_entry(&mut entries, &update.key, |entry| {
                    entry.remote = RemoteIdentity::Failed(SyncFailure::Update);
                });
                continue;
            }

            let Some(env_id) = update.remote.synced_id().map(ToString::to_string) else {
                continue;
            };

            match self
                .platform
                .update_env_var(&api, project_id, &env_id, &write_request(update))
                .await
            {
                Ok(_) => summary.updated += 1,
                Err(error) => {
                    self.note_remote_error(&tenant.id, &error).await;
                    let partial = EngineError::RemotePartialFailure {
                        operation: "env update",
                        applied: index,
                        total: total_updates,
                        detail: error.to_string(),
                    };
                    warn!(
                        tenant_id = %tenant.id,
                        key = %update.key,
                        error = %partial,
                        "env var update batch aborted"
                    );
                    set_entry(&mut entries, &update.key, |entry| {
                        entry.remote = RemoteIdentity::Failed(SyncFailure::Update);
                    });
                    aborted = true;
                    summary.errors += 1;
                }
            }
        }

        // Deletes are best-effort and independent; a vanished remote entry
        // already satisfies the goal.
        for retired in &plan.deletes {
            match self
                .platform
                .delete_env_var(&api, project_id, &retired.remote_id)
                .await
            {
                Ok(()) | Err(EngineError::RemoteNotFound { .. }) => summary.deleted += 1,
                Err(error) => {
                    warn!(
                        tenant_id = %tenant.id,
                        key = %retired.key,
                        error = %error,
                        "env var deletion failed"
                    );
                    summary.errors += 1;
                }
            }
        }

        let persisted = self.store.persist_reconciled_entries(&set.id, &entries).await;
        self.guard.release(&set.id, LockKind::FinalWrite).await;
        persisted?;

        if set.auto_deploy
            && summary.changed()
            && tenant.is_eligible()
            && tenant.has_git_repository()
        {
            if let Err(error) = self
                .trigger_deployment(tenant, TriggerOrigin::Auto, None)
                .await
            {
                warn!(
                    tenant_id = %tenant.id,
                    error = %error,
                    "auto deploy after env change failed"
                );
                summary.errors += 1;
            }
        }

        Ok(summary)
    }

    async fn loaded_env_set(&self, set_id: &str) -> Result<EnvVarSetRecord, EngineError> {
        self.store
            .get_env_set_by_id(set_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("env var set {set_id} disappeared")))
    }
}
