//! Tenant-project lifecycle: approval with compensating rollback, the
//! deletion guard and cascade, and field-level sync-back to the platform.

use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::platform::types::{
    CreateProjectRequest, GitRepositoryDescriptor, UpdateProjectRequest,
};
use crate::platform::ApiCredentials;
use crate::store::types::{
    NewTenant, RemoteProjectFields, TenantFieldPatch, TenantRecord, TenantStatus, WriteOrigin,
};

use super::guard::LockKind;
use super::{ReconcileEngine, SyncOutcome, SyncSummary};

/// Git repository descriptor supplied at tenant creation.
#[derive(Debug, Clone, Deserialize)]
pub struct GitRepoSpec {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Drafts can always be deleted; approved tenants only once deactivated.
pub(crate) const fn deletion_allowed(status: TenantStatus, is_active: bool) -> bool {
    matches!(status, TenantStatus::Draft) || !is_active
}

/// An edit landing this close to a sync write is treated as an echo of the
/// sync itself and is not pushed back out.
fn within_suppression_window(last_synced_at: i64, window_seconds: i64) -> bool {
    last_synced_at > 0 && chrono::Utc::now().timestamp() - last_synced_at <= window_seconds
}

/// The remote-relevant subset of tenant fields, as an outbound update.
fn remote_update_request(tenant: &TenantRecord) -> UpdateProjectRequest {
    UpdateProjectRequest {
        framework: tenant.framework.clone(),
        install_command: tenant.install_command.clone(),
        build_command: tenant.build_command.clone(),
        output_directory: tenant.output_directory.clone(),
        root_directory: tenant.root_directory.clone(),
        public_source: Some(tenant.public_source),
        git_branch: tenant.repo_branch.clone(),
    }
}

impl ReconcileEngine {
    /// Creates a draft tenant. No remote interaction happens until the
    /// tenant is approved.
    ///
    /// # Errors
    /// Returns a validation error for an empty name, or store errors.
    pub async fn create_tenant(
        &self,
        name: &str,
        git_repo: Option<GitRepoSpec>,
    ) -> Result<TenantRecord, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("tenant name is required".to_string()));
        }

        let tenant = NewTenant {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            repo_owner: git_repo.as_ref().map(|repo| repo.owner.clone()),
            repo_name: git_repo.as_ref().map(|repo| repo.name.clone()),
            repo_branch: git_repo.and_then(|repo| repo.branch),
        };
        self.store.insert_tenant(&tenant).await?;

        self.require_tenant(&tenant.id).await
    }

    /// Approves a tenant: creates (or idempotently updates) its remote
    /// project, runs the mandatory detail sync, and persists the approved
    /// state. On any failure before the local write, nothing is persisted
    /// and a just-created remote project is deleted again.
    ///
    /// # Errors
    /// Returns credential and remote errors as-is; remote creation failure
    /// leaves the tenant a draft.
    pub async fn approve_tenant(&self, tenant_id: &str) -> Result<TenantRecord, EngineError> {
        let tenant = self.require_tenant(tenant_id).await?;

        match self.ensure_remote_project(&tenant, true).await? {
            Some((tenant, _)) => Ok(tenant),
            None => Err(EngineError::Validation(format!(
                "tenant {tenant_id}: project reconciliation already in progress"
            ))),
        }
    }

    /// Brings the tenant's remote project in line with the record: creates
    /// it when missing, and always finishes with a detail sync. The
    /// idempotent outbound update only runs on an approval/update trigger
    /// (`push_update`); a scheduled pass pulls detail without pushing.
    /// Returns `None` when the operation lock for the record is held.
    pub(crate) async fn ensure_remote_project(
        &self,
        tenant: &TenantRecord,
        push_update: bool,
    ) -> Result<Option<(TenantRecord, SyncSummary)>, EngineError> {
        let kind = if tenant.remote_project_id.is_some() {
            LockKind::Update
        } else {
            LockKind::Create
        };
        if !self.guard.try_acquire(&tenant.id, kind).await {
            debug!(tenant_id = %tenant.id, ?kind, "project operation already in flight");
            return Ok(None);
        }

        let result = self.reconcile_remote_project(tenant, push_update).await;
        self.guard.release(&tenant.id, kind).await;
        result.map(Some)
    }

    async fn reconcile_remote_project(
        &self,
        tenant: &TenantRecord,
        push_update: bool,
    ) -> Result<(TenantRecord, SyncSummary), EngineError> {
        let credentials = self
            .credentials
            .resolve(&self.platform, &self.settings.default_credentials, Some(tenant))
            .await?;
        let api = credentials.api();
        let mut summary = SyncSummary::default();

        if let Some(project_id) = tenant.remote_project_id.as_deref() {
            let others = self
                .store
                .count_other_tenants_with_remote_project(&tenant.id, project_id)
                .await?;
            if others > 0 {
                return Err(EngineError::Validation(format!(
                    "remote project {project_id} is already referenced by another tenant"
                )));
            }

            if push_update {
                // Idempotent update; a failure here is recoverable on the
                // next pass and must not abort the reconciliation.
                if let Err(error) = self
                    .platform
                    .update_project(&api, project_id, &remote_update_request(tenant))
                    .await
                {
                    self.note_remote_error(&tenant.id, &error).await;
                    warn!(
                        tenant_id = %tenant.id,
                        error = %error,
                        "remote project update failed; local state stands"
                    );
                    summary.errors += 1;
                }
            }

            let fields = self.fetch_project_detail(&api, project_id, &tenant.name).await?;
            if push_update {
                self.store
                    .approve_tenant_with_project(&tenant.id, &fields)
                    .await?;
                summary.updated += 1;
            } else {
                self.store
                    .refresh_tenant_remote_detail(&tenant.id, &fields)
                    .await?;
            }
        } else {
            let request = CreateProjectRequest {
                name: tenant
                    .project_name
                    .clone()
                    .unwrap_or_else(|| tenant.name.clone()),
                framework: tenant.framework.clone(),
                git_repository: git_descriptor(tenant),
            };

            let created = match self.platform.create_project(&api, &request).await {
                Ok(created) => created,
                Err(error) => {
                    self.note_remote_error(&tenant.id, &error).await;
                    return Err(error);
                }
            };
            info!(tenant_id = %tenant.id, project_id = %created.id, "remote project created");

            // Creation responses are partial; the detail sync is mandatory.
            // Failing it rolls the remote project back so neither side
            // keeps an orphan.
            let fields = match self
                .fetch_project_detail(&api, &created.id, &tenant.name)
                .await
            {
                Ok(fields) => fields,
                Err(error) => {
                    warn!(
                        tenant_id = %tenant.id,
                        project_id = %created.id,
                        error = %error,
                        "post-creation detail sync failed; rolling back remote project"
                    );
                    if let Err(rollback_error) =
                        self.platform.delete_project(&api, &created.id).await
                    {
                        warn!(
                            project_id = %created.id,
                            error = %rollback_error,
                            "rollback deletion of remote project failed"
                        );
                    }
                    return Err(error);
                }
            };

            self.store
                .approve_tenant_with_project(&tenant.id, &fields)
                .await?;
            summary.created += 1;
        }

        let refreshed = self.require_tenant(&tenant.id).await?;
        Ok((refreshed, summary))
    }

    /// Full project representation plus domains; project creation and list
    /// responses do not carry everything the tenant record mirrors.
    async fn fetch_project_detail(
        &self,
        api: &ApiCredentials,
        project_id: &str,
        fallback_name: &str,
    ) -> Result<RemoteProjectFields, EngineError> {
        let project = self.platform.get_project(api, project_id).await?;
        let domains = self.platform.list_project_domains(api, project_id).await?;

        let snapshot = serde_json::to_string(&project)?;
        let url = project
            .url
            .clone()
            .or_else(|| domains.first().map(|domain| format!("https://{}", domain.name)));
        let project_name = if project.name.is_empty() {
            fallback_name.to_string()
        } else {
            project.name
        };

        Ok(RemoteProjectFields {
            remote_project_id: project.id,
            project_name,
            framework: project.framework,
            url,
            snapshot,
        })
    }

    /// Applies a user edit to the tenant and pushes the remote-relevant
    /// fields outward, unless the edit landed inside the suppression window
    /// of a sync write. Outbound failures are logged and swallowed; the
    /// local edit stands either way.
    ///
    /// # Errors
    /// Returns validation or store errors.
    pub async fn update_tenant(
        &self,
        tenant_id: &str,
        patch: TenantFieldPatch,
    ) -> Result<TenantRecord, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("empty tenant update".to_string()));
        }

        let before = self.require_tenant(tenant_id).await?;
        self.store
            .update_tenant_fields(tenant_id, &patch, WriteOrigin::User)
            .await?;
        let updated = self.require_tenant(tenant_id).await?;

        let Some(project_id) = updated.remote_project_id.clone() else {
            return Ok(updated);
        };
        if updated.status != TenantStatus::Approved {
            return Ok(updated);
        }

        let wants_sync_back = patch.touches_remote_fields();
        let wants_cron_toggle = patch.is_active.is_some_and(|active| active != before.is_active);
        if !wants_sync_back && !wants_cron_toggle {
            return Ok(updated);
        }

        if wants_sync_back
            && within_suppression_window(
                before.last_synced_at,
                self.settings.suppression_window_seconds,
            )
        {
            debug!(
                tenant_id,
                "outbound project update suppressed; edit landed inside the sync window"
            );
            return Ok(updated);
        }

        let api = match self
            .credentials
            .resolve(&self.platform, &self.settings.default_credentials, Some(&updated))
            .await
        {
            Ok(credentials) => credentials.api(),
            Err(error) => {
                warn!(tenant_id, error = %error, "sync-back skipped; no usable credential");
                return Ok(updated);
            }
        };

        if wants_sync_back {
            if let Err(error) = self
                .platform
                .update_project(&api, &project_id, &remote_update_request(&updated))
                .await
            {
                self.note_remote_error(tenant_id, &error).await;
                warn!(
                    tenant_id,
                    error = %error,
                    "outbound project update failed; the next full sync will converge"
                );
            }
        }

        if wants_cron_toggle {
            if let Err(error) = self
                .platform
                .toggle_crons(&api, &project_id, updated.is_active)
                .await
            {
                warn!(tenant_id, error = %error, "cron toggle failed");
            }
        }

        Ok(updated)
    }

    /// Deletes a tenant. Allowed for drafts, and for approved tenants only
    /// once deactivated. The remote project deletion is best-effort and
    /// never blocks the local deletion; dependent records are cascaded.
    ///
    /// # Errors
    /// Returns a validation error when the deletion guard rejects, or
    /// store errors from the cascade.
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<SyncOutcome, EngineError> {
        let tenant = self.require_tenant(tenant_id).await?;

        if !deletion_allowed(tenant.status, tenant.is_active) {
            return Err(EngineError::Validation(format!(
                "tenant {tenant_id} is approved and active; deactivate it before deleting"
            )));
        }

        let mut summary = SyncSummary::default();

        if let Some(project_id) = tenant.remote_project_id.as_deref() {
            match self
                .credentials
                .resolve(&self.platform, &self.settings.default_credentials, Some(&tenant))
                .await
            {
                Ok(credentials) => {
                    match self
                        .platform
                        .delete_project(&credentials.api(), project_id)
                        .await
                    {
                        Ok(()) | Err(EngineError::RemoteNotFound { .. }) => {
                            info!(tenant_id, project_id, "remote project deleted");
                        }
                        Err(error) => {
                            warn!(
                                tenant_id,
                                project_id,
                                error = %error,
                                "remote project deletion failed; continuing with local deletion"
                            );
                            summary.errors += 1;
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        tenant_id,
                        error = %error,
                        "no usable credential for remote deletion; continuing"
                    );
                    summary.errors += 1;
                }
            }
        }

        let env_removed = self.store.delete_env_sets_for_tenant(tenant_id).await?;
        let deployments_removed = self.store.delete_deployments_for_tenant(tenant_id).await?;
        self.store.delete_tenant(tenant_id).await?;

        summary.deleted += 1
            + usize::try_from(env_removed).unwrap_or(usize::MAX)
            + usize::try_from(deployments_removed).unwrap_or(usize::MAX);

        Ok(SyncOutcome::completed(
            format!("tenant {tenant_id} deleted"),
            summary,
        ))
    }
}

fn git_descriptor(tenant: &TenantRecord) -> Option<GitRepositoryDescriptor> {
    match (tenant.repo_owner.as_deref(), tenant.repo_name.as_deref()) {
        (Some(owner), Some(name)) if !owner.is_empty() && !name.is_empty() => {
            Some(GitRepositoryDescriptor {
                kind: "github".to_string(),
                repo: format!("{owner}/{name}"),
                branch: tenant.repo_branch.clone(),
            })
        }
        _ => None,
    }
}
