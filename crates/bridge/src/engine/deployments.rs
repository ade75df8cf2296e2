//! Deployment history sync, latest-pointer maintenance, and deployment
//! creation/cancellation against the platform.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::platform::types::CreateDeploymentRequest;
use crate::store::types::{
    DeployStatus, DeploymentRecord, NewDeployment, TenantRecord, TriggerOrigin,
};

use super::{ReconcileEngine, SyncOutcome, SyncSummary};

/// Normalizes the platform's status vocabulary to the local one. Unknown
/// values degrade to `error` rather than inventing a healthy state.
pub(crate) fn map_remote_status(state: &str) -> DeployStatus {
    match state {
        "QUEUED" => DeployStatus::Queued,
        "BUILDING" | "INITIALIZING" | "DEPLOYING" => DeployStatus::Building,
        "READY" => DeployStatus::Ready,
        "CANCELED" => DeployStatus::Canceled,
        _ => DeployStatus::Error,
    }
}

/// Optional knobs for an explicitly created deployment.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct DeploymentOverrides {
    pub target: Option<String>,
    pub git_branch: Option<String>,
}

impl ReconcileEngine {
    /// Syncs deployment history for one tenant, or for every eligible
    /// tenant.
    ///
    /// # Errors
    /// For a single tenant: validation, credential, or store errors. The
    /// all-tenants sweep absorbs per-tenant failures into the summary.
    pub async fn sync_deployments(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<SyncOutcome, EngineError> {
        if let Some(tenant_id) = tenant_id {
            let tenant = self.require_tenant(tenant_id).await?;
            if !tenant.is_eligible() {
                return Ok(SyncOutcome::skipped(format!(
                    "tenant {tenant_id} is not eligible for deployment sync"
                )));
            }

            let summary = self.sync_tenant_deployments(&tenant).await?;
            return Ok(SyncOutcome::completed("deployments synced", summary));
        }

        let tenants = self.store.list_eligible_tenants().await?;
        let total = tenants.len();
        let mut summary = SyncSummary::default();
        let mut synced = 0_usize;

        for tenant in &tenants {
            match self.sync_tenant_deployments(tenant).await {
                Ok(tenant_summary) => {
                    synced += 1;
                    summary.absorb(tenant_summary);
                }
                Err(error) => {
                    warn!(tenant_id = %tenant.id, error = %error, "deployment sync failed");
                    summary.errors += 1;
                }
            }
        }

        Ok(SyncOutcome::completed(
            format!("deployments synced for {synced} of {total} eligible tenants"),
            summary,
        ))
    }

    /// One tenant's resync: wholesale-replace the sync-owned records, patch
    /// matching records of any origin, then refresh the latest pointer.
    pub(crate) async fn sync_tenant_deployments(
        &self,
        tenant: &TenantRecord,
    ) -> Result<SyncSummary, EngineError> {
        let project_id = tenant.remote_project_id.as_deref().ok_or_else(|| {
            EngineError::Validation(format!("tenant {} has no remote project", tenant.id))
        })?;

        let credentials = self
            .credentials
            .resolve(&self.platform, &self.settings.default_credentials, Some(tenant))
            .await?;
        let api = credentials.api();

        let mut summary = SyncSummary::default();

        let removed = self
            .store
            .delete_sync_deployments_for_tenant(&tenant.id)
            .await?;
        summary.deleted += usize::try_from(removed).unwrap_or(usize::MAX);

        let remote = match self
            .platform
            .list_deployments(&api, project_id, self.settings.deployment_fetch_limit)
            .await
        {
            Ok(remote) => remote,
            Err(error) => {
                self.note_remote_error(&tenant.id, &error).await;
                return Err(error);
            }
        };

        for deployment in &remote {
            let status = map_remote_status(&deployment.state);

            if let Some(existing) = self
                .store
                .get_deployment_by_remote_id(&tenant.id, &deployment.id)
                .await?
            {
                self.store
                    .update_deployment_remote_state(
                        &existing.id,
                        status,
                        deployment.url.as_deref(),
                        deployment.created_at,
                        "status refreshed from platform",
                    )
                    .await?;
                summary.updated += 1;
            } else {
                self.store
                    .insert_deployment(&NewDeployment {
                        id: Uuid::new_v4().to_string(),
                        tenant_id: tenant.id.clone(),
                        remote_deployment_id: Some(deployment.id.clone()),
                        status,
                        trigger_origin: TriggerOrigin::Sync,
                        url: deployment.url.clone(),
                        remote_created_at: deployment.created_at,
                        events: vec!["imported from platform".to_string()],
                    })
                    .await?;
                summary.created += 1;
            }
        }

        if let Some(latest) = self.store.latest_sync_deployment(&tenant.id).await? {
            self.store
                .set_latest_deployment(&tenant.id, &latest.id, latest.status)
                .await?;
        }

        Ok(summary)
    }

    /// Explicit deployment creation for a tenant.
    ///
    /// # Errors
    /// Returns validation errors when the tenant is not deployable, and the
    /// remote error when the platform rejects the trigger (the local record
    /// is kept and marked failed).
    pub async fn create_deployment(
        &self,
        tenant_id: &str,
        overrides: Option<DeploymentOverrides>,
    ) -> Result<DeploymentRecord, EngineError> {
        let tenant = self.require_tenant(tenant_id).await?;
        self.trigger_deployment(&tenant, TriggerOrigin::Manual, overrides)
            .await
    }

    /// Shared creation path: a queued local record first, then the remote
    /// trigger; the record is connected to its remote identity on success
    /// and marked failed on rejection.
    pub(crate) async fn trigger_deployment(
        &self,
        tenant: &TenantRecord,
        origin: TriggerOrigin,
        overrides: Option<DeploymentOverrides>,
    ) -> Result<DeploymentRecord, EngineError> {
        let project_id = tenant.remote_project_id.as_deref().ok_or_else(|| {
            EngineError::Validation(format!(
                "tenant {} has no remote project to deploy",
                tenant.id
            ))
        })?;
        if !tenant.has_git_repository() {
            return Err(EngineError::Validation(format!(
                "tenant {} is missing its git repository fields",
                tenant.id
            )));
        }

        let overrides = overrides.unwrap_or_default();
        let record_id = Uuid::new_v4().to_string();
        self.store
            .insert_deployment(&NewDeployment {
                id: record_id.clone(),
                tenant_id: tenant.id.clone(),
                remote_deployment_id: None,
                status: DeployStatus::Queued,
                trigger_origin: origin,
                url: None,
                remote_created_at: 0,
                events: vec![format!("queued ({})", origin.as_str())],
            })
            .await?;

        let credentials = self
            .credentials
            .resolve(&self.platform, &self.settings.default_credentials, Some(tenant))
            .await?;

        let request = CreateDeploymentRequest {
            name: tenant
                .project_name
                .clone()
                .unwrap_or_else(|| tenant.name.clone()),
            project_id: project_id.to_string(),
            target: overrides.target.unwrap_or_else(|| "production".to_string()),
            git_branch: overrides.git_branch.or_else(|| tenant.repo_branch.clone()),
        };

        match self
            .platform
            .create_deployment(&credentials.api(), &request)
            .await
        {
            Ok(remote) => {
                self.store
                    .connect_deployment_remote_id(&record_id, &remote.id)
                    .await?;
                self.store
                    .update_deployment_remote_state(
                        &record_id,
                        map_remote_status(&remote.state),
                        remote.url.as_deref(),
                        remote.created_at,
                        "deployment created on platform",
                    )
                    .await?;
                info!(tenant_id = %tenant.id, deployment_id = %remote.id, "deployment triggered");

                self.store
                    .get_deployment_by_remote_id(&tenant.id, &remote.id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Validation(format!(
                            "deployment record {record_id} disappeared"
                        ))
                    })
            }
            Err(error) => {
                self.note_remote_error(&tenant.id, &error).await;
                self.store
                    .update_deployment_remote_state(
                        &record_id,
                        DeployStatus::Error,
                        None,
                        0,
                        &format!("remote trigger failed: {error}"),
                    )
                    .await?;
                Err(error)
            }
        }
    }

    /// Cancels a tenant's in-flight deployments. Remote cancellations are
    /// best-effort; local records are patched to `canceled`, and queued
    /// records that never reached the platform are deleted outright.
    ///
    /// # Errors
    /// Returns validation, credential, or store errors.
    pub async fn cancel_deployments(&self, tenant_id: &str) -> Result<SyncOutcome, EngineError> {
        let tenant = self.require_tenant(tenant_id).await?;
        let inflight = self.store.list_inflight_deployments(tenant_id).await?;

        if inflight.is_empty() {
            return Ok(SyncOutcome::skipped(format!(
                "tenant {tenant_id} has no in-flight deployments"
            )));
        }

        let mut summary = SyncSummary::default();

        let api = if inflight
            .iter()
            .any(|record| record.remote_deployment_id.is_some())
        {
            Some(
                self.credentials
                    .resolve(&self.platform, &self.settings.default_credentials, Some(&tenant))
                    .await?
                    .api(),
            )
        } else {
            None
        };

        for record in &inflight {
            match record.remote_deployment_id.as_deref() {
                Some(remote_id) => {
                    let Some(api) = api.as_ref() else {
                        continue;
                    };

                    match self.platform.cancel_deployment(api, remote_id).await {
                        Ok(()) | Err(EngineError::RemoteNotFound { .. }) => {
                            self.store
                                .update_deployment_remote_state(
                                    &record.id,
                                    DeployStatus::Canceled,
                                    None,
                                    0,
                                    "cancellation requested",
                                )
                                .await?;
                            summary.updated += 1;
                        }
                        Err(error) => {
                            self.note_remote_error(&tenant.id, &error).await;
                            warn!(
                                tenant_id = %tenant.id,
                                deployment_id = %remote_id,
                                error = %error,
                                "remote cancellation failed"
                            );
                            summary.errors += 1;
                        }
                    }
                }
                None if record.status == DeployStatus::Queued => {
                    // Never reached the platform: pure local cleanup.
                    self.store.delete_deployment(&record.id).await?;
                    summary.deleted += 1;
                }
                None => {
                    self.store
                        .update_deployment_remote_state(
                            &record.id,
                            DeployStatus::Canceled,
                            None,
                            0,
                            "canceled locally",
                        )
                        .await?;
                    summary.updated += 1;
                }
            }
        }

        Ok(SyncOutcome::completed(
            format!(
                "canceled {} deployments for tenant {tenant_id}",
                summary.updated + summary.deleted
            ),
            summary,
        ))
    }
}
