use crate::error::EngineError;

use super::types::{
    DeployStatus, NewTenant, RemoteProjectFields, TenantFieldPatch, TenantRecord, TenantRow,
    WriteOrigin,
};
use super::{now_epoch, StoreClient};

const TENANT_COLUMNS: &str = "id, name, status, is_active, remote_project_id, project_name, \
     framework, url, repo_owner, repo_name, repo_branch, install_command, build_command, \
     output_directory, root_directory, public_source, override_token, override_team_id, \
     latest_deployment_id, latest_deployment_status, last_synced_at, last_sync_status, \
     last_sync_message, remote_snapshot, created_at, updated_at";

impl StoreClient {
    /// Inserts a new draft tenant.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn insert_tenant(&self, tenant: &NewTenant) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO tenants (id, name, repo_owner, repo_name, repo_branch) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(tenant.repo_owner.as_deref())
        .bind(tenant.repo_name.as_deref())
        .bind(tenant.repo_branch.as_deref())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_tenant_by_id(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantRecord>, EngineError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"
        ))
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(TenantRecord::from))
    }

    /// Lists tenants in creation order.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_tenants(&self) -> Result<Vec<TenantRecord>, EngineError> {
        let rows = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants ORDER BY created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(TenantRecord::from).collect())
    }

    /// Lists tenants eligible for remote reconciliation: approved, active,
    /// and backed by a remote project.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_eligible_tenants(&self) -> Result<Vec<TenantRecord>, EngineError> {
        let rows = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants \
             WHERE status = 'approved' AND is_active = 1 AND remote_project_id IS NOT NULL \
             ORDER BY created_at ASC"
        ))
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(TenantRecord::from).collect())
    }

    /// Counts tenants other than `tenant_id` referencing `remote_project_id`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_other_tenants_with_remote_project(
        &self,
        tenant_id: &str,
        remote_project_id: &str,
    ) -> Result<i64, EngineError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tenants WHERE remote_project_id = ?1 AND id != ?2",
        )
        .bind(remote_project_id)
        .bind(tenant_id)
        .fetch_one(self.pool())
        .await?;

        Ok(count)
    }

    /// Marks a tenant approved and populates its remote project identity in
    /// one write. Always stamped as a sync write: the field values came from
    /// the platform, not from a user edit.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn approve_tenant_with_project(
        &self,
        tenant_id: &str,
        fields: &RemoteProjectFields,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE tenants SET status = 'approved', remote_project_id = ?2, project_name = ?3, \
             framework = COALESCE(?4, framework), url = ?5, remote_snapshot = ?6, \
             last_synced_at = ?7, updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(tenant_id)
        .bind(&fields.remote_project_id)
        .bind(&fields.project_name)
        .bind(fields.framework.as_deref())
        .bind(fields.url.as_deref())
        .bind(&fields.snapshot)
        .bind(now_epoch())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Refreshes the remote-sourced detail fields (url, snapshot, framework)
    /// after a detail sync.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn refresh_tenant_remote_detail(
        &self,
        tenant_id: &str,
        fields: &RemoteProjectFields,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE tenants SET project_name = ?2, framework = COALESCE(?3, framework), \
             url = COALESCE(?4, url), remote_snapshot = ?5, last_synced_at = ?6, \
             updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(tenant_id)
        .bind(&fields.project_name)
        .bind(fields.framework.as_deref())
        .bind(fields.url.as_deref())
        .bind(&fields.snapshot)
        .bind(now_epoch())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Applies a partial field update. Sync-origin writes stamp
    /// `last_synced_at` so downstream triggers can suppress themselves.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn update_tenant_fields(
        &self,
        tenant_id: &str,
        patch: &TenantFieldPatch,
        origin: WriteOrigin,
    ) -> Result<(), EngineError> {
        let synced_at = match origin {
            WriteOrigin::Sync => Some(now_epoch()),
            WriteOrigin::User => None,
        };

        sqlx::query(
            "UPDATE tenants SET \
             name = COALESCE(?2, name), \
             is_active = COALESCE(?3, is_active), \
             framework = COALESCE(?4, framework), \
             repo_branch = COALESCE(?5, repo_branch), \
             install_command = COALESCE(?6, install_command), \
             build_command = COALESCE(?7, build_command), \
             output_directory = COALESCE(?8, output_directory), \
             root_directory = COALESCE(?9, root_directory), \
             public_source = COALESCE(?10, public_source), \
             override_token = COALESCE(?11, override_token), \
             override_team_id = COALESCE(?12, override_team_id), \
             last_synced_at = COALESCE(?13, last_synced_at), \
             updated_at = datetime('now') \
             WHERE id = ?1",
        )
        .bind(tenant_id)
        .bind(patch.name.as_deref())
        .bind(patch.is_active.map(i64::from))
        .bind(patch.framework.as_deref())
        .bind(patch.repo_branch.as_deref())
        .bind(patch.install_command.as_deref())
        .bind(patch.build_command.as_deref())
        .bind(patch.output_directory.as_deref())
        .bind(patch.root_directory.as_deref())
        .bind(patch.public_source.map(i64::from))
        .bind(patch.override_token.as_deref())
        .bind(patch.override_team_id.as_deref())
        .bind(synced_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Writes the tenant's latest-deployment pointer. Always a sync write.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn set_latest_deployment(
        &self,
        tenant_id: &str,
        deployment_id: &str,
        status: DeployStatus,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE tenants SET latest_deployment_id = ?2, latest_deployment_status = ?3, \
             last_synced_at = ?4, updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(tenant_id)
        .bind(deployment_id)
        .bind(status.as_str())
        .bind(now_epoch())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Records the outcome of a reconciliation pass on the tenant.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn record_sync_result(
        &self,
        tenant_id: &str,
        status: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE tenants SET last_sync_status = ?2, last_sync_message = ?3, \
             last_synced_at = ?4, updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(tenant_id)
        .bind(status)
        .bind(message)
        .bind(now_epoch())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Deletes the tenant row. Cascading deletes of dependent records are
    /// the caller's responsibility so they can be reported.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM tenants WHERE id = ?1")
            .bind(tenant_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }
}
