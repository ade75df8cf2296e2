use crate::error::EngineError;

use super::types::{DeployStatus, DeploymentRecord, DeploymentRow, NewDeployment};
use super::StoreClient;

const DEPLOYMENT_COLUMNS: &str = "id, tenant_id, remote_deployment_id, status, trigger_origin, \
     url, remote_created_at, event_log, created_at";

impl StoreClient {
    /// # Errors
    /// Returns an error if encoding or the insert fails.
    pub async fn insert_deployment(&self, deployment: &NewDeployment) -> Result<(), EngineError> {
        let events = serde_json::to_string(&deployment.events)?;

        sqlx::query(
            "INSERT INTO deployments (id, tenant_id, remote_deployment_id, status, \
             trigger_origin, url, remote_created_at, event_log) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&deployment.id)
        .bind(&deployment.tenant_id)
        .bind(deployment.remote_deployment_id.as_deref())
        .bind(deployment.status.as_str())
        .bind(deployment.trigger_origin.as_str())
        .bind(deployment.url.as_deref())
        .bind(deployment.remote_created_at)
        .bind(events)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_deployment_by_remote_id(
        &self,
        tenant_id: &str,
        remote_deployment_id: &str,
    ) -> Result<Option<DeploymentRecord>, EngineError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE tenant_id = ?1 AND remote_deployment_id = ?2"
        ))
        .bind(tenant_id)
        .bind(remote_deployment_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(DeploymentRecord::try_from).transpose()
    }

    /// Lists a tenant's deployments, newest remote activity first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_deployments_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<DeploymentRecord>, EngineError> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE tenant_id = ?1 \
             ORDER BY remote_created_at DESC, created_at DESC"
        ))
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(DeploymentRecord::try_from).collect()
    }

    /// The newest sync-origin record for the tenant, if any. This is the
    /// candidate for the tenant's latest-deployment pointer.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn latest_sync_deployment(
        &self,
        tenant_id: &str,
    ) -> Result<Option<DeploymentRecord>, EngineError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE tenant_id = ?1 AND trigger_origin = 'sync' \
             ORDER BY remote_created_at DESC, created_at DESC LIMIT 1"
        ))
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(DeploymentRecord::try_from).transpose()
    }

    /// Deployments still in flight (queued or building) for a tenant.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_inflight_deployments(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<DeploymentRecord>, EngineError> {
        let rows = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE tenant_id = ?1 AND status IN ('queued', 'building') \
             ORDER BY created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(DeploymentRecord::try_from).collect()
    }

    /// Bulk-deletes the tenant's sync-origin records, returning the count.
    /// Each full resync wholesale replaces the sync-owned subset.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_sync_deployments_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<u64, EngineError> {
        let result = sqlx::query(
            "DELETE FROM deployments WHERE tenant_id = ?1 AND trigger_origin = 'sync'",
        )
        .bind(tenant_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Patches a record with fresh remote state and appends an event line.
    ///
    /// # Errors
    /// Returns an error if the record is missing or the update fails.
    pub async fn update_deployment_remote_state(
        &self,
        deployment_id: &str,
        status: DeployStatus,
        url: Option<&str>,
        remote_created_at: i64,
        event: &str,
    ) -> Result<(), EngineError> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = ?1"
        ))
        .bind(deployment_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Err(EngineError::Validation(format!(
                "deployment {deployment_id} not found"
            )));
        };

        let mut record = DeploymentRecord::try_from(row)?;
        record.events.push(event.to_string());
        let events = serde_json::to_string(&record.events)?;

        sqlx::query(
            "UPDATE deployments SET status = ?2, url = COALESCE(?3, url), \
             remote_created_at = CASE WHEN ?4 > 0 THEN ?4 ELSE remote_created_at END, \
             event_log = ?5 WHERE id = ?1",
        )
        .bind(deployment_id)
        .bind(status.as_str())
        .bind(url)
        .bind(remote_created_at)
        .bind(events)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Stores the remote identity the platform assigned to a local record.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn connect_deployment_remote_id(
        &self,
        deployment_id: &str,
        remote_deployment_id: &str,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE deployments SET remote_deployment_id = ?2 WHERE id = ?1")
            .bind(deployment_id)
            .bind(remote_deployment_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_deployment(&self, deployment_id: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM deployments WHERE id = ?1")
            .bind(deployment_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Deletes every deployment owned by the tenant, returning the count.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_deployments_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<u64, EngineError> {
        let result = sqlx::query("DELETE FROM deployments WHERE tenant_id = ?1")
            .bind(tenant_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_deployments_for_tenant(&self, tenant_id: &str) -> Result<i64, EngineError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM deployments WHERE tenant_id = ?1")
                .bind(tenant_id)
                .fetch_one(self.pool())
                .await?;

        Ok(count)
    }
}
