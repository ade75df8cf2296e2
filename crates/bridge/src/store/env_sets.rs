use crate::error::EngineError;

use super::types::{EnvVarEntry, EnvVarSetRecord, EnvVarSetRow, NewEnvVarSet, WriteOrigin};
use super::StoreClient;

const SET_COLUMNS: &str =
    "id, tenant_id, auto_deploy, entries, applied_entries, created_at, updated_at";

impl StoreClient {
    /// Inserts a new environment variable set. Each tenant may own at most
    /// one set; a second insert fails with a validation error.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] if the tenant already has a set,
    /// or a store error if the insert fails.
    pub async fn insert_env_set(&self, set: &NewEnvVarSet) -> Result<(), EngineError> {
        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM env_var_sets WHERE tenant_id = ?1",
        )
        .bind(&set.tenant_id)
        .fetch_one(self.pool())
        .await?;

        if existing > 0 {
            return Err(EngineError::Validation(format!(
                "tenant {} already has an environment variable set",
                set.tenant_id
            )));
        }

        let entries = serde_json::to_string(&set.entries)?;
        sqlx::query(
            "INSERT INTO env_var_sets (id, tenant_id, auto_deploy, entries) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&set.id)
        .bind(&set.tenant_id)
        .bind(i64::from(set.auto_deploy))
        .bind(entries)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails or a JSON column is malformed.
    pub async fn get_env_set_by_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Option<EnvVarSetRecord>, EngineError> {
        let row = sqlx::query_as::<_, EnvVarSetRow>(&format!(
            "SELECT {SET_COLUMNS} FROM env_var_sets WHERE tenant_id = ?1"
        ))
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(EnvVarSetRecord::try_from).transpose()
    }

    /// # Errors
    /// Returns an error if the query fails or a JSON column is malformed.
    pub async fn get_env_set_by_id(
        &self,
        set_id: &str,
    ) -> Result<Option<EnvVarSetRecord>, EngineError> {
        let row = sqlx::query_as::<_, EnvVarSetRow>(&format!(
            "SELECT {SET_COLUMNS} FROM env_var_sets WHERE id = ?1"
        ))
        .bind(set_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(EnvVarSetRecord::try_from).transpose()
    }

    /// Overwrites the set's current entries. The applied snapshot is left
    /// alone so the next reconciliation still diffs against the last
    /// successfully applied state.
    ///
    /// # Errors
    /// Returns an error if encoding or the update fails.
    pub async fn update_env_entries(
        &self,
        set_id: &str,
        entries: &[EnvVarEntry],
        origin: WriteOrigin,
    ) -> Result<(), EngineError> {
        let encoded = serde_json::to_string(entries)?;
        let synced_at = match origin {
            WriteOrigin::Sync => Some(super::now_epoch()),
            WriteOrigin::User => None,
        };

        sqlx::query(
            "UPDATE env_var_sets SET entries = ?2, updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(set_id)
        .bind(&encoded)
        .execute(self.pool())
        .await?;

        if let Some(at) = synced_at {
            sqlx::query("UPDATE tenants SET last_synced_at = ?2 WHERE id = \
                         (SELECT tenant_id FROM env_var_sets WHERE id = ?1)")
                .bind(set_id)
                .bind(at)
                .execute(self.pool())
                .await?;
        }

        Ok(())
    }

    /// Persists the outcome of a reconciliation: the entries (with fresh
    /// remote identities and synthesized values) and the applied snapshot,
    /// in a single write. Always a sync write.
    ///
    /// # Errors
    /// Returns an error if encoding or the update fails.
    pub async fn persist_reconciled_entries(
        &self,
        set_id: &str,
        entries: &[EnvVarEntry],
    ) -> Result<(), EngineError> {
        let encoded = serde_json::to_string(entries)?;

        sqlx::query(
            "UPDATE env_var_sets SET entries = ?2, applied_entries = ?2, \
             updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(set_id)
        .bind(&encoded)
        .execute(self.pool())
        .await?;

        sqlx::query(
            "UPDATE tenants SET last_synced_at = ?2 WHERE id = \
             (SELECT tenant_id FROM env_var_sets WHERE id = ?1)",
        )
        .bind(set_id)
        .bind(super::now_epoch())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Deletes every set owned by the tenant, returning the number removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_env_sets_for_tenant(&self, tenant_id: &str) -> Result<u64, EngineError> {
        let result = sqlx::query("DELETE FROM env_var_sets WHERE tenant_id = ?1")
            .bind(tenant_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }
}
