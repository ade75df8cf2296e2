use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Marks who caused a mutating store call. Writes originating from a
/// reconciliation pass stamp `last_synced_at` on the tenant so dependent
/// triggers can recognize and suppress their own effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    User,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Draft,
    Approved,
}

impl TenantStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value == "approved" {
            Self::Approved
        } else {
            Self::Draft
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Queued,
    Building,
    Ready,
    Error,
    Canceled,
}

impl DeployStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "queued" => Self::Queued,
            "building" => Self::Building,
            "ready" => Self::Ready,
            "canceled" => Self::Canceled,
            _ => Self::Error,
        }
    }

    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Building)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOrigin {
    Manual,
    Auto,
    Sync,
}

impl TriggerOrigin {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Sync => "sync",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "auto" => Self::Auto,
            "sync" => Self::Sync,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Plain,
    Encrypted,
    Secret,
    System,
}

impl VarType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Encrypted => "encrypted",
            Self::Secret => "secret",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvTarget {
    Production,
    Preview,
    Development,
}

impl EnvTarget {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Preview => "preview",
            Self::Development => "development",
        }
    }
}

/// Which remote apply step an entry failed in. Failed identities are
/// terminal: the entry is not retried until it is edited again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFailure {
    Creation,
    Update,
}

/// Remote identity of an environment variable entry.
///
/// The storage encoding keeps the historical sentinel strings as the wire
/// format; decoding also folds the legacy `"null"`/`"undefined"` values
/// into `Unsynced` so imported data cannot wedge an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteIdentity {
    Unsynced,
    Synced(String),
    Failed(SyncFailure),
}

const FAILED_CREATION: &str = "FAILED_CREATION";
const FAILED_UPDATE: &str = "FAILED_UPDATE";

impl From<String> for RemoteIdentity {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "null" | "undefined" => Self::Unsynced,
            FAILED_CREATION => Self::Failed(SyncFailure::Creation),
            FAILED_UPDATE => Self::Failed(SyncFailure::Update),
            _ => Self::Synced(value),
        }
    }
}

impl From<RemoteIdentity> for String {
    fn from(value: RemoteIdentity) -> Self {
        match value {
            RemoteIdentity::Unsynced => Self::new(),
            RemoteIdentity::Synced(id) => id,
            RemoteIdentity::Failed(SyncFailure::Creation) => FAILED_CREATION.to_string(),
            RemoteIdentity::Failed(SyncFailure::Update) => FAILED_UPDATE.to_string(),
        }
    }
}

impl Default for RemoteIdentity {
    fn default() -> Self {
        Self::Unsynced
    }
}

impl RemoteIdentity {
    #[must_use]
    pub fn synced_id(&self) -> Option<&str> {
        match self {
            Self::Synced(id) => Some(id.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// One environment variable as stored in the set's JSON columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarEntry {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    #[serde(default)]
    pub targets: Vec<EnvTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, rename = "remote_id")]
    pub remote: RemoteIdentity,
}

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub id: String,
    pub name: String,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
    pub repo_branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub id: String,
    pub name: String,
    pub status: TenantStatus,
    pub is_active: bool,
    pub remote_project_id: Option<String>,
    pub project_name: Option<String>,
    pub framework: Option<String>,
    pub url: Option<String>,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
    pub repo_branch: Option<String>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub output_directory: Option<String>,
    pub root_directory: Option<String>,
    pub public_source: bool,
    pub override_token: Option<String>,
    pub override_team_id: Option<String>,
    pub latest_deployment_id: Option<String>,
    pub latest_deployment_status: Option<DeployStatus>,
    pub last_synced_at: i64,
    pub last_sync_status: Option<String>,
    pub last_sync_message: Option<String>,
    pub remote_snapshot: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TenantRecord {
    /// A tenant is eligible for remote reconciliation once it is approved,
    /// active, and backed by a remote project.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.status == TenantStatus::Approved
            && self.is_active
            && self.remote_project_id.is_some()
    }

    #[must_use]
    pub fn has_git_repository(&self) -> bool {
        self.repo_owner.as_deref().is_some_and(|v| !v.is_empty())
            && self.repo_name.as_deref().is_some_and(|v| !v.is_empty())
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TenantRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub is_active: i64,
    pub remote_project_id: Option<String>,
    pub project_name: Option<String>,
    pub framework: Option<String>,
    pub url: Option<String>,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
    pub repo_branch: Option<String>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub output_directory: Option<String>,
    pub root_directory: Option<String>,
    pub public_source: i64,
    pub override_token: Option<String>,
    pub override_team_id: Option<String>,
    pub latest_deployment_id: Option<String>,
    pub latest_deployment_status: Option<String>,
    pub last_synced_at: i64,
    pub last_sync_status: Option<String>,
    pub last_sync_message: Option<String>,
    pub remote_snapshot: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<TenantRow> for TenantRecord {
    fn from(row: TenantRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            status: TenantStatus::parse(&row.status),
            is_active: row.is_active != 0,
            remote_project_id: row.remote_project_id,
            project_name: row.project_name,
            framework: row.framework,
            url: row.url,
            repo_owner: row.repo_owner,
            repo_name: row.repo_name,
            repo_branch: row.repo_branch,
            install_command: row.install_command,
            build_command: row.build_command,
            output_directory: row.output_directory,
            root_directory: row.root_directory,
            public_source: row.public_source != 0,
            override_token: row.override_token,
            override_team_id: row.override_team_id,
            latest_deployment_id: row.latest_deployment_id,
            latest_deployment_status: row
                .latest_deployment_status
                .as_deref()
                .map(DeployStatus::parse),
            last_synced_at: row.last_synced_at,
            last_sync_status: row.last_sync_status,
            last_sync_message: row.last_sync_message,
            remote_snapshot: row.remote_snapshot,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Partial update to a tenant's editable fields. `None` leaves a column
/// untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantFieldPatch {
    pub name: Option<String>,
    pub is_active: Option<bool>,
    pub framework: Option<String>,
    pub repo_branch: Option<String>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub output_directory: Option<String>,
    pub root_directory: Option<String>,
    pub public_source: Option<bool>,
    pub override_token: Option<String>,
    pub override_team_id: Option<String>,
}

impl TenantFieldPatch {
    /// Whether the patch touches a field that is mirrored on the remote
    /// project and therefore triggers an outbound update.
    #[must_use]
    pub const fn touches_remote_fields(&self) -> bool {
        self.framework.is_some()
            || self.repo_branch.is_some()
            || self.install_command.is_some()
            || self.build_command.is_some()
            || self.output_directory.is_some()
            || self.root_directory.is_some()
            || self.public_source.is_some()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.is_active.is_none()
            && self.framework.is_none()
            && self.repo_branch.is_none()
            && self.install_command.is_none()
            && self.build_command.is_none()
            && self.output_directory.is_none()
            && self.root_directory.is_none()
            && self.public_source.is_none()
            && self.override_token.is_none()
            && self.override_team_id.is_none()
    }
}

/// Identity and detail fields populated from the remote project after a
/// create, connect, or detail sync.
#[derive(Debug, Clone)]
pub struct RemoteProjectFields {
    pub remote_project_id: String,
    pub project_name: String,
    pub framework: Option<String>,
    pub url: Option<String>,
    pub snapshot: String,
}

#[derive(Debug, Clone)]
pub struct NewEnvVarSet {
    pub id: String,
    pub tenant_id: String,
    pub auto_deploy: bool,
    pub entries: Vec<EnvVarEntry>,
}

#[derive(Debug, Clone)]
pub struct EnvVarSetRecord {
    pub id: String,
    pub tenant_id: String,
    pub auto_deploy: bool,
    pub entries: Vec<EnvVarEntry>,
    pub applied_entries: Vec<EnvVarEntry>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct EnvVarSetRow {
    pub id: String,
    pub tenant_id: String,
    pub auto_deploy: i64,
    pub entries: String,
    pub applied_entries: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<EnvVarSetRow> for EnvVarSetRecord {
    type Error = EngineError;

    fn try_from(row: EnvVarSetRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            auto_deploy: row.auto_deploy != 0,
            entries: serde_json::from_str(&row.entries)?,
            applied_entries: serde_json::from_str(&row.applied_entries)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub id: String,
    pub tenant_id: String,
    pub remote_deployment_id: Option<String>,
    pub status: DeployStatus,
    pub trigger_origin: TriggerOrigin,
    pub url: Option<String>,
    pub remote_created_at: i64,
    pub events: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeploymentRecord {
    pub id: String,
    pub tenant_id: String,
    pub remote_deployment_id: Option<String>,
    pub status: DeployStatus,
    pub trigger_origin: TriggerOrigin,
    pub url: Option<String>,
    pub remote_created_at: i64,
    pub events: Vec<String>,
    pub created_at: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct DeploymentRow {
    pub id: String,
    pub tenant_id: String,
    pub remote_deployment_id: Option<String>,
    pub status: String,
    pub trigger_origin: String,
    pub url: Option<String>,
    pub remote_created_at: i64,
    pub event_log: String,
    pub created_at: String,
}

impl TryFrom<DeploymentRow> for DeploymentRecord {
    type Error = EngineError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            remote_deployment_id: row.remote_deployment_id,
            status: DeployStatus::parse(&row.status),
            trigger_origin: TriggerOrigin::parse(&row.trigger_origin),
            url: row.url,
            remote_created_at: row.remote_created_at,
            events: serde_json::from_str(&row.event_log)?,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_identity_round_trips_through_sentinels() {
        assert_eq!(
            RemoteIdentity::from(String::new()),
            RemoteIdentity::Unsynced
        );
        assert_eq!(
            RemoteIdentity::from("null".to_string()),
            RemoteIdentity::Unsynced
        );
        assert_eq!(
            RemoteIdentity::from("undefined".to_string()),
            RemoteIdentity::Unsynced
        );
        assert_eq!(
            RemoteIdentity::from("FAILED_CREATION".to_string()),
            RemoteIdentity::Failed(SyncFailure::Creation)
        );
        assert_eq!(
            RemoteIdentity::from("env_123".to_string()),
            RemoteIdentity::Synced("env_123".to_string())
        );

        let encoded: String = RemoteIdentity::Failed(SyncFailure::Update).into();
        assert_eq!(encoded, "FAILED_UPDATE");
        let encoded: String = RemoteIdentity::Synced("env_9".to_string()).into();
        assert_eq!(encoded, "env_9");
    }

    #[test]
    fn env_var_entry_serializes_identity_as_string() {
        let entry = EnvVarEntry {
            key: "API_KEY".to_string(),
            value: "v".to_string(),
            var_type: VarType::Encrypted,
            targets: vec![EnvTarget::Production, EnvTarget::Preview],
            comment: None,
            git_branch: None,
            remote: RemoteIdentity::Synced("env_1".to_string()),
        };

        let json = serde_json::to_string(&entry).expect("serialize");
        assert!(json.contains("\"remote_id\":\"env_1\""));
        assert!(json.contains("\"type\":\"encrypted\""));

        let back: EnvVarEntry = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, entry);
    }

    #[test]
    fn tenant_eligibility_requires_approved_active_and_project() {
        let row = TenantRow {
            id: "t1".to_string(),
            name: "tenant".to_string(),
            status: "approved".to_string(),
            is_active: 1,
            remote_project_id: Some("prj_1".to_string()),
            project_name: None,
            framework: None,
            url: None,
            repo_owner: Some("acme".to_string()),
            repo_name: Some("site".to_string()),
            repo_branch: None,
            install_command: None,
            build_command: None,
            output_directory: None,
            root_directory: None,
            public_source: 0,
            override_token: None,
            override_team_id: None,
            latest_deployment_id: None,
            latest_deployment_status: None,
            last_synced_at: 0,
            last_sync_status: None,
            last_sync_message: None,
            remote_snapshot: None,
            created_at: "now".to_string(),
            updated_at: "now".to_string(),
        };

        let tenant = TenantRecord::from(row);
        assert!(tenant.is_eligible());
        assert!(tenant.has_git_repository());

        let mut inactive = tenant.clone();
        inactive.is_active = false;
        assert!(!inactive.is_eligible());

        let mut no_project = tenant;
        no_project.remote_project_id = None;
        assert!(!no_project.is_eligible());
    }
}
