use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{EngineError, RemoteErrorKind};
use crate::platform::{ApiCredentials, PlatformClient};
use crate::store::types::TenantRecord;

const ENV_TOKEN: &str = "TENANTBRIDGE_PLATFORM_TOKEN";
const ENV_TEAM_ID: &str = "TENANTBRIDGE_PLATFORM_TEAM_ID";

/// Which rung of the fallback chain produced a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    TenantOverride,
    TenantSetting,
    Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialValidity {
    /// Confirmed against the platform with a cheap read.
    Validated,
    /// Returned without a validation call (no project to probe yet).
    Unvalidated,
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub token: String,
    pub team_id: Option<String>,
    pub source: CredentialSource,
    pub validity: CredentialValidity,
}

impl ResolvedCredential {
    #[must_use]
    pub fn api(&self) -> ApiCredentials {
        ApiCredentials {
            token: self.token.clone(),
            team_id: self.team_id.clone(),
        }
    }
}

/// The shared rungs below a tenant's own override: the configuration file
/// setting, then the process environment (read lazily here).
#[derive(Debug, Clone, Default)]
pub struct DefaultCredentials {
    pub setting_token: Option<String>,
    pub setting_team_id: Option<String>,
}

struct CachedCredential {
    credential: ResolvedCredential,
    expires_at: Instant,
}

/// Resolves which API credentials to use per tenant and caches the result
/// for a bounded TTL. A cache hit skips validation entirely.
pub struct CredentialResolver {
    cache: RwLock<HashMap<String, CachedCredential>>,
    ttl: Duration,
}

impl CredentialResolver {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolves credentials for a tenant, or the process-wide default when
    /// no tenant is given.
    ///
    /// The chain is tenant override, then the shared setting, then the
    /// process environment. Each rung is validated with a cheap read
    /// against the tenant's project when one exists; a rung that fails
    /// validation falls through to the next. The environment rung is the
    /// last resort: its validation failure is terminal.
    ///
    /// # Errors
    /// Returns [`EngineError::Credential`] when no rung yields a usable
    /// token, or when the final rung fails validation.
    pub async fn resolve(
        &self,
        platform: &PlatformClient,
        defaults: &DefaultCredentials,
        tenant: Option<&TenantRecord>,
    ) -> Result<ResolvedCredential, EngineError> {
        let Some(tenant) = tenant else {
            return default_credential(defaults).ok_or_else(|| EngineError::Credential {
                tenant_id: "-".to_string(),
                reason: "no platform token configured in settings or environment".to_string(),
            });
        };

        if let Some(cached) = self.cached(&tenant.id).await {
            debug!(tenant_id = %tenant.id, "credential cache hit");
            return Ok(cached);
        }

        let candidates = candidate_chain(defaults, tenant);
        if candidates.is_empty() {
            return Err(EngineError::Credential {
                tenant_id: tenant.id.clone(),
                reason: "no platform token available from override, settings, or environment"
                    .to_string(),
            });
        }

        let last = candidates.len() - 1;
        for (index, mut candidate) in candidates.into_iter().enumerate() {
            let Some(project_id) = tenant.remote_project_id.as_deref() else {
                // Nothing to validate against until the project exists.
                candidate.validity = CredentialValidity::Unvalidated;
                self.store_cached(&tenant.id, candidate.clone()).await;
                return Ok(candidate);
            };

            match validate(platform, &candidate, project_id).await {
                Ok(()) => {
                    candidate.validity = CredentialValidity::Validated;
                    self.store_cached(&tenant.id, candidate.clone()).await;
                    return Ok(candidate);
                }
                Err(classification) => {
                    warn!(
                        tenant_id = %tenant.id,
                        source = ?candidate.source,
                        classification,
                        "credential validation failed"
                    );
                    if index == last {
                        return Err(EngineError::Credential {
                            tenant_id: tenant.id.clone(),
                            reason: format!(
                                "validation failed on every rung; last failure: {classification}"
                            ),
                        });
                    }
                }
            }
        }

        unreachable!("candidate chain is non-empty and the last rung returns")
    }

    /// Drops the cached credential for a tenant, forcing re-validation on
    /// the next resolve.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.write().await.remove(tenant_id);
    }

    async fn cached(&self, tenant_id: &str) -> Option<ResolvedCredential> {
        self.prune_expired().await;

        self.cache
            .read()
            .await
            .get(tenant_id)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.credential.clone())
    }

    async fn store_cached(&self, tenant_id: &str, credential: ResolvedCredential) {
        self.cache.write().await.insert(
            tenant_id.to_string(),
            CachedCredential {
                credential,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    async fn prune_expired(&self) {
        let now = Instant::now();
        self.cache
            .write()
            .await
            .retain(|_, entry| entry.expires_at > now);
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_credential(defaults: &DefaultCredentials) -> Option<ResolvedCredential> {
    if let Some(token) = defaults.setting_token.clone() {
        return Some(ResolvedCredential {
            token,
            team_id: defaults.setting_team_id.clone(),
            source: CredentialSource::TenantSetting,
            validity: CredentialValidity::Unvalidated,
        });
    }

    env_value(ENV_TOKEN).map(|token| ResolvedCredential {
        token,
        team_id: env_value(ENV_TEAM_ID),
        source: CredentialSource::Environment,
        validity: CredentialValidity::Unvalidated,
    })
}

fn candidate_chain(defaults: &DefaultCredentials, tenant: &TenantRecord) -> Vec<ResolvedCredential> {
    let mut chain = Vec::new();

    if let Some(token) = tenant
        .override_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        chain.push(ResolvedCredential {
            token: token.to_string(),
            team_id: tenant.override_team_id.clone(),
            source: CredentialSource::TenantOverride,
            validity: CredentialValidity::Unvalidated,
        });
    }

    if let Some(token) = defaults.setting_token.clone() {
        chain.push(ResolvedCredential {
            token,
            team_id: defaults.setting_team_id.clone(),
            source: CredentialSource::TenantSetting,
            validity: CredentialValidity::Unvalidated,
        });
    }

    if let Some(token) = env_value(ENV_TOKEN) {
        chain.push(ResolvedCredential {
            token,
            team_id: env_value(ENV_TEAM_ID),
            source: CredentialSource::Environment,
            validity: CredentialValidity::Unvalidated,
        });
    }

    chain
}

/// Cheap validation read: list one deployment on the tenant's project.
/// Failures are reduced to a classification string for diagnostics.
async fn validate(
    platform: &PlatformClient,
    candidate: &ResolvedCredential,
    project_id: &str,
) -> Result<(), &'static str> {
    match platform.list_deployments(&candidate.api(), project_id, 1).await {
        Ok(_) => Ok(()),
        Err(error) => Err(match error.remote_kind() {
            Some(RemoteErrorKind::NotFound) => "project-not-found",
            Some(RemoteErrorKind::Unauthorized) => "unauthorized",
            Some(RemoteErrorKind::Forbidden) => "forbidden",
            _ => "unknown",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{TenantRecord, TenantStatus};
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn tenant_without_project(id: &str, override_token: Option<&str>) -> TenantRecord {
        TenantRecord {
            id: id.to_string(),
            name: format!("tenant-{id}"),
            status: TenantStatus::Approved,
            is_active: true,
            remote_project_id: None,
            project_name: None,
            framework: None,
            url: None,
            repo_owner: None,
            repo_name: None,
            repo_branch: None,
            install_command: None,
            build_command: None,
            output_directory: None,
            root_directory: None,
            public_source: false,
            override_token: override_token.map(ToString::to_string),
            override_team_id: Some("team_override".to_string()),
            latest_deployment_id: None,
            latest_deployment_status: None,
            last_synced_at: 0,
            last_sync_status: None,
            last_sync_message: None,
            remote_snapshot: None,
            created_at: "now".to_string(),
            updated_at: "now".to_string(),
        }
    }

    fn defaults() -> DefaultCredentials {
        DefaultCredentials {
            setting_token: Some("tok_setting".to_string()),
            setting_team_id: Some("team_setting".to_string()),
        }
    }

    #[tokio::test]
    async fn override_wins_when_present_and_is_cached() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        std::env::remove_var(ENV_TOKEN);

        let resolver = CredentialResolver::new(Duration::from_secs(60));
        let platform = PlatformClient::new("http://127.0.0.1:0");
        let tenant = tenant_without_project("t1", Some("tok_override"));

        let resolved = resolver
            .resolve(&platform, &defaults(), Some(&tenant))
            .await
            .expect("resolve");
        assert_eq!(resolved.source, CredentialSource::TenantOverride);
        assert_eq!(resolved.token, "tok_override");
        assert_eq!(resolved.team_id.as_deref(), Some("team_override"));
        assert_eq!(resolved.validity, CredentialValidity::Unvalidated);

        // Second resolve is a cache hit even if the override is gone.
        let stripped = tenant_without_project("t1", None);
        let resolved = resolver
            .resolve(&platform, &defaults(), Some(&stripped))
            .await
            .expect("resolve");
        assert_eq!(resolved.source, CredentialSource::TenantOverride);
    }

    #[tokio::test]
    async fn falls_back_to_setting_then_environment() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        std::env::remove_var(ENV_TOKEN);
        std::env::remove_var(ENV_TEAM_ID);

        let resolver = CredentialResolver::new(Duration::from_secs(60));
        let platform = PlatformClient::new("http://127.0.0.1:0");
        let tenant = tenant_without_project("t2", None);

        let resolved = resolver
            .resolve(&platform, &defaults(), Some(&tenant))
            .await
            .expect("resolve");
        assert_eq!(resolved.source, CredentialSource::TenantSetting);
        assert_eq!(resolved.token, "tok_setting");

        std::env::set_var(ENV_TOKEN, "tok_env");
        std::env::set_var(ENV_TEAM_ID, "team_env");
        let resolver = CredentialResolver::new(Duration::from_secs(60));
        let resolved = resolver
            .resolve(&platform, &DefaultCredentials::default(), Some(&tenant))
            .await
            .expect("resolve");
        assert_eq!(resolved.source, CredentialSource::Environment);
        assert_eq!(resolved.token, "tok_env");
        assert_eq!(resolved.team_id.as_deref(), Some("team_env"));

        std::env::remove_var(ENV_TOKEN);
        std::env::remove_var(ENV_TEAM_ID);
    }

    #[tokio::test]
    async fn missing_tokens_everywhere_is_a_credential_error() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        std::env::remove_var(ENV_TOKEN);

        let resolver = CredentialResolver::new(Duration::from_secs(60));
        let platform = PlatformClient::new("http://127.0.0.1:0");
        let tenant = tenant_without_project("t3", None);

        let error = resolver
            .resolve(&platform, &DefaultCredentials::default(), Some(&tenant))
            .await
            .expect_err("no token anywhere");
        assert!(matches!(error, EngineError::Credential { .. }));
    }

    #[tokio::test]
    async fn cache_expires_after_ttl_and_invalidate_evicts() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        std::env::remove_var(ENV_TOKEN);

        let resolver = CredentialResolver::new(Duration::ZERO);
        let platform = PlatformClient::new("http://127.0.0.1:0");
        let tenant = tenant_without_project("t4", Some("tok_override"));

        resolver
            .resolve(&platform, &defaults(), Some(&tenant))
            .await
            .expect("resolve");
        // TTL of zero: the entry is already stale, so the next resolve
        // re-runs the chain and sees the stripped override.
        let stripped = tenant_without_project("t4", None);
        let resolved = resolver
            .resolve(&platform, &defaults(), Some(&stripped))
            .await
            .expect("resolve");
        assert_eq!(resolved.source, CredentialSource::TenantSetting);

        let resolver = CredentialResolver::new(Duration::from_secs(60));
        resolver
            .resolve(&platform, &defaults(), Some(&tenant))
            .await
            .expect("resolve");
        resolver.invalidate("t4").await;
        let resolved = resolver
            .resolve(&platform, &defaults(), Some(&stripped))
            .await
            .expect("resolve");
        assert_eq!(resolved.source, CredentialSource::TenantSetting);
    }

    #[tokio::test]
    async fn process_default_prefers_setting_over_environment() {
        let _guard = env_lock().lock().expect("env lock poisoned");
        std::env::set_var(ENV_TOKEN, "tok_env");

        let resolver = CredentialResolver::new(Duration::from_secs(60));
        let platform = PlatformClient::new("http://127.0.0.1:0");

        let resolved = resolver
            .resolve(&platform, &defaults(), None)
            .await
            .expect("resolve");
        assert_eq!(resolved.source, CredentialSource::TenantSetting);

        std::env::remove_var(ENV_TOKEN);
    }
}
