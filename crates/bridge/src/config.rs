use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/opt/tenantbridge/config.json";

const DEFAULT_DB_PATH: &str = "/opt/tenantbridge/data/tenantbridge.db";
const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:4700";
const DEFAULT_SYNC_INTERVAL_SECONDS: u64 = 300;

const DEFAULT_CREDENTIAL_TTL_SECONDS: u64 = 300;
const DEFAULT_LOCK_TTL_SECONDS: u64 = 120;
const DEFAULT_DEBOUNCE_MILLIS: u64 = 1_000;
const DEFAULT_SUPPRESSION_WINDOW_SECONDS: i64 = 10;
const DEFAULT_DEPLOYMENT_FETCH_LIMIT: usize = 3;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub database_path: Option<String>,
    pub bind_address: Option<String>,
    pub sync_interval_seconds: Option<u64>,
    pub platform: PlatformConfig,
    pub engine: EngineConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub team_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub credential_ttl_seconds: Option<u64>,
    pub lock_ttl_seconds: Option<u64>,
    pub debounce_millis: Option<u64>,
    pub suppression_window_seconds: Option<i64>,
    pub deployment_fetch_limit: Option<usize>,
}

impl BridgeConfig {
    /// Loads the config file named by `TENANTBRIDGE_CONFIG_PATH` (or the
    /// default location). A missing file yields the built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TENANTBRIDGE_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let path = Path::new(&config_path);
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {config_path}"))?;

        let config = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("Failed to parse config JSON: {config_path}"))?;

        Ok(config)
    }

    #[must_use]
    pub fn database_path(&self) -> String {
        self.database_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .or_else(|| {
                std::env::var("TENANTBRIDGE_DB_PATH")
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        self.bind_address
            .as_deref()
            .unwrap_or(DEFAULT_BIND_ADDRESS)
            .trim()
            .to_string()
    }

    #[must_use]
    pub fn sync_interval_seconds(&self) -> u64 {
        self.sync_interval_seconds
            .unwrap_or(DEFAULT_SYNC_INTERVAL_SECONDS)
            .max(1)
    }

    /// Base URL of the remote hosting platform API. Required for any remote
    /// operation; there is no sensible default.
    pub fn platform_base_url(&self) -> Option<String> {
        self.platform
            .base_url
            .as_deref()
            .map(str::trim)
            .map(|value| value.trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                std::env::var("TENANTBRIDGE_PLATFORM_BASE_URL")
                    .ok()
                    .map(|value| value.trim().trim_end_matches('/').to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    /// The shared platform token from the config file. This is the
    /// "tenant setting" rung of the credential fallback chain; the process
    /// environment rung is read by the resolver itself.
    pub fn platform_token(&self) -> Option<String> {
        self.platform
            .token
            .as_deref()
            .map(str::trim)
            .map(ToString::to_string)
            .filter(|value| !value.is_empty())
    }

    pub fn platform_team_id(&self) -> Option<String> {
        self.platform
            .team_id
            .as_deref()
            .map(str::trim)
            .map(ToString::to_string)
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn credential_ttl_seconds(&self) -> u64 {
        self.engine
            .credential_ttl_seconds
            .unwrap_or(DEFAULT_CREDENTIAL_TTL_SECONDS)
    }

    #[must_use]
    pub fn lock_ttl_seconds(&self) -> u64 {
        self.engine.lock_ttl_seconds.unwrap_or(DEFAULT_LOCK_TTL_SECONDS)
    }

    #[must_use]
    pub fn debounce_millis(&self) -> u64 {
        self.engine.debounce_millis.unwrap_or(DEFAULT_DEBOUNCE_MILLIS)
    }

    #[must_use]
    pub fn suppression_window_seconds(&self) -> i64 {
        self.engine
            .suppression_window_seconds
            .unwrap_or(DEFAULT_SUPPRESSION_WINDOW_SECONDS)
    }

    #[must_use]
    pub fn deployment_fetch_limit(&self) -> usize {
        self.engine
            .deployment_fetch_limit
            .unwrap_or(DEFAULT_DEPLOYMENT_FETCH_LIMIT)
            .clamp(1, 20)
    }
}
