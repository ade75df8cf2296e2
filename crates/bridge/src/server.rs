//! Thin HTTP dispatch to the engine entry points, plus the periodic
//! full-resync scheduler. No reconciliation logic lives here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::BridgeConfig;
use crate::engine::{DeploymentOverrides, GitRepoSpec, ReconcileEngine, SyncOutcome};
use crate::error::EngineError;
use crate::store::types::{
    DeploymentRecord, EnvVarEntry, TenantFieldPatch, TenantRecord,
};

#[derive(Clone)]
struct AppState {
    engine: Arc<ReconcileEngine>,
}

/// Starts the scheduler and serves the API until shutdown.
///
/// # Errors
/// Returns an error if the engine cannot be built or the listener fails.
pub async fn run(config: &BridgeConfig) -> Result<()> {
    let engine = Arc::new(ReconcileEngine::from_config(config).await?);
    spawn_scheduler(Arc::clone(&engine), config.sync_interval_seconds());

    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(%bind_address, "listening");

    axum::serve(listener, router(engine)).await?;
    Ok(())
}

fn spawn_scheduler(engine: Arc<ReconcileEngine>, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        // The first tick completes immediately; the first sync should wait
        // a full interval.
        interval.tick().await;

        loop {
            interval.tick().await;
            match engine.sync_all_tenants().await {
                Ok(outcome) => {
                    info!(message = %outcome.message, "scheduled sync finished");
                }
                Err(sync_error) => {
                    error!(error = %sync_error, "scheduled sync failed");
                }
            }
        }
    });
}

fn router(engine: Arc<ReconcileEngine>) -> Router {
    Router::new()
        .route("/api/sync", post(sync_all))
        .route("/api/tenants", get(list_tenants).post(create_tenant))
        .route(
            "/api/tenants/:id",
            get(get_tenant).patch(update_tenant).delete(delete_tenant),
        )
        .route("/api/tenants/:id/approve", post(approve_tenant))
        .route("/api/tenants/:id/sync", post(sync_tenant))
        .route(
            "/api/tenants/:id/env",
            post(create_env_set).put(update_env_set),
        )
        .route("/api/tenants/:id/env/sync", post(sync_env_vars))
        .route(
            "/api/tenants/:id/deployments",
            get(list_deployments).post(create_deployment),
        )
        .route("/api/tenants/:id/deployments/sync", post(sync_deployments))
        .route(
            "/api/tenants/:id/deployments/cancel",
            post(cancel_deployments),
        )
        .with_state(AppState { engine })
}

fn error_response(error: EngineError) -> (StatusCode, String) {
    let status = match &error {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::RemoteConflict { .. } => StatusCode::CONFLICT,
        EngineError::Credential { .. }
        | EngineError::RemoteNotFound { .. }
        | EngineError::RemotePartialFailure { .. }
        | EngineError::RemoteApi { .. } => StatusCode::BAD_GATEWAY,
        EngineError::LocalStore(_) | EngineError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (status, error.to_string())
}

/// Credential overrides never leave the service; everything else mirrors
/// the record.
#[derive(Debug, Serialize)]
struct TenantView {
    id: String,
    name: String,
    status: String,
    is_active: bool,
    remote_project_id: Option<String>,
    project_name: Option<String>,
    framework: Option<String>,
    url: Option<String>,
    repo_owner: Option<String>,
    repo_name: Option<String>,
    repo_branch: Option<String>,
    latest_deployment_id: Option<String>,
    latest_deployment_status: Option<String>,
    last_synced_at: i64,
    last_sync_status: Option<String>,
    last_sync_message: Option<String>,
    created_at: String,
    updated_at: String,
}

fn tenant_view(record: TenantRecord) -> TenantView {
    TenantView {
        id: record.id,
        name: record.name,
        status: record.status.as_str().to_string(),
        is_active: record.is_active,
        remote_project_id: record.remote_project_id,
        project_name: record.project_name,
        framework: record.framework,
        url: record.url,
        repo_owner: record.repo_owner,
        repo_name: record.repo_name,
        repo_branch: record.repo_branch,
        latest_deployment_id: record.latest_deployment_id,
        latest_deployment_status: record
            .latest_deployment_status
            .map(|status| status.as_str().to_string()),
        last_synced_at: record.last_synced_at,
        last_sync_status: record.last_sync_status,
        last_sync_message: record.last_sync_message,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

#[derive(Debug, Serialize)]
struct DeploymentView {
    id: String,
    tenant_id: String,
    remote_deployment_id: Option<String>,
    status: String,
    trigger_origin: String,
    url: Option<String>,
    remote_created_at: i64,
    events: Vec<String>,
    created_at: String,
}

fn deployment_view(record: DeploymentRecord) -> DeploymentView {
    DeploymentView {
        id: record.id,
        tenant_id: record.tenant_id,
        remote_deployment_id: record.remote_deployment_id,
        status: record.status.as_str().to_string(),
        trigger_origin: record.trigger_origin.as_str().to_string(),
        url: record.url,
        remote_created_at: record.remote_created_at,
        events: record.events,
        created_at: record.created_at,
    }
}

#[derive(Debug, Deserialize)]
struct CreateTenantRequest {
    name: String,
    #[serde(default)]
    git_repo: Option<GitRepoSpec>,
}

#[derive(Debug, Deserialize)]
struct CreateEnvSetRequest {
    entries: Vec<EnvVarEntry>,
    #[serde(default)]
    auto_deploy: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateEnvSetRequest {
    entries: Vec<EnvVarEntry>,
}

async fn sync_all(
    State(state): State<AppState>,
) -> Result<Json<SyncOutcome>, (StatusCode, String)> {
    state
        .engine
        .sync_all_tenants()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn list_tenants(
    State(state): State<AppState>,
) -> Result<Json<Vec<TenantView>>, (StatusCode, String)> {
    let tenants = state
        .engine
        .store()
        .list_tenants()
        .await
        .map_err(error_response)?;

    Ok(Json(tenants.into_iter().map(tenant_view).collect()))
}

async fn get_tenant(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
) -> Result<Json<TenantView>, (StatusCode, String)> {
    let tenant = state
        .engine
        .store()
        .get_tenant_by_id(&tenant_id)
        .await
        .map_err(error_response)?
        .ok_or((StatusCode::NOT_FOUND, "tenant not found".to_string()))?;

    Ok(Json(tenant_view(tenant)))
}

async fn create_tenant(
    State(state): State<AppState>,
    Json(payload): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<TenantView>), (StatusCode, String)> {
    let tenant = state
        .engine
        .create_tenant(&payload.name, payload.git_repo)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(tenant_view(tenant))))
}

async fn update_tenant(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
    Json(patch): Json<TenantFieldPatch>,
) -> Result<Json<TenantView>, (StatusCode, String)> {
    let tenant = state
        .engine
        .update_tenant(&tenant_id, patch)
        .await
        .map_err(error_response)?;

    Ok(Json(tenant_view(tenant)))
}

async fn approve_tenant(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
) -> Result<Json<TenantView>, (StatusCode, String)> {
    let tenant = state
        .engine
        .approve_tenant(&tenant_id)
        .await
        .map_err(error_response)?;

    Ok(Json(tenant_view(tenant)))
}

async fn delete_tenant(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
) -> Result<Json<SyncOutcome>, (StatusCode, String)> {
    state
        .engine
        .delete_tenant(&tenant_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn sync_tenant(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
) -> Result<Json<SyncOutcome>, (StatusCode, String)> {
    state
        .engine
        .sync_tenant(&tenant_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn create_env_set(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
    Json(payload): Json<CreateEnvSetRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .engine
        .create_env_set(&tenant_id, payload.entries, payload.auto_deploy)
        .await
        .map(|_| StatusCode::CREATED)
        .map_err(error_response)
}

async fn update_env_set(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
    Json(payload): Json<UpdateEnvSetRequest>,
) -> Result<Json<SyncOutcome>, (StatusCode, String)> {
    state
        .engine
        .update_env_set(&tenant_id, payload.entries)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn sync_env_vars(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
) -> Result<Json<SyncOutcome>, (StatusCode, String)> {
    state
        .engine
        .sync_env_vars(Some(&tenant_id))
        .await
        .map(Json)
        .map_err(error_response)
}

async fn list_deployments(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
) -> Result<Json<Vec<DeploymentView>>, (StatusCode, String)> {
    let deployments = state
        .engine
        .store()
        .list_deployments_for_tenant(&tenant_id)
        .await
        .map_err(error_response)?;

    Ok(Json(deployments.into_iter().map(deployment_view).collect()))
}

async fn create_deployment(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
    Json(overrides): Json<DeploymentOverrides>,
) -> Result<(StatusCode, Json<DeploymentView>), (StatusCode, String)> {
    let deployment = state
        .engine
        .create_deployment(&tenant_id, Some(overrides))
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(deployment_view(deployment))))
}

async fn sync_deployments(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
) -> Result<Json<SyncOutcome>, (StatusCode, String)> {
    state
        .engine
        .sync_deployments(Some(&tenant_id))
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cancel_deployments(
    State(state): State<AppState>,
    AxumPath(tenant_id): AxumPath<String>,
) -> Result<Json<SyncOutcome>, (StatusCode, String)> {
    state
        .engine
        .cancel_deployments(&tenant_id)
        .await
        .map(Json)
        .map_err(error_response)
}
