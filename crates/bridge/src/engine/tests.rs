use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::platform::PlatformClient;
use crate::store::types::{
    DeployStatus, EnvTarget, EnvVarEntry, NewDeployment, NewEnvVarSet, NewTenant, RemoteIdentity,
    RemoteProjectFields, TenantFieldPatch, TenantStatus, TriggerOrigin, VarType, WriteOrigin,
};
use crate::store::StoreClient;

use super::credentials::DefaultCredentials;
use super::{EngineSettings, EngineTiming, ReconcileEngine};

/// In-process stand-in for the hosting platform. Records every call it
/// serves so tests can assert on the remote traffic a pass produced.
#[derive(Clone)]
struct StubPlatform {
    calls: Arc<Mutex<Vec<String>>>,
    env_ids: Arc<AtomicUsize>,
    deployments: Arc<Value>,
    fail_project_detail: bool,
    fail_env_update: bool,
}

impl StubPlatform {
    fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            env_ids: Arc::new(AtomicUsize::new(1)),
            deployments: Arc::new(json!({ "deployments": [] })),
            fail_project_detail: false,
            fail_env_update: false,
        }
    }

    fn note(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn count_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|call| call.contains(needle))
            .count()
    }
}

async fn stub_create_project(
    State(stub): State<StubPlatform>,
    Json(body): Json<Value>,
) -> Json<Value> {
    stub.note("create-project".to_string());
    Json(json!({ "id": "prj_new", "name": body["name"] }))
}

async fn stub_project_detail(
    State(stub): State<StubPlatform>,
    AxumPath(project_id): AxumPath<String>,
) -> Result<Json<Value>, StatusCode> {
    stub.note(format!("project-detail {project_id}"));
    if stub.fail_project_detail {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    Ok(Json(json!({
        "id": project_id,
        "name": "demo",
        "framework": "nextjs",
        "url": null
    })))
}

async fn stub_delete_project(
    State(stub): State<StubPlatform>,
    AxumPath(project_id): AxumPath<String>,
) -> StatusCode {
    stub.note(format!("delete-project {project_id}"));
    StatusCode::NO_CONTENT
}

async fn stub_project_domains(
    State(stub): State<StubPlatform>,
    AxumPath(project_id): AxumPath<String>,
) -> Json<Value> {
    stub.note(format!("domains {project_id}"));
    Json(json!({ "domains": [{ "name": "demo.example.app", "verified": true }] }))
}

async fn stub_create_env(
    State(stub): State<StubPlatform>,
    AxumPath(project_id): AxumPath<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let id = stub.env_ids.fetch_add(1, Ordering::SeqCst);
    stub.note(format!("create-env {project_id} {}", body["key"]));
    Json(json!({ "id": format!("env_{id}"), "key": body["key"] }))
}

async fn stub_update_env(
    State(stub): State<StubPlatform>,
    AxumPath((_, env_id)): AxumPath<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    stub.note(format!("update-env {env_id}"));
    if stub.fail_env_update {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    Ok(Json(json!({ "id": env_id, "key": "K" })))
}

async fn stub_delete_env(
    State(stub): State<StubPlatform>,
    AxumPath((_, env_id)): AxumPath<(String, String)>,
) -> StatusCode {
    stub.note(format!("delete-env {env_id}"));
    StatusCode::NO_CONTENT
}

async fn stub_list_deployments(State(stub): State<StubPlatform>) -> Json<Value> {
    stub.note("list-deployments".to_string());
    Json(stub.deployments.as_ref().clone())
}

async fn serve_stub(stub: StubPlatform) -> String {
    let app = Router::new()
        .route("/v1/projects", post(stub_create_project))
        .route(
            "/v1/projects/:id",
            get(stub_project_detail).delete(stub_delete_project),
        )
        .route("/v1/projects/:id/domains", get(stub_project_domains))
        .route("/v1/projects/:id/env", post(stub_create_env))
        .route(
            "/v1/projects/:id/env/:env_id",
            patch(stub_update_env).delete(stub_delete_env),
        )
        .route("/v1/deployments", get(stub_list_deployments))
        .with_state(stub);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub platform");
    let addr = listener.local_addr().expect("stub address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub platform stopped");
    });

    format!("http://{addr}")
}

async fn temp_store() -> StoreClient {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("bridge.db");
    std::mem::forget(tempdir);

    StoreClient::initialize(&db_path.to_string_lossy())
        .await
        .expect("store init")
}

fn test_engine(store: StoreClient, base_url: &str) -> ReconcileEngine {
    ReconcileEngine::new(
        store,
        PlatformClient::new(base_url),
        EngineSettings {
            default_credentials: DefaultCredentials {
                setting_token: Some("tok_test".to_string()),
                setting_team_id: None,
            },
            ..EngineSettings::default()
        },
        EngineTiming::default(),
    )
}

async fn insert_draft(store: &StoreClient, id: &str) {
    store
        .insert_tenant(&NewTenant {
            id: id.to_string(),
            name: format!("tenant-{id}"),
            repo_owner: Some("acme".to_string()),
            repo_name: Some("site".to_string()),
            repo_branch: Some("main".to_string()),
        })
        .await
        .expect("insert tenant");
}

async fn insert_approved_active(store: &StoreClient, id: &str, project_id: &str) {
    insert_draft(store, id).await;
    store
        .approve_tenant_with_project(
            id,
            &RemoteProjectFields {
                remote_project_id: project_id.to_string(),
                project_name: format!("tenant-{id}"),
                framework: Some("nextjs".to_string()),
                url: Some(format!("https://{id}.example.app")),
                snapshot: "{}".to_string(),
            },
        )
        .await
        .expect("approve");
    store
        .update_tenant_fields(
            id,
            &TenantFieldPatch {
                is_active: Some(true),
                ..TenantFieldPatch::default()
            },
            WriteOrigin::User,
        )
        .await
        .expect("activate");
}

fn entry(key: &str, value: &str, var_type: VarType) -> EnvVarEntry {
    EnvVarEntry {
        key: key.to_string(),
        value: value.to_string(),
        var_type,
        targets: vec![EnvTarget::Production],
        comment: None,
        git_branch: None,
        remote: RemoteIdentity::Unsynced,
    }
}

fn synced_entry(key: &str, value: &str, id: &str) -> EnvVarEntry {
    EnvVarEntry {
        remote: RemoteIdentity::Synced(id.to_string()),
        ..entry(key, value, VarType::Plain)
    }
}

#[tokio::test]
async fn approval_creates_the_project_and_finishes_with_a_detail_sync() {
    let stub = StubPlatform::new();
    let base_url = serve_stub(stub.clone()).await;
    let store = temp_store().await;
    insert_draft(&store, "t1").await;
    let engine = test_engine(store.clone(), &base_url);

    let tenant = engine.approve_tenant("t1").await.expect("approve");
    assert_eq!(tenant.status, TenantStatus::Approved);
    assert_eq!(tenant.remote_project_id.as_deref(), Some("prj_new"));
    assert_eq!(tenant.project_name.as_deref(), Some("demo"));
    // The creation response has no url; the detail sync fills it in from
    // the project's first domain.
    assert_eq!(tenant.url.as_deref(), Some("https://demo.example.app"));

    assert_eq!(stub.count_matching("create-project"), 1);
    assert_eq!(stub.count_matching("project-detail prj_new"), 1);
    assert_eq!(stub.count_matching("domains prj_new"), 1);
    assert_eq!(stub.count_matching("delete-project"), 0);
}

#[tokio::test]
async fn failed_detail_sync_rolls_back_the_created_project() {
    let mut stub = StubPlatform::new();
    stub.fail_project_detail = true;
    let base_url = serve_stub(stub.clone()).await;
    let store = temp_store().await;
    insert_draft(&store, "t1").await;
    let engine = test_engine(store.clone(), &base_url);

    engine
        .approve_tenant("t1")
        .await
        .expect_err("detail sync failure must fail the approval");

    // Neither side keeps an orphan: the tenant is still a draft and the
    // just-created remote project was deleted again.
    let tenant = store
        .get_tenant_by_id("t1")
        .await
        .expect("get tenant")
        .expect("exists");
    assert_eq!(tenant.status, TenantStatus::Draft);
    assert!(tenant.remote_project_id.is_none());
    assert_eq!(stub.count_matching("delete-project prj_new"), 1);
}

#[tokio::test]
async fn env_reconciliation_synthesizes_values_and_is_idempotent() {
    let stub = StubPlatform::new();
    let base_url = serve_stub(stub.clone()).await;
    let store = temp_store().await;
    insert_approved_active(&store, "t1", "prj_1").await;
    store
        .insert_env_set(&NewEnvVarSet {
            id: "set-1".to_string(),
            tenant_id: "t1".to_string(),
            auto_deploy: false,
            entries: vec![
                entry("SESSION_SECRET", "", VarType::Encrypted),
                entry("PUBLIC_SERVER_URL", "", VarType::Plain),
            ],
        })
        .await
        .expect("insert set");
    let engine = test_engine(store.clone(), &base_url);

    let outcome = engine.sync_env_vars(Some("t1")).await.expect("first sync");
    assert!(outcome.success);
    assert_eq!(outcome.summary.created, 2);
    assert_eq!(outcome.summary.errors, 0);

    let set = store
        .get_env_set_by_tenant("t1")
        .await
        .expect("get set")
        .expect("exists");
    let secret = set
        .entries
        .iter()
        .find(|entry| entry.key == "SESSION_SECRET")
        .expect("secret entry");
    assert_eq!(secret.value.len(), 32);
    assert!(secret.remote.synced_id().is_some());
    let url_var = set
        .entries
        .iter()
        .find(|entry| entry.key == "PUBLIC_SERVER_URL")
        .expect("url entry");
    assert_eq!(url_var.value, "https://t1.example.app");
    assert_eq!(set.entries, set.applied_entries);
    assert_eq!(stub.count_matching("create-env"), 2);

    // Second pass with no local change: everything classifies as skip and
    // no further remote calls are made.
    let total_calls = stub.calls.lock().expect("calls lock").len();
    let outcome = engine.sync_env_vars(Some("t1")).await.expect("second sync");
    assert_eq!(outcome.summary.created, 0);
    assert_eq!(outcome.summary.updated, 0);
    assert_eq!(outcome.summary.skipped, 2);
    assert_eq!(stub.calls.lock().expect("calls lock").len(), total_calls);
}

#[tokio::test]
async fn env_update_batch_aborts_and_marks_remaining_entries_failed() {
    let mut stub = StubPlatform::new();
    stub.fail_env_update = true;
    let base_url = serve_stub(stub.clone()).await;
    let store = temp_store().await;
    insert_approved_active(&store, "t1", "prj_1").await;

    let synced = vec![
        synced_entry("A", "1", "env_a"),
        synced_entry("B", "1", "env_b"),
    ];
    store
        .insert_env_set(&NewEnvVarSet {
            id: "set-1".to_string(),
            tenant_id: "t1".to_string(),
            auto_deploy: false,
            entries: synced.clone(),
        })
        .await
        .expect("insert set");
    store
        .persist_reconciled_entries("set-1", &synced)
        .await
        .expect("seed applied snapshot");

    let engine = test_engine(store.clone(), &base_url);
    let edited = vec![
        synced_entry("A", "2", "env_a"),
        synced_entry("B", "2", "env_b"),
    ];
    let outcome = engine.update_env_set("t1", edited).await.expect("update");

    // The first remote update fails; the rest of the batch is abandoned
    // rather than half-applied.
    assert!(!outcome.success);
    assert_eq!(outcome.summary.updated, 0);
    assert_eq!(outcome.summary.errors, 1);
    assert_eq!(stub.count_matching("update-env"), 1);

    let set = store
        .get_env_set_by_tenant("t1")
        .await
        .expect("get set")
        .expect("exists");
    assert!(set.entries.iter().all(|entry| entry.remote.is_failed()));
}

#[tokio::test]
async fn deployment_resync_replaces_sync_records_and_patches_manual_ones() {
    let mut stub = StubPlatform::new();
    stub.deployments = Arc::new(json!({
        "deployments": [
            { "id": "dpl_a", "url": "https://a.example.app", "state": "READY", "createdAt": 2_000 },
            { "id": "dpl_b", "state": "BUILDING", "createdAt": 1_000 }
        ]
    }));
    let base_url = serve_stub(stub.clone()).await;
    let store = temp_store().await;
    insert_approved_active(&store, "t1", "prj_1").await;
    store
        .insert_deployment(&NewDeployment {
            id: "d-manual".to_string(),
            tenant_id: "t1".to_string(),
            remote_deployment_id: Some("dpl_a".to_string()),
            status: DeployStatus::Queued,
            trigger_origin: TriggerOrigin::Manual,
            url: None,
            remote_created_at: 0,
            events: vec!["queued (manual)".to_string()],
        })
        .await
        .expect("manual deployment");

    let engine = test_engine(store.clone(), &base_url);
    let outcome = engine
        .sync_deployments(Some("t1"))
        .await
        .expect("first sync");
    assert_eq!(outcome.summary.updated, 1);
    assert_eq!(outcome.summary.created, 1);

    // The manual record tracks the remote state but keeps its origin.
    let manual = store
        .get_deployment_by_remote_id("t1", "dpl_a")
        .await
        .expect("get manual")
        .expect("exists");
    assert_eq!(manual.trigger_origin, TriggerOrigin::Manual);
    assert_eq!(manual.status, DeployStatus::Ready);

    let latest = store
        .latest_sync_deployment("t1")
        .await
        .expect("latest")
        .expect("exists");
    let tenant = store
        .get_tenant_by_id("t1")
        .await
        .expect("get tenant")
        .expect("exists");
    assert_eq!(tenant.latest_deployment_id.as_deref(), Some(latest.id.as_str()));
    assert_eq!(tenant.latest_deployment_status, Some(DeployStatus::Building));

    // A second pass wholesale-replaces the sync-owned subset.
    let outcome = engine
        .sync_deployments(Some("t1"))
        .await
        .expect("second sync");
    assert_eq!(outcome.summary.deleted, 1);
    assert_eq!(outcome.summary.created, 1);
    assert_eq!(outcome.summary.updated, 1);
}

#[tokio::test]
async fn cancel_removes_queued_records_that_never_reached_the_platform() {
    let store = temp_store().await;
    insert_draft(&store, "t1").await;
    store
        .insert_deployment(&NewDeployment {
            id: "d1".to_string(),
            tenant_id: "t1".to_string(),
            remote_deployment_id: None,
            status: DeployStatus::Queued,
            trigger_origin: TriggerOrigin::Manual,
            url: None,
            remote_created_at: 0,
            events: vec!["queued (manual)".to_string()],
        })
        .await
        .expect("queued deployment");

    let engine = test_engine(store.clone(), "http://127.0.0.1:0");
    let outcome = engine.cancel_deployments("t1").await.expect("cancel");
    assert_eq!(outcome.summary.deleted, 1);
    assert_eq!(
        store
            .count_deployments_for_tenant("t1")
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn back_to_back_passes_on_the_same_tenant_are_debounced() {
    let store = temp_store().await;
    insert_draft(&store, "t1").await;
    let engine = test_engine(store, "http://127.0.0.1:0");

    let first = engine.sync_tenant("t1").await.expect("first pass");
    assert!(first.success);

    let second = engine.sync_tenant("t1").await.expect("second pass");
    assert_eq!(second.summary.skipped, 1);
    assert!(second.message.contains("already in flight"));
}
