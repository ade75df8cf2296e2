use super::types::{
    DeployStatus, EnvTarget, EnvVarEntry, NewDeployment, NewEnvVarSet, NewTenant, RemoteIdentity,
    RemoteProjectFields, TenantFieldPatch, TenantStatus, TriggerOrigin, VarType, WriteOrigin,
};
use super::StoreClient;
use crate::error::EngineError;

fn new_tenant(id: &str) -> NewTenant {
    NewTenant {
        id: id.to_string(),
        name: format!("tenant-{id}"),
        repo_owner: Some("acme".to_string()),
        repo_name: Some("site".to_string()),
        repo_branch: Some("main".to_string()),
    }
}

fn new_entry(key: &str, remote: RemoteIdentity) -> EnvVarEntry {
    EnvVarEntry {
        key: key.to_string(),
        value: "value".to_string(),
        var_type: VarType::Plain,
        targets: vec![EnvTarget::Production],
        comment: None,
        git_branch: None,
        remote,
    }
}

fn new_deployment(id: &str, tenant_id: &str, origin: TriggerOrigin) -> NewDeployment {
    NewDeployment {
        id: id.to_string(),
        tenant_id: tenant_id.to_string(),
        remote_deployment_id: Some(format!("dpl_{id}")),
        status: DeployStatus::Ready,
        trigger_origin: origin,
        url: Some(format!("https://{id}.example.app")),
        remote_created_at: 1_000,
        events: vec!["created".to_string()],
    }
}

async fn temp_store() -> StoreClient {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("bridge.db");
    // Keep tempdir alive by leaking it for the duration of the test (each test has its own).
    std::mem::forget(tempdir);

    StoreClient::initialize(&db_path.to_string_lossy())
        .await
        .expect("store init")
}

#[tokio::test]
async fn initialize_runs_migrations_and_enables_wal() {
    let store = temp_store().await;
    store.ensure_wal_mode().await.expect("wal mode");
}

#[tokio::test]
async fn tenants_insert_lookup_and_eligibility_filter() {
    let store = temp_store().await;

    store
        .insert_tenant(&new_tenant("t1"))
        .await
        .expect("insert tenant");

    let tenant = store
        .get_tenant_by_id("t1")
        .await
        .expect("get tenant")
        .expect("exists");
    assert_eq!(tenant.status, TenantStatus::Draft);
    assert!(!tenant.is_active);
    assert!(tenant.remote_project_id.is_none());

    // Drafts are never eligible for remote reconciliation.
    assert!(store
        .list_eligible_tenants()
        .await
        .expect("eligible")
        .is_empty());

    store
        .approve_tenant_with_project(
            "t1",
            &RemoteProjectFields {
                remote_project_id: "prj_1".to_string(),
                project_name: "tenant-t1".to_string(),
                framework: Some("nextjs".to_string()),
                url: Some("https://t1.example.app".to_string()),
                snapshot: "{}".to_string(),
            },
        )
        .await
        .expect("approve");
    store
        .update_tenant_fields(
            "t1",
            &TenantFieldPatch {
                is_active: Some(true),
                ..TenantFieldPatch::default()
            },
            WriteOrigin::User,
        )
        .await
        .expect("activate");

    let eligible = store.list_eligible_tenants().await.expect("eligible");
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].remote_project_id.as_deref(), Some("prj_1"));
    assert!(eligible[0].last_synced_at > 0);
}

#[tokio::test]
async fn remote_project_uniqueness_is_visible_to_the_guard_query() {
    let store = temp_store().await;
    store.insert_tenant(&new_tenant("t1")).await.expect("t1");
    store.insert_tenant(&new_tenant("t2")).await.expect("t2");

    let fields = RemoteProjectFields {
        remote_project_id: "prj_shared".to_string(),
        project_name: "tenant-t1".to_string(),
        framework: None,
        url: None,
        snapshot: "{}".to_string(),
    };
    store
        .approve_tenant_with_project("t1", &fields)
        .await
        .expect("approve t1");

    let others = store
        .count_other_tenants_with_remote_project("t2", "prj_shared")
        .await
        .expect("count");
    assert_eq!(others, 1);

    let unclaimed = store
        .count_other_tenants_with_remote_project("t2", "prj_free")
        .await
        .expect("count");
    assert_eq!(unclaimed, 0);

    // The unique index is the backstop behind the engine's pre-check.
    let error = store
        .approve_tenant_with_project("t2", &fields)
        .await
        .expect_err("second claim on the same remote project must fail");
    assert!(matches!(error, EngineError::LocalStore(_)));
}

#[tokio::test]
async fn env_set_is_unique_per_tenant() {
    let store = temp_store().await;
    store.insert_tenant(&new_tenant("t1")).await.expect("t1");

    let set = NewEnvVarSet {
        id: "set-1".to_string(),
        tenant_id: "t1".to_string(),
        auto_deploy: false,
        entries: vec![new_entry("A", RemoteIdentity::Unsynced)],
    };
    store.insert_env_set(&set).await.expect("first set");

    let second = NewEnvVarSet {
        id: "set-2".to_string(),
        tenant_id: "t1".to_string(),
        auto_deploy: false,
        entries: Vec::new(),
    };
    let error = store
        .insert_env_set(&second)
        .await
        .expect_err("second set must be rejected");
    assert!(matches!(error, EngineError::Validation(_)));
}

#[tokio::test]
async fn reconciled_entries_update_the_applied_snapshot_in_one_write() {
    let store = temp_store().await;
    store.insert_tenant(&new_tenant("t1")).await.expect("t1");
    store
        .insert_env_set(&NewEnvVarSet {
            id: "set-1".to_string(),
            tenant_id: "t1".to_string(),
            auto_deploy: true,
            entries: vec![new_entry("A", RemoteIdentity::Unsynced)],
        })
        .await
        .expect("insert set");

    let set = store
        .get_env_set_by_tenant("t1")
        .await
        .expect("get set")
        .expect("exists");
    assert!(set.auto_deploy);
    assert_eq!(set.entries.len(), 1);
    assert!(set.applied_entries.is_empty());

    let reconciled = vec![new_entry(
        "A",
        RemoteIdentity::Synced("env_1".to_string()),
    )];
    store
        .persist_reconciled_entries("set-1", &reconciled)
        .await
        .expect("persist");

    let set = store
        .get_env_set_by_id("set-1")
        .await
        .expect("get set")
        .expect("exists");
    assert_eq!(set.entries, reconciled);
    assert_eq!(set.applied_entries, reconciled);

    // The persistence write is sync-tagged on the owning tenant.
    let tenant = store
        .get_tenant_by_id("t1")
        .await
        .expect("get tenant")
        .expect("exists");
    assert!(tenant.last_synced_at > 0);
}

#[tokio::test]
async fn sync_deployments_are_bulk_replaced_and_manual_ones_survive() {
    let store = temp_store().await;
    store.insert_tenant(&new_tenant("t1")).await.expect("t1");

    store
        .insert_deployment(&new_deployment("d-manual", "t1", TriggerOrigin::Manual))
        .await
        .expect("manual");
    store
        .insert_deployment(&new_deployment("d-sync-1", "t1", TriggerOrigin::Sync))
        .await
        .expect("sync 1");
    store
        .insert_deployment(&new_deployment("d-sync-2", "t1", TriggerOrigin::Sync))
        .await
        .expect("sync 2");

    let removed = store
        .delete_sync_deployments_for_tenant("t1")
        .await
        .expect("bulk delete");
    assert_eq!(removed, 2);

    let remaining = store
        .list_deployments_for_tenant("t1")
        .await
        .expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].trigger_origin, TriggerOrigin::Manual);
}

#[tokio::test]
async fn latest_sync_deployment_picks_newest_by_remote_creation_time() {
    let store = temp_store().await;
    store.insert_tenant(&new_tenant("t1")).await.expect("t1");

    let mut older = new_deployment("d-old", "t1", TriggerOrigin::Sync);
    older.remote_created_at = 1_000;
    let mut newer = new_deployment("d-new", "t1", TriggerOrigin::Sync);
    newer.remote_created_at = 2_000;
    let mut manual = new_deployment("d-manual", "t1", TriggerOrigin::Manual);
    manual.remote_created_at = 3_000;

    store.insert_deployment(&older).await.expect("older");
    store.insert_deployment(&newer).await.expect("newer");
    store.insert_deployment(&manual).await.expect("manual");

    let latest = store
        .latest_sync_deployment("t1")
        .await
        .expect("latest")
        .expect("exists");
    assert_eq!(latest.id, "d-new");

    store
        .set_latest_deployment("t1", &latest.id, latest.status)
        .await
        .expect("pointer");
    let tenant = store
        .get_tenant_by_id("t1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(tenant.latest_deployment_id.as_deref(), Some("d-new"));
    assert_eq!(tenant.latest_deployment_status, Some(DeployStatus::Ready));
}

#[tokio::test]
async fn deployment_patch_appends_event_and_updates_status() {
    let store = temp_store().await;
    store.insert_tenant(&new_tenant("t1")).await.expect("t1");

    let mut deployment = new_deployment("d1", "t1", TriggerOrigin::Manual);
    deployment.status = DeployStatus::Building;
    store.insert_deployment(&deployment).await.expect("insert");

    store
        .update_deployment_remote_state(
            "d1",
            DeployStatus::Ready,
            Some("https://d1.example.app"),
            5_000,
            "status refreshed from platform",
        )
        .await
        .expect("patch");

    let record = store
        .get_deployment_by_remote_id("t1", "dpl_d1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(record.status, DeployStatus::Ready);
    assert_eq!(record.remote_created_at, 5_000);
    assert_eq!(record.events.len(), 2);
}

#[tokio::test]
async fn tenant_deletion_cascade_removes_dependents() {
    let store = temp_store().await;
    store.insert_tenant(&new_tenant("t1")).await.expect("t1");
    store
        .insert_env_set(&NewEnvVarSet {
            id: "set-1".to_string(),
            tenant_id: "t1".to_string(),
            auto_deploy: false,
            entries: Vec::new(),
        })
        .await
        .expect("set");
    store
        .insert_deployment(&new_deployment("d1", "t1", TriggerOrigin::Auto))
        .await
        .expect("deployment");

    assert_eq!(
        store
            .delete_env_sets_for_tenant("t1")
            .await
            .expect("env cascade"),
        1
    );
    assert_eq!(
        store
            .delete_deployments_for_tenant("t1")
            .await
            .expect("deploy cascade"),
        1
    );
    store.delete_tenant("t1").await.expect("delete tenant");

    assert!(store
        .get_tenant_by_id("t1")
        .await
        .expect("get")
        .is_none());
    assert!(store
        .get_env_set_by_tenant("t1")
        .await
        .expect("get set")
        .is_none());
    assert_eq!(
        store
            .count_deployments_for_tenant("t1")
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn sync_origin_field_update_stamps_last_synced_at() {
    let store = temp_store().await;
    store.insert_tenant(&new_tenant("t1")).await.expect("t1");

    store
        .update_tenant_fields(
            "t1",
            &TenantFieldPatch {
                build_command: Some("npm run build".to_string()),
                ..TenantFieldPatch::default()
            },
            WriteOrigin::User,
        )
        .await
        .expect("user write");
    let tenant = store
        .get_tenant_by_id("t1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(tenant.last_synced_at, 0);

    store
        .update_tenant_fields(
            "t1",
            &TenantFieldPatch {
                install_command: Some("npm ci".to_string()),
                ..TenantFieldPatch::default()
            },
            WriteOrigin::Sync,
        )
        .await
        .expect("sync write");
    let tenant = store
        .get_tenant_by_id("t1")
        .await
        .expect("get")
        .expect("exists");
    assert!(tenant.last_synced_at > 0);
    assert_eq!(tenant.install_command.as_deref(), Some("npm ci"));
    assert_eq!(tenant.build_command.as_deref(), Some("npm run build"));
}
