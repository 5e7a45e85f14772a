//! Provisioning state machine against in-memory providers

use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;
use std::time::Duration;
use ws_orchestrator::test_utils::{create_test_db, create_test_workspace};
use ws_orchestrator::{
    AesGcmCipher, CredentialCipher, CredentialStore, InstanceStatus, OrchestratorError, ProvisionSettings,
    Provisioner, SqlCredentialStore, VolumeStatus, WorkspaceStatus, WorkspaceStore,
};
use ws_provider::mock::{ComputeFailure, MockCompute, MockMesh};
use ws_provider::{DeviceWait, Volume};
use ws_queue::JobPayload;

struct Harness {
    store: WorkspaceStore,
    compute: Arc<MockCompute>,
    mesh: Arc<MockMesh>,
    credentials: Arc<SqlCredentialStore>,
    provisioner: Provisioner,
}

fn settings() -> ProvisionSettings {
    ProvisionSettings {
        mesh_wait: DeviceWait {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        },
        ..ProvisionSettings::default()
    }
}

async fn harness_with(mesh: MockMesh, settings: ProvisionSettings) -> Harness {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let compute = Arc::new(MockCompute::new());
    let mesh = Arc::new(mesh);
    let cipher: Arc<dyn CredentialCipher> = Arc::new(AesGcmCipher::new(&[3u8; 32]).unwrap());
    let credentials = Arc::new(SqlCredentialStore::new(pool, Some(cipher)));

    let provisioner = Provisioner::new(
        store.clone(),
        compute.clone(),
        mesh.clone(),
        credentials.clone(),
        settings,
    );

    Harness {
        store,
        compute,
        mesh,
        credentials,
        provisioner,
    }
}

async fn harness() -> Harness {
    harness_with(MockMesh::joining(), settings()).await
}

#[tokio::test]
async fn test_provision_brings_workspace_to_ready() {
    let h = harness().await;
    let ws = create_test_workspace(&h.store, "alice").await;

    let outcome = h
        .provisioner
        .run(&JobPayload::new(&ws.id, "alice"))
        .await
        .expect("provisioning should succeed");

    assert!(outcome.created_volume);
    assert!(outcome.created_instance);
    assert_eq!(outcome.mesh_ip, "100.64.0.1");

    let detail = h.store.get_workspace_detail(&ws.id).await.unwrap().unwrap();
    assert_eq!(detail.workspace.status, WorkspaceStatus::Ready);

    let volume = detail.volume.unwrap();
    assert_eq!(volume.status, VolumeStatus::Available);
    assert_eq!(volume.provider_volume_id.as_deref(), Some(outcome.provider_volume_id.as_str()));

    let instance = detail.instance.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(
        instance.provider_instance_id.as_deref(),
        Some(outcome.provider_instance_id.as_str())
    );
    assert_eq!(instance.mesh_ip.as_deref(), Some("100.64.0.1"));
    assert!(instance.public_ip.is_some());
    assert!(instance.started_at.is_some());

    let provider_volume = h.compute.volume(&outcome.provider_volume_id).unwrap();
    assert_eq!(provider_volume.size_gb, ws.storage_gb);
    assert_eq!(
        provider_volume.attached_to.as_deref(),
        Some(outcome.provider_instance_id.as_str())
    );

    let credentials = h.mesh.credentials_issued();
    assert_eq!(credentials.len(), 1);
    assert!(credentials[0].ephemeral);
    assert!(credentials[0].preauthorized);
    assert!(!credentials[0].reusable);
    assert!(credentials[0].description.contains(&ws.id));

    let user_data = h.compute.last_user_data().unwrap();
    assert!(user_data.starts_with("#cloud-config"));
    assert!(user_data.contains(&format!("ws-{}", ws.id)));
}

#[tokio::test]
async fn test_existing_volume_is_reused() {
    let h = harness().await;
    let ws = create_test_workspace(&h.store, "alice").await;

    h.compute.insert_volume(Volume {
        id: "vol-existing".to_string(),
        name: "data".to_string(),
        size_gb: 20,
        device_path: Some("/dev/disk/by-id/scsi-0_Volume_existing".to_string()),
        attached_to: None,
    });
    h.store.create_volume_record(&ws.id, 20).await.unwrap();
    h.store
        .mark_volume_available(&ws.id, "vol-existing")
        .await
        .unwrap();

    let outcome = h
        .provisioner
        .run(&JobPayload::new(&ws.id, "alice"))
        .await
        .unwrap();

    assert!(!outcome.created_volume);
    assert_eq!(outcome.provider_volume_id, "vol-existing");
    assert_eq!(h.compute.calls().volumes_created, 0);
    assert!(h
        .compute
        .last_user_data()
        .unwrap()
        .contains("/dev/disk/by-id/scsi-0_Volume_existing"));
}

#[tokio::test]
async fn test_volume_wait_failure_marks_error_without_instance() {
    let h = harness().await;
    let ws = create_test_workspace(&h.store, "alice").await;
    h.compute.fail_on(ComputeFailure::VolumeCreateOp);

    let result = h.provisioner.run(&JobPayload::new(&ws.id, "alice")).await;

    assert!(matches!(result, Err(OrchestratorError::Provider(_))));
    assert!(result.unwrap_err().is_retryable());

    let detail = h.store.get_workspace_detail(&ws.id).await.unwrap().unwrap();
    assert_eq!(detail.workspace.status, WorkspaceStatus::Error);
    assert_eq!(detail.instance.unwrap().status, InstanceStatus::Stopped);

    let volume = detail.volume.unwrap();
    assert_eq!(volume.status, VolumeStatus::Error);
    assert!(volume.provider_volume_id.is_none());

    assert_eq!(h.compute.calls().instances_created, 0);
    assert_eq!(h.compute.instance_count(), 0);
}

#[tokio::test]
async fn test_mesh_timeout_unwinds_created_instance() {
    let h = harness_with(MockMesh::new(), settings()).await;
    let ws = create_test_workspace(&h.store, "alice").await;

    let result = h.provisioner.run(&JobPayload::new(&ws.id, "alice")).await;
    assert!(matches!(result, Err(OrchestratorError::Provider(_))));

    let calls = h.compute.calls();
    assert_eq!(calls.instances_created, 1);
    assert_eq!(calls.instances_deleted, 1);
    assert_eq!(h.compute.instance_count(), 0);

    // The volume holds user data and survives
    assert_eq!(calls.volumes_deleted, 0);
    let detail = h.store.get_workspace_detail(&ws.id).await.unwrap().unwrap();
    let volume_id = detail.volume.unwrap().provider_volume_id.unwrap();
    assert!(h.compute.volume(&volume_id).is_some());

    assert_eq!(detail.workspace.status, WorkspaceStatus::Error);
    let instance = detail.instance.unwrap();
    assert_eq!(instance.status, InstanceStatus::Stopped);
    assert!(instance.provider_instance_id.is_none());
}

#[tokio::test]
async fn test_instance_that_never_runs_is_compensated() {
    let h = harness().await;
    let ws = create_test_workspace(&h.store, "alice").await;
    h.compute.fail_on(ComputeFailure::InstanceNeverRuns);

    let result = h.provisioner.run(&JobPayload::new(&ws.id, "alice")).await;

    assert!(result.is_err());
    assert_eq!(h.compute.instance_count(), 0);
    assert_eq!(h.mesh.device_count(), 0);
}

#[tokio::test]
async fn test_wrong_owner_is_rejected_before_any_work() {
    let h = harness().await;
    let ws = create_test_workspace(&h.store, "alice").await;

    let result = h.provisioner.run(&JobPayload::new(&ws.id, "mallory")).await;

    match result {
        Err(e @ OrchestratorError::Unauthorized { .. }) => assert!(!e.is_retryable()),
        other => panic!("Expected Unauthorized, got {:?}", other),
    }

    let workspace = h.store.get_workspace(&ws.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Pending);
    assert_eq!(h.compute.calls().volumes_created, 0);
    assert!(h.mesh.credentials_issued().is_empty());
}

#[tokio::test]
async fn test_missing_workspace_is_fatal() {
    let h = harness().await;

    let result = h.provisioner.run(&JobPayload::new("missing", "alice")).await;

    match result {
        Err(e @ OrchestratorError::NotFound(_)) => assert!(!e.is_retryable()),
        other => panic!("Expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_second_run_reuses_live_instance() {
    let h = harness().await;
    let ws = create_test_workspace(&h.store, "alice").await;
    let job = JobPayload::new(&ws.id, "alice");

    let first = h.provisioner.run(&job).await.unwrap();
    let second = h.provisioner.run(&job).await.unwrap();

    assert!(!second.created_instance);
    assert!(!second.created_volume);
    assert_eq!(first.provider_instance_id, second.provider_instance_id);

    let calls = h.compute.calls();
    assert_eq!(calls.instances_created, 1);
    assert_eq!(calls.volumes_created, 1);
}

#[tokio::test]
async fn test_stale_mesh_device_is_replaced() {
    let h = harness().await;
    let ws = create_test_workspace(&h.store, "alice").await;
    let stale = h.mesh.register_device(&format!("ws-{}", ws.id));

    let outcome = h
        .provisioner
        .run(&JobPayload::new(&ws.id, "alice"))
        .await
        .unwrap();

    assert_eq!(h.mesh.deleted_devices(), vec![stale.id.clone()]);
    assert!(h.mesh.device(&stale.id).is_none());
    assert_eq!(outcome.mesh_ip, "100.64.0.2");
}

#[tokio::test]
async fn test_captured_credentials_are_injected() {
    let settings = ProvisionSettings {
        callback_url: Some("https://api.example.test/capture".to_string()),
        ..settings()
    };
    let h = harness_with(MockMesh::joining(), settings).await;
    let ws = create_test_workspace(&h.store, "alice").await;

    let token = h
        .credentials
        .issue_capture_token("alice", &ws.id, Duration::from_secs(60))
        .await
        .unwrap();
    h.credentials
        .redeem_capture_token(&token.token, "{\"refresh\":\"r-123\"}")
        .await
        .unwrap();

    h.provisioner
        .run(&JobPayload::new(&ws.id, "alice"))
        .await
        .unwrap();

    let user_data = h.compute.last_user_data().unwrap();
    assert!(user_data.contains(&STANDARD.encode("{\"refresh\":\"r-123\"}")));
    assert!(!user_data.contains("r-123"));

    let tokens: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM capture_tokens WHERE used_at IS NULL")
        .fetch_one(h.store.pool())
        .await
        .unwrap();
    assert_eq!(tokens, 1);
}
