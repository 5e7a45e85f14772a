//! Destroy state machine against in-memory providers

use std::sync::Arc;
use std::time::Duration;
use ws_orchestrator::test_utils::{create_test_db, create_test_workspace};
use ws_orchestrator::{
    DestroyOutcome, Destroyer, InstanceStatus, OrchestratorError, ProvisionOutcome,
    ProvisionSettings, Provisioner, SqlCredentialStore, WorkspaceStatus, WorkspaceStore,
};
use ws_provider::mock::{ComputeFailure, MockCompute, MockMesh};
use ws_provider::{DeviceWait, Instance, InstanceStatus as ProviderInstanceStatus};
use ws_queue::JobPayload;

struct Harness {
    store: WorkspaceStore,
    compute: Arc<MockCompute>,
    mesh: Arc<MockMesh>,
    provisioner: Provisioner,
    destroyer: Destroyer,
}

async fn harness() -> Harness {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let compute = Arc::new(MockCompute::new());
    let mesh = Arc::new(MockMesh::joining());
    let settings = ProvisionSettings {
        mesh_wait: DeviceWait {
            timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        },
        ..ProvisionSettings::default()
    };

    let provisioner = Provisioner::new(
        store.clone(),
        compute.clone(),
        mesh.clone(),
        Arc::new(SqlCredentialStore::new(pool, None)),
        settings.clone(),
    );
    let destroyer = Destroyer::new(store.clone(), compute.clone(), mesh.clone(), settings);

    Harness {
        store,
        compute,
        mesh,
        provisioner,
        destroyer,
    }
}

async fn provisioned(h: &Harness) -> (String, ProvisionOutcome) {
    let ws = create_test_workspace(&h.store, "alice").await;
    let outcome = h
        .provisioner
        .run(&JobPayload::new(&ws.id, "alice"))
        .await
        .expect("provisioning should succeed");
    (ws.id, outcome)
}

#[tokio::test]
async fn test_destroy_suspends_and_keeps_volume() {
    let h = harness().await;
    let (ws_id, provisioned) = provisioned(&h).await;
    assert_eq!(h.mesh.device_count(), 1);

    let outcome = h
        .destroyer
        .run(&JobPayload::new(&ws_id, "alice"))
        .await
        .unwrap();
    assert_eq!(outcome, DestroyOutcome::Suspended);

    let detail = h.store.get_workspace_detail(&ws_id).await.unwrap().unwrap();
    assert_eq!(detail.workspace.status, WorkspaceStatus::Suspended);

    let instance = detail.instance.unwrap();
    assert_eq!(instance.status, InstanceStatus::Stopped);
    assert!(instance.stopped_at.is_some());
    assert!(instance.provider_instance_id.is_none());
    assert!(instance.public_ip.is_none());
    assert!(instance.mesh_ip.is_none());

    let calls = h.compute.calls();
    assert_eq!(calls.volumes_detached, 1);
    assert_eq!(calls.instances_deleted, 1);
    assert_eq!(calls.volumes_deleted, 0);
    assert_eq!(h.compute.instance_count(), 0);
    assert_eq!(h.mesh.device_count(), 0);

    let volume = h.compute.volume(&provisioned.provider_volume_id).unwrap();
    assert!(volume.attached_to.is_none());
    assert_eq!(
        detail.volume.unwrap().provider_volume_id,
        Some(provisioned.provider_volume_id)
    );
}

#[tokio::test]
async fn test_destroy_with_instance_already_gone() {
    let h = harness().await;
    let (ws_id, provisioned) = provisioned(&h).await;

    h.compute.remove_instance(&provisioned.provider_instance_id);

    let outcome = h
        .destroyer
        .run(&JobPayload::new(&ws_id, "alice"))
        .await
        .expect("destroy should tolerate a missing instance");

    assert_eq!(outcome, DestroyOutcome::Suspended);
    assert_eq!(h.compute.calls().instances_deleted, 0);
    assert_eq!(h.mesh.device_count(), 0);
    assert_eq!(h.mesh.deleted_devices().len(), 1);

    let workspace = h.store.get_workspace(&ws_id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Suspended);
}

#[tokio::test]
async fn test_destroy_with_delete_removes_record_and_volume() {
    let h = harness().await;
    let (ws_id, provisioned) = provisioned(&h).await;

    let mut job = JobPayload::new(&ws_id, "alice");
    job.delete_record = true;

    let outcome = h.destroyer.run(&job).await.unwrap();

    assert_eq!(outcome, DestroyOutcome::Deleted);
    assert!(h.store.find_workspace(&ws_id).await.unwrap().is_none());
    assert!(h.store.get_volume(&ws_id).await.unwrap().is_none());
    assert!(h.store.get_instance(&ws_id).await.unwrap().is_none());
    assert!(h.compute.volume(&provisioned.provider_volume_id).is_none());
    assert_eq!(h.compute.calls().volumes_deleted, 1);
}

#[tokio::test]
async fn test_destroy_missing_workspace_cleans_job_resources() {
    let h = harness().await;
    h.compute.insert_instance(Instance {
        id: "srv-orphan".to_string(),
        name: "ws-gone".to_string(),
        status: ProviderInstanceStatus::Running,
        public_ipv4: None,
    });
    let device = h.mesh.register_device("ws-gone");

    let mut job = JobPayload::new("gone", "alice");
    job.instance_id = Some("srv-orphan".to_string());
    job.mesh_device_id = Some(device.id.clone());

    let outcome = h.destroyer.run(&job).await.unwrap();

    assert_eq!(outcome, DestroyOutcome::AlreadyGone);
    assert!(h.compute.instance("srv-orphan").is_none());
    assert_eq!(h.mesh.deleted_devices(), vec![device.id]);
}

#[tokio::test]
async fn test_destroy_rejects_wrong_owner() {
    let h = harness().await;
    let (ws_id, _) = provisioned(&h).await;

    let result = h.destroyer.run(&JobPayload::new(&ws_id, "mallory")).await;

    assert!(matches!(
        result,
        Err(OrchestratorError::Unauthorized { .. })
    ));
    assert_eq!(h.compute.instance_count(), 1);

    let workspace = h.store.get_workspace(&ws_id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Ready);
}

#[tokio::test]
async fn test_provider_failures_do_not_abort_teardown() {
    let h = harness().await;
    let (ws_id, _) = provisioned(&h).await;

    h.compute.fail_on(ComputeFailure::DetachVolume);
    h.compute.fail_on(ComputeFailure::DeleteInstance);

    let outcome = h
        .destroyer
        .run(&JobPayload::new(&ws_id, "alice"))
        .await
        .unwrap();

    assert_eq!(outcome, DestroyOutcome::Suspended);
    // The mesh step still ran
    assert_eq!(h.mesh.device_count(), 0);
}

#[tokio::test]
async fn test_destroy_then_provision_again() {
    let h = harness().await;
    let (ws_id, first) = provisioned(&h).await;
    let job = JobPayload::new(&ws_id, "alice");

    h.destroyer.run(&job).await.unwrap();
    let second = h.provisioner.run(&job).await.unwrap();

    assert!(second.created_instance);
    assert!(!second.created_volume);
    assert_eq!(second.provider_volume_id, first.provider_volume_id);
    assert_ne!(second.provider_instance_id, first.provider_instance_id);

    let workspace = h.store.get_workspace(&ws_id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Ready);
}
