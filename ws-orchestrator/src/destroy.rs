//! Teardown of a workspace's compute resources
//!
//! Each provider step is guarded: a failing step is logged and the teardown
//! moves on, so a half-deleted workspace can always be torn down again. Only
//! database failures abort the run.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use ws_provider::{ComputeProvider, MeshProvider, ProviderError};
use ws_queue::JobPayload;

use crate::error::{OrchestratorError, Result};
use crate::resources::InstanceStatus;
use crate::settings::ProvisionSettings;
use crate::workspace::{WorkspaceDetail, WorkspaceStatus, WorkspaceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyOutcome {
    /// Compute released, volume and record kept.
    Suspended,
    /// Workspace record removed.
    Deleted,
    /// The workspace did not exist.
    AlreadyGone,
}

pub struct Destroyer {
    store: WorkspaceStore,
    compute: Arc<dyn ComputeProvider>,
    mesh: Arc<dyn MeshProvider>,
    settings: ProvisionSettings,
}

impl Destroyer {
    pub fn new(
        store: WorkspaceStore,
        compute: Arc<dyn ComputeProvider>,
        mesh: Arc<dyn MeshProvider>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            store,
            compute,
            mesh,
            settings,
        }
    }

    #[instrument(skip(self, job), fields(workspace_id = %job.workspace_id, delete = job.delete_record))]
    pub async fn run(&self, job: &JobPayload) -> Result<DestroyOutcome> {
        let Some(detail) = self.store.get_workspace_detail(&job.workspace_id).await? else {
            info!("Workspace already gone, cleaning up job resources");
            self.cleanup_orphans(job).await;
            return Ok(DestroyOutcome::AlreadyGone);
        };

        if detail.workspace.user_id != job.user_id {
            return Err(OrchestratorError::Unauthorized {
                workspace_id: job.workspace_id.clone(),
                user_id: job.user_id.clone(),
            });
        }

        match self.teardown(job, &detail).await {
            Ok(outcome) => {
                info!(?outcome, "Workspace torn down");
                Ok(outcome)
            }
            Err(e) => {
                if let Err(status_err) = self
                    .store
                    .set_workspace_status(&job.workspace_id, WorkspaceStatus::Error)
                    .await
                {
                    warn!(error = %status_err, "Failed to mark workspace as errored");
                }
                Err(e)
            }
        }
    }

    async fn teardown(&self, job: &JobPayload, detail: &WorkspaceDetail) -> Result<DestroyOutcome> {
        let workspace_id = detail.workspace.id.as_str();

        self.store
            .set_instance_status(workspace_id, InstanceStatus::Stopping)
            .await?;

        let instance_id = job.instance_id.clone().or_else(|| {
            detail
                .instance
                .as_ref()
                .and_then(|i| i.provider_instance_id.clone())
        });
        let volume_id = job.volume_id.clone().or_else(|| {
            detail
                .volume
                .as_ref()
                .and_then(|v| v.provider_volume_id.clone())
        });

        if let (Some(volume_id), Some(_)) = (&volume_id, &instance_id) {
            self.detach_volume(volume_id).await;
        }
        if let Some(instance_id) = &instance_id {
            self.delete_instance(instance_id).await;
        }
        self.remove_mesh_device(job.mesh_device_id.as_deref(), workspace_id)
            .await;

        if job.delete_record {
            if let Some(volume_id) = &volume_id {
                self.delete_volume(volume_id).await;
            }
            self.store.delete_workspace(workspace_id).await?;
            return Ok(DestroyOutcome::Deleted);
        }

        self.store.mark_instance_stopped(workspace_id, true).await?;
        self.store
            .set_workspace_status(workspace_id, WorkspaceStatus::Suspended)
            .await?;

        Ok(DestroyOutcome::Suspended)
    }

    /// Best-effort release of whatever provider ids the job still carries.
    async fn cleanup_orphans(&self, job: &JobPayload) {
        if let Some(instance_id) = &job.instance_id {
            self.delete_instance(instance_id).await;
        }
        self.remove_mesh_device(job.mesh_device_id.as_deref(), &job.workspace_id)
            .await;
        if job.delete_record {
            if let Some(volume_id) = &job.volume_id {
                self.delete_volume(volume_id).await;
            }
        }
    }

    async fn detach_volume(&self, volume_id: &str) {
        let result = async {
            match self.compute.get_volume(volume_id).await? {
                Some(volume) if volume.attached_to.is_some() => {
                    let op = self.compute.detach_volume(volume_id).await?;
                    self.compute.wait_for_op(&op.id).await?;
                    info!(volume = %volume_id, "Volume detached");
                }
                _ => {}
            }
            Ok::<(), ProviderError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(volume = %volume_id, error = %e, "Volume detach failed");
        }
    }

    async fn delete_instance(&self, instance_id: &str) {
        let result = async {
            if self.compute.get_instance(instance_id).await?.is_none() {
                info!(instance = %instance_id, "Instance already deleted");
                return Ok::<(), ProviderError>(());
            }
            let op = self.compute.delete_instance(instance_id).await?;
            self.compute.wait_for_op(&op.id).await?;
            info!(instance = %instance_id, "Instance deleted");
            Ok::<(), ProviderError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(instance = %instance_id, error = %e, "Instance deletion failed");
        }
    }

    async fn remove_mesh_device(&self, device_id: Option<&str>, workspace_id: &str) {
        let result = async {
            let device_id = match device_id {
                Some(id) => Some(id.to_string()),
                None => self
                    .mesh
                    .get_device_by_hostname(&self.settings.mesh_hostname(workspace_id))
                    .await?
                    .map(|device| device.id),
            };
            if let Some(id) = device_id {
                self.mesh.delete_device(&id).await?;
                info!(device = %id, "Mesh device removed");
            }
            Ok::<(), ProviderError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Mesh device removal failed");
        }
    }

    async fn delete_volume(&self, volume_id: &str) {
        match self.compute.delete_volume(volume_id).await {
            Ok(()) => info!(volume = %volume_id, "Volume deleted"),
            Err(ProviderError::NotFound(_)) => info!(volume = %volume_id, "Volume already deleted"),
            Err(e) => warn!(volume = %volume_id, error = %e, "Volume deletion failed"),
        }
    }
}
