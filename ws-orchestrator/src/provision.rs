//! Provisioning state machine
//!
//! Brings a workspace from any resting state to `ready`: volume, instance and
//! mesh membership. Provider calls are sequential; anything created during a
//! run is remembered so a failed run can be unwound in reverse. Volumes are
//! never removed by compensation since they hold user data.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use ws_provider::{
    AuthCredentialRequest, ComputeProvider, CreateInstanceRequest, CreateVolumeRequest,
    InstanceStatus as ProviderInstanceStatus, MeshProvider, ProviderError,
};
use ws_queue::JobPayload;

use crate::boot::BootConfig;
use crate::credentials::CredentialStore;
use crate::error::{OrchestratorError, Result};
use crate::resources::{InstanceStatus, VolumeStatus, WorkspaceInstance};
use crate::settings::ProvisionSettings;
use crate::workspace::{WorkspaceDetail, WorkspaceStatus, WorkspaceStore};

/// Provider resources created by the current run, in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CreatedResource {
    Instance(String),
    MeshDevice(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub workspace_id: String,
    pub provider_volume_id: String,
    pub provider_instance_id: String,
    pub public_ip: Option<String>,
    pub mesh_ip: String,
    pub created_volume: bool,
    pub created_instance: bool,
}

pub struct Provisioner {
    store: WorkspaceStore,
    compute: Arc<dyn ComputeProvider>,
    mesh: Arc<dyn MeshProvider>,
    credentials: Arc<dyn CredentialStore>,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(
        store: WorkspaceStore,
        compute: Arc<dyn ComputeProvider>,
        mesh: Arc<dyn MeshProvider>,
        credentials: Arc<dyn CredentialStore>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            store,
            compute,
            mesh,
            credentials,
            settings,
        }
    }

    #[instrument(skip(self, job), fields(workspace_id = %job.workspace_id))]
    pub async fn run(&self, job: &JobPayload) -> Result<ProvisionOutcome> {
        let detail = self
            .store
            .get_workspace_detail(&job.workspace_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(job.workspace_id.clone()))?;

        if detail.workspace.user_id != job.user_id {
            return Err(OrchestratorError::Unauthorized {
                workspace_id: job.workspace_id.clone(),
                user_id: job.user_id.clone(),
            });
        }

        info!(provider = self.compute.name(), "Provisioning workspace");

        let mut created = Vec::new();
        match self.provision(job, detail, &mut created).await {
            Ok(outcome) => {
                info!(
                    instance = %outcome.provider_instance_id,
                    mesh_ip = %outcome.mesh_ip,
                    "Workspace ready"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "Provisioning failed, unwinding");
                self.handle_failure(&job.workspace_id, &created).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        job: &JobPayload,
        detail: WorkspaceDetail,
        created: &mut Vec<CreatedResource>,
    ) -> Result<ProvisionOutcome> {
        let workspace = &detail.workspace;
        let workspace_id = workspace.id.as_str();
        let hostname = self.settings.mesh_hostname(workspace_id);

        self.store
            .set_workspace_status(workspace_id, WorkspaceStatus::Provisioning)
            .await?;
        let instance_row = self.store.begin_instance(workspace_id).await?;

        let reusable = self.reusable_instance(job, &instance_row).await?;
        if reusable.is_none() {
            self.remove_stale_device(&hostname).await;
        }

        let mesh_key = self
            .mesh
            .create_auth_credential(&AuthCredentialRequest {
                description: format!("workspace {workspace_id}"),
                expiry_seconds: self.settings.mesh_credential_ttl.as_secs(),
                ephemeral: true,
                preauthorized: true,
                reusable: false,
                tags: self.settings.mesh_tags.clone(),
            })
            .await?;

        let (volume_id, created_volume) = self.ensure_volume(job, &detail, &hostname).await?;

        let volume = self
            .compute
            .get_volume(&volume_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("volume {volume_id}")))?;
        let volume_device = volume.device_path.ok_or_else(|| {
            OrchestratorError::InvalidState(format!("volume {volume_id} has no device path"))
        })?;

        let captured = self.credentials.load_captured(&workspace.user_id).await?;
        let capture_token = match &self.settings.callback_url {
            Some(_) => Some(
                self.credentials
                    .issue_capture_token(
                        &workspace.user_id,
                        workspace_id,
                        self.settings.capture_token_ttl,
                    )
                    .await?,
            ),
            None => None,
        };

        let user_data = BootConfig {
            hostname: &hostname,
            mesh_auth_key: &mesh_key.key,
            volume_device: &volume_device,
            mount_path: &self.settings.mount_path,
            credentials: captured.as_deref(),
            capture_token: capture_token.as_ref().map(|t| t.token.as_str()),
            callback_url: self.settings.callback_url.as_deref(),
            terminal_command: &self.settings.terminal_command,
            ssh_public_key: workspace.ssh_public_key.as_deref(),
        }
        .render()?;

        let (instance_id, mut public_ip, created_instance) = match reusable {
            Some((id, ip)) => (id, ip, false),
            None => {
                let new = self
                    .compute
                    .create_instance(&CreateInstanceRequest {
                        name: hostname.clone(),
                        server_type: self.settings.server_type.clone(),
                        location: self.settings.location.clone(),
                        image: self.settings.image.clone(),
                        user_data,
                        volume_ids: vec![volume_id.clone()],
                        labels: labels(workspace_id),
                    })
                    .await?;
                let instance = new.resource;
                created.push(CreatedResource::Instance(instance.id.clone()));

                self.store
                    .set_instance_provider(
                        workspace_id,
                        &instance.id,
                        instance.public_ipv4.as_deref(),
                    )
                    .await?;
                self.compute.wait_for_op(&new.op.id).await?;

                (instance.id, instance.public_ipv4, true)
            }
        };

        let running = self
            .compute
            .wait_for_instance_status(&instance_id, ProviderInstanceStatus::Running)
            .await?;
        if running.public_ipv4.is_some() && running.public_ipv4 != public_ip {
            public_ip = running.public_ipv4;
            self.store
                .set_instance_provider(workspace_id, &instance_id, public_ip.as_deref())
                .await?;
        }

        let device = self
            .mesh
            .wait_for_device(&hostname, self.settings.mesh_wait)
            .await?;
        if created_instance {
            created.push(CreatedResource::MeshDevice(device.id.clone()));
        }
        let mesh_ip = self.mesh.device_address(&device)?;

        self.store.mark_instance_running(workspace_id, &mesh_ip).await?;
        self.store
            .set_workspace_status(workspace_id, WorkspaceStatus::Ready)
            .await?;

        Ok(ProvisionOutcome {
            workspace_id: workspace_id.to_string(),
            provider_volume_id: volume_id,
            provider_instance_id: instance_id,
            public_ip,
            mesh_ip,
            created_volume,
            created_instance,
        })
    }

    /// Returns the provider volume id and whether it was created by this run.
    async fn ensure_volume(
        &self,
        job: &JobPayload,
        detail: &WorkspaceDetail,
        hostname: &str,
    ) -> Result<(String, bool)> {
        let workspace_id = detail.workspace.id.as_str();

        let row = match &detail.volume {
            Some(row) => row.clone(),
            None => {
                self.store
                    .create_volume_record(workspace_id, detail.workspace.storage_gb)
                    .await?
            }
        };

        if let Some(id) = row.provider_volume_id {
            info!(volume = %id, "Reusing volume");
            return Ok((id, false));
        }
        if let Some(id) = &job.volume_id {
            info!(volume = %id, "Adopting volume from job");
            self.store.mark_volume_available(workspace_id, id).await?;
            return Ok((id.clone(), false));
        }

        let new = self
            .compute
            .create_volume(&CreateVolumeRequest {
                name: format!("{hostname}-data"),
                size_gb: detail.workspace.storage_gb,
                location: self.settings.location.clone(),
                labels: labels(workspace_id),
            })
            .await;

        let new = match new {
            Ok(new) => new,
            Err(e) => {
                self.mark_volume_error(workspace_id).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.compute.wait_for_op(&new.op.id).await {
            self.mark_volume_error(workspace_id).await;
            return Err(e.into());
        }

        self.store
            .mark_volume_available(workspace_id, &new.resource.id)
            .await?;
        info!(volume = %new.resource.id, size_gb = new.resource.size_gb, "Volume created");

        Ok((new.resource.id, true))
    }

    async fn mark_volume_error(&self, workspace_id: &str) {
        if let Err(e) = self
            .store
            .set_volume_status(workspace_id, VolumeStatus::Error)
            .await
        {
            warn!(error = %e, "Failed to mark volume as errored");
        }
    }

    /// An instance recorded for the workspace (or carried by the job) that the
    /// provider still knows about.
    async fn reusable_instance(
        &self,
        job: &JobPayload,
        row: &WorkspaceInstance,
    ) -> Result<Option<(String, Option<String>)>> {
        let Some(id) = row
            .provider_instance_id
            .as_ref()
            .or(job.instance_id.as_ref())
        else {
            return Ok(None);
        };

        match self.compute.get_instance(id).await? {
            Some(instance) => {
                info!(instance = %instance.id, status = %instance.status, "Reusing instance");
                if row.provider_instance_id.is_none() {
                    self.store
                        .set_instance_provider(
                            &row.workspace_id,
                            &instance.id,
                            instance.public_ipv4.as_deref(),
                        )
                        .await?;
                }
                Ok(Some((instance.id, instance.public_ipv4)))
            }
            None => {
                info!(instance = %id, "Recorded instance no longer exists");
                Ok(None)
            }
        }
    }

    // A device left over from an earlier instance would shadow the new one.
    async fn remove_stale_device(&self, hostname: &str) {
        match self.mesh.get_device_by_hostname(hostname).await {
            Ok(Some(device)) => {
                info!(device = %device.id, "Removing stale mesh device");
                if let Err(e) = self.mesh.delete_device(&device.id).await {
                    warn!(device = %device.id, error = %e, "Failed to remove stale mesh device");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Stale mesh device lookup failed"),
        }
    }

    async fn handle_failure(&self, workspace_id: &str, created: &[CreatedResource]) {
        if let Err(e) = self
            .store
            .set_workspace_status(workspace_id, WorkspaceStatus::Error)
            .await
        {
            warn!(error = %e, "Failed to mark workspace as errored");
        }
        if let Err(e) = self
            .store
            .set_instance_status(workspace_id, InstanceStatus::Stopped)
            .await
        {
            warn!(error = %e, "Failed to mark instance as stopped");
        }

        let mut instance_removed = false;
        for resource in created.iter().rev() {
            match self.compensate(resource).await {
                Ok(()) => {
                    info!(?resource, "Compensated");
                    instance_removed |= matches!(resource, CreatedResource::Instance(_));
                }
                Err(e) => warn!(?resource, error = %e, "Compensation failed"),
            }
        }

        if instance_removed {
            if let Err(e) = self.store.mark_instance_stopped(workspace_id, true).await {
                warn!(error = %e, "Failed to clear removed instance");
            }
        }
    }

    async fn compensate(&self, resource: &CreatedResource) -> Result<()> {
        match resource {
            CreatedResource::MeshDevice(id) => self.mesh.delete_device(id).await?,
            CreatedResource::Instance(id) => {
                let op = self.compute.delete_instance(id).await?;
                self.compute.wait_for_op(&op.id).await?;
            }
        }
        Ok(())
    }
}

fn labels(workspace_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("managed-by".to_string(), "ws-orchestrator".to_string()),
        ("workspace".to_string(), workspace_id.to_string()),
    ])
}
