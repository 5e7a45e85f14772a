//! In-memory provider fakes with failure injection.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::compute::ComputeProvider;
use crate::error::{ProviderError, Result};
use crate::mesh::MeshProvider;
use crate::types::{
    AsyncOp, AuthCredential, AuthCredentialRequest, CreateInstanceRequest, CreateVolumeRequest,
    Created, Instance, InstanceStatus, MeshDevice, OpStatus, Volume,
};
use crate::wait::PollPolicy;

/// Compute calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeFailure {
    CreateVolume,
    /// The volume create action finishes with an error.
    VolumeCreateOp,
    GetVolume,
    DetachVolume,
    DeleteVolume,
    CreateInstance,
    /// The instance create action finishes with an error.
    InstanceCreateOp,
    /// The instance never reaches `running`.
    InstanceNeverRuns,
    GetInstance,
    DeleteInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshFailure {
    CreateCredential,
    Lookup,
    DeleteDevice,
}

/// Counters of mutating calls, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeCalls {
    pub volumes_created: usize,
    pub volumes_detached: usize,
    pub volumes_deleted: usize,
    pub instances_created: usize,
    pub instances_deleted: usize,
}

#[derive(Default)]
struct ComputeState {
    volumes: HashMap<String, Volume>,
    instances: HashMap<String, Instance>,
    ops: HashMap<String, AsyncOp>,
    failures: HashSet<ComputeFailure>,
    calls: ComputeCalls,
    last_user_data: Option<String>,
    next_id: u64,
}

impl ComputeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn op(&mut self, fails: bool) -> AsyncOp {
        let op = AsyncOp {
            id: self.next_id("op"),
            status: if fails { OpStatus::Error } else { OpStatus::Success },
            error: fails.then(|| "injected failure".to_string()),
        };
        self.ops.insert(op.id.clone(), op.clone());
        op
    }

    fn check(&self, failure: ComputeFailure) -> Result<()> {
        if self.failures.contains(&failure) {
            return Err(injected(format!("{failure:?}")));
        }
        Ok(())
    }
}

fn injected(what: String) -> ProviderError {
    ProviderError::Api {
        status: 500,
        message: format!("injected failure: {what}"),
    }
}

#[derive(Default)]
pub struct MockCompute {
    state: Mutex<ComputeState>,
}

impl MockCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, failure: ComputeFailure) {
        self.lock().failures.insert(failure);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Seed an existing volume.
    pub fn insert_volume(&self, volume: Volume) {
        self.lock().volumes.insert(volume.id.clone(), volume);
    }

    /// Seed an existing instance.
    pub fn insert_instance(&self, instance: Instance) {
        self.lock().instances.insert(instance.id.clone(), instance);
    }

    /// Delete an instance out-of-band, behind the orchestrator's back.
    pub fn remove_instance(&self, id: &str) {
        let mut state = self.lock();
        state.instances.remove(id);
        for volume in state.volumes.values_mut() {
            if volume.attached_to.as_deref() == Some(id) {
                volume.attached_to = None;
            }
        }
    }

    pub fn calls(&self) -> ComputeCalls {
        self.lock().calls.clone()
    }

    pub fn volume(&self, id: &str) -> Option<Volume> {
        self.lock().volumes.get(id).cloned()
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.lock().instances.get(id).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn last_user_data(&self) -> Option<String> {
        self.lock().last_user_data.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ComputeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ComputeProvider for MockCompute {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Created<Volume>> {
        let mut state = self.lock();
        state.check(ComputeFailure::CreateVolume)?;

        let volume = Volume {
            id: state.next_id("vol"),
            name: req.name.clone(),
            size_gb: req.size_gb,
            device_path: None,
            attached_to: None,
        };
        let fails = state.failures.contains(&ComputeFailure::VolumeCreateOp);
        let op = state.op(fails);
        let volume = Volume {
            device_path: Some(format!("/dev/disk/by-id/scsi-0_Volume_{}", volume.id)),
            ..volume
        };
        state.volumes.insert(volume.id.clone(), volume.clone());
        state.calls.volumes_created += 1;

        Ok(Created {
            resource: volume,
            op,
        })
    }

    async fn get_volume(&self, id: &str) -> Result<Option<Volume>> {
        let state = self.lock();
        state.check(ComputeFailure::GetVolume)?;
        Ok(state.volumes.get(id).cloned())
    }

    async fn detach_volume(&self, id: &str) -> Result<AsyncOp> {
        let mut state = self.lock();
        state.check(ComputeFailure::DetachVolume)?;

        let volume = state
            .volumes
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(format!("volume {id}")))?;
        volume.attached_to = None;
        state.calls.volumes_detached += 1;
        Ok(state.op(false))
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.check(ComputeFailure::DeleteVolume)?;

        if state.volumes.remove(id).is_none() {
            return Err(ProviderError::NotFound(format!("volume {id}")));
        }
        state.calls.volumes_deleted += 1;
        Ok(())
    }

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<Created<Instance>> {
        let mut state = self.lock();
        state.check(ComputeFailure::CreateInstance)?;

        let id = state.next_id("srv");
        let instance = Instance {
            id: id.clone(),
            name: req.name.clone(),
            status: InstanceStatus::Initializing,
            public_ipv4: Some(format!("203.0.113.{}", state.next_id % 250 + 1)),
        };
        for volume_id in &req.volume_ids {
            if let Some(volume) = state.volumes.get_mut(volume_id) {
                volume.attached_to = Some(id.clone());
            }
        }

        let fails = state.failures.contains(&ComputeFailure::InstanceCreateOp);
        let op = state.op(fails);
        state.instances.insert(id, instance.clone());
        state.last_user_data = Some(req.user_data.clone());
        state.calls.instances_created += 1;

        Ok(Created {
            resource: instance,
            op,
        })
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let mut state = self.lock();
        state.check(ComputeFailure::GetInstance)?;

        let never_runs = state.failures.contains(&ComputeFailure::InstanceNeverRuns);
        let Some(instance) = state.instances.get_mut(id) else {
            return Ok(None);
        };
        // Boots on first observation
        if instance.status == InstanceStatus::Initializing && !never_runs {
            instance.status = InstanceStatus::Running;
        }
        Ok(Some(instance.clone()))
    }

    async fn delete_instance(&self, id: &str) -> Result<AsyncOp> {
        let mut state = self.lock();
        state.check(ComputeFailure::DeleteInstance)?;

        if state.instances.remove(id).is_none() {
            return Err(ProviderError::NotFound(format!("instance {id}")));
        }
        for volume in state.volumes.values_mut() {
            if volume.attached_to.as_deref() == Some(id) {
                volume.attached_to = None;
            }
        }
        state.calls.instances_deleted += 1;
        Ok(state.op(false))
    }

    async fn get_operation(&self, id: &str) -> Result<AsyncOp> {
        self.lock()
            .ops
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("operation {id}")))
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct MeshState {
    devices: HashMap<String, MeshDevice>,
    failures: HashSet<MeshFailure>,
    credentials: Vec<AuthCredentialRequest>,
    deleted: Vec<String>,
    auto_join: bool,
    joined: usize,
    next_id: u64,
}

impl MeshState {
    fn check(&self, failure: MeshFailure) -> Result<()> {
        if self.failures.contains(&failure) {
            return Err(injected(format!("{failure:?}")));
        }
        Ok(())
    }

    fn register(&mut self, hostname: &str) -> MeshDevice {
        self.next_id += 1;
        let device = MeshDevice {
            id: format!("node-{}", self.next_id),
            hostname: hostname.to_string(),
            name: format!("{hostname}.mesh.test"),
            addresses: vec![
                format!("fd7a:115c:a1e0::{}", self.next_id),
                format!("100.64.0.{}", self.next_id),
            ],
        };
        self.devices.insert(device.id.clone(), device.clone());
        device
    }
}

#[derive(Default)]
pub struct MockMesh {
    state: Mutex<MeshState>,
}

impl MockMesh {
    /// A mesh where instances never join on their own.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mesh where each issued credential lets one looked-up hostname join,
    /// as an instance booting with that credential would.
    pub fn joining() -> Self {
        let mesh = Self::default();
        mesh.lock().auto_join = true;
        mesh
    }

    pub fn fail_on(&self, failure: MeshFailure) {
        self.lock().failures.insert(failure);
    }

    pub fn register_device(&self, hostname: &str) -> MeshDevice {
        self.lock().register(hostname)
    }

    pub fn device(&self, id: &str) -> Option<MeshDevice> {
        self.lock().devices.get(id).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn credentials_issued(&self) -> Vec<AuthCredentialRequest> {
        self.lock().credentials.clone()
    }

    pub fn deleted_devices(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MeshProvider for MockMesh {
    async fn create_auth_credential(&self, req: &AuthCredentialRequest) -> Result<AuthCredential> {
        let mut state = self.lock();
        state.check(MeshFailure::CreateCredential)?;

        state.credentials.push(req.clone());
        Ok(AuthCredential {
            id: format!("key-{}", state.credentials.len()),
            key: format!("mesh-auth-key-{}", state.credentials.len()),
            expires_at: Some(
                chrono::Utc::now() + chrono::Duration::seconds(req.expiry_seconds as i64),
            ),
        })
    }

    async fn get_device_by_hostname(&self, hostname: &str) -> Result<Option<MeshDevice>> {
        let mut state = self.lock();
        state.check(MeshFailure::Lookup)?;

        let found = state
            .devices
            .values()
            .find(|device| device.matches_hostname(hostname))
            .cloned();
        if found.is_none() && state.auto_join && state.joined < state.credentials.len() {
            state.joined += 1;
            return Ok(Some(state.register(hostname)));
        }
        Ok(found)
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.check(MeshFailure::DeleteDevice)?;

        state.devices.remove(id);
        state.deleted.push(id.to_string());
        Ok(())
    }
}
