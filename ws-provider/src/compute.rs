use async_trait::async_trait;

use crate::error::{ProviderError, Result};
use crate::types::{
    AsyncOp, CreateInstanceRequest, CreateVolumeRequest, Created, Instance, InstanceStatus,
    OpStatus, Volume,
};
use crate::wait::{poll_until, PollPolicy};

/// Contract of the compute/volume provider.
///
/// Mutating calls return an [`AsyncOp`]; callers decide whether to wait on it.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Get the name of the provider (e.g., "cloud", "mock").
    fn name(&self) -> &'static str;

    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Created<Volume>>;

    /// Look up a volume; `None` when the provider no longer knows it.
    async fn get_volume(&self, id: &str) -> Result<Option<Volume>>;

    async fn detach_volume(&self, id: &str) -> Result<AsyncOp>;

    async fn delete_volume(&self, id: &str) -> Result<()>;

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<Created<Instance>>;

    /// Look up an instance; `None` when it has been deleted.
    async fn get_instance(&self, id: &str) -> Result<Option<Instance>>;

    async fn delete_instance(&self, id: &str) -> Result<AsyncOp>;

    async fn get_operation(&self, id: &str) -> Result<AsyncOp>;

    /// Polling schedule used by the default wait helpers.
    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::default()
    }

    /// Wait until an operation succeeds; a failed operation is an error.
    async fn wait_for_op(&self, op_id: &str) -> Result<()> {
        let what = format!("operation {op_id}");
        poll_until(&what, self.poll_policy(), || async move {
            let op = self.get_operation(op_id).await?;
            match op.status {
                OpStatus::Success => Ok(Some(())),
                OpStatus::Running => Ok(None),
                OpStatus::Error => Err(ProviderError::OperationFailed {
                    id: op.id,
                    message: op.error.unwrap_or_else(|| "unknown error".to_string()),
                }),
            }
        })
        .await
    }

    /// Wait until the instance reports `status`.
    async fn wait_for_instance_status(&self, id: &str, status: InstanceStatus) -> Result<Instance> {
        let what = format!("instance {id} to become {status}");
        poll_until(&what, self.poll_policy(), || async move {
            match self.get_instance(id).await? {
                Some(instance) if instance.status == status => Ok(Some(instance)),
                Some(_) => Ok(None),
                None => Err(ProviderError::NotFound(format!("instance {id}"))),
            }
        })
        .await
    }
}
