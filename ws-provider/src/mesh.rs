use async_trait::async_trait;

use crate::error::{ProviderError, Result};
use crate::types::{AuthCredential, AuthCredentialRequest, DeviceWait, MeshDevice};
use crate::wait::{poll_until, PollPolicy};

/// Contract of the private network-mesh provider.
#[async_trait]
pub trait MeshProvider: Send + Sync {
    async fn create_auth_credential(&self, req: &AuthCredentialRequest) -> Result<AuthCredential>;

    async fn get_device_by_hostname(&self, hostname: &str) -> Result<Option<MeshDevice>>;

    async fn delete_device(&self, id: &str) -> Result<()>;

    /// Mesh-internal address of a device, preferring IPv4.
    fn device_address(&self, device: &MeshDevice) -> Result<String> {
        device
            .addresses
            .iter()
            .find(|addr| addr.contains('.'))
            .or_else(|| device.addresses.first())
            .cloned()
            .ok_or_else(|| ProviderError::NoAddress(device.hostname.clone()))
    }

    /// Wait for an instance to join the mesh under `hostname`.
    async fn wait_for_device(&self, hostname: &str, wait: DeviceWait) -> Result<MeshDevice> {
        let what = format!("mesh device {hostname}");
        let policy = PollPolicy::fixed(wait.poll_interval, wait.timeout);
        poll_until(&what, policy, || async move {
            self.get_device_by_hostname(hostname).await
        })
        .await
    }
}
