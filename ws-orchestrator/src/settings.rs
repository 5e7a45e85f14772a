use std::time::Duration;
use ws_provider::DeviceWait;

/// Deployment-wide knobs for provisioning instances.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub server_type: String,
    pub location: String,
    pub image: String,
    /// Mesh hostnames are `{hostname_prefix}{workspace_id}`.
    pub hostname_prefix: String,
    pub mesh_tags: Vec<String>,
    pub mesh_credential_ttl: Duration,
    pub mesh_wait: DeviceWait,
    pub capture_token_ttl: Duration,
    /// Endpoint instances report captured credentials to.
    pub callback_url: Option<String>,
    pub terminal_command: String,
    pub mount_path: String,
}

impl ProvisionSettings {
    pub fn mesh_hostname(&self, workspace_id: &str) -> String {
        format!("{}{}", self.hostname_prefix, workspace_id)
    }
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            server_type: "cx22".to_string(),
            location: "nbg1".to_string(),
            image: "ubuntu-24.04".to_string(),
            hostname_prefix: "ws-".to_string(),
            mesh_tags: vec!["tag:workspace".to_string()],
            mesh_credential_ttl: Duration::from_secs(60 * 60),
            mesh_wait: DeviceWait {
                timeout: Duration::from_secs(5 * 60),
                poll_interval: Duration::from_secs(5),
            },
            capture_token_ttl: Duration::from_secs(24 * 60 * 60),
            callback_url: None,
            terminal_command: "ttyd --writable --port 7681 --cwd /workspace bash".to_string(),
            mount_path: "/workspace".to_string(),
        }
    }
}
