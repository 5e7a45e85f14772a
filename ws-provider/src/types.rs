use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Running,
    Success,
    Error,
}

/// Handle to an asynchronous provider action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncOp {
    pub id: String,
    pub status: OpStatus,
    pub error: Option<String>,
}

/// A resource together with the action that creates it.
#[derive(Debug, Clone)]
pub struct Created<T> {
    pub resource: T,
    pub op: AsyncOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_gb: i64,
    /// Block device path on the instance the volume is attached to.
    pub device_path: Option<String>,
    /// Provider id of the instance the volume is attached to.
    pub attached_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Off,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Initializing => "initializing",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Off => "off",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub public_ipv4: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size_gb: i64,
    pub location: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub server_type: String,
    pub location: String,
    pub image: String,
    /// Boot configuration handed to the instance on first start.
    pub user_data: String,
    pub volume_ids: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AuthCredentialRequest {
    pub description: String,
    pub expiry_seconds: u64,
    pub ephemeral: bool,
    pub preauthorized: bool,
    pub reusable: bool,
    pub tags: Vec<String>,
}

/// Pre-authorized key an instance uses to join the mesh.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthCredential {
    pub id: String,
    pub key: String,
    pub expires_at: Option<DateTime<Utc>>,
}

// The key is a secret; keep it out of logs.
impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshDevice {
    pub id: String,
    pub hostname: String,
    /// Fully qualified mesh name, e.g. `ws-abc.tailnet.ts.net`.
    pub name: String,
    pub addresses: Vec<String>,
}

impl MeshDevice {
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        self.hostname == hostname || self.name.starts_with(&format!("{hostname}."))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceWait {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DeviceWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_instance_status_deserializes() {
        let status: InstanceStatus = serde_json::from_str("\"migrating\"").unwrap();
        assert_eq!(status, InstanceStatus::Unknown);
    }

    #[test]
    fn device_matches_short_or_qualified_hostname() {
        let device = MeshDevice {
            id: "d1".into(),
            hostname: "laptop".into(),
            name: "ws-abc.example.ts.net".into(),
            addresses: vec![],
        };
        assert!(device.matches_hostname("laptop"));
        assert!(device.matches_hostname("ws-abc"));
        assert!(!device.matches_hostname("ws-ab"));
    }

    #[test]
    fn credential_debug_redacts_key() {
        let credential = AuthCredential {
            id: "k1".into(),
            key: "tskey-secret".into(),
            expires_at: None,
        };
        assert!(!format!("{credential:?}").contains("tskey-secret"));
    }
}
