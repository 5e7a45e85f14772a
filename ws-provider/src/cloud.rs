//! HTTP client for the compute/volume provider.
//!
//! Talks to a REST API shaped like common cloud providers: `/volumes`,
//! `/servers` and `/actions`, bearer-token authenticated, with every mutating
//! call returning an action that completes asynchronously.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::compute::ComputeProvider;
use crate::error::{check, check_found, ProviderError, Result};
use crate::types::{
    AsyncOp, CreateInstanceRequest, CreateVolumeRequest, Created, Instance, InstanceStatus,
    OpStatus, Volume,
};
use crate::wait::PollPolicy;

#[derive(Clone)]
pub struct CloudClient {
    http: Client,
    base_url: String,
    token: String,
    poll: PollPolicy,
}

impl CloudClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            poll: PollPolicy::default(),
        })
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_optional<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }
}

/// Provider ids are numeric on some APIs and strings on others.
fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

fn optional_id_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

// Wire types

#[derive(Deserialize)]
struct WireAction {
    #[serde(deserialize_with = "id_string")]
    id: String,
    status: OpStatus,
    #[serde(default)]
    error: Option<WireActionError>,
}

#[derive(Deserialize)]
struct WireActionError {
    message: String,
}

impl From<WireAction> for AsyncOp {
    fn from(action: WireAction) -> Self {
        Self {
            id: action.id,
            status: action.status,
            error: action.error.map(|e| e.message),
        }
    }
}

#[derive(Deserialize)]
struct WireVolume {
    #[serde(deserialize_with = "id_string")]
    id: String,
    name: String,
    size: i64,
    #[serde(default)]
    linux_device: Option<String>,
    #[serde(default, deserialize_with = "optional_id_string")]
    server: Option<String>,
}

impl From<WireVolume> for Volume {
    fn from(v: WireVolume) -> Self {
        Self {
            id: v.id,
            name: v.name,
            size_gb: v.size,
            device_path: v.linux_device,
            attached_to: v.server,
        }
    }
}

#[derive(Deserialize)]
struct WireServer {
    #[serde(deserialize_with = "id_string")]
    id: String,
    name: String,
    status: InstanceStatus,
    #[serde(default)]
    public_net: Option<WirePublicNet>,
}

#[derive(Deserialize)]
struct WirePublicNet {
    #[serde(default)]
    ipv4: Option<WireIp>,
}

#[derive(Deserialize)]
struct WireIp {
    ip: String,
}

impl From<WireServer> for Instance {
    fn from(s: WireServer) -> Self {
        Self {
            id: s.id,
            name: s.name,
            status: s.status,
            public_ipv4: s.public_net.and_then(|n| n.ipv4).map(|ip| ip.ip),
        }
    }
}

#[derive(Deserialize)]
struct VolumeEnvelope {
    volume: WireVolume,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: WireServer,
}

#[derive(Deserialize)]
struct ActionEnvelope {
    action: WireAction,
}

#[derive(Deserialize)]
struct CreateVolumeResponse {
    volume: WireVolume,
    action: WireAction,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: WireServer,
    action: WireAction,
}

#[derive(Serialize)]
struct CreateVolumeBody<'a> {
    name: &'a str,
    size: i64,
    location: &'a str,
    labels: &'a BTreeMap<String, String>,
    format: &'static str,
    automount: bool,
}

#[derive(Serialize)]
struct CreateServerBody<'a> {
    name: &'a str,
    server_type: &'a str,
    location: &'a str,
    image: &'a str,
    user_data: &'a str,
    volumes: &'a [String],
    labels: &'a BTreeMap<String, String>,
    automount: bool,
}

#[async_trait]
impl ComputeProvider for CloudClient {
    fn name(&self) -> &'static str {
        "cloud"
    }

    #[instrument(skip(self, req), fields(volume = %req.name, size_gb = req.size_gb))]
    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Created<Volume>> {
        let body = CreateVolumeBody {
            name: &req.name,
            size: req.size_gb,
            location: &req.location,
            labels: &req.labels,
            format: "ext4",
            automount: false,
        };

        let response = self
            .http
            .post(self.url("/volumes"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let created: CreateVolumeResponse = check(response).await?.json().await?;
        debug!(volume_id = %created.volume.id, "Volume create requested");

        Ok(Created {
            resource: created.volume.into(),
            op: created.action.into(),
        })
    }

    async fn get_volume(&self, id: &str) -> Result<Option<Volume>> {
        let envelope: Option<VolumeEnvelope> =
            self.get_optional(&format!("/volumes/{id}")).await?;
        Ok(envelope.map(|e| e.volume.into()))
    }

    async fn detach_volume(&self, id: &str) -> Result<AsyncOp> {
        let response = self
            .http
            .post(self.url(&format!("/volumes/{id}/actions/detach")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let envelope: ActionEnvelope = check(response).await?.json().await?;
        Ok(envelope.action.into())
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/volumes/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        check_found(response, format!("volume {id}")).await?;
        Ok(())
    }

    #[instrument(skip(self, req), fields(instance = %req.name, server_type = %req.server_type))]
    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<Created<Instance>> {
        let body = CreateServerBody {
            name: &req.name,
            server_type: &req.server_type,
            location: &req.location,
            image: &req.image,
            user_data: &req.user_data,
            volumes: &req.volume_ids,
            labels: &req.labels,
            automount: false,
        };

        let response = self
            .http
            .post(self.url("/servers"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let created: CreateServerResponse = check(response).await?.json().await?;
        debug!(instance_id = %created.server.id, "Instance create requested");

        Ok(Created {
            resource: created.server.into(),
            op: created.action.into(),
        })
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let envelope: Option<ServerEnvelope> =
            self.get_optional(&format!("/servers/{id}")).await?;
        Ok(envelope.map(|e| e.server.into()))
    }

    async fn delete_instance(&self, id: &str) -> Result<AsyncOp> {
        let response = self
            .http
            .delete(self.url(&format!("/servers/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let envelope: ActionEnvelope = check_found(response, format!("instance {id}"))
            .await?
            .json()
            .await?;
        Ok(envelope.action.into())
    }

    async fn get_operation(&self, id: &str) -> Result<AsyncOp> {
        let envelope: ActionEnvelope = self
            .get_optional(&format!("/actions/{id}"))
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("action {id}")))?;
        Ok(envelope.action.into())
    }

    fn poll_policy(&self) -> PollPolicy {
        self.poll
    }
}
