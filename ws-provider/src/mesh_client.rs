//! HTTP client for the network-mesh coordination API

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{check, Result};
use crate::mesh::MeshProvider;
use crate::types::{AuthCredential, AuthCredentialRequest, MeshDevice};

#[derive(Clone)]
pub struct MeshClient {
    http: Client,
    base_url: String,
    tailnet: String,
    api_key: String,
}

impl MeshClient {
    pub fn new(
        base_url: impl Into<String>,
        tailnet: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tailnet: tailnet.into(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn list_devices(&self) -> Result<Vec<MeshDevice>> {
        let response = self
            .http
            .get(self.url(&format!("/tailnet/{}/devices", self.tailnet)))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let list: DeviceList = check(response).await?.json().await?;
        Ok(list.devices.into_iter().map(Into::into).collect())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody<'a> {
    capabilities: KeyCapabilities<'a>,
    expiry_seconds: u64,
    description: &'a str,
}

#[derive(Serialize)]
struct KeyCapabilities<'a> {
    devices: DeviceCapabilities<'a>,
}

#[derive(Serialize)]
struct DeviceCapabilities<'a> {
    create: CreateCapability<'a>,
}

#[derive(Serialize)]
struct CreateCapability<'a> {
    reusable: bool,
    ephemeral: bool,
    preauthorized: bool,
    tags: &'a [String],
}

#[derive(Deserialize)]
struct WireKey {
    id: String,
    key: String,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct DeviceList {
    devices: Vec<WireDevice>,
}

#[derive(Deserialize)]
struct WireDevice {
    id: String,
    hostname: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    addresses: Vec<String>,
}

impl From<WireDevice> for MeshDevice {
    fn from(d: WireDevice) -> Self {
        Self {
            id: d.id,
            hostname: d.hostname,
            name: d.name,
            addresses: d.addresses,
        }
    }
}

#[async_trait]
impl MeshProvider for MeshClient {
    #[instrument(skip(self, req), fields(description = %req.description))]
    async fn create_auth_credential(&self, req: &AuthCredentialRequest) -> Result<AuthCredential> {
        let body = CreateKeyBody {
            capabilities: KeyCapabilities {
                devices: DeviceCapabilities {
                    create: CreateCapability {
                        reusable: req.reusable,
                        ephemeral: req.ephemeral,
                        preauthorized: req.preauthorized,
                        tags: &req.tags,
                    },
                },
            },
            expiry_seconds: req.expiry_seconds,
            description: &req.description,
        };

        let response = self
            .http
            .post(self.url(&format!("/tailnet/{}/keys", self.tailnet)))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let key: WireKey = check(response).await?.json().await?;
        debug!(key_id = %key.id, "Mesh auth key issued");

        Ok(AuthCredential {
            id: key.id,
            key: key.key,
            expires_at: key.expires,
        })
    }

    async fn get_device_by_hostname(&self, hostname: &str) -> Result<Option<MeshDevice>> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .find(|device| device.matches_hostname(hostname)))
    }

    async fn delete_device(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/device/{id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        // Already removed (e.g. an ephemeral node that expired) counts as deleted
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}
