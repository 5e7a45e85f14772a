//! Forwarding of usage events to the payment processor

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::error::{MeteringError, Result};
use crate::event::EventType;

/// One usage event as the processor sees it.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSubmission {
    /// Lets the processor drop duplicates of a retried submission.
    pub idempotency_key: String,
    pub user_id: String,
    pub customer_id: Option<String>,
    pub event_type: EventType,
    pub quantity: i64,
    /// Unix seconds of the metered slot's recording.
    pub timestamp: i64,
}

#[async_trait]
pub trait MeteringProcessor: Send + Sync {
    async fn submit(&self, usage: &UsageSubmission) -> Result<()>;
}

/// Processor reached over HTTP with a bearer API key.
#[derive(Clone)]
pub struct HttpMeteringProcessor {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpMeteringProcessor {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl MeteringProcessor for HttpMeteringProcessor {
    async fn submit(&self, usage: &UsageSubmission) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/v1/meter_events", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &usage.idempotency_key)
            .json(usage)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(MeteringError::Processor {
            status: status.as_u16(),
            message,
        })
    }
}
