//! Outbound delivery adapters

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use concierge_core::gateway::{DeliveryGateway, DeliveryReceipt};

/// Replies longer than this are cut before sending
const MAX_MESSAGE_SIZE: usize = 10_240;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    to: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<&'a str>,
    sent_at: String,
}

fn truncate(text: &str) -> &str {
    if text.len() <= MAX_MESSAGE_SIZE {
        return text;
    }
    let mut end = MAX_MESSAGE_SIZE;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Delivers replies as JSON POSTs to a provider webhook
pub struct WebhookDelivery {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for WebhookDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDelivery")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(anyhow!("Webhook delivery URL is empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            url,
            token: token.filter(|t| !t.is_empty()),
            client,
        })
    }
}

#[async_trait]
impl DeliveryGateway for WebhookDelivery {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, address: &str, text: &str, attribution: Option<&str>) -> Result<DeliveryReceipt> {
        let payload = WebhookPayload {
            to: address,
            text: truncate(text),
            agent: attribution,
            sent_at: Utc::now().to_rfc3339(),
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Webhook request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Webhook rejected delivery to {}: HTTP {}", address, status);
            return Ok(DeliveryReceipt::failed(format!("HTTP {}", status)));
        }

        debug!("Delivered {} chars to {} via webhook", payload.text.len(), address);
        Ok(DeliveryReceipt::delivered())
    }
}

/// Writes replies to the log instead of sending them
#[derive(Debug, Default)]
pub struct LogDelivery;

#[async_trait]
impl DeliveryGateway for LogDelivery {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, address: &str, text: &str, attribution: Option<&str>) -> Result<DeliveryReceipt> {
        info!(
            "Reply to {} from {}: {}",
            address,
            attribution.unwrap_or("unknown agent"),
            truncate(text)
        );
        Ok(DeliveryReceipt::delivered())
    }
}
