//! Outbound message delivery.
//!
//! The HTTP client posts `{email, subject, message}` as JSON with an
//! `Idempotency-Key` header derived from the recipient and body, so a retried
//! call with identical content collapses to one send at the provider.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::metrics::MetricsCollector;

/// Header carrying the idempotency token.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Confirmation of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sent {
    pub timestamp: DateTime<Utc>,
}

/// Channel that delivers a single message.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Delivers `body` to `recipient`.
    ///
    /// Timeouts, transport failures and non-success responses all surface as
    /// `DeliveryError`.
    async fn send(&self, recipient: &str, subject: &str, body: &str)
        -> Result<Sent, DeliveryError>;
}

/// Idempotency token for a message: SHA-256 hex of the length-prefixed
/// recipient followed by the body.
pub fn idempotency_token(recipient: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((recipient.len() as u64).to_be_bytes());
    hasher.update(recipient.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    email: &'a str,
    subject: &'a str,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    status: String,
    #[serde(rename = "sentTime", default)]
    sent_time: Option<String>,
}

/// HTTP delivery client for the email service.
pub struct HttpDeliveryClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
    metrics: MetricsCollector,
}

impl HttpDeliveryClient {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.endpoint.clone(),
            timeout: config.timeout,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn failure(&self, recipient: &str, message: String) -> DeliveryError {
        warn!(recipient = recipient, error = %message, "Message delivery failed");
        DeliveryError(message)
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<Sent, DeliveryError> {
        let token = idempotency_token(recipient, body);
        let request = SendRequest {
            email: recipient,
            subject,
            message: body,
        };

        let started = Instant::now();
        let result = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header(IDEMPOTENCY_HEADER, &token)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await;
        self.metrics
            .record_delivery_latency(started.elapsed().as_secs_f64());

        let response = result.map_err(|e| {
            let message = if e.is_timeout() {
                format!("timed out after {:?}", self.timeout)
            } else {
                e.to_string()
            };
            self.failure(recipient, message)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.failure(
                recipient,
                format!("unexpected response status {}", status.as_u16()),
            ));
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| self.failure(recipient, format!("invalid response body: {}", e)))?;

        if parsed.status != "sent" {
            return Err(self.failure(
                recipient,
                format!("provider reported status '{}'", parsed.status),
            ));
        }

        let timestamp = parsed
            .sent_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        debug!(recipient = recipient, sent_at = %timestamp, "Message delivered");
        Ok(Sent { timestamp })
    }
}
