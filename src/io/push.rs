//! Push-delivery provider
//!
//! `HttpPushProvider` talks JSON to a push gateway:
//! - `POST {endpoint}/send` - one token, answers `{"message_id": ..}`
//! - `POST {endpoint}/send-multicast` - up to `max_batch()` tokens, answers
//!   `{"responses": [{"success": bool, "message_id"?: .., "error"?: ..}]}`
//!   in token order
//!
//! A non-2xx multicast answer fails the whole batch.

use crate::domain::error::PushError;
use crate::infra::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Provider limit on tokens per multicast call
pub const MAX_MULTICAST_TOKENS: usize = 500;

/// Notification content shared by every recipient of one send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

/// Result for one token of a multicast call
#[derive(Debug, Clone, PartialEq)]
pub enum TokenOutcome {
    Delivered { message_id: String },
    Failed { reason: String },
}

impl TokenOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Largest token list `send_multicast` accepts
    fn max_batch(&self) -> usize {
        MAX_MULTICAST_TOKENS
    }

    /// Send to one device; returns the provider's message id
    async fn send(&self, token: &str, message: &PushMessage) -> Result<String, PushError>;

    /// Send to many devices; outcomes are in token order
    async fn send_multicast(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<Vec<TokenOutcome>, PushError>;
}

/// Android delivery options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AndroidConfig {
    pub priority: String,
    pub notification: AndroidNotification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AndroidNotification {
    pub sound: String,
    pub priority: String,
    pub channel_id: String,
}

/// APNs delivery options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApnsConfig {
    pub sound: String,
    pub badge: u32,
    pub content_available: bool,
}

impl Default for AndroidConfig {
    fn default() -> Self {
        Self {
            priority: "high".to_string(),
            notification: AndroidNotification {
                sound: "default".to_string(),
                priority: "high".to_string(),
                channel_id: "default-channel".to_string(),
            },
        }
    }
}

impl Default for ApnsConfig {
    fn default() -> Self {
        Self { sound: "default".to_string(), badge: 1, content_available: true }
    }
}

/// Body of `POST /send`
#[derive(Debug, Serialize, Deserialize)]
pub struct SendRequest {
    pub token: String,
    pub notification: PushMessage,
    pub android: AndroidConfig,
    pub apns: ApnsConfig,
}

/// Body of `POST /send-multicast`
#[derive(Debug, Serialize, Deserialize)]
pub struct MulticastRequest {
    pub tokens: Vec<String>,
    pub notification: PushMessage,
    pub android: AndroidConfig,
    pub apns: ApnsConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub message_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MulticastResponse {
    pub responses: Vec<WireOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<WireOutcome> for TokenOutcome {
    fn from(wire: WireOutcome) -> Self {
        if wire.success {
            TokenOutcome::Delivered { message_id: wire.message_id.unwrap_or_default() }
        } else {
            TokenOutcome::Failed { reason: wire.error.unwrap_or_else(|| "unknown".to_string()) }
        }
    }
}

/// Push gateway client authenticated with a server key
#[derive(Debug, Clone)]
pub struct HttpPushProvider {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
    timeout: Duration,
}

impl HttpPushProvider {
    pub fn new(endpoint: &str, server_key: &str, timeout: Duration) -> Result<Self, PushError> {
        if endpoint.is_empty() {
            return Err(PushError::NotInitialized("missing push endpoint".to_string()));
        }
        if server_key.is_empty() {
            return Err(PushError::NotInitialized("missing push server key".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PushError::NotInitialized(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            server_key: server_key.to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, PushError> {
        let endpoint = config
            .push_endpoint()
            .ok_or_else(|| PushError::NotInitialized("push.endpoint not set".to_string()))?;
        let server_key = config.push_server_key().ok_or_else(|| {
            PushError::NotInitialized("push.server_key / PUSH_SERVER_KEY not set".to_string())
        })?;
        Self::new(endpoint, server_key, config.push_timeout())
    }

    fn map_send_error(&self, e: reqwest::Error) -> PushError {
        if e.is_timeout() {
            PushError::Timeout(self.timeout.as_millis() as u64)
        } else {
            PushError::Transport(e.to_string())
        }
    }

    async fn post<B: Serialize + Sync, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, PushError> {
        let response = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .header("Authorization", format!("key={}", self.server_key))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(PushError::Rejected { status: status.as_u16(), message });
        }

        response.json::<R>().await.map_err(|e| self.map_send_error(e))
    }
}

#[async_trait]
impl PushProvider for HttpPushProvider {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<String, PushError> {
        let request = SendRequest {
            token: token.to_string(),
            notification: message.clone(),
            android: AndroidConfig::default(),
            apns: ApnsConfig::default(),
        };
        let response: SendResponse = self.post("/send", &request).await?;
        Ok(response.message_id)
    }

    async fn send_multicast(
        &self,
        tokens: &[String],
        message: &PushMessage,
    ) -> Result<Vec<TokenOutcome>, PushError> {
        if tokens.len() > self.max_batch() {
            return Err(PushError::Transport(format!(
                "batch of {} exceeds provider limit {}",
                tokens.len(),
                self.max_batch()
            )));
        }
        let request = MulticastRequest {
            tokens: tokens.to_vec(),
            notification: message.clone(),
            android: AndroidConfig::default(),
            apns: ApnsConfig::default(),
        };
        let response: MulticastResponse = self.post("/send-multicast", &request).await?;
        Ok(response.responses.into_iter().map(TokenOutcome::from).collect())
    }
}
