//! Message Gateway
//!
//! Sends rendered messages to the WhatsApp HTTP gateway. A send has three
//! outcomes: delivered to the provider, rejected by the provider, or a
//! transport failure before any acknowledgement. Rejections and transport
//! failures are both terminal for the record; the distinction only matters
//! for the error detail logged alongside it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Send failure classification.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The request never got a well-formed provider answer.
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider answered and refused the message.
    #[error("rejected by gateway: {0}")]
    Rejected(String),
}

/// Outbound message gateway.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Send one message. `media_url` attaches an image when present.
    async fn send(
        &self,
        phone: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<(), SendError>;
}

/// HTTP gateway configuration
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub api_url: String,
    pub api_key: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            api_url: "https://wasenderapi.com/api/send-message".to_string(),
            api_key: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    text: &'a str,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
    image_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    status: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

impl SendResponse {
    fn accepted(&self) -> bool {
        // Providers answer with either field; absence of both means accepted
        self.success.unwrap_or(true) && self.status.unwrap_or(true)
    }
}

/// Gateway client over the provider's REST API.
pub struct HttpGateway {
    config: HttpGatewayConfig,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl MessageGateway for HttpGateway {
    async fn send(
        &self,
        phone: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<(), SendError> {
        let payload = SendRequest {
            to: phone,
            text: body,
            image_url: media_url,
        };

        debug!(to = phone, "Sending message to gateway");

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(%status, "Gateway request failed: {}", error_body);
            return Err(SendError::Transport(format!(
                "HTTP {}: {}",
                status, error_body
            )));
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transport(format!("malformed response: {}", e)))?;

        if parsed.accepted() {
            Ok(())
        } else {
            let detail = parsed
                .message
                .unwrap_or_else(|| "no detail provided".to_string());
            warn!(to = phone, "Gateway rejected message: {}", detail);
            Err(SendError::Rejected(detail))
        }
    }
}
