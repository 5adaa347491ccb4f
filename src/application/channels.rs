use crate::domain::models::ChannelType;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Retrying cannot help (bad recipient, rejected payload).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, recipient: &str, title: &str, message: &str) -> Result<(), DeliveryError>;

    /// Whether the channel needs an external address from the recipient directory.
    fn needs_recipient(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct TelegramChannel {
    client: Client,
    bot_token: String,
    api_base: String,
}

#[derive(Debug, serde::Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: String,
}

impl TelegramChannel {
    pub fn new(client: Client, bot_token: impl Into<String>) -> Self {
        Self {
            client,
            bot_token: bot_token.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn from_env(client: Client) -> Result<Self, InfraError> {
        let token = ["REMINDSYNC_TELEGRAM_BOT_TOKEN", "TELEGRAM_BOT_TOKEN"]
            .iter()
            .filter_map(|key| std::env::var(key).ok())
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
            .ok_or_else(|| {
                InfraError::InvalidConfig(
                    "missing telegram bot token (set one of: REMINDSYNC_TELEGRAM_BOT_TOKEN, TELEGRAM_BOT_TOKEN)"
                        .to_string(),
                )
            })?;
        Ok(Self::new(client, token))
    }

    fn classify(status: StatusCode, body: &str) -> DeliveryError {
        match status {
            StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => {
                DeliveryError::Permanent(format!("recipient unreachable: http {}; {body}", status.as_u16()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                DeliveryError::Transient(format!("rate limited: {body}"))
            }
            status if status.is_server_error() => {
                DeliveryError::Transient(format!("telegram unavailable: http {}", status.as_u16()))
            }
            status => DeliveryError::Permanent(format!("telegram rejected message: http {}; {body}", status.as_u16())),
        }
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send(&self, recipient: &str, title: &str, message: &str) -> Result<(), DeliveryError> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(DeliveryError::Permanent("recipient unreachable: empty chat id".to_string()));
        }
        let endpoint = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let request = SendMessageRequest {
            chat_id: recipient,
            text: format!("{title}\n{message}"),
        };

        let response = self
            .client
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|error| DeliveryError::Transient(format!("network error: {}", error.without_url())))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, &body))
    }
}

/// In-app notifications: the stored record is the notification itself.
#[derive(Debug, Clone, Default)]
pub struct SystemChannel;

#[async_trait]
impl DeliveryChannel for SystemChannel {
    async fn send(&self, _recipient: &str, _title: &str, _message: &str) -> Result<(), DeliveryError> {
        Ok(())
    }

    fn needs_recipient(&self) -> bool {
        false
    }
}

#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelType, Arc<dyn DeliveryChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel_type: ChannelType, channel: Arc<dyn DeliveryChannel>) -> Self {
        self.channels.insert(channel_type, channel);
        self
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn DeliveryChannel>> {
        self.channels.get(&channel_type).cloned()
    }
}
