use std::time::Duration;

use async_trait::async_trait;
use frame_sentinel_common::config::TelegramConfig;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// Telegram rejects photo captions longer than this many characters.
pub const MAX_CAPTION_CHARS: usize = 1024;

/// Delivers an alert image with a caption to a messaging channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `Ok(())` means the service accepted the message.
    async fn send(&self, jpeg: &[u8], caption: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request to messaging service failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("messaging service returned {status}: {description}")]
    Rejected { status: u16, description: String },
    #[error("messaging service did not answer within {0:?}")]
    Timeout(Duration),
}

/// Sends photos through the Telegram Bot API `sendPhoto` method.
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendPhoto", config.base_url, config.token),
            chat_id: config.chat_id.clone(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, jpeg: &[u8], caption: &str) -> Result<(), DeliveryError> {
        let photo = Part::bytes(jpeg.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", truncate_caption(caption).to_string())
            .part("photo", photo);

        debug!(chat_id = self.chat_id, bytes = jpeg.len(), "sending photo to Telegram");

        let response = self.client.post(&self.endpoint).multipart(form).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let description = serde_json::from_str::<TelegramReply>(&body)
            .ok()
            .and_then(|r| r.description)
            .unwrap_or(body);
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            description,
        })
    }
}

/// Cut `caption` to at most [`MAX_CAPTION_CHARS`] characters on a char boundary.
pub fn truncate_caption(caption: &str) -> &str {
    match caption.char_indices().nth(MAX_CAPTION_CHARS) {
        Some((idx, _)) => &caption[..idx],
        None => caption,
    }
}
