use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, InboundMessageKind, OutboundMessage};
use anyhow::{Result, anyhow};
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const INSTAGRAM_CHANNEL_ID: &str = "instagram";
pub const INSTAGRAM_WEBHOOK_OBJECT: &str = "instagram";
pub const DEFAULT_GRAPH_API_BASE_URL: &str = "https://graph.facebook.com";
pub const DEFAULT_GRAPH_API_VERSION: &str = "v20.0";
const MESSAGING_TYPE_RESPONSE: &str = "RESPONSE";

/// Sends replies through the Graph API `me/messages` endpoint using a page
/// access token.
#[derive(Clone)]
pub struct InstagramAdapter {
    http: reqwest::Client,
    access_token: String,
    base_url: Url,
    api_version: String,
}

impl InstagramAdapter {
    pub fn new(access_token: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("instagram page access token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            base_url: parse_graph_base_url(DEFAULT_GRAPH_API_BASE_URL)?,
            api_version: DEFAULT_GRAPH_API_VERSION.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.base_url = parse_graph_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_api_version(mut self, api_version: &str) -> Result<Self> {
        let api_version = api_version.trim().trim_matches('/');
        if api_version.is_empty() {
            return Err(anyhow!("graph api version must not be empty"));
        }
        self.api_version = api_version.to_string();
        Ok(self)
    }

    fn messages_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("invalid graph API base URL: {}", self.base_url))?
            .pop_if_empty()
            .extend([self.api_version.as_str(), "me", "messages"]);
        Ok(url)
    }
}

fn parse_graph_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| anyhow!("invalid graph API URL {raw:?}: {e}"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(anyhow!("graph API URL must be http or https: {raw:?}"));
    }
    Ok(url)
}

#[async_trait::async_trait]
impl ChannelAdapter for InstagramAdapter {
    fn channel_id(&self) -> &str {
        INSTAGRAM_CHANNEL_ID
    }

    #[tracing::instrument(level = "info", skip_all, fields(recipient_id = %recipient_id))]
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (instagram-scoped user id) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let url = self.messages_url()?;
        let payload = InstagramSendRequest {
            recipient: InstagramParticipant { id: to.to_string() },
            message: InstagramSendMessage { text },
            messaging_type: MESSAGING_TYPE_RESPONSE,
        };

        let response = self
            .http
            .post(url)
            .query(&[("access_token", self.access_token.as_str())])
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "instagram send failed: status={} body={}",
                status,
                body
            ));
        }

        tracing::debug!(%status, "instagram message sent");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct InstagramSendRequest<'a> {
    recipient: InstagramParticipant,
    message: InstagramSendMessage<'a>,
    messaging_type: &'a str,
}

#[derive(Debug, Serialize)]
struct InstagramSendMessage<'a> {
    text: &'a str,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramWebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<InstagramEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub messaging: Vec<InstagramMessagingEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramMessagingEvent {
    #[serde(default)]
    pub sender: InstagramParticipant,
    #[serde(default)]
    pub recipient: Option<InstagramParticipant>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<InstagramMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramParticipant {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstagramMessage {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<serde_json::Value>,
}

/// Messages extracted from one webhook delivery, in payload order.
#[derive(Debug, Default)]
pub struct WebhookBatch {
    pub object_matched: bool,
    pub messages: Vec<InboundMessage>,
    /// Events that were skipped: echoes, non-message events, missing sender.
    pub ignored: usize,
}

/// Flatten `entry[].messaging[]` into inbound messages.
///
/// Payloads for any other `object` produce an empty batch. Order is preserved
/// and nothing is deduplicated.
pub fn normalize_webhook(payload: &InstagramWebhookPayload, expected_object: &str) -> WebhookBatch {
    if payload.object != expected_object {
        tracing::debug!(object = %payload.object, expected_object, "ignoring webhook for other object");
        return WebhookBatch::default();
    }

    let mut batch = WebhookBatch {
        object_matched: true,
        ..WebhookBatch::default()
    };
    for entry in &payload.entry {
        for event in &entry.messaging {
            match convert_messaging_event(event) {
                Some(inbound) => batch.messages.push(inbound),
                None => {
                    tracing::debug!(event = ?event, "ignoring non-message or echo webhook event");
                    batch.ignored += 1;
                }
            }
        }
    }
    batch
}

fn convert_messaging_event(event: &InstagramMessagingEvent) -> Option<InboundMessage> {
    let message = event.message.as_ref()?;
    if message.is_echo {
        return None;
    }
    let sender = event.sender.id.trim();
    if sender.is_empty() {
        return None;
    }

    let message_id = message
        .mid
        .as_deref()
        .map(str::trim)
        .filter(|mid| !mid.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| ulid::Ulid::new().to_string());
    let text = message.text.as_deref().filter(|text| !text.is_empty());
    let kind = if text.is_some() {
        InboundMessageKind::Text
    } else {
        InboundMessageKind::NonText
    };

    Some(InboundMessage {
        kind,
        message_id: message_id.into(),
        channel_id: INSTAGRAM_CHANNEL_ID.into(),
        sender_id: sender.into(),
        recipient_id: event
            .recipient
            .as_ref()
            .map(|r| r.id.trim())
            .filter(|id| !id.is_empty())
            .map(Into::into),
        content: text.unwrap_or_default().to_string(),
        metadata: serde_json::json!({
            "provider": "instagram",
            "timestamp": event.timestamp,
            "attachments": message.attachments.len(),
        }),
        received_at: Utc::now(),
    })
}
