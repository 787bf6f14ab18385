//! Per-message pipeline: inbound text → assistant reply → platform send.
//!
//! Every qualifying message gets exactly one send attempt. Assistant failures
//! are mapped to the configured fallback text instead of propagating.

use crate::config::RepliesConfig;
use async_trait::async_trait;
use ig_assistant::{AssistantClient, AssistantError};
use ig_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use std::sync::Arc;

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, text: &str) -> ig_assistant::Result<String>;
}

#[async_trait]
impl ReplyGenerator for AssistantClient {
    async fn generate(&self, text: &str) -> ig_assistant::Result<String> {
        self.reply(text).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The assistant reply was delivered.
    Replied,
    /// The assistant failed and the fallback text was delivered.
    Fallback,
    /// The message had no text and the text-only notice was delivered.
    NonText,
    /// The send itself failed; nothing reached the user.
    SendFailed,
}

pub struct Relay {
    generator: Arc<dyn ReplyGenerator>,
    channel: Arc<dyn ChannelAdapter>,
    replies: RepliesConfig,
}

impl Relay {
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        channel: Arc<dyn ChannelAdapter>,
        replies: RepliesConfig,
    ) -> Self {
        Self {
            generator,
            channel,
            replies,
        }
    }

    pub async fn reply_for(&self, message: &InboundMessage) -> Result<String, AssistantError> {
        self.generator.generate(&message.content).await
    }

    /// Process messages one after another, in order.
    pub async fn handle_all(&self, messages: &[InboundMessage]) -> Vec<RelayOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(self.handle(message).await);
        }
        outcomes
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            channel = %message.channel_id,
            sender_id = %message.sender_id,
            message_id = %message.message_id,
        )
    )]
    pub async fn handle(&self, message: &InboundMessage) -> RelayOutcome {
        let (content, outcome) = if message.is_text() {
            tracing::info!(chars = message.content.chars().count(), "relaying message to assistant");
            let result = self.reply_for(message).await;
            reply_or_fallback(result, &self.replies.fallback_text)
        } else {
            tracing::info!("message has no text; sending text-only notice");
            (self.replies.non_text_text.clone(), RelayOutcome::NonText)
        };

        match self
            .channel
            .send(message.sender_id.as_str(), OutboundMessage::text(content))
            .await
        {
            Ok(()) => {
                tracing::info!(?outcome, "reply sent");
                outcome
            }
            Err(error) => {
                tracing::error!(%error, ?outcome, "reply send failed");
                RelayOutcome::SendFailed
            }
        }
    }
}

/// Map an assistant result to the text that should be sent.
///
/// Errors and blank replies both become `fallback`.
pub fn reply_or_fallback(
    result: Result<String, AssistantError>,
    fallback: &str,
) -> (String, RelayOutcome) {
    match result {
        Ok(reply) if !reply.trim().is_empty() => (reply, RelayOutcome::Replied),
        Ok(_) => {
            tracing::warn!("assistant returned a blank reply; using fallback");
            (fallback.to_string(), RelayOutcome::Fallback)
        }
        Err(error) => {
            tracing::error!(%error, "assistant reply failed; using fallback");
            (fallback.to_string(), RelayOutcome::Fallback)
        }
    }
}
