use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "instagram".
    fn channel_id(&self) -> &str;

    /// Send a message to a specific user on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;
}
