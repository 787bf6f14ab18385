//! Channel adapters for the relay.
//!
//! Adapters are pure I/O: they turn platform webhook payloads into
//! `InboundMessage`s and deliver `OutboundMessage`s back to the platform.

mod instagram;
mod traits;
mod types;

pub use instagram::{
    DEFAULT_GRAPH_API_BASE_URL, DEFAULT_GRAPH_API_VERSION, INSTAGRAM_CHANNEL_ID,
    INSTAGRAM_WEBHOOK_OBJECT, InstagramAdapter, InstagramEntry, InstagramMessage,
    InstagramMessagingEvent, InstagramParticipant, InstagramWebhookPayload, WebhookBatch,
    normalize_webhook,
};
pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, InboundMessage, InboundMessageKind, MessageId, OutboundMessage, SenderId,
};
