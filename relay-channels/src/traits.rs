use crate::types::{ChannelId, ConversationRef, OutboundMessage, PlatformMessage, UserId};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Deliver a message to a user on behalf of a channel.
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        message: OutboundMessage,
    ) -> Result<()>;

    /// Resolve the platform conversation holding this (user, channel) pair.
    /// `None` means the platform has no conversation yet (a truly new lead).
    async fn conversation_ref(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<Option<ConversationRef>>;

    /// Most-recent-first slice of a conversation's history.
    async fn fetch_recent_messages(
        &self,
        channel_id: &ChannelId,
        conversation: &ConversationRef,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>>;
}
