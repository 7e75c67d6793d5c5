use crate::traits::PlatformClient;
use crate::types::{ChannelId, ConversationRef, OutboundMessage, PlatformMessage, UserId};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";
const CONVERSATION_SCAN_LIMIT: usize = 5;

/// Facebook Graph API client for Messenger pages. One instance serves every
/// configured page; each page authenticates with its own access token.
#[derive(Clone)]
pub struct MessengerClient {
    http: reqwest::Client,
    page_tokens: HashMap<ChannelId, String>,
}

impl MessengerClient {
    pub fn new(page_tokens: HashMap<ChannelId, String>) -> Result<Self> {
        if page_tokens.is_empty() {
            return Err(anyhow!("at least one page access token is required"));
        }
        for (channel_id, token) in &page_tokens {
            if token.trim().is_empty() {
                return Err(anyhow!("page {channel_id} has an empty access token"));
            }
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, page_tokens })
    }

    fn token_for(&self, channel_id: &ChannelId) -> Result<&str> {
        self.page_tokens
            .get(channel_id)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no access token configured for page {channel_id}"))
    }

    async fn scan_conversations(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        platform: &str,
    ) -> Result<Option<ConversationRef>> {
        let token = self.token_for(channel_id)?;
        let response = self
            .http
            .get(format!("{GRAPH_API_BASE}/me/conversations"))
            .query(&[
                ("platform", platform),
                ("fields", "participants"),
                ("limit", &CONVERSATION_SCAN_LIMIT.to_string()),
                ("access_token", token),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "conversation lookup failed: platform={platform} status={status} body={body}"
            ));
        }
        let parsed: ConversationsResponse = serde_json::from_str(&body)?;
        Ok(find_participant_conversation(user_id, &parsed))
    }
}

#[async_trait::async_trait]
impl PlatformClient for MessengerClient {
    #[tracing::instrument(level = "info", skip_all, fields(channel_id = %channel_id, user_id = %user_id))]
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
        message: OutboundMessage,
    ) -> Result<()> {
        let text = message.text.trim();
        if text.is_empty() {
            return Err(anyhow!("message text is empty"));
        }
        let token = self.token_for(channel_id)?;

        let payload = serde_json::json!({
            "recipient": { "id": user_id.as_str() },
            "messaging_type": "RESPONSE",
            "message": { "text": text },
        });
        let response = self
            .http
            .post(format!("{GRAPH_API_BASE}/{channel_id}/messages"))
            .query(&[("access_token", token)])
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "messenger send failed: status={status} body={body}"
            ));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(channel_id = %channel_id, user_id = %user_id))]
    async fn conversation_ref(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<Option<ConversationRef>> {
        // A page's inbox spans both surfaces; a user found on neither has no
        // conversation yet.
        for platform in ["messenger", "instagram"] {
            match self.scan_conversations(channel_id, user_id, platform).await {
                Ok(Some(conversation)) => return Ok(Some(conversation)),
                Ok(None) => {}
                Err(error) if platform == "messenger" => {
                    tracing::warn!(%error, "messenger conversation scan failed; trying instagram");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(channel_id = %channel_id, conversation = %conversation))]
    async fn fetch_recent_messages(
        &self,
        channel_id: &ChannelId,
        conversation: &ConversationRef,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>> {
        let token = self.token_for(channel_id)?;
        let response = self
            .http
            .get(format!("{GRAPH_API_BASE}/{conversation}/messages"))
            .query(&[
                ("fields", "message,from,created_time"),
                ("limit", &limit.to_string()),
                ("access_token", token),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "message history fetch failed: status={status} body={body}"
            ));
        }
        let parsed: MessagesResponse = serde_json::from_str(&body)?;
        Ok(parsed
            .data
            .into_iter()
            .map(|m| PlatformMessage {
                sender_id: UserId::new(m.from.map(|f| f.id).unwrap_or_default()),
                text: m.message.unwrap_or_default(),
                created_at: m.created_time.as_deref().and_then(parse_graph_time),
            })
            .collect())
    }
}

fn find_participant_conversation(
    user_id: &UserId,
    response: &ConversationsResponse,
) -> Option<ConversationRef> {
    for conversation in &response.data {
        let participants = &conversation.participants.data;
        if participants.iter().any(|p| p.id == user_id.as_str()) {
            return Some(ConversationRef::new(conversation.id.clone()));
        }
    }
    None
}

/// Graph timestamps look like `2024-05-05T12:34:56+0000`.
fn parse_graph_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
struct ConversationsResponse {
    #[serde(default)]
    data: Vec<ConversationObject>,
}

#[derive(Debug, Deserialize)]
struct ConversationObject {
    id: String,
    #[serde(default)]
    participants: ParticipantList,
}

#[derive(Debug, Default, Deserialize)]
struct ParticipantList {
    #[serde(default)]
    data: Vec<ParticipantObject>,
}

#[derive(Debug, Deserialize)]
struct ParticipantObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    from: Option<SenderObject>,
    #[serde(default)]
    created_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SenderObject {
    id: String,
}
