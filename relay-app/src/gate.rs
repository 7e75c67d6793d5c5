//! Should-respond decision for a (user, channel) pair.
//!
//! A channel may configure a marker text that the page sends to
//! automation-eligible conversations (ad-originated leads). If recent
//! channel-sent history carries the marker, automation answers; if the
//! marker is configured but absent, a human team owns the conversation and
//! the relay stays silent.

use crate::page_config::PageSettings;
use relay_channels::{ChannelId, PlatformClient, UserId};
use std::sync::Arc;
use unicode_normalization::UnicodeNormalization;

/// How many of the channel's most recent messages are scanned for the marker.
pub const GATE_HISTORY_LIMIT: usize = 4;

pub struct ResponseGate {
    platform: Arc<dyn PlatformClient>,
}

impl ResponseGate {
    pub fn new(platform: Arc<dyn PlatformClient>) -> Self {
        Self { platform }
    }

    /// `was_awaiting_handoff` is the stored flag from before this message
    /// arrived; it only matters when the live history lookup fails, where the
    /// default is to respond unless the store unambiguously says a human has
    /// the conversation.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user_id, channel_id = %channel_id))]
    pub async fn should_respond(
        &self,
        user_id: &UserId,
        channel_id: &ChannelId,
        settings: &PageSettings,
        was_awaiting_handoff: bool,
    ) -> bool {
        let marker = settings.marker_text.trim();
        if marker.is_empty() {
            return true;
        }

        let conversation = match self.platform.conversation_ref(channel_id, user_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                // No platform history at all: a new lead, answer it.
                tracing::debug!("no conversation on platform; treating as new lead");
                return true;
            }
            Err(error) => {
                tracing::warn!(%error, "conversation lookup failed; defaulting by stored handoff flag");
                return !was_awaiting_handoff;
            }
        };

        let history = match self
            .platform
            .fetch_recent_messages(channel_id, &conversation, GATE_HISTORY_LIMIT)
            .await
        {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(%error, "history fetch failed; defaulting by stored handoff flag");
                return !was_awaiting_handoff;
            }
        };

        let responded = history
            .iter()
            .filter(|message| message.sender_id.as_str() == channel_id.as_str())
            .take(GATE_HISTORY_LIMIT)
            .any(|message| contains_marker(&message.text, marker));
        if !responded {
            tracing::info!("marker absent from recent channel messages; deferring to human team");
        }
        responded
    }
}

/// Substring check in both raw and NFC-normalized form. Accented and Arabic
/// text arrives in composed or decomposed form depending on the sending
/// client, so a byte-wise comparison alone misses real matches.
fn contains_marker(message: &str, marker: &str) -> bool {
    if message.contains(marker) {
        return true;
    }
    let message: String = message.nfc().collect();
    let marker: String = marker.nfc().collect();
    message.contains(&marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use relay_channels::{ConversationRef, OutboundMessage, PlatformMessage};

    struct FakePlatform {
        conversation: Result<Option<ConversationRef>, String>,
        history: Result<Vec<PlatformMessage>, String>,
    }

    impl FakePlatform {
        fn with_history(history: Vec<PlatformMessage>) -> Self {
            Self {
                conversation: Ok(Some(ConversationRef::new("t_1"))),
                history: Ok(history),
            }
        }
    }

    #[async_trait]
    impl PlatformClient for FakePlatform {
        async fn send_message(
            &self,
            _channel_id: &ChannelId,
            _user_id: &UserId,
            _message: OutboundMessage,
        ) -> Result<()> {
            Ok(())
        }

        async fn conversation_ref(
            &self,
            _channel_id: &ChannelId,
            _user_id: &UserId,
        ) -> Result<Option<ConversationRef>> {
            self.conversation
                .clone()
                .map_err(|e| anyhow::anyhow!("{e}"))
        }

        async fn fetch_recent_messages(
            &self,
            _channel_id: &ChannelId,
            _conversation: &ConversationRef,
            _limit: usize,
        ) -> Result<Vec<PlatformMessage>> {
            self.history.clone().map_err(|e| anyhow::anyhow!("{e}"))
        }
    }

    fn channel_message(text: &str) -> PlatformMessage {
        PlatformMessage {
            sender_id: UserId::new("page-1"),
            text: text.to_string(),
            created_at: None,
        }
    }

    fn user_message(text: &str) -> PlatformMessage {
        PlatformMessage {
            sender_id: UserId::new("user-1"),
            text: text.to_string(),
            created_at: None,
        }
    }

    fn settings(marker: &str) -> PageSettings {
        PageSettings {
            marker_text: marker.to_string(),
            ..PageSettings::default()
        }
    }

    async fn decide(platform: FakePlatform, marker: &str, was_awaiting: bool) -> bool {
        let gate = ResponseGate::new(Arc::new(platform));
        gate.should_respond(
            &UserId::new("user-1"),
            &ChannelId::new("page-1"),
            &settings(marker),
            was_awaiting,
        )
        .await
    }

    #[tokio::test]
    async fn empty_marker_always_responds() {
        let platform = FakePlatform {
            conversation: Err("should not be called".to_string()),
            history: Err("should not be called".to_string()),
        };
        assert!(decide(platform, "", false).await);
    }

    #[tokio::test]
    async fn new_lead_without_conversation_responds() {
        let platform = FakePlatform {
            conversation: Ok(None),
            history: Ok(vec![]),
        };
        assert!(decide(platform, "welcome aboard", false).await);
    }

    #[tokio::test]
    async fn marker_in_channel_history_responds() {
        let platform = FakePlatform::with_history(vec![
            user_message("hi"),
            channel_message("welcome aboard! how can we help?"),
        ]);
        assert!(decide(platform, "welcome aboard", false).await);
    }

    #[tokio::test]
    async fn marker_only_counts_when_channel_sent_it() {
        let platform = FakePlatform::with_history(vec![
            user_message("welcome aboard"),
            channel_message("our agent will reach out shortly"),
        ]);
        assert!(!decide(platform, "welcome aboard", false).await);
    }

    #[tokio::test]
    async fn marker_absent_defers_to_human_team() {
        let platform = FakePlatform::with_history(vec![
            channel_message("thanks for reaching out"),
            channel_message("an agent will call you"),
            channel_message("anything else?"),
            channel_message("have a good day"),
        ]);
        assert!(!decide(platform, "welcome aboard", false).await);
    }

    #[tokio::test]
    async fn normalized_marker_matches_decomposed_text() {
        // "é" composed in the marker, decomposed (e + combining acute) in
        // the message.
        let platform =
            FakePlatform::with_history(vec![channel_message("bienvenue a bord, d\u{0065}\u{0301}marrons")]);
        assert!(decide(platform, "d\u{00e9}marrons", false).await);
    }

    #[tokio::test]
    async fn lookup_failure_favors_responding() {
        let platform = FakePlatform {
            conversation: Err("graph api down".to_string()),
            history: Err("graph api down".to_string()),
        };
        assert!(decide(platform, "welcome aboard", false).await);
    }

    #[tokio::test]
    async fn lookup_failure_stays_silent_when_already_handed_off() {
        let platform = FakePlatform {
            conversation: Err("graph api down".to_string()),
            history: Err("graph api down".to_string()),
        };
        assert!(!decide(platform, "welcome aboard", true).await);
    }
}
