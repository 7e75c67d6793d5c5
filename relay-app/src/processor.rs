//! Orchestrates one flushed batch into one conversation turn.

use crate::gate::ResponseGate;
use crate::page_config::PageDirectory;
use crate::session::SessionManager;
use crate::store::{ConvKey, ConversationState, ConversationStore};
use anyhow::Result;
use chrono::Utc;
use relay_channels::{OutboundMessage, PlatformClient};
use std::sync::Arc;
use std::time::Duration;

/// Sent when a batch flushes with nothing usable in it.
pub const REPLY_NOT_UNDERSTOOD: &str =
    "I didn't understand your message. Please try sending a text message.";

#[derive(Debug, Clone, Copy)]
pub struct TurnTimeouts {
    pub send_timeout: Duration,
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
}

impl Default for TurnTimeouts {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(3),
            persist_attempts: 3,
            persist_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnResult {
    pub reply: Option<String>,
    pub delivered: bool,
}

pub struct TurnProcessor {
    store: ConversationStore,
    sessions: Arc<SessionManager>,
    gate: ResponseGate,
    platform: Arc<dyn PlatformClient>,
    pages: Arc<PageDirectory>,
    timeouts: TurnTimeouts,
}

impl TurnProcessor {
    pub fn new(
        store: ConversationStore,
        sessions: Arc<SessionManager>,
        gate: ResponseGate,
        platform: Arc<dyn PlatformClient>,
        pages: Arc<PageDirectory>,
        timeouts: TurnTimeouts,
    ) -> Self {
        Self {
            store,
            sessions,
            gate,
            platform,
            pages,
            timeouts,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %key.user_id, channel_id = %key.channel_id))]
    pub async fn process(&self, key: ConvKey, merged_text: String) -> Result<TurnResult> {
        let settings = self.pages.settings_for(&key.channel_id);
        let entry = self.sessions.get_or_load(&key).await;
        // Holding the lock for the whole turn is what serializes turns per
        // conversation; different conversations proceed in parallel.
        let mut state = entry.lock().await;

        let was_awaiting_handoff = state.awaiting_handoff;
        state.awaiting_handoff = false;
        state.last_message_text = merged_text.clone();
        state.last_message_at = Some(Utc::now());

        if merged_text.trim().is_empty() {
            let delivered = self.deliver(&key, REPLY_NOT_UNDERSTOOD).await;
            self.persist_in_background(state.clone());
            return Ok(TurnResult {
                reply: Some(REPLY_NOT_UNDERSTOOD.to_string()),
                delivered,
            });
        }

        if !self
            .gate
            .should_respond(&key.user_id, &key.channel_id, &settings, was_awaiting_handoff)
            .await
        {
            state.awaiting_handoff = true;
            self.persist_in_background(state.clone());
            tracing::info!("gate declined; conversation stays with the human team");
            return Ok(TurnResult {
                reply: None,
                delivered: false,
            });
        }

        state.turn_count += 1;
        if state.turn_count > settings.max_turns {
            let delivered = self.deliver(&key, &settings.end_message).await;
            state.turn_count = 0;
            self.persist_in_background(state.clone());
            tracing::info!(max_turns = settings.max_turns, "conversation cycle ended");
            return Ok(TurnResult {
                reply: Some(settings.end_message.clone()),
                delivered,
            });
        }

        let reply = self
            .sessions
            .run_turn(&mut state, &settings, &merged_text)
            .await;
        let delivered = self.deliver(&key, &reply).await;
        state.is_new = false;
        self.persist_in_background(state.clone());

        Ok(TurnResult {
            reply: Some(reply),
            delivered,
        })
    }

    /// Platform delivery under a short timeout. A failed send changes the
    /// observable outcome but never the turn's state bookkeeping.
    async fn deliver(&self, key: &ConvKey, text: &str) -> bool {
        let send = self.platform.send_message(
            &key.channel_id,
            &key.user_id,
            OutboundMessage::text(text),
        );
        match tokio::time::timeout(self.timeouts.send_timeout, send).await {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::error!(%error, "platform send failed");
                false
            }
            Err(_) => {
                tracing::error!(timeout = ?self.timeouts.send_timeout, "platform send timed out");
                false
            }
        }
    }

    /// Persist off the reply path: retried with exponential backoff, and
    /// abandoned with a log line once attempts run out. The reply has
    /// already been sent by the time this runs.
    fn persist_in_background(&self, state: ConversationState) {
        let store = self.store.clone();
        let attempts = self.timeouts.persist_attempts.max(1);
        let base_backoff = self.timeouts.persist_backoff;
        tokio::spawn(async move {
            for attempt in 1..=attempts {
                match store.save(&state).await {
                    Ok(()) => return,
                    Err(error) if attempt == attempts => {
                        tracing::error!(
                            %error,
                            attempts,
                            user_id = %state.user_id,
                            channel_id = %state.channel_id,
                            "giving up persisting conversation state"
                        );
                    }
                    Err(error) => {
                        let backoff = base_backoff * 2u32.saturating_pow(attempt - 1);
                        tracing::warn!(
                            %error,
                            attempt,
                            ?backoff,
                            "conversation persist failed; retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageConfig;
    use crate::page_config::DEFAULT_END_MESSAGE;
    use async_trait::async_trait;
    use relay_channels::{ChannelId, ConversationRef, PlatformMessage, UserId};
    use relay_llm::{
        AssistantBackend, PollConfig, Result as LlmResult, RunId, RunPoll, RunStatus, SessionId,
    };
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingPlatform {
        sent: StdMutex<Vec<String>>,
        history: Vec<PlatformMessage>,
    }

    #[async_trait]
    impl PlatformClient for RecordingPlatform {
        async fn send_message(
            &self,
            _channel_id: &ChannelId,
            _user_id: &UserId,
            message: OutboundMessage,
        ) -> Result<()> {
            self.sent.lock().expect("sent lock").push(message.text);
            Ok(())
        }

        async fn conversation_ref(
            &self,
            _channel_id: &ChannelId,
            _user_id: &UserId,
        ) -> Result<Option<ConversationRef>> {
            if self.history.is_empty() {
                Ok(None)
            } else {
                Ok(Some(ConversationRef::new("t_1")))
            }
        }

        async fn fetch_recent_messages(
            &self,
            _channel_id: &ChannelId,
            _conversation: &ConversationRef,
            _limit: usize,
        ) -> Result<Vec<PlatformMessage>> {
            Ok(self.history.clone())
        }
    }

    #[derive(Default)]
    struct CountingBackend {
        submits: AtomicUsize,
    }

    #[async_trait]
    impl AssistantBackend for CountingBackend {
        async fn create_session(&self) -> LlmResult<SessionId> {
            Ok(SessionId::new("thread_1"))
        }

        async fn submit_turn(
            &self,
            _session: &SessionId,
            _assistant_id: &str,
            _text: &str,
        ) -> LlmResult<RunId> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(RunId::new("run_1"))
        }

        async fn poll_run(&self, _session: &SessionId, _run: &RunId) -> LlmResult<RunPoll> {
            Ok(RunPoll {
                status: RunStatus::Completed,
                reply: Some("automated answer".to_string()),
            })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: ConversationStore,
        platform: Arc<RecordingPlatform>,
        backend: Arc<CountingBackend>,
        processor: TurnProcessor,
    }

    async fn harness(max_turns: u32) -> Harness {
        harness_with(max_turns, "", RecordingPlatform::default()).await
    }

    async fn harness_with(max_turns: u32, marker: &str, platform: RecordingPlatform) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConversationStore::open(dir.path().join("conversations.db"))
            .await
            .expect("open store");
        let platform = Arc::new(platform);
        let backend = Arc::new(CountingBackend::default());
        let sessions = Arc::new(SessionManager::new(
            backend.clone(),
            store.clone(),
            PollConfig::default(),
        ));
        let pages = Arc::new(PageDirectory::from_config(&[PageConfig {
            channel_id: "page-1".to_string(),
            access_token: "token".to_string(),
            assistant_id: "asst_1".to_string(),
            marker_text: marker.to_string(),
            greeting: String::new(),
            max_turns: Some(max_turns),
            end_message: None,
        }]));
        let processor = TurnProcessor::new(
            store.clone(),
            sessions,
            ResponseGate::new(platform.clone()),
            platform.clone(),
            pages,
            TurnTimeouts::default(),
        );
        Harness {
            _dir: dir,
            store,
            platform,
            backend,
            processor,
        }
    }

    fn key() -> ConvKey {
        ConvKey::new("user-1", "page-1")
    }

    #[tokio::test]
    async fn merged_turn_is_processed_once_and_counted() {
        let h = harness(10).await;
        let result = h
            .processor
            .process(key(), "hi there".to_string())
            .await
            .expect("turn");

        assert_eq!(result.reply.as_deref(), Some("automated answer"));
        assert!(result.delivered);
        assert_eq!(h.backend.submits.load(Ordering::SeqCst), 1);

        let entry = h.processor.sessions.get_or_load(&key()).await;
        let state = entry.lock().await;
        assert_eq!(state.turn_count, 1);
        assert!(!state.is_new);
        assert_eq!(state.last_message_text, "hi there");
    }

    #[tokio::test]
    async fn exceeding_max_turns_sends_end_message_without_ai_call() {
        let h = harness(10).await;
        {
            let entry = h.processor.sessions.get_or_load(&key()).await;
            entry.lock().await.turn_count = 10;
        }

        let result = h
            .processor
            .process(key(), "one more".to_string())
            .await
            .expect("turn");

        assert_eq!(result.reply.as_deref(), Some(DEFAULT_END_MESSAGE));
        assert_eq!(h.backend.submits.load(Ordering::SeqCst), 0);

        let entry = h.processor.sessions.get_or_load(&key()).await;
        let state = entry.lock().await;
        assert_eq!(state.turn_count, 0);
        assert!(!state.awaiting_handoff);
    }

    #[tokio::test]
    async fn empty_batch_gets_the_fallback_reply() {
        let h = harness(10).await;
        let result = h
            .processor
            .process(key(), "   ".to_string())
            .await
            .expect("turn");

        assert_eq!(result.reply.as_deref(), Some(REPLY_NOT_UNDERSTOOD));
        assert_eq!(h.backend.submits.load(Ordering::SeqCst), 0);
        let sent = h.platform.sent.lock().expect("sent lock").clone();
        assert_eq!(sent, vec![REPLY_NOT_UNDERSTOOD.to_string()]);
    }

    #[tokio::test]
    async fn gate_refusal_hands_off_without_a_reply() {
        let platform = RecordingPlatform {
            sent: StdMutex::new(Vec::new()),
            history: vec![PlatformMessage {
                sender_id: UserId::new("page-1"),
                text: "an agent will reach out shortly".to_string(),
                created_at: None,
            }],
        };
        let h = harness_with(10, "welcome aboard", platform).await;

        let result = h
            .processor
            .process(key(), "any update?".to_string())
            .await
            .expect("turn");

        assert!(result.reply.is_none());
        assert!(!result.delivered);
        assert_eq!(h.backend.submits.load(Ordering::SeqCst), 0);
        assert!(h.platform.sent.lock().expect("sent lock").is_empty());

        let entry = h.processor.sessions.get_or_load(&key()).await;
        let state = entry.lock().await;
        assert!(state.awaiting_handoff);
        assert_eq!(state.turn_count, 0);
        assert_eq!(state.last_message_text, "any update?");
    }

    #[tokio::test]
    async fn state_reaches_the_store_after_a_turn() {
        let h = harness(10).await;
        h.processor
            .process(key(), "hello".to_string())
            .await
            .expect("turn");

        // Background persist; poll briefly for it to land.
        let mut persisted = None;
        for _ in 0..50 {
            if let Some(state) = h.store.load(&key()).await.expect("load") {
                persisted = Some(state);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let persisted = persisted.expect("state persisted in background");
        assert_eq!(persisted.turn_count, 1);
        assert_eq!(persisted.ai_session_id, Some(SessionId::new("thread_1")));
    }
}
