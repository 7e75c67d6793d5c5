//! Maps conversations to completion-service sessions and drives turns.
//!
//! Each (user, channel) pair owns at most one session for its lifetime and
//! at most one in-flight generation at a time. The in-memory index is
//! rebuilt from the store at startup so a restart never orphans a session.

use crate::page_config::PageSettings;
use crate::store::{ConvKey, ConversationState, ConversationStore};
use dashmap::DashMap;
use relay_llm::{
    AssistantBackend, AssistantError, EntryRole, PollConfig, RunOutcome, SessionId, await_run,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sent when the completion service cannot produce a reply in time.
pub const REPLY_RETRY: &str =
    "Sorry, something went wrong while processing your message. Please try again.";
/// Sent when the service echoes the user's text back verbatim.
pub const REPLY_REPHRASE: &str =
    "Sorry, I didn't quite understand your question. Could you ask it another way?";

pub struct SessionManager {
    backend: Arc<dyn AssistantBackend>,
    store: ConversationStore,
    conversations: DashMap<ConvKey, Arc<Mutex<ConversationState>>>,
    poll: PollConfig,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn AssistantBackend>, store: ConversationStore, poll: PollConfig) -> Self {
        Self {
            backend,
            store,
            conversations: DashMap::new(),
            poll,
        }
    }

    /// Rebuild the index from every stored conversation holding a session.
    /// The next inbound message then reuses the existing session instead of
    /// creating a fresh one.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let active = self.store.load_all_active().await?;
        let mut restored = 0usize;
        for state in active {
            let key = state.key();
            self.conversations
                .insert(key, Arc::new(Mutex::new(state)));
            restored += 1;
        }
        tracing::info!(restored, "conversation sessions restored from store");
        Ok(restored)
    }

    /// Fetch the conversation's shared state handle, consulting the store
    /// before falling back to a fresh in-memory default.
    pub async fn get_or_load(&self, key: &ConvKey) -> Arc<Mutex<ConversationState>> {
        if let Some(entry) = self.conversations.get(key) {
            return entry.clone();
        }

        let state = match self.store.load(key).await {
            Ok(Some(state)) => state,
            Ok(None) => ConversationState::new(key),
            Err(error) => {
                tracing::warn!(
                    %error,
                    user_id = %key.user_id,
                    channel_id = %key.channel_id,
                    "store load failed; starting from in-memory default"
                );
                ConversationState::new(key)
            }
        };

        // A concurrent loader may have won the race; keep whichever entry
        // landed first.
        self.conversations
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(state)))
            .clone()
    }

    /// Run one turn against the conversation's session and return the reply
    /// text. Failures degrade to a static retry message, never an error: by
    /// the time a turn is running, the user must receive *some* answer.
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %state.user_id, channel_id = %state.channel_id))]
    pub async fn run_turn(
        &self,
        state: &mut ConversationState,
        settings: &PageSettings,
        user_text: &str,
    ) -> String {
        let session = match self.ensure_session(state, settings).await {
            Some(session) => session,
            None => return REPLY_RETRY.to_string(),
        };

        // A crash or timeout may have left a generation in flight; never run
        // two against the same session.
        if let Some(run) = state.pending_run_id.take() {
            tracing::info!(%run, "awaiting leftover in-flight run before submitting");
            let outcome = await_run(self.backend.as_ref(), &session, &run, self.poll).await;
            tracing::debug!(?outcome, "leftover run settled");
        }

        let run = match self
            .backend
            .submit_turn(&session, &settings.assistant_id, user_text)
            .await
        {
            Ok(run) => run,
            Err(AssistantError::UnknownSession(stale)) => {
                // The service no longer knows the session (state
                // inconsistency): start fresh and resubmit once.
                tracing::warn!(%stale, "completion session vanished; creating a fresh one");
                state.ai_session_id = None;
                let Some(session) = self.ensure_session(state, settings).await else {
                    return REPLY_RETRY.to_string();
                };
                match self
                    .backend
                    .submit_turn(&session, &settings.assistant_id, user_text)
                    .await
                {
                    Ok(run) => run,
                    Err(error) => {
                        tracing::error!(%error, "turn submit failed after session recreate");
                        return REPLY_RETRY.to_string();
                    }
                }
            }
            Err(error) => {
                tracing::error!(%error, "turn submit failed");
                return REPLY_RETRY.to_string();
            }
        };
        state.pending_run_id = Some(run.clone());

        let session = match state.ai_session_id.clone() {
            Some(session) => session,
            None => return REPLY_RETRY.to_string(),
        };
        match await_run(self.backend.as_ref(), &session, &run, self.poll).await {
            RunOutcome::Completed(reply) => {
                state.pending_run_id = None;
                state.push_context(EntryRole::User, user_text);
                state.push_context(EntryRole::Assistant, reply.clone());
                if reply == user_text {
                    // The service occasionally parrots the input; that is a
                    // failed answer from the user's point of view.
                    REPLY_REPHRASE.to_string()
                } else {
                    reply
                }
            }
            RunOutcome::Failed(reason) => {
                tracing::warn!(%reason, "run failed; sending retry reply");
                state.pending_run_id = None;
                REPLY_RETRY.to_string()
            }
            RunOutcome::TimedOut => {
                tracing::warn!("run timed out; sending retry reply");
                state.pending_run_id = None;
                REPLY_RETRY.to_string()
            }
        }
    }

    /// Create the session on first use and persist the handle immediately,
    /// before awaiting any reply, so a crash mid-turn cannot orphan it.
    async fn ensure_session(
        &self,
        state: &mut ConversationState,
        settings: &PageSettings,
    ) -> Option<SessionId> {
        if let Some(session) = state.ai_session_id.clone() {
            return Some(session);
        }

        match self.backend.create_session().await {
            Ok(session) => {
                state.ai_session_id = Some(session.clone());
                if state.rolling_context.is_empty() && !settings.greeting.trim().is_empty() {
                    state.push_context(EntryRole::Assistant, settings.greeting.clone());
                }
                if let Err(error) = self.store.save(state).await {
                    tracing::warn!(%error, "failed to persist fresh session id; continuing turn");
                }
                Some(session)
            }
            Err(error) => {
                tracing::error!(%error, "session create failed");
                None
            }
        }
    }
}
