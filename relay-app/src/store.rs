//! Durable conversation state, one row per (user, channel) pair.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relay_channels::{ChannelId, UserId};
use relay_llm::{ContextEntry, EntryRole, RunId, SessionId};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Rolling context keeps this many entries; older ones are dropped first.
pub const CONTEXT_WINDOW: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvKey {
    pub user_id: UserId,
    pub channel_id: ChannelId,
}

impl ConvKey {
    pub fn new(user_id: impl Into<UserId>, channel_id: impl Into<ChannelId>) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub turn_count: u32,
    pub ai_session_id: Option<SessionId>,
    pub pending_run_id: Option<RunId>,
    pub rolling_context: Vec<ContextEntry>,
    pub last_message_text: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub awaiting_handoff: bool,
    pub is_new: bool,
}

impl ConversationState {
    pub fn new(key: &ConvKey) -> Self {
        Self {
            user_id: key.user_id.clone(),
            channel_id: key.channel_id.clone(),
            turn_count: 0,
            ai_session_id: None,
            pending_run_id: None,
            rolling_context: Vec::new(),
            last_message_text: String::new(),
            last_message_at: None,
            awaiting_handoff: false,
            is_new: true,
        }
    }

    pub fn key(&self) -> ConvKey {
        ConvKey {
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
        }
    }

    /// Append one entry, dropping from the front once the window is full.
    pub fn push_context(&mut self, role: EntryRole, content: impl Into<String>) {
        self.rolling_context.push(ContextEntry {
            role,
            content: content.into(),
        });
        if self.rolling_context.len() > CONTEXT_WINDOW {
            let excess = self.rolling_context.len() - CONTEXT_WINDOW;
            self.rolling_context.drain(..excess);
        }
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create store directory {}", parent.display()))?;
            }
            let conn = open_conversation_db(&path)?;
            ensure_schema(&conn)?;
            Ok::<_, anyhow::Error>(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn load(&self, key: &ConvKey) -> Result<Option<ConversationState>> {
        let conn = self.conn.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
            let row = conn
                .prepare_cached(
                    r#"
SELECT user_id, channel_id, turn_count, ai_session_id, pending_run_id,
       rolling_context, last_message_text, last_message_at,
       awaiting_handoff, is_new
  FROM conversations
 WHERE user_id = ?1
   AND channel_id = ?2
"#,
                )?
                .query_row(
                    params![key.user_id.as_str(), key.channel_id.as_str()],
                    row_to_state,
                )
                .optional()?;
            row.transpose()
        })
        .await?
    }

    pub async fn save(&self, state: &ConversationState) -> Result<()> {
        let conn = self.conn.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || {
            let rolling_context = serde_json::to_string(&state.rolling_context)?;
            let conn = conn.lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
            conn.prepare_cached(
                r#"
INSERT INTO conversations (
    user_id, channel_id, turn_count, ai_session_id, pending_run_id,
    rolling_context, last_message_text, last_message_at,
    awaiting_handoff, is_new, updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, CURRENT_TIMESTAMP)
ON CONFLICT(user_id, channel_id) DO UPDATE
SET turn_count = excluded.turn_count,
    ai_session_id = excluded.ai_session_id,
    pending_run_id = excluded.pending_run_id,
    rolling_context = excluded.rolling_context,
    last_message_text = excluded.last_message_text,
    last_message_at = excluded.last_message_at,
    awaiting_handoff = excluded.awaiting_handoff,
    is_new = excluded.is_new,
    updated_at = CURRENT_TIMESTAMP
"#,
            )?
            .execute(params![
                state.user_id.as_str(),
                state.channel_id.as_str(),
                state.turn_count,
                state.ai_session_id.as_ref().map(|s| s.as_str()),
                state.pending_run_id.as_ref().map(|r| r.as_str()),
                rolling_context,
                state.last_message_text,
                state.last_message_at.map(|t| t.to_rfc3339()),
                state.awaiting_handoff,
                state.is_new,
            ])?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    /// Every conversation holding a live completion-service session. Used to
    /// rebuild the in-memory index on process start.
    pub async fn load_all_active(&self) -> Result<Vec<ConversationState>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
            let mut stmt = conn.prepare_cached(
                r#"
SELECT user_id, channel_id, turn_count, ai_session_id, pending_run_id,
       rolling_context, last_message_text, last_message_at,
       awaiting_handoff, is_new
  FROM conversations
 WHERE ai_session_id IS NOT NULL
"#,
            )?;
            let rows = stmt.query_map([], row_to_state)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok::<_, anyhow::Error>(out)
        })
        .await?
    }
}

fn open_conversation_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open conversation db {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 15_000)?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS conversations (
    user_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    turn_count INTEGER NOT NULL,
    ai_session_id TEXT,
    pending_run_id TEXT,
    rolling_context TEXT NOT NULL,
    last_message_text TEXT NOT NULL,
    last_message_at TEXT,
    awaiting_handoff INTEGER NOT NULL,
    is_new INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (user_id, channel_id)
)
"#,
        [],
    )?;
    Ok(())
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ConversationState>> {
    let user_id: String = row.get(0)?;
    let channel_id: String = row.get(1)?;
    let turn_count: u32 = row.get(2)?;
    let ai_session_id: Option<String> = row.get(3)?;
    let pending_run_id: Option<String> = row.get(4)?;
    let rolling_context: String = row.get(5)?;
    let last_message_text: String = row.get(6)?;
    let last_message_at: Option<String> = row.get(7)?;
    let awaiting_handoff: bool = row.get(8)?;
    let is_new: bool = row.get(9)?;

    Ok(decode_state(
        user_id,
        channel_id,
        turn_count,
        ai_session_id,
        pending_run_id,
        rolling_context,
        last_message_text,
        last_message_at,
        awaiting_handoff,
        is_new,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_state(
    user_id: String,
    channel_id: String,
    turn_count: u32,
    ai_session_id: Option<String>,
    pending_run_id: Option<String>,
    rolling_context: String,
    last_message_text: String,
    last_message_at: Option<String>,
    awaiting_handoff: bool,
    is_new: bool,
) -> Result<ConversationState> {
    let rolling_context: Vec<ContextEntry> = serde_json::from_str(&rolling_context)
        .with_context(|| format!("decode rolling context for user {user_id}"))?;
    let last_message_at = last_message_at
        .as_deref()
        .map(DateTime::parse_from_rfc3339)
        .transpose()
        .with_context(|| format!("decode last_message_at for user {user_id}"))?
        .map(|t| t.with_timezone(&Utc));

    Ok(ConversationState {
        user_id: UserId::new(user_id),
        channel_id: ChannelId::new(channel_id),
        turn_count,
        ai_session_id: ai_session_id.map(SessionId::new),
        pending_run_id: pending_run_id.map(RunId::new),
        rolling_context,
        last_message_text,
        last_message_at,
        awaiting_handoff,
        is_new,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConversationStore::open(dir.path().join("conversations.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let (_dir, store) = temp_store().await;
        let key = ConvKey::new("user-1", "page-1");
        let mut state = ConversationState::new(&key);
        state.turn_count = 3;
        state.ai_session_id = Some(SessionId::new("thread_1"));
        state.pending_run_id = Some(RunId::new("run_9"));
        state.push_context(EntryRole::User, "hi");
        state.push_context(EntryRole::Assistant, "hello!");
        state.last_message_text = "hi".to_string();
        state.last_message_at = Some(Utc::now());
        state.is_new = false;

        store.save(&state).await.expect("save");
        let loaded = store
            .load(&key)
            .await
            .expect("load")
            .expect("state present");

        assert_eq!(loaded.turn_count, 3);
        assert_eq!(loaded.ai_session_id, Some(SessionId::new("thread_1")));
        assert_eq!(loaded.pending_run_id, Some(RunId::new("run_9")));
        assert_eq!(loaded.rolling_context.len(), 2);
        assert_eq!(loaded.rolling_context[0].content, "hi");
        assert!(!loaded.is_new);
        assert!(loaded.last_message_at.is_some());
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let (_dir, store) = temp_store().await;
        let key = ConvKey::new("user-1", "page-1");
        let mut state = ConversationState::new(&key);
        store.save(&state).await.expect("insert");
        state.turn_count = 7;
        store.save(&state).await.expect("update");

        let loaded = store
            .load(&key)
            .await
            .expect("load")
            .expect("state present");
        assert_eq!(loaded.turn_count, 7);
    }

    #[tokio::test]
    async fn load_all_active_skips_sessionless_rows() {
        let (_dir, store) = temp_store().await;

        let mut with_session = ConversationState::new(&ConvKey::new("user-1", "page-1"));
        with_session.ai_session_id = Some(SessionId::new("thread_1"));
        store.save(&with_session).await.expect("save");

        let without_session = ConversationState::new(&ConvKey::new("user-2", "page-1"));
        store.save(&without_session).await.expect("save");

        let active = store.load_all_active().await.expect("load all");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, UserId::new("user-1"));
    }

    #[tokio::test]
    async fn missing_row_loads_as_none() {
        let (_dir, store) = temp_store().await;
        let loaded = store
            .load(&ConvKey::new("nobody", "page-1"))
            .await
            .expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn rolling_context_trims_oldest_first() {
        let mut state = ConversationState::new(&ConvKey::new("user-1", "page-1"));
        for i in 0..25 {
            state.push_context(EntryRole::User, format!("msg-{i}"));
        }
        assert_eq!(state.rolling_context.len(), CONTEXT_WINDOW);
        assert_eq!(state.rolling_context[0].content, "msg-5");
        assert_eq!(
            state.rolling_context.last().map(|e| e.content.as_str()),
            Some("msg-24")
        );
    }
}
