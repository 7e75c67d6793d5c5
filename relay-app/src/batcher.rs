//! Per-user batching of rapid message bursts into one logical turn.
//!
//! Two triggers close a batch: the hot path in `add` (second message inside
//! the window, or a stale entry), and the periodic sweep for the user who
//! sends exactly one message and goes silent. Rapid bursts merge into a
//! single completion call; a lone message still gets a prompt reply.

use crate::store::ConvKey;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub const BATCH_MAX_MESSAGES: usize = 2;
pub const BATCH_MAX_WAIT: Duration = Duration::from_secs(30);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const SINGLE_MESSAGE_GRACE: Duration = Duration::from_secs(2);

/// A closed batch: the user's queued messages merged in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBatch {
    pub key: ConvKey,
    pub merged_text: String,
}

#[derive(Debug)]
pub enum BatchDecision {
    Wait,
    Flush(FlushedBatch),
}

struct BatchEntry {
    messages: Vec<String>,
    first_seen: Instant,
}

#[derive(Default)]
pub struct MessageBatcher {
    entries: Mutex<HashMap<ConvKey, BatchEntry>>,
}

impl MessageBatcher {
    pub fn add(&self, key: ConvKey, text: String) -> BatchDecision {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries.entry(key.clone()).or_insert_with(|| BatchEntry {
            messages: Vec::new(),
            first_seen: Instant::now(),
        });
        entry.messages.push(text);

        let full = entry.messages.len() >= BATCH_MAX_MESSAGES;
        let stale = entry.first_seen.elapsed() >= BATCH_MAX_WAIT;
        if !full && !stale {
            return BatchDecision::Wait;
        }
        let Some(entry) = entries.remove(&key) else {
            return BatchDecision::Wait;
        };
        tracing::debug!(
            user_id = %key.user_id,
            channel_id = %key.channel_id,
            messages = entry.messages.len(),
            full,
            stale,
            "batch flushed on add"
        );
        BatchDecision::Flush(merge(key, entry))
    }

    /// Flush single-message entries that have sat idle past the grace period.
    /// Multi-message entries never linger here: `add` flushes them directly.
    pub fn sweep(&self) -> Vec<FlushedBatch> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due: Vec<ConvKey> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.messages.len() == 1 && entry.first_seen.elapsed() >= SINGLE_MESSAGE_GRACE
            })
            .map(|(key, _)| key.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| {
                let entry = entries.remove(&key)?;
                Some(merge(key, entry))
            })
            .collect()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.entries.lock().expect("entries lock").len()
    }
}

fn merge(key: ConvKey, entry: BatchEntry) -> FlushedBatch {
    FlushedBatch {
        key,
        merged_text: entry.messages.join(" "),
    }
}
