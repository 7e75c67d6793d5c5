use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a server-side conversation context on the completion
/// service. Created lazily on a conversation's first turn and reused for its
/// whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Opaque handle to one in-flight generation against a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

macro_rules! id_impls {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_impls!(SessionId);
id_impls!(RunId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    User,
    Assistant,
}

/// One entry of a conversation's rolling context window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: EntryRole,
    pub content: String,
}

impl ContextEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: EntryRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: EntryRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    /// Terminal statuses this relay does not act on (cancelled, expired,
    /// requires_action, ...). Treated as a failure by the poll helper.
    #[serde(other)]
    Unsupported,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::InProgress)
    }
}

/// Snapshot of one generation, as reported by the completion service.
#[derive(Debug, Clone)]
pub struct RunPoll {
    pub status: RunStatus,
    pub reply: Option<String>,
}
