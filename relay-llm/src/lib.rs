pub mod assistants;
pub mod error;
pub mod poll;
pub mod types;

pub use assistants::{AssistantBackend, OpenAiAssistantsClient};
pub use error::{AssistantError, Result};
pub use poll::{PollConfig, RunOutcome, await_run};
pub use types::{ContextEntry, EntryRole, RunId, RunPoll, RunStatus, SessionId};
