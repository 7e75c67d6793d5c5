use crate::assistants::AssistantBackend;
use crate::types::{RunId, RunStatus, SessionId};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Terminal result of one generation, from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(String),
    Failed(String),
    TimedOut,
}

/// Poll a run at a fixed interval until it reaches a terminal status or the
/// hard timeout elapses. Poll errors are treated as transient: the run may
/// still complete on the service side, so polling continues until the
/// deadline.
#[tracing::instrument(level = "debug", skip_all, fields(session = %session, run = %run))]
pub async fn await_run(
    backend: &dyn AssistantBackend,
    session: &SessionId,
    run: &RunId,
    cfg: PollConfig,
) -> RunOutcome {
    let deadline = Instant::now() + cfg.timeout;

    loop {
        match backend.poll_run(session, run).await {
            Ok(poll) => match poll.status {
                RunStatus::Completed => {
                    let Some(reply) = poll.reply.filter(|r| !r.trim().is_empty()) else {
                        return RunOutcome::Failed("run completed without a reply".to_string());
                    };
                    return RunOutcome::Completed(reply);
                }
                RunStatus::Failed => {
                    return RunOutcome::Failed("run reported failed status".to_string());
                }
                RunStatus::Unsupported => {
                    return RunOutcome::Failed(
                        "run ended in an unsupported terminal status".to_string(),
                    );
                }
                RunStatus::Queued | RunStatus::InProgress => {}
            },
            Err(error) => {
                tracing::warn!(%error, "run poll failed; retrying until deadline");
            }
        }

        if Instant::now() + cfg.interval > deadline {
            tracing::warn!(timeout = ?cfg.timeout, "run did not finish before deadline");
            return RunOutcome::TimedOut;
        }
        tokio::time::sleep(cfg.interval).await;
    }
}
