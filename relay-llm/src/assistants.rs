use crate::error::{AssistantError, Result};
use crate::types::{RunId, RunPoll, RunStatus, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OPENAI_BETA_HEADER: &str = "OpenAI-Beta";
const OPENAI_BETA_VALUE: &str = "assistants=v2";

/// Seam between the orchestration layer and the completion service.
///
/// Sessions are stateful on the service side: `submit_turn` appends the new
/// user text to the session and starts a generation; `poll_run` reports its
/// progress and, once completed, the reply text.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_session(&self) -> Result<SessionId>;

    async fn submit_turn(
        &self,
        session: &SessionId,
        assistant_id: &str,
        text: &str,
    ) -> Result<RunId>;

    async fn poll_run(&self, session: &SessionId, run: &RunId) -> Result<RunPoll>;
}

#[derive(Clone)]
pub struct OpenAiAssistantsClient {
    http: reqwest::Client,
    api_key: String,
}

impl OpenAiAssistantsClient {
    pub fn new(http: reqwest::Client, api_key: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(AssistantError::InvalidInput(
                "openai api key is required".to_string(),
            ));
        }
        Ok(Self {
            http,
            api_key: api_key.to_string(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{OPENAI_API_BASE}{path}"))
            .bearer_auth(&self.api_key)
            .header(OPENAI_BETA_HEADER, OPENAI_BETA_VALUE)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{OPENAI_API_BASE}{path}"))
            .bearer_auth(&self.api_key)
            .header(OPENAI_BETA_HEADER, OPENAI_BETA_VALUE)
    }

    async fn read_success(
        response: reqwest::Response,
        context: &str,
        session: Option<&SessionId>,
    ) -> Result<String> {
        let status = response.status();
        let body = response.text().await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            if let Some(session) = session {
                return Err(AssistantError::UnknownSession(session.to_string()));
            }
        }
        if !status.is_success() {
            return Err(AssistantError::Http(format!(
                "{context} status={status} body={body}"
            )));
        }
        Ok(body)
    }

    /// Fetch the newest message of the session; the reply of a completed run.
    async fn latest_reply(&self, session: &SessionId) -> Result<Option<String>> {
        let response = self
            .get(&format!(
                "/threads/{}/messages?order=desc&limit=1",
                session.as_str()
            ))
            .send()
            .await?;
        let body = Self::read_success(response, "assistants messages", Some(session)).await?;
        let parsed: MessageListResponse = serde_json::from_str(&body)?;

        let Some(latest) = parsed.data.into_iter().next() else {
            return Ok(None);
        };
        if latest.role != "assistant" {
            return Ok(None);
        }
        let text = latest
            .content
            .into_iter()
            .find_map(|block| block.text.map(|t| t.value));
        Ok(text)
    }
}

#[async_trait]
impl AssistantBackend for OpenAiAssistantsClient {
    #[tracing::instrument(level = "info", skip_all)]
    async fn create_session(&self) -> Result<SessionId> {
        let response = self
            .post("/threads")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let body = Self::read_success(response, "assistants thread create", None).await?;
        let parsed: ThreadObject = serde_json::from_str(&body)?;
        Ok(SessionId::new(parsed.id))
    }

    #[tracing::instrument(level = "info", skip_all, fields(session = %session))]
    async fn submit_turn(
        &self,
        session: &SessionId,
        assistant_id: &str,
        text: &str,
    ) -> Result<RunId> {
        if text.trim().is_empty() {
            return Err(AssistantError::InvalidInput(
                "turn text is empty".to_string(),
            ));
        }
        if assistant_id.trim().is_empty() {
            return Err(AssistantError::InvalidInput(
                "assistant id is required".to_string(),
            ));
        }

        let message = self
            .post(&format!("/threads/{}/messages", session.as_str()))
            .json(&AppendMessageRequest {
                role: "user",
                content: text,
            })
            .send()
            .await?;
        Self::read_success(message, "assistants message append", Some(session)).await?;

        let run = self
            .post(&format!("/threads/{}/runs", session.as_str()))
            .json(&CreateRunRequest { assistant_id })
            .send()
            .await?;
        let body = Self::read_success(run, "assistants run create", Some(session)).await?;
        let parsed: RunObject = serde_json::from_str(&body)?;
        Ok(RunId::new(parsed.id))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(session = %session, run = %run))]
    async fn poll_run(&self, session: &SessionId, run: &RunId) -> Result<RunPoll> {
        let response = self
            .get(&format!(
                "/threads/{}/runs/{}",
                session.as_str(),
                run.as_str()
            ))
            .send()
            .await?;
        let body = Self::read_success(response, "assistants run retrieve", Some(session)).await?;
        let parsed: RunObject = serde_json::from_str(&body)?;

        let reply = if parsed.status == RunStatus::Completed {
            self.latest_reply(session).await?
        } else {
            None
        };
        Ok(RunPoll {
            status: parsed.status,
            reply,
        })
    }
}

#[derive(Debug, Serialize)]
struct AppendMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: RunStatus,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    role: String,
    #[serde(default)]
    content: Vec<MessageContentBlock>,
}

#[derive(Debug, Deserialize)]
struct MessageContentBlock {
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}
