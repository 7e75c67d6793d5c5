//! Webhook server: platform events in, gateway dispatch out.

use crate::config::RelayConfig;
use crate::gate::ResponseGate;
use crate::gateway::Gateway;
use crate::page_config::PageDirectory;
use crate::processor::{TurnProcessor, TurnTimeouts};
use crate::session::SessionManager;
use crate::store::ConversationStore;
use anyhow::Result;
use axum::extract::{Json, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use relay_channels::{
    ChannelId, InboundEvent, InboundPayload, MessageId, MessengerClient, OutboundMessage,
    PlatformClient, UserId,
};
use relay_llm::{OpenAiAssistantsClient, PollConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const HTTP_MAX_IN_FLIGHT: usize = 256;
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    verify_token: String,
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let addr: SocketAddr = cfg.general.bind_addr.parse()?;

    let store = ConversationStore::open(cfg.store_path()).await?;
    let platform: Arc<dyn PlatformClient> = Arc::new(MessengerClient::new(
        PageDirectory::access_tokens(&cfg.pages),
    )?);
    let api_key = cfg.keys.openai_api_key.clone().unwrap_or_default();
    let backend = Arc::new(OpenAiAssistantsClient::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?,
        &api_key,
    )?);

    let sessions = Arc::new(SessionManager::new(
        backend,
        store.clone(),
        PollConfig::default(),
    ));
    let restored = sessions.restore().await?;

    let pages = Arc::new(PageDirectory::from_config(&cfg.pages));
    let processor = Arc::new(TurnProcessor::new(
        store,
        sessions,
        ResponseGate::new(platform.clone()),
        platform.clone(),
        pages,
        TurnTimeouts::default(),
    ));
    let gateway = Arc::new(Gateway::new(processor, platform));

    let shutdown = CancellationToken::new();
    let sweep = gateway.spawn_batch_sweep(shutdown.clone());

    let app = router(AppState {
        gateway,
        verify_token: cfg.general.verify_token.clone(),
    });

    tracing::info!(
        bind_addr = %addr,
        pages = cfg.pages.len(),
        restored_sessions = restored,
        "relayd serving"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_for_signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            shutdown_for_signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sweep.await;
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let store = ConversationStore::open(cfg.store_path()).await?;
    let active = store.load_all_active().await?;
    tracing::info!(
        bind_addr = %cfg.general.bind_addr,
        pages = cfg.pages.len(),
        active_conversations = active.len(),
        store_path = %cfg.store_path().display(),
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let platform = MessengerClient::new(PageDirectory::access_tokens(&cfg.pages))?;
    platform
        .send_message(
            &ChannelId::new(channel),
            &UserId::new(recipient),
            OutboundMessage::text(message),
        )
        .await?;
    Ok(())
}

fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TimeoutLayer::new(HTTP_REQUEST_TIMEOUT))
        .layer(GlobalConcurrencyLimitLayer::new(HTTP_MAX_IN_FLIGHT))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Subscription handshake: echo the challenge when the verify token matches.
async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or_default();
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or_default();
    if mode == "subscribe" && !state.verify_token.is_empty() && token == state.verify_token {
        let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
        (StatusCode::OK, challenge).into_response()
    } else {
        tracing::warn!(%mode, "webhook verification rejected");
        StatusCode::FORBIDDEN.into_response()
    }
}

/// Always acknowledges with 200: the platform retries non-2xx responses, and
/// the dedup cache absorbs whatever does get redelivered.
async fn receive_webhook(
    State(state): State<AppState>,
    Json(envelope): Json<WebhookEnvelope>,
) -> &'static str {
    let events = envelope_to_events(envelope);
    tracing::debug!(events = events.len(), "webhook batch received");
    for event in events {
        let gateway = state.gateway.clone();
        tokio::spawn(async move {
            gateway.handle_inbound(event).await;
        });
    }
    "EVENT_RECEIVED"
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    id: String,
    #[serde(default)]
    messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
struct MessagingEvent {
    #[serde(default)]
    sender: Option<EventParty>,
    #[serde(default)]
    message: Option<EventMessage>,
}

#[derive(Debug, Deserialize)]
struct EventParty {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Vec<EventAttachment>,
    #[serde(default)]
    is_echo: bool,
}

#[derive(Debug, Deserialize)]
struct EventAttachment {
    #[serde(rename = "type", default)]
    kind: String,
}

fn envelope_to_events(envelope: WebhookEnvelope) -> Vec<InboundEvent> {
    if envelope.object != "page" && envelope.object != "instagram" {
        tracing::debug!(object = %envelope.object, "ignoring non-page webhook object");
        return Vec::new();
    }

    let mut out = Vec::new();
    for entry in envelope.entry {
        let channel_id = ChannelId::new(entry.id.clone());
        for event in entry.messaging {
            let Some(sender) = event.sender else {
                continue;
            };
            let Some(message) = event.message else {
                continue;
            };
            // Echoes are the page's own outbound messages reflected back.
            if message.is_echo {
                continue;
            }
            // The sender being the page itself means a human agent replied
            // from the inbox; not an inbound user message.
            if sender.id == entry.id {
                continue;
            }

            let payload = match (&message.text, message.attachments.first()) {
                (Some(text), _) if !text.trim().is_empty() => InboundPayload::Text {
                    text: text.clone(),
                },
                (_, Some(attachment)) => InboundPayload::Attachment {
                    attachment_type: attachment.kind.clone(),
                },
                _ => InboundPayload::Unsupported,
            };
            let message_id = message
                .mid
                .clone()
                .unwrap_or_else(|| format!("generated:{}", uuid::Uuid::new_v4()));

            out.push(InboundEvent {
                message_id: MessageId::new(message_id),
                channel_id: channel_id.clone(),
                user_id: UserId::new(sender.id.clone()),
                payload,
                received_at: Utc::now(),
            });
        }
    }
    out
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(error) => tracing::error!(%error, "failed to listen for shutdown signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> WebhookEnvelope {
        serde_json::from_str(body).expect("parse envelope")
    }

    #[test]
    fn text_messages_become_text_events() {
        let envelope = parse(
            r#"{
                "object": "page",
                "entry": [{
                    "id": "page-1",
                    "messaging": [{
                        "sender": {"id": "user-1"},
                        "message": {"mid": "mid.1", "text": "hello"}
                    }]
                }]
            }"#,
        );
        let events = envelope_to_events(envelope);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_id, MessageId::new("mid.1"));
        assert_eq!(events[0].channel_id, ChannelId::new("page-1"));
        assert!(matches!(
            &events[0].payload,
            InboundPayload::Text { text } if text == "hello"
        ));
    }

    #[test]
    fn attachments_without_text_become_attachment_events() {
        let envelope = parse(
            r#"{
                "object": "page",
                "entry": [{
                    "id": "page-1",
                    "messaging": [{
                        "sender": {"id": "user-1"},
                        "message": {"mid": "mid.2", "attachments": [{"type": "image"}]}
                    }]
                }]
            }"#,
        );
        let events = envelope_to_events(envelope);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].payload,
            InboundPayload::Attachment { attachment_type } if attachment_type == "image"
        ));
    }

    #[test]
    fn echoes_and_page_sent_messages_are_skipped() {
        let envelope = parse(
            r#"{
                "object": "page",
                "entry": [{
                    "id": "page-1",
                    "messaging": [
                        {
                            "sender": {"id": "user-1"},
                            "message": {"mid": "mid.3", "text": "real", "is_echo": false}
                        },
                        {
                            "sender": {"id": "user-1"},
                            "message": {"mid": "mid.4", "text": "echo", "is_echo": true}
                        },
                        {
                            "sender": {"id": "page-1"},
                            "message": {"mid": "mid.5", "text": "agent reply"}
                        }
                    ]
                }]
            }"#,
        );
        let events = envelope_to_events(envelope);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_id, MessageId::new("mid.3"));
    }

    #[test]
    fn non_page_objects_are_ignored() {
        let envelope = parse(r#"{"object": "user", "entry": []}"#);
        assert!(envelope_to_events(envelope).is_empty());
    }

    #[test]
    fn missing_mid_gets_a_generated_id() {
        let envelope = parse(
            r#"{
                "object": "page",
                "entry": [{
                    "id": "page-1",
                    "messaging": [{
                        "sender": {"id": "user-1"},
                        "message": {"text": "no mid"}
                    }]
                }]
            }"#,
        );
        let events = envelope_to_events(envelope);
        assert_eq!(events.len(), 1);
        assert!(events[0].message_id.as_str().starts_with("generated:"));
    }
}
