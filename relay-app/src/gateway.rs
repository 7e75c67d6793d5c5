//! Inbound entry point: dedup, batching, and turn dispatch.

use crate::batcher::{BatchDecision, FlushedBatch, MessageBatcher, SWEEP_INTERVAL};
use crate::dedup::DedupCache;
use crate::processor::{REPLY_NOT_UNDERSTOOD, TurnProcessor};
use crate::store::ConvKey;
use relay_channels::{InboundEvent, InboundPayload, OutboundMessage, PlatformClient};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const REPLY_ATTACHMENT: &str =
    "I've received your attachment. If you have any specific questions about it, please let me know.";

pub struct Gateway {
    dedup: DedupCache,
    batcher: MessageBatcher,
    processor: Arc<TurnProcessor>,
    platform: Arc<dyn PlatformClient>,
}

impl Gateway {
    pub fn new(processor: Arc<TurnProcessor>, platform: Arc<dyn PlatformClient>) -> Self {
        Self {
            dedup: DedupCache::default(),
            batcher: MessageBatcher::default(),
            processor,
            platform,
        }
    }

    /// Handle one webhook event. The webhook layer fires and forgets; reply
    /// delivery happens in here via the platform client.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(message_id = %event.message_id, user_id = %event.user_id, channel_id = %event.channel_id)
    )]
    pub async fn handle_inbound(&self, event: InboundEvent) {
        if self.dedup.seen(&event.message_id) {
            tracing::debug!("duplicate delivery dropped");
            return;
        }

        let key = ConvKey {
            user_id: event.user_id.clone(),
            channel_id: event.channel_id.clone(),
        };
        match event.payload {
            InboundPayload::Text { text } => match self.batcher.add(key, text) {
                BatchDecision::Wait => {}
                BatchDecision::Flush(batch) => self.process_batch(batch).await,
            },
            InboundPayload::Attachment { attachment_type } => {
                tracing::info!(%attachment_type, "acknowledging attachment");
                self.acknowledge(&key, REPLY_ATTACHMENT).await;
            }
            InboundPayload::Unsupported => {
                self.acknowledge(&key, REPLY_NOT_UNDERSTOOD).await;
            }
        }
    }

    /// Run the batch sweep until shutdown. Flushed batches process
    /// concurrently so one slow turn does not delay other users.
    pub fn spawn_batch_sweep(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("batch sweep stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        for batch in gateway.batcher.sweep() {
                            let gateway = gateway.clone();
                            tokio::spawn(async move {
                                gateway.process_batch(batch).await;
                            });
                        }
                    }
                }
            }
        })
    }

    /// The batch is already gone from the queue; a failure here drops its
    /// messages rather than looping on a poison batch.
    async fn process_batch(&self, batch: FlushedBatch) {
        let FlushedBatch { key, merged_text } = batch;
        match self.processor.process(key.clone(), merged_text).await {
            Ok(result) => {
                tracing::info!(
                    user_id = %key.user_id,
                    channel_id = %key.channel_id,
                    replied = result.reply.is_some(),
                    delivered = result.delivered,
                    "turn finished"
                );
            }
            Err(error) => {
                tracing::error!(
                    %error,
                    user_id = %key.user_id,
                    channel_id = %key.channel_id,
                    "turn processing failed; batch dropped"
                );
            }
        }
    }

    async fn acknowledge(&self, key: &ConvKey, text: &str) {
        if let Err(error) = self
            .platform
            .send_message(&key.channel_id, &key.user_id, OutboundMessage::text(text))
            .await
        {
            tracing::warn!(%error, "acknowledgement send failed");
        }
    }
}
