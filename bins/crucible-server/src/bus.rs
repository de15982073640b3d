/// Message Bus - per-job publish/subscribe fabric
///
/// Decouples the PTY worker from the socket-facing orchestrator. Every job
/// owns two topics: `job:{id}:output` for streamed chunks and
/// `job:{id}:complete` for the single terminal event. A subscriber joins
/// both before the executor starts and sees messages in publish order;
/// delivery is best-effort at-most-once.
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crucible_common::redis::{complete_channel, output_channel};
use crucible_common::types::BusMessage;

/// Per-subscription buffer; deep enough that a bursty program does not shed
/// chunks before the socket task catches up.
const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

fn backend<E: Into<anyhow::Error>>(err: E) -> BusError {
    BusError::Backend(err.into())
}

/// Receiving half of a job subscription. Yields `None` once the publisher
/// side is gone.
pub struct BusSubscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl BusSubscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish on the topic matching the message kind: output chunks on the
    /// output topic, terminal events on the complete topic.
    async fn publish(&self, job_id: Uuid, message: &BusMessage) -> Result<(), BusError>;

    /// Join both of the job's topics. Must be called before the executor
    /// starts so no message can be missed.
    async fn subscribe(&self, job_id: Uuid) -> Result<BusSubscription, BusError>;
}

fn channel_for(job_id: Uuid, message: &BusMessage) -> String {
    match message {
        BusMessage::Output { .. } => output_channel(&job_id),
        BusMessage::Complete { .. } | BusMessage::Error { .. } => complete_channel(&job_id),
    }
}

// ---------------------------------------------------------------------------
// Redis adapter
// ---------------------------------------------------------------------------

pub struct RedisBus {
    publisher: ConnectionManager,
    client: redis::Client,
}

impl RedisBus {
    /// `publisher` is the shared multiplexed connection; `client` opens the
    /// dedicated connection each subscription needs.
    pub fn new(publisher: ConnectionManager, client: redis::Client) -> Self {
        Self { publisher, client }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, job_id: Uuid, message: &BusMessage) -> Result<(), BusError> {
        let payload = serde_json::to_string(message).map_err(backend)?;
        let channel = channel_for(job_id, message);
        let mut conn = self.publisher.clone();
        let _: () = conn.publish(&channel, payload).await.map_err(backend)?;
        Ok(())
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<BusSubscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub
            .subscribe(&[output_channel(&job_id), complete_channel(&job_id)])
            .await
            .map_err(backend)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(raw) = stream.next().await {
                let payload: String = match raw.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Dropping undecodable bus payload");
                        continue;
                    }
                };
                let message: BusMessage = match serde_json::from_str(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Dropping malformed bus message");
                        continue;
                    }
                };
                let terminal = message.is_terminal();
                if tx.send(message).await.is_err() {
                    // Subscriber hung up; unsubscribes when pubsub drops.
                    break;
                }
                if terminal {
                    break;
                }
            }
            debug!(job_id = %job_id, "Bus subscription closed");
        });

        Ok(BusSubscription { rx })
    }
}

// ---------------------------------------------------------------------------
// In-memory adapter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBus {
    topics: DashMap<Uuid, Vec<mpsc::Sender<BusMessage>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, job_id: Uuid, message: &BusMessage) -> Result<(), BusError> {
        if let Some(mut senders) = self.topics.get_mut(&job_id) {
            senders.retain(|tx| match tx.try_send(message.clone()) {
                Ok(()) => true,
                // Full buffer: at-most-once allows shedding the chunk.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.topics.entry(job_id).or_default().push(tx);
        Ok(BusSubscription { rx })
    }
}
