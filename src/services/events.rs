//! Domain event publishing

use anyhow::Result;
use async_nats::Client;
use async_trait::async_trait;
#[cfg(test)]
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{BatchEvent, BatchEventType};

/// Subject prefix of published events, `dispatch.events.<event_type>`
pub const EVENT_SUBJECT_PREFIX: &str = "dispatch.events";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &BatchEvent) -> Result<()>;
}

/// Publishes events as JSON on NATS
pub struct NatsEventPublisher {
    client: Client,
}

impl NatsEventPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub fn event_subject(event_type: BatchEventType) -> String {
    format!("{}.{}", EVENT_SUBJECT_PREFIX, event_type.as_str())
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, event: &BatchEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(event_subject(event.event_type), payload.into())
            .await?;
        Ok(())
    }
}

/// Keeps events in memory, for tests
#[cfg(test)]
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<BatchEvent>>,
}

#[cfg(test)]
impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: BatchEventType) -> Vec<BatchEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: &BatchEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Publish after a committed change. Delivery problems never undo the change,
/// so they are logged rather than returned.
pub async fn emit(publisher: &dyn EventPublisher, event: BatchEvent) {
    match publisher.publish(&event).await {
        Ok(()) => debug!(
            event = event.event_type.as_str(),
            batch_id = %event.batch_id,
            "Event published"
        ),
        Err(e) => warn!(
            event = event.event_type.as_str(),
            batch_id = %event.batch_id,
            "Failed to publish event: {}",
            e
        ),
    }
}
