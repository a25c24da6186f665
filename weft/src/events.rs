//! Coordination lifecycle events.
//!
//! The engine publishes state transitions (spawns, exits, barrier
//! progress, transfers, quit) onto an in-process broadcast bus so
//! embedding code can observe the pipeline without hooking into the
//! coordinator itself. Publishing never blocks and never fails the
//! publisher; a subscriber that falls behind loses the oldest events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::id::Id;
use crate::message::ExecuteKind;

pub const EVENT_SCHEMA_VERSION: u16 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Uuid of the envelope that caused the transition.
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            version: EVENT_SCHEMA_VERSION,
            correlation_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinationEventPayload {
    ModuleSpawned { module: Id, name: String },
    ModuleExited { module: Id, crashed: bool },
    ExecuteIssued { module: Id, what: ExecuteKind },
    BarrierStarted { info: String },
    BarrierReachedLocally,
    BarrierCompleted,
    TransferStarted { object: String },
    TransferCompleted { object: String },
    QuitRequested,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub meta: EventMeta,
    pub payload: CoordinationEventPayload,
}

impl CoordinationEvent {
    pub fn new(correlation_id: Uuid, payload: CoordinationEventPayload) -> Self {
        Self { meta: EventMeta::new(correlation_id), payload }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Fire-and-forget; implementations must not block coordination.
    async fn publish(&self, event: CoordinationEvent);
}

/// Broadcast-channel bus for in-process subscribers.
pub struct InProcCoordinationBus {
    sender: broadcast::Sender<CoordinationEvent>,
}

impl InProcCoordinationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.sender.subscribe()
    }

    /// Synchronous publish for callers inside the coordination loop.
    pub fn emit(&self, correlation_id: Uuid, payload: CoordinationEventPayload) {
        // A send error only means nobody is listening.
        let _ = self.sender.send(CoordinationEvent::new(correlation_id, payload));
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for InProcCoordinationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcCoordinationBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for InProcCoordinationBus {
    async fn publish(&self, event: CoordinationEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_emitted_events() {
        let bus = InProcCoordinationBus::new(16);
        let mut rx = bus.subscribe();
        let correlation = Uuid::now_v7();
        bus.emit(
            correlation,
            CoordinationEventPayload::ModuleSpawned { module: Id::module(1), name: "gen".into() },
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.meta.correlation_id, correlation);
        assert_eq!(event.meta.version, EVENT_SCHEMA_VERSION);
        match event.payload {
            CoordinationEventPayload::ModuleSpawned { module, .. } => {
                assert_eq!(module, Id::module(1));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let bus = InProcCoordinationBus::new(4);
        bus.emit(Uuid::now_v7(), CoordinationEventPayload::QuitRequested);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn lagged_subscriber_drops_oldest() {
        let bus = InProcCoordinationBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.emit(Uuid::now_v7(), CoordinationEventPayload::BarrierCompleted);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
