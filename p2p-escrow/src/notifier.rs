//! Notification Port - best-effort delivery of engine events
//!
//! The engine emits an event at every advertisement and trade transition
//! and for every appended chat message. Delivery is fire-and-forget: a
//! failing port is logged and never rolls back engine state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::EscrowResult;

/// Event kinds emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AdCreated,
    AdCancelled,
    AdCompleted,
    TradeCreated,
    TradePaymentSent,
    TradeCompleted,
    TradeCancelled,
    TradeDisputed,
    TradeResolved,
    MessageAppended,
    /// A new dispute is waiting in the arbitration queue
    ArbitrationRequested,
}

impl EventKind {
    /// Dotted name used in logs and downstream routing
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdCreated => "ad.created",
            Self::AdCancelled => "ad.cancelled",
            Self::AdCompleted => "ad.completed",
            Self::TradeCreated => "trade.created",
            Self::TradePaymentSent => "trade.payment_sent",
            Self::TradeCompleted => "trade.completed",
            Self::TradeCancelled => "trade.cancelled",
            Self::TradeDisputed => "trade.disputed",
            Self::TradeResolved => "trade.resolved",
            Self::MessageAppended => "message.appended",
            Self::ArbitrationRequested => "dispute.arbitration_requested",
        }
    }
}

/// Entity an event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Ad(Uuid),
    Trade(Uuid),
    Dispute(Uuid),
}

/// One engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub subject: Subject,
    /// Users who should receive the event; empty means operators only
    pub recipients: Vec<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(kind: EventKind, subject: Subject, payload: serde_json::Value) -> Self {
        Self {
            kind,
            subject,
            recipients: Vec::new(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn to<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = recipients.into_iter().map(Into::into).collect();
        self
    }
}

/// Delivery interface produced-to by the engine
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify(&self, event: EngineEvent) -> EscrowResult<()>;
}

/// Deliver an event, logging (not propagating) failures
pub(crate) async fn deliver(port: &dyn NotificationPort, event: EngineEvent) {
    let kind = event.kind;
    let subject = event.subject;
    if let Err(e) = port.notify(event).await {
        warn!(
            "Notification {} for {:?} not delivered: {}",
            kind.as_str(),
            subject,
            e
        );
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationPort for TracingNotifier {
    async fn notify(&self, event: EngineEvent) -> EscrowResult<()> {
        info!(
            "Event {} subject={:?} recipients={:?} payload={}",
            event.kind.as_str(),
            event.subject,
            event.recipients,
            event.payload
        );
        Ok(())
    }
}

/// Keeps events in memory so callers and tests can inspect them
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    events: Arc<RwLock<Vec<EngineEvent>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<EngineEvent> {
        self.events.read().await.clone()
    }

    pub async fn kinds(&self) -> Vec<EventKind> {
        self.events.read().await.iter().map(|e| e.kind).collect()
    }

    pub async fn count(&self, kind: EventKind) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Events addressed to `user_id`
    pub async fn inbox(&self, user_id: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.recipients.iter().any(|r| r == user_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationPort for RecordingNotifier {
    async fn notify(&self, event: EngineEvent) -> EscrowResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}

/// Delivers each event to several ports; one failing port does not stop the others
#[derive(Default, Clone)]
pub struct FanoutNotifier {
    ports: Vec<Arc<dyn NotificationPort>>,
}

impl FanoutNotifier {
    pub fn new(ports: Vec<Arc<dyn NotificationPort>>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl NotificationPort for FanoutNotifier {
    async fn notify(&self, event: EngineEvent) -> EscrowResult<()> {
        for port in &self.ports {
            deliver(port.as_ref(), event.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EscrowError;

    struct FailingNotifier;

    #[async_trait]
    impl NotificationPort for FailingNotifier {
        async fn notify(&self, _event: EngineEvent) -> EscrowResult<()> {
            Err(EscrowError::notification("relay unreachable"))
        }
    }

    #[tokio::test]
    async fn test_recording_notifier_inbox() {
        let recorder = RecordingNotifier::new();
        let trade_id = Uuid::new_v4();

        recorder
            .notify(
                EngineEvent::new(
                    EventKind::TradeCreated,
                    Subject::Trade(trade_id),
                    serde_json::json!({ "trade_id": trade_id }),
                )
                .to(["alice", "bob"]),
            )
            .await
            .unwrap();

        assert_eq!(recorder.count(EventKind::TradeCreated).await, 1);
        assert_eq!(recorder.inbox("bob").await.len(), 1);
        assert!(recorder.inbox("carol").await.is_empty());
    }

    #[tokio::test]
    async fn test_fanout_survives_failing_port() {
        let recorder = RecordingNotifier::new();
        let fanout = FanoutNotifier::new(vec![
            Arc::new(FailingNotifier),
            Arc::new(recorder.clone()),
        ]);

        fanout
            .notify(EngineEvent::new(
                EventKind::AdCreated,
                Subject::Ad(Uuid::new_v4()),
                serde_json::Value::Null,
            ))
            .await
            .unwrap();

        assert_eq!(recorder.kinds().await, vec![EventKind::AdCreated]);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::TradePaymentSent.as_str(), "trade.payment_sent");
        assert_eq!(EventKind::MessageAppended.as_str(), "message.appended");
    }
}
