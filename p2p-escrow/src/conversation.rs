//! Conversation Log - append-only chat per trade
//!
//! Messages are ordered by a per-trade sequence number starting at 1 and are
//! never reordered or deleted. Only the two trade parties (and the engine,
//! as SYSTEM) may write; only the parties may read. Fetching messages marks
//! the ones written by someone else as read.

use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::EscrowError,
    models::{Message, MessageKind, Sender},
    notifier::{deliver, EngineEvent, EventKind, NotificationPort, Subject},
    EscrowResult,
};

/// Longest message body accepted
pub const MAX_MESSAGE_LENGTH: usize = 2_000;

struct Thread {
    buyer: String,
    seller: String,
    messages: Vec<Message>,
}

impl Thread {
    fn is_party(&self, user_id: &str) -> bool {
        self.buyer == user_id || self.seller == user_id
    }

    fn recipients_of(&self, sender: &Sender) -> Vec<String> {
        [&self.buyer, &self.seller]
            .into_iter()
            .filter(|party| !sender.is(party))
            .cloned()
            .collect()
    }
}

/// Per-trade message threads
pub struct ConversationLog {
    threads: RwLock<HashMap<Uuid, Arc<Mutex<Thread>>>>,
    notifier: Arc<dyn NotificationPort>,
}

impl ConversationLog {
    pub fn new(notifier: Arc<dyn NotificationPort>) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    /// Start the thread for a newly created trade
    pub(crate) async fn open_thread(&self, trade_id: Uuid, buyer: &str, seller: &str) {
        self.threads.write().await.entry(trade_id).or_insert_with(|| {
            Arc::new(Mutex::new(Thread {
                buyer: buyer.to_string(),
                seller: seller.to_string(),
                messages: Vec::new(),
            }))
        });
    }

    /// Append a party's message to a trade's thread
    ///
    /// SYSTEM messages are written by the engine only.
    pub async fn append(
        &self,
        trade_id: Uuid,
        sender: &str,
        body: &str,
        kind: MessageKind,
    ) -> EscrowResult<Message> {
        if kind == MessageKind::System {
            return Err(EscrowError::validation(
                "System messages cannot be posted by a trade party",
            ));
        }
        self.push(trade_id, Sender::user(sender), body, kind).await
    }

    /// Engine-authored message
    pub(crate) async fn append_system(&self, trade_id: Uuid, body: &str) -> EscrowResult<Message> {
        self.push(trade_id, Sender::System, body, MessageKind::System)
            .await
    }

    async fn push(
        &self,
        trade_id: Uuid,
        sender: Sender,
        body: &str,
        kind: MessageKind,
    ) -> EscrowResult<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(EscrowError::validation("Message body cannot be empty"));
        }
        if body.len() > MAX_MESSAGE_LENGTH {
            return Err(EscrowError::validation(format!(
                "Message body exceeds {} bytes",
                MAX_MESSAGE_LENGTH
            )));
        }

        let thread = self.thread(trade_id).await?;
        let (message, recipients) = {
            let mut thread = thread.lock().await;
            if let Sender::User(user_id) = &sender {
                if !thread.is_party(user_id) {
                    return Err(EscrowError::forbidden(format!(
                        "{} is not a party to trade {}",
                        user_id, trade_id
                    )));
                }
            }

            let message = Message {
                id: Uuid::new_v4(),
                trade_id,
                seq: thread.messages.len() as u64 + 1,
                sender,
                body: body.to_string(),
                kind,
                read: false,
                created_at: Utc::now(),
            };
            thread.messages.push(message.clone());
            (message.clone(), thread.recipients_of(&message.sender))
        };

        debug!(
            "Appended message #{} ({:?}) to trade {}",
            message.seq, message.kind, trade_id
        );

        deliver(
            self.notifier.as_ref(),
            EngineEvent::new(
                EventKind::MessageAppended,
                Subject::Trade(trade_id),
                serde_json::json!({
                    "trade_id": trade_id,
                    "message_id": message.id,
                    "seq": message.seq,
                    "kind": message.kind,
                }),
            )
            .to(recipients),
        )
        .await;

        Ok(message)
    }

    /// Messages after `cursor` (a sequence number) in creation order
    ///
    /// Returned messages written by someone other than `caller` are marked
    /// read.
    pub async fn list_since(
        &self,
        trade_id: Uuid,
        caller: &str,
        cursor: Option<u64>,
    ) -> EscrowResult<Vec<Message>> {
        let thread = self.thread(trade_id).await?;
        let mut thread = thread.lock().await;
        if !thread.is_party(caller) {
            return Err(EscrowError::forbidden(format!(
                "{} is not a party to trade {}",
                caller, trade_id
            )));
        }

        let after = cursor.unwrap_or(0);
        let mut fetched = Vec::new();
        for message in thread.messages.iter_mut().filter(|m| m.seq > after) {
            if !message.sender.is(caller) {
                message.read = true;
            }
            fetched.push(message.clone());
        }
        Ok(fetched)
    }

    /// Messages `caller` has not fetched yet
    pub async fn unread_count(&self, trade_id: Uuid, caller: &str) -> EscrowResult<usize> {
        let thread = self.thread(trade_id).await?;
        let thread = thread.lock().await;
        if !thread.is_party(caller) {
            return Err(EscrowError::forbidden(format!(
                "{} is not a party to trade {}",
                caller, trade_id
            )));
        }
        Ok(thread
            .messages
            .iter()
            .filter(|m| !m.read && !m.sender.is(caller))
            .count())
    }

    async fn thread(&self, trade_id: Uuid) -> EscrowResult<Arc<Mutex<Thread>>> {
        self.threads
            .read()
            .await
            .get(&trade_id)
            .cloned()
            .ok_or_else(|| EscrowError::TradeNotFound(trade_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::RecordingNotifier;

    async fn log_with_thread() -> (ConversationLog, RecordingNotifier, Uuid) {
        let events = RecordingNotifier::new();
        let log = ConversationLog::new(Arc::new(events.clone()));
        let trade_id = Uuid::new_v4();
        log.open_thread(trade_id, "buyer", "seller").await;
        (log, events, trade_id)
    }

    #[tokio::test]
    async fn test_append_assigns_sequence() {
        let (log, events, trade_id) = log_with_thread().await;

        let first = log
            .append(trade_id, "buyer", "hi", MessageKind::Text)
            .await
            .unwrap();
        let second = log.append_system(trade_id, "Trade created").await.unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(events.count(EventKind::MessageAppended).await, 2);
        // buyer's message goes to the seller only; SYSTEM goes to both
        assert_eq!(events.inbox("seller").await.len(), 2);
        assert_eq!(events.inbox("buyer").await.len(), 1);
    }

    #[tokio::test]
    async fn test_outsiders_cannot_read_or_write() {
        let (log, _, trade_id) = log_with_thread().await;

        let err = log
            .append(trade_id, "mallory", "hi", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Forbidden(_)));
        assert!(log.list_since(trade_id, "mallory", None).await.is_err());
        assert!(matches!(
            log.list_since(Uuid::new_v4(), "buyer", None).await,
            Err(EscrowError::TradeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_marks_counterparty_messages_read() {
        let (log, _, trade_id) = log_with_thread().await;
        log.append(trade_id, "buyer", "paid?", MessageKind::Text)
            .await
            .unwrap();
        log.append(trade_id, "seller", "not yet", MessageKind::Text)
            .await
            .unwrap();
        log.append(trade_id, "seller", "now yes", MessageKind::Text)
            .await
            .unwrap();

        assert_eq!(log.unread_count(trade_id, "buyer").await.unwrap(), 2);

        let since = log.list_since(trade_id, "buyer", Some(2)).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].body, "now yes");
        assert_eq!(log.unread_count(trade_id, "buyer").await.unwrap(), 1);

        let all = log.list_since(trade_id, "buyer", None).await.unwrap();
        let seqs: Vec<u64> = all.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(log.unread_count(trade_id, "buyer").await.unwrap(), 0);
        // the buyer's own message is still unread for the seller
        assert_eq!(log.unread_count(trade_id, "seller").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_body() {
        let (log, _, trade_id) = log_with_thread().await;
        assert!(matches!(
            log.append(trade_id, "buyer", "   ", MessageKind::Text).await,
            Err(EscrowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_parties_cannot_post_as_system() {
        let (log, events, trade_id) = log_with_thread().await;

        assert!(matches!(
            log.append(
                trade_id,
                "buyer",
                "Seller confirmed payment, escrow released",
                MessageKind::System
            )
            .await,
            Err(EscrowError::Validation(_))
        ));
        assert!(log.list_since(trade_id, "seller", None).await.unwrap().is_empty());
        assert_eq!(events.count(EventKind::MessageAppended).await, 0);

        let message = log
            .append(trade_id, "seller", "Thanks, released", MessageKind::Text)
            .await
            .unwrap();
        assert!(message.sender.is("seller"));
    }
}
