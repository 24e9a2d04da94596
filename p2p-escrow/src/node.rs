//! Main Escrow Node - High-level API for the escrow engine
//!
//! Wires the advertisement book, trade engine, dispute arbiter,
//! conversation log and reputation book around one ledger, one notifier
//! and one fee policy, and owns the background deadline sweeper.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    book::{AdFilter, AdvertisementBook, CreateAdRequest},
    config::EscrowNodeConfig,
    conversation::ConversationLog,
    dispute::DisputeArbiter,
    engine::{CancelOutcome, DeadlineSweeper, OpenTradeRequest, SweepReport, TradeEngine},
    fees::{FeePolicy, PercentageFee},
    ledger::{GuardedLedger, InMemoryLedger, LedgerPort},
    models::{
        Advertisement, Dispute, DisputeOutcome, EvidenceRef, Message, MessageKind, Trade,
        TradeStatus,
    },
    notifier::{NotificationPort, TracingNotifier},
    reputation::{Feedback, ReputationBook, TraderProfile},
    EscrowResult,
};

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    config: EscrowNodeConfig,
    book: Arc<AdvertisementBook>,
    engine: Arc<TradeEngine>,
    arbiter: Arc<DisputeArbiter>,
    conversation: Arc<ConversationLog>,
    reputation: Arc<ReputationBook>,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Node health status
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub advertisements: usize,
    pub trades: usize,
    pub open_disputes: usize,
    /// PENDING trades past their deadline not yet expired
    pub expiring_trades: usize,
    pub sweeper_running: bool,
    pub timestamp: DateTime<Utc>,
}

impl EscrowNode {
    /// Create a new escrow node with all components initialized
    pub fn new(
        config: EscrowNodeConfig,
        ledger: Arc<dyn LedgerPort>,
        notifier: Arc<dyn NotificationPort>,
        fees: Arc<dyn FeePolicy>,
    ) -> EscrowResult<Self> {
        info!("Initializing escrow node");
        config.validate()?;

        let ledger = GuardedLedger::new(ledger, &config.ledger);
        let book = Arc::new(AdvertisementBook::new(
            config.book.clone(),
            ledger.clone(),
            notifier.clone(),
        ));
        let conversation = Arc::new(ConversationLog::new(notifier.clone()));
        let reputation = Arc::new(ReputationBook::new(config.reputation.clone()));
        let engine = Arc::new(TradeEngine::new(
            config.engine.clone(),
            book.clone(),
            conversation.clone(),
            reputation.clone(),
            ledger,
            fees,
            notifier.clone(),
        ));
        let arbiter = Arc::new(DisputeArbiter::new(
            engine.clone(),
            reputation.clone(),
            notifier,
        ));
        let (shutdown, _) = watch::channel(false);

        info!("Escrow node initialized successfully");

        Ok(Self {
            config,
            book,
            engine,
            arbiter,
            conversation,
            reputation,
            shutdown,
            sweeper: Mutex::new(None),
        })
    }

    /// Node backed by the in-memory ledger and the tracing notifier
    ///
    /// The ledger handle is returned so callers can fund accounts.
    pub fn in_memory(config: EscrowNodeConfig) -> EscrowResult<(Self, Arc<InMemoryLedger>)> {
        let ledger = Arc::new(InMemoryLedger::new());
        let fees = Arc::new(PercentageFee::new(&config.fees));
        let node = Self::new(config, ledger.clone(), Arc::new(TracingNotifier), fees)?;
        Ok((node, ledger))
    }

    pub fn config(&self) -> &EscrowNodeConfig {
        &self.config
    }

    // Advertisements

    pub async fn create_ad(&self, request: CreateAdRequest) -> EscrowResult<Advertisement> {
        self.book.create(request).await
    }

    pub async fn get_ad(&self, ad_id: Uuid) -> EscrowResult<Advertisement> {
        self.book.get(ad_id).await
    }

    pub async fn list_ads(&self, filter: &AdFilter) -> Vec<Advertisement> {
        self.book.list(filter).await
    }

    pub async fn list_ads_by_owner(&self, owner: &str) -> Vec<Advertisement> {
        self.book.list_by_owner(owner).await
    }

    pub async fn cancel_ad(&self, ad_id: Uuid, owner: &str) -> EscrowResult<Advertisement> {
        self.book.cancel(ad_id, owner).await
    }

    // Trades

    pub async fn open_trade(&self, request: OpenTradeRequest) -> EscrowResult<Trade> {
        self.engine.open(request).await
    }

    pub async fn mark_payment_sent(&self, trade_id: Uuid, caller: &str) -> EscrowResult<Trade> {
        self.engine.mark_payment_sent(trade_id, caller).await
    }

    pub async fn confirm_payment_received(
        &self,
        trade_id: Uuid,
        caller: &str,
    ) -> EscrowResult<Trade> {
        self.engine.confirm_payment_received(trade_id, caller).await
    }

    pub async fn cancel_trade(&self, trade_id: Uuid, caller: &str) -> EscrowResult<CancelOutcome> {
        self.engine.cancel(trade_id, caller).await
    }

    pub async fn expire_trade(&self, trade_id: Uuid) -> EscrowResult<Trade> {
        self.engine.expire(trade_id).await
    }

    pub async fn get_trade(&self, trade_id: Uuid) -> EscrowResult<Trade> {
        self.engine.get_trade(trade_id).await
    }

    pub async fn list_trades_for(&self, user_id: &str, status: Option<TradeStatus>) -> Vec<Trade> {
        self.engine.list_trades_for(user_id, status).await
    }

    pub async fn list_expiring(&self, now: DateTime<Utc>) -> Vec<Trade> {
        self.engine.list_expiring(now).await
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        self.engine.sweep_expired(now).await
    }

    // Disputes

    pub async fn raise_dispute(
        &self,
        trade_id: Uuid,
        initiator: &str,
        reason: &str,
        evidence: Vec<EvidenceRef>,
    ) -> EscrowResult<Dispute> {
        self.arbiter
            .raise(trade_id, initiator, reason, evidence)
            .await
    }

    pub async fn resolve_dispute(
        &self,
        dispute_id: Uuid,
        arbitrator: &str,
        outcome: DisputeOutcome,
        notes: Option<String>,
    ) -> EscrowResult<Dispute> {
        self.arbiter
            .resolve(dispute_id, arbitrator, outcome, notes)
            .await
    }

    pub async fn get_dispute(&self, dispute_id: Uuid) -> EscrowResult<Dispute> {
        self.arbiter.get(dispute_id).await
    }

    pub async fn get_dispute_by_trade(&self, trade_id: Uuid) -> Option<Dispute> {
        self.arbiter.get_by_trade(trade_id).await
    }

    pub async fn list_open_disputes(&self) -> Vec<Dispute> {
        self.arbiter.list_open().await
    }

    // Conversation

    /// Post a chat message as `sender`
    pub async fn send_message(
        &self,
        trade_id: Uuid,
        sender: &str,
        body: &str,
    ) -> EscrowResult<Message> {
        self.conversation
            .append(trade_id, sender, body, MessageKind::Text)
            .await
    }

    pub async fn list_messages(
        &self,
        trade_id: Uuid,
        caller: &str,
        cursor: Option<u64>,
    ) -> EscrowResult<Vec<Message>> {
        self.conversation.list_since(trade_id, caller, cursor).await
    }

    pub async fn unread_count(&self, trade_id: Uuid, caller: &str) -> EscrowResult<usize> {
        self.conversation.unread_count(trade_id, caller).await
    }

    // Reputation

    pub async fn leave_feedback(
        &self,
        trade_id: Uuid,
        from: &str,
        rating: u8,
        comment: Option<String>,
    ) -> EscrowResult<Feedback> {
        let trade = self.engine.get_trade(trade_id).await?;
        self.reputation
            .leave_feedback(&trade, from, rating, comment)
            .await
    }

    pub async fn trader_profile(&self, user_id: &str) -> TraderProfile {
        self.reputation.get(user_id).await
    }

    pub async fn feedback_for(&self, user_id: &str) -> Vec<Feedback> {
        self.reputation.feedback_for(user_id).await
    }

    // Lifecycle

    /// Start the background deadline sweeper
    ///
    /// Returns false when the sweeper is disabled or already running.
    pub async fn spawn_sweeper(&self) -> bool {
        if !self.config.sweeper.enabled {
            info!("Deadline sweeper disabled by configuration");
            return false;
        }

        let mut handle = self.sweeper.lock().await;
        if handle.as_ref().map_or(false, |h| !h.is_finished()) {
            return false;
        }

        self.shutdown.send_replace(false);
        let sweeper = DeadlineSweeper::new(self.engine.clone(), &self.config.sweeper);
        *handle = Some(sweeper.spawn(self.shutdown.subscribe()));
        true
    }

    /// Check component health
    pub async fn health_check(&self) -> EscrowResult<NodeHealth> {
        let mut issues = Vec::new();

        let expiring_trades = self.engine.list_expiring(Utc::now()).await.len();
        let sweeper_running = self
            .sweeper
            .lock()
            .await
            .as_ref()
            .map_or(false, |h| !h.is_finished());

        if expiring_trades > self.config.engine.sweep_batch_size {
            issues.push(format!(
                "{} trades past their payment deadline await expiry",
                expiring_trades
            ));
        }
        if self.config.sweeper.enabled && expiring_trades > 0 && !sweeper_running {
            issues.push("Deadline sweeper is not running".to_string());
        }

        Ok(NodeHealth {
            healthy: issues.is_empty(),
            issues,
            advertisements: self.book.len().await,
            trades: self.engine.len().await,
            open_disputes: self.arbiter.list_open().await.len(),
            expiring_trades,
            sweeper_running,
            timestamp: Utc::now(),
        })
    }

    /// Stop background work
    pub async fn shutdown(&self) -> EscrowResult<()> {
        info!("Shutting down escrow node");

        self.shutdown.send_replace(true);
        if let Some(handle) = self.sweeper.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Deadline sweeper ended abnormally: {}", e);
            }
        }

        info!("Escrow node shutdown complete");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::EscrowError, models::AdSide};
    use rust_decimal_macros::dec;

    async fn funded_node() -> (EscrowNode, Arc<InMemoryLedger>) {
        let (node, ledger) = EscrowNode::in_memory(EscrowNodeConfig::default()).unwrap();
        ledger.deposit("alice", "USDT", dec!(500)).await;
        (node, ledger)
    }

    fn sell_ad() -> CreateAdRequest {
        CreateAdRequest {
            owner: "alice".to_string(),
            side: AdSide::Sell,
            asset: "USDT".to_string(),
            fiat_currency: "NGN".to_string(),
            price: dec!(1500),
            quantity: dec!(100),
            min_amount: Some(dec!(15000)),
            max_amount: Some(dec!(150000)),
            payment_methods: vec!["bank_transfer".into()],
            terms: Some("Pay from an account in your name".to_string()),
            auto_reply: Some("Thanks, send proof of payment".to_string()),
            time_limit_minutes: Some(30),
        }
    }

    #[tokio::test]
    async fn test_node_health_check() {
        let (node, _) = funded_node().await;
        let health = node.health_check().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.trades, 0);
        assert!(!health.sweeper_running);
    }

    #[tokio::test]
    async fn test_trade_flow_with_feedback() {
        let (node, ledger) = funded_node().await;
        let ad = node.create_ad(sell_ad()).await.unwrap();

        let trade = node
            .open_trade(OpenTradeRequest {
                ad_id: ad.id,
                requester: "bob".to_string(),
                quantity: dec!(20),
                payment_method: "bank_transfer".into(),
                initial_message: None,
            })
            .await
            .unwrap();
        assert_eq!(trade.fiat_amount, dec!(30000));

        node.send_message(trade.id, "bob", "Sent via GTBank").await.unwrap();
        assert_eq!(node.unread_count(trade.id, "alice").await.unwrap(), 2);

        node.mark_payment_sent(trade.id, "bob").await.unwrap();
        assert!(matches!(
            node.leave_feedback(trade.id, "bob", 5, None).await,
            Err(EscrowError::InvalidState { .. })
        ));
        node.confirm_payment_received(trade.id, "alice").await.unwrap();

        node.leave_feedback(trade.id, "bob", 5, Some("smooth".to_string()))
            .await
            .unwrap();
        assert_eq!(node.trader_profile("alice").await.rating_count, 1);
        assert_eq!(node.feedback_for("alice").await.len(), 1);
        assert_eq!(ledger.balance("bob", "USDT").await.available, dec!(20));
        assert_eq!(node.list_trades_for("bob", None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let (node, _) = funded_node().await;

        assert!(node.spawn_sweeper().await);
        assert!(!node.spawn_sweeper().await);
        assert!(node.health_check().await.unwrap().sweeper_running);

        node.shutdown().await.unwrap();
        assert!(!node.health_check().await.unwrap().sweeper_running);
    }
}
