//! Escrow Trade Engine - trade lifecycle and escrow movements
//!
//! Drives each trade through `PENDING -> PAYMENT_SENT -> COMPLETED`, the
//! cancellation/expiry path back to the seller, and the DISPUTED detour
//! handed to the dispute arbiter.
//!
//! Transitions that touch the ledger run in three steps: claim the
//! transition under the trade's mutex, call the ledger with the mutex
//! released, then commit (or drop the claim if the call failed). While a
//! claim is held every other transition on the trade is rejected with
//! `InvalidState`, so exactly one of two racing transitions wins and a
//! failed ledger call leaves the trade in its prior state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    book::AdvertisementBook,
    conversation::{ConversationLog, MAX_MESSAGE_LENGTH},
    error::EscrowError,
    fees::FeePolicy,
    ledger::{GuardedLedger, IdempotencyKey},
    models::{
        DisputeOutcome, EscrowSource, MessageKind, PaymentMethodRef, Trade, TradeRole,
        TradeStatus, SYSTEM_ACTOR,
    },
    notifier::{deliver, EngineEvent, EventKind, NotificationPort, Subject},
    reputation::ReputationBook,
    EscrowResult,
};

/// Ledger transition names used in idempotency keys
const ESCROW_TRANSITION: &str = "escrow";
const RELEASE_TRANSITION: &str = "release";
const REFUND_TRANSITION: &str = "refund";

/// Configuration for the trade engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Most trades expired by one sweep pass
    pub sweep_batch_size: usize,
    /// Post SYSTEM messages into the trade chat at each transition
    pub system_messages: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_batch_size: 100,
            system_messages: true,
        }
    }
}

/// Configuration for the background deadline sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Seconds between sweep passes
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

/// Trade opening request
#[derive(Debug, Clone)]
pub struct OpenTradeRequest {
    pub ad_id: Uuid,
    pub requester: String,
    pub quantity: Decimal,
    pub payment_method: PaymentMethodRef,
    pub initial_message: Option<String>,
}

/// Result of a cancellation request
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// Trade is CANCELLED and its escrow returned
    Cancelled(Trade),
    /// Seller's request recorded; the trade stays PENDING until the buyer agrees
    AwaitingCounterparty(Trade),
}

impl CancelOutcome {
    pub fn trade(&self) -> &Trade {
        match self {
            Self::Cancelled(trade) | Self::AwaitingCounterparty(trade) => trade,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    /// Trades that moved on before the sweep reached them
    pub skipped: usize,
    /// Trades whose ledger call failed; retried on the next pass
    pub failed: usize,
}

struct TradeSlot {
    trade: Trade,
    /// Transition claimed but not yet committed
    in_flight: Option<TradeStatus>,
}

impl TradeSlot {
    fn ensure_idle(&self, action: &str) -> EscrowResult<()> {
        match self.in_flight {
            Some(pending) => Err(EscrowError::invalid_state(
                format!("trade {}", self.trade.id),
                self.trade.status,
                format!("{} (transition to {:?} in progress)", action, pending),
            )),
            None => Ok(()),
        }
    }
}

type TradeRef = Arc<Mutex<TradeSlot>>;

enum CancelStep {
    Requested(Trade, bool),
    Claimed(Trade, Option<String>),
}

/// Main trade engine
///
/// Cloning is cheap and shares every store.
#[derive(Clone)]
pub struct TradeEngine {
    config: EngineConfig,
    trades: Arc<RwLock<HashMap<Uuid, TradeRef>>>,
    book: Arc<AdvertisementBook>,
    conversation: Arc<ConversationLog>,
    reputation: Arc<ReputationBook>,
    ledger: GuardedLedger,
    fees: Arc<dyn FeePolicy>,
    notifier: Arc<dyn NotificationPort>,
}

impl TradeEngine {
    /// Create a new trade engine
    pub fn new(
        config: EngineConfig,
        book: Arc<AdvertisementBook>,
        conversation: Arc<ConversationLog>,
        reputation: Arc<ReputationBook>,
        ledger: GuardedLedger,
        fees: Arc<dyn FeePolicy>,
        notifier: Arc<dyn NotificationPort>,
    ) -> Self {
        Self {
            config,
            trades: Arc::new(RwLock::new(HashMap::new())),
            book,
            conversation,
            reputation,
            ledger,
            fees,
            notifier,
        }
    }

    /// Match a counter-request against an advertisement
    ///
    /// Reservation, escrow lock and registration run on their own task, so
    /// a caller that stops waiting never strands a reservation or a lock.
    pub async fn open(&self, request: OpenTradeRequest) -> EscrowResult<Trade> {
        info!(
            "Opening trade on ad {}: {} by {}",
            request.ad_id, request.quantity, request.requester
        );

        self.validate_open_request(&request)?;

        let engine = self.clone();
        detached(async move { engine.place(request).await }).await
    }

    async fn place(&self, request: OpenTradeRequest) -> EscrowResult<Trade> {
        let ad = self.book.get(request.ad_id).await?;
        if !ad.payment_methods.contains(&request.payment_method) {
            return Err(EscrowError::validation(
                "Payment method is not accepted by this advertisement",
            ));
        }

        let ad = self
            .book
            .reserve(request.ad_id, &request.requester, request.quantity)
            .await?;

        let now = Utc::now();
        let fee = self.fees.fee_for(&ad, request.quantity);
        let trade = Trade::new(
            &ad,
            &request.requester,
            request.quantity,
            request.payment_method,
            fee,
            now,
        );

        if trade.escrow_source == EscrowSource::Trade {
            let locked = self
                .ledger
                .lock(
                    &trade.seller,
                    &trade.asset,
                    trade.quantity,
                    &IdempotencyKey::new(trade.id, ESCROW_TRANSITION),
                )
                .await;

            if let Err(e) = locked {
                warn!("Escrow lock for trade on ad {} failed: {}", ad.id, e);
                if let Err(restore_err) = self.book.restore(ad.id, trade.quantity).await {
                    error!(
                        "Failed to release reservation of {} on ad {}: {}",
                        trade.quantity, ad.id, restore_err
                    );
                }
                return Err(e);
            }
        }

        self.trades.write().await.insert(
            trade.id,
            Arc::new(Mutex::new(TradeSlot {
                trade: trade.clone(),
                in_flight: None,
            })),
        );
        self.conversation
            .open_thread(trade.id, &trade.buyer, &trade.seller)
            .await;

        self.post_system(
            trade.id,
            format!(
                "Trade opened: {} {} for {} {}. Pay before {}.",
                trade.quantity,
                trade.asset,
                trade.fiat_amount,
                trade.fiat_currency,
                trade.payment_deadline.format("%Y-%m-%d %H:%M UTC")
            ),
        )
        .await;
        if let Some(body) = &request.initial_message {
            if let Err(e) = self
                .conversation
                .append(trade.id, &request.requester, body, MessageKind::Text)
                .await
            {
                warn!("Initial message for trade {} dropped: {}", trade.id, e);
            }
        }
        if let Some(reply) = &ad.auto_reply {
            if let Err(e) = self
                .conversation
                .append(trade.id, &ad.owner, reply, MessageKind::AutoReply)
                .await
            {
                warn!("Auto-reply for trade {} dropped: {}", trade.id, e);
            }
        }

        self.emit(EventKind::TradeCreated, &trade, [&trade.buyer, &trade.seller])
            .await;

        info!(
            "Created trade {}: buyer={} seller={} amount={} {}",
            trade.id, trade.buyer, trade.seller, trade.fiat_amount, trade.fiat_currency
        );

        Ok(trade)
    }

    /// Buyer signals the off-platform payment has been sent
    pub async fn mark_payment_sent(&self, trade_id: Uuid, caller: &str) -> EscrowResult<Trade> {
        info!("Marking payment sent for trade {}", trade_id);

        let slot = self.slot(trade_id).await?;
        let trade = {
            let mut guard = slot.lock().await;
            if guard.trade.buyer != caller {
                return Err(EscrowError::forbidden(
                    "Only the buyer can mark payment as sent",
                ));
            }
            guard.ensure_idle("mark payment sent")?;
            if !guard.trade.status.can_mark_paid() {
                return Err(EscrowError::invalid_state(
                    format!("trade {}", trade_id),
                    guard.trade.status,
                    "mark payment sent",
                ));
            }
            guard
                .trade
                .transition(TradeStatus::PaymentSent, caller, Utc::now())?;
            guard.trade.cancel_requested_by = None;
            guard.trade.clone()
        };

        self.post_system(
            trade_id,
            "Buyer marked the payment as sent. Seller: confirm once the funds arrive.",
        )
        .await;
        self.emit(EventKind::TradePaymentSent, &trade, [&trade.seller])
            .await;

        Ok(trade)
    }

    /// Seller confirms the fiat arrived; escrow is released to the buyer
    ///
    /// If the ledger transfer fails the trade stays PAYMENT_SENT and the
    /// retryable error is returned. Once claimed, the release runs to its
    /// end even if the caller stops waiting.
    pub async fn confirm_payment_received(
        &self,
        trade_id: Uuid,
        caller: &str,
    ) -> EscrowResult<Trade> {
        info!("Confirming payment received for trade {}", trade_id);

        let engine = self.clone();
        let caller = caller.to_string();
        detached(async move {
            let (slot, trade) = engine
                .claim(trade_id, TradeStatus::Completed, "confirm payment", |trade| {
                    if trade.seller != caller {
                        return Err(EscrowError::forbidden(
                            "Only the seller can confirm payment received",
                        ));
                    }
                    if !trade.status.can_confirm() {
                        return Err(EscrowError::invalid_state(
                            format!("trade {}", trade.id),
                            trade.status,
                            "confirm payment",
                        ));
                    }
                    Ok(())
                })
                .await?;

            let completed = engine
                .release_to_buyer(&slot, &trade, &caller, Utc::now())
                .await?;

            engine
                .post_system(
                    trade_id,
                    format!(
                        "Seller confirmed payment. {} {} released to the buyer.",
                        completed.quantity, completed.asset
                    ),
                )
                .await;
            engine
                .emit(
                    EventKind::TradeCompleted,
                    &completed,
                    [&completed.buyer, &completed.seller],
                )
                .await;

            info!("Completed trade {}", trade_id);

            Ok::<_, EscrowError>(completed)
        })
        .await
    }

    /// Cancel a PENDING trade whose payment deadline has passed
    pub async fn expire(&self, trade_id: Uuid) -> EscrowResult<Trade> {
        self.expire_at(trade_id, Utc::now()).await
    }

    /// Expire as of `now`
    pub async fn expire_at(&self, trade_id: Uuid, now: DateTime<Utc>) -> EscrowResult<Trade> {
        let engine = self.clone();
        detached(async move {
            let (slot, trade) = engine
                .claim(trade_id, TradeStatus::Cancelled, "expire", |trade| {
                    if !trade.status.can_cancel() {
                        return Err(EscrowError::invalid_state(
                            format!("trade {}", trade.id),
                            trade.status,
                            "expire",
                        ));
                    }
                    if now <= trade.payment_deadline {
                        return Err(EscrowError::invalid_state(
                            format!("trade {}", trade.id),
                            trade.status,
                            format!("expire before deadline {}", trade.payment_deadline),
                        ));
                    }
                    Ok(())
                })
                .await?;

            let cancelled = engine
                .refund_to_seller(&slot, &trade, SYSTEM_ACTOR, now)
                .await?;
            engine
                .reputation
                .record_cancellation(&cancelled, Some(cancelled.buyer.as_str()))
                .await;

            engine
                .post_system(
                    trade_id,
                    "Payment time limit expired. The trade was cancelled and the escrow returned.",
                )
                .await;
            engine
                .emit_with(
                    EventKind::TradeCancelled,
                    &cancelled,
                    [&cancelled.buyer, &cancelled.seller],
                    serde_json::json!({ "reason": "expired" }),
                )
                .await;

            info!("Expired trade {}", trade_id);

            Ok::<_, EscrowError>(cancelled)
        })
        .await
    }

    /// Withdraw from a PENDING trade
    ///
    /// The buyer cancels immediately. A seller's request is recorded and
    /// takes effect once the buyer also cancels.
    pub async fn cancel(&self, trade_id: Uuid, caller: &str) -> EscrowResult<CancelOutcome> {
        info!("Cancel requested for trade {} by {}", trade_id, caller);

        let engine = self.clone();
        let caller = caller.to_string();
        detached(async move { engine.withdraw(trade_id, &caller).await }).await
    }

    async fn withdraw(&self, trade_id: Uuid, caller: &str) -> EscrowResult<CancelOutcome> {
        let slot = self.slot(trade_id).await?;
        let step = {
            let mut guard = slot.lock().await;
            let role = guard.trade.role_of(caller).ok_or_else(|| {
                EscrowError::forbidden(format!("{} is not a party to trade {}", caller, trade_id))
            })?;
            guard.ensure_idle("cancel")?;
            if !guard.trade.status.can_cancel() {
                return Err(EscrowError::invalid_state(
                    format!("trade {}", trade_id),
                    guard.trade.status,
                    "cancel",
                ));
            }

            match role {
                TradeRole::Seller => {
                    let first_request = guard.trade.cancel_requested_by.is_none();
                    if first_request {
                        guard.trade.cancel_requested_by = Some(caller.to_string());
                        guard.trade.updated_at = Utc::now();
                    }
                    CancelStep::Requested(guard.trade.clone(), first_request)
                }
                TradeRole::Buyer => {
                    let blamed = match guard.trade.cancel_requested_by {
                        Some(_) => None,
                        None => Some(caller.to_string()),
                    };
                    guard.in_flight = Some(TradeStatus::Cancelled);
                    CancelStep::Claimed(guard.trade.clone(), blamed)
                }
            }
        };

        let (trade, blamed) = match step {
            CancelStep::Requested(trade, first_request) => {
                if first_request {
                    self.post_system(
                        trade_id,
                        "Seller asked to cancel this trade. Buyer: cancel to agree.",
                    )
                    .await;
                }
                return Ok(CancelOutcome::AwaitingCounterparty(trade));
            }
            CancelStep::Claimed(trade, blamed) => (trade, blamed),
        };

        let cancelled = self
            .refund_to_seller(&slot, &trade, caller, Utc::now())
            .await?;
        self.reputation
            .record_cancellation(&cancelled, blamed.as_deref())
            .await;

        self.post_system(trade_id, "Trade cancelled. The escrow was returned to the seller.")
            .await;
        self.emit_with(
            EventKind::TradeCancelled,
            &cancelled,
            [&cancelled.buyer, &cancelled.seller],
            serde_json::json!({ "reason": "cancelled", "by": caller }),
        )
        .await;

        info!("Cancelled trade {}", trade_id);

        Ok(CancelOutcome::Cancelled(cancelled))
    }

    /// Get a trade by ID
    pub async fn get_trade(&self, trade_id: Uuid) -> EscrowResult<Trade> {
        let slot = self.slot(trade_id).await?;
        let trade = slot.lock().await.trade.clone();
        Ok(trade)
    }

    /// Trades `user_id` is a party to, newest first
    pub async fn list_trades_for(
        &self,
        user_id: &str,
        status: Option<TradeStatus>,
    ) -> Vec<Trade> {
        let mut trades = Vec::new();
        for slot in self.slots().await {
            let guard = slot.lock().await;
            if guard.trade.is_party(user_id) && status.map_or(true, |s| guard.trade.status == s) {
                trades.push(guard.trade.clone());
            }
        }
        trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        trades
    }

    /// PENDING trades past their deadline, earliest deadline first
    ///
    /// These are still PENDING until `expire` runs.
    pub async fn list_expiring(&self, now: DateTime<Utc>) -> Vec<Trade> {
        let mut trades = Vec::new();
        for slot in self.slots().await {
            let guard = slot.lock().await;
            if guard.trade.is_expiring(now) {
                trades.push(guard.trade.clone());
            }
        }
        trades.sort_by(|a, b| a.payment_deadline.cmp(&b.payment_deadline));
        trades
    }

    /// Expire every trade past its deadline as of `now`
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let expiring = self.list_expiring(now).await;

        for trade in expiring.into_iter().take(self.config.sweep_batch_size) {
            match self.expire_at(trade.id, now).await {
                Ok(_) => report.expired += 1,
                Err(e) if e.is_retryable() => {
                    warn!("Failed to expire trade {}: {}", trade.id, e);
                    report.failed += 1;
                }
                Err(e) => {
                    debug!("Skipping trade {}: {}", trade.id, e);
                    report.skipped += 1;
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            info!(
                "Deadline sweep: {} expired, {} skipped, {} failed",
                report.expired, report.skipped, report.failed
            );
        }

        report
    }

    /// Freeze a trade for arbitration
    pub(crate) async fn begin_dispute(
        &self,
        trade_id: Uuid,
        initiator: &str,
        dispute_id: Uuid,
    ) -> EscrowResult<Trade> {
        let slot = self.slot(trade_id).await?;
        let trade = {
            let mut guard = slot.lock().await;
            if !guard.trade.is_party(initiator) {
                return Err(EscrowError::forbidden(format!(
                    "{} is not a party to trade {}",
                    initiator, trade_id
                )));
            }
            guard.ensure_idle("raise dispute")?;
            if !guard.trade.status.can_dispute() {
                return Err(EscrowError::invalid_state(
                    format!("trade {}", trade_id),
                    guard.trade.status,
                    "raise dispute",
                ));
            }
            guard
                .trade
                .transition(TradeStatus::Disputed, initiator, Utc::now())?;
            guard.trade.dispute_id = Some(dispute_id);
            guard.trade.cancel_requested_by = None;
            guard.trade.clone()
        };

        self.post_system(
            trade_id,
            "A dispute was opened. The trade is frozen until an arbitrator resolves it.",
        )
        .await;

        Ok(trade)
    }

    /// Execute an arbitrator's decision on a DISPUTED trade
    pub(crate) async fn settle_dispute(
        &self,
        trade_id: Uuid,
        outcome: DisputeOutcome,
        arbitrator: &str,
    ) -> EscrowResult<Trade> {
        let to = match outcome {
            DisputeOutcome::ReleaseToBuyer => TradeStatus::Completed,
            DisputeOutcome::ReleaseToSeller => TradeStatus::Cancelled,
        };
        let (slot, trade) = self
            .claim(trade_id, to, "resolve dispute", |trade| {
                if trade.status != TradeStatus::Disputed {
                    return Err(EscrowError::invalid_state(
                        format!("trade {}", trade.id),
                        trade.status,
                        "resolve dispute",
                    ));
                }
                Ok(())
            })
            .await?;

        let now = Utc::now();
        let settled = match outcome {
            DisputeOutcome::ReleaseToBuyer => {
                self.release_to_buyer(&slot, &trade, arbitrator, now).await?
            }
            DisputeOutcome::ReleaseToSeller => {
                let cancelled = self.refund_to_seller(&slot, &trade, arbitrator, now).await?;
                self.reputation.record_cancellation(&cancelled, None).await;
                cancelled
            }
        };

        let body = match outcome {
            DisputeOutcome::ReleaseToBuyer => "Arbitration decided: escrow released to the buyer.",
            DisputeOutcome::ReleaseToSeller => "Arbitration decided: escrow returned to the seller.",
        };
        self.post_system(trade_id, body).await;

        Ok(settled)
    }

    /// Number of trades held, in any status
    pub async fn len(&self) -> usize {
        self.trades.read().await.len()
    }

    /// Claim a transition: run `check` and mark `to` in flight under the trade's mutex
    async fn claim<F>(
        &self,
        trade_id: Uuid,
        to: TradeStatus,
        action: &str,
        check: F,
    ) -> EscrowResult<(TradeRef, Trade)>
    where
        F: FnOnce(&Trade) -> EscrowResult<()>,
    {
        let slot = self.slot(trade_id).await?;
        let trade = {
            let mut guard = slot.lock().await;
            check(&guard.trade)?;
            guard.ensure_idle(action)?;
            guard.trade.validate_transition(to)?;
            guard.in_flight = Some(to);
            guard.trade.clone()
        };
        debug!("Claimed {:?} for trade {}", to, trade_id);
        Ok((slot, trade))
    }

    async fn commit(
        slot: &TradeRef,
        to: TradeStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<Trade> {
        let mut guard = slot.lock().await;
        guard.in_flight = None;
        guard.trade.transition(to, actor, now)?;
        Ok(guard.trade.clone())
    }

    async fn abandon(slot: &TradeRef) {
        slot.lock().await.in_flight = None;
    }

    /// Transfer the escrowed quantity to the buyer and commit COMPLETED
    async fn release_to_buyer(
        &self,
        slot: &TradeRef,
        trade: &Trade,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<Trade> {
        if let Err(e) = self
            .ensure_not_applied(
                trade,
                REFUND_TRANSITION,
                "release (escrow was already returned to the seller)",
            )
            .await
        {
            Self::abandon(slot).await;
            return Err(e);
        }

        let transferred = self
            .ledger
            .transfer(
                &trade.seller,
                &trade.buyer,
                &trade.asset,
                trade.quantity,
                &IdempotencyKey::new(trade.id, RELEASE_TRANSITION),
            )
            .await;
        if let Err(e) = transferred {
            Self::abandon(slot).await;
            return Err(e);
        }

        let completed = Self::commit(slot, TradeStatus::Completed, actor, now).await?;

        if let Err(e) = self
            .book
            .record_completion(completed.ad_id, completed.fiat_amount)
            .await
        {
            warn!("Failed to update stats of ad {}: {}", completed.ad_id, e);
        }
        self.reputation.record_completion(&completed).await;

        Ok(completed)
    }

    /// Return the escrow to the seller and commit CANCELLED
    async fn refund_to_seller(
        &self,
        slot: &TradeRef,
        trade: &Trade,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<Trade> {
        let returned = match self
            .ensure_not_applied(
                trade,
                RELEASE_TRANSITION,
                "refund (escrow was already released to the buyer)",
            )
            .await
        {
            Ok(()) => self.return_escrow(trade).await,
            Err(e) => Err(e),
        };
        if let Err(e) = returned {
            Self::abandon(slot).await;
            return Err(e);
        }
        Self::commit(slot, TradeStatus::Cancelled, actor, now).await
    }

    /// Reject a settlement when the opposite one already reached the ledger
    ///
    /// A release or refund whose response was lost is still applied, and
    /// the trade keeps its prior status until a retry commits it. Only that
    /// same settlement may follow.
    async fn ensure_not_applied(
        &self,
        trade: &Trade,
        opposite: &str,
        action: &str,
    ) -> EscrowResult<()> {
        let key = IdempotencyKey::new(trade.id, opposite);
        if let Some(receipt) = self.ledger.receipt(&key).await? {
            warn!(
                "Trade {} already has {:?} of {} {} applied at the ledger",
                trade.id, receipt.op, receipt.amount, receipt.asset
            );
            return Err(EscrowError::invalid_state(
                format!("trade {}", trade.id),
                trade.status,
                action,
            ));
        }
        Ok(())
    }

    /// Give a cancelled trade's quantity back
    ///
    /// Escrow that came from a SELL ad flows back into the ad when it still
    /// accepts it and stays locked there; otherwise it is unlocked to the
    /// seller. Escrow locked at trade opening is always unlocked.
    async fn return_escrow(&self, trade: &Trade) -> EscrowResult<()> {
        let key = IdempotencyKey::new(trade.id, REFUND_TRANSITION);
        match trade.escrow_source {
            EscrowSource::Trade => {
                self.ledger
                    .unlock(&trade.seller, &trade.asset, trade.quantity, &key)
                    .await?;
                let restored = self.book.restore(trade.ad_id, trade.quantity).await?;
                debug!(
                    "Unlocked {} {} for trade {} (ad restored: {})",
                    trade.quantity, trade.asset, trade.id, restored
                );
            }
            EscrowSource::Advertisement => {
                if self.book.restore(trade.ad_id, trade.quantity).await? {
                    debug!(
                        "Returned {} {} from trade {} to ad {}",
                        trade.quantity, trade.asset, trade.id, trade.ad_id
                    );
                } else {
                    self.ledger
                        .unlock(&trade.seller, &trade.asset, trade.quantity, &key)
                        .await?;
                    debug!(
                        "Ad {} is closed; unlocked {} {} for trade {}",
                        trade.ad_id, trade.quantity, trade.asset, trade.id
                    );
                }
            }
        }
        Ok(())
    }

    async fn slot(&self, trade_id: Uuid) -> EscrowResult<TradeRef> {
        self.trades
            .read()
            .await
            .get(&trade_id)
            .cloned()
            .ok_or_else(|| EscrowError::TradeNotFound(trade_id.to_string()))
    }

    async fn slots(&self) -> Vec<TradeRef> {
        self.trades.read().await.values().cloned().collect()
    }

    async fn post_system<S: AsRef<str>>(&self, trade_id: Uuid, body: S) {
        if !self.config.system_messages {
            return;
        }
        if let Err(e) = self
            .conversation
            .append_system(trade_id, body.as_ref())
            .await
        {
            warn!("System message for trade {} dropped: {}", trade_id, e);
        }
    }

    async fn emit<'a, I>(&self, kind: EventKind, trade: &Trade, recipients: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.emit_with(kind, trade, recipients, serde_json::Value::Null)
            .await
    }

    async fn emit_with<'a, I>(
        &self,
        kind: EventKind,
        trade: &Trade,
        recipients: I,
        extra: serde_json::Value,
    ) where
        I: IntoIterator<Item = &'a String>,
    {
        let mut payload = trade_payload(trade);
        if let (Some(payload), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra)
        {
            payload.extend(extra);
        }
        deliver(
            self.notifier.as_ref(),
            EngineEvent::new(kind, Subject::Trade(trade.id), payload)
                .to(recipients.into_iter().cloned()),
        )
        .await;
    }

    /// Validate trade opening request
    fn validate_open_request(&self, request: &OpenTradeRequest) -> EscrowResult<()> {
        if request.quantity <= Decimal::ZERO {
            return Err(EscrowError::validation("Quantity must be greater than 0"));
        }
        if request.requester.trim().is_empty() {
            return Err(EscrowError::validation("Requester cannot be empty"));
        }
        if let Some(message) = &request.initial_message {
            if message.len() > MAX_MESSAGE_LENGTH {
                return Err(EscrowError::validation(format!(
                    "Initial message exceeds {} bytes",
                    MAX_MESSAGE_LENGTH
                )));
            }
        }
        Ok(())
    }
}

/// Run `work` on its own task and wait for it
///
/// Dropping the returned future does not stop `work`: once a transition has
/// claimed a trade or reserved quantity it always reaches its commit or its
/// rollback.
pub(crate) async fn detached<T, F>(work: F) -> EscrowResult<T>
where
    F: Future<Output = EscrowResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| EscrowError::internal(format!("engine task failed: {}", e)))?
}

fn trade_payload(trade: &Trade) -> serde_json::Value {
    serde_json::json!({
        "trade_id": trade.id,
        "ad_id": trade.ad_id,
        "buyer": trade.buyer,
        "seller": trade.seller,
        "asset": trade.asset,
        "quantity": trade.quantity,
        "fiat_amount": trade.fiat_amount,
        "fiat_currency": trade.fiat_currency,
        "status": trade.status,
        "payment_deadline": trade.payment_deadline,
    })
}

/// Periodically expires trades whose payment deadline has passed
pub struct DeadlineSweeper {
    engine: Arc<TradeEngine>,
    interval: Duration,
}

impl DeadlineSweeper {
    pub fn new(engine: Arc<TradeEngine>, config: &SweeperConfig) -> Self {
        Self {
            engine,
            interval: Duration::from_secs(config.interval_secs.max(1)),
        }
    }

    /// Run on a background task until `shutdown` flips to true or its sender drops
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Deadline sweeper started (every {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.engine.sweep_expired(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Deadline sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        book::{BookConfig, CreateAdRequest},
        fees::PercentageFee,
        ledger::{InMemoryLedger, LedgerConfig, LedgerOp, LedgerPort},
        models::{AdSide, AdStatus, Advertisement},
        notifier::RecordingNotifier,
        reputation::ReputationConfig,
    };
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    struct Fixture {
        engine: TradeEngine,
        book: Arc<AdvertisementBook>,
        conversation: Arc<ConversationLog>,
        reputation: Arc<ReputationBook>,
        ledger: Arc<InMemoryLedger>,
        events: RecordingNotifier,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.deposit("maker", "USDT", dec!(100)).await;
        ledger.deposit("taker", "USDT", dec!(100)).await;

        let events = RecordingNotifier::new();
        let notifier: Arc<dyn NotificationPort> = Arc::new(events.clone());
        let guarded = GuardedLedger::new(ledger.clone(), &LedgerConfig::default());
        let book = Arc::new(AdvertisementBook::new(
            BookConfig::default(),
            guarded.clone(),
            notifier.clone(),
        ));
        let conversation = Arc::new(ConversationLog::new(notifier.clone()));
        let reputation = Arc::new(ReputationBook::new(ReputationConfig::default()));
        let engine = TradeEngine::new(
            EngineConfig::default(),
            book.clone(),
            conversation.clone(),
            reputation.clone(),
            guarded,
            Arc::new(PercentageFee::default()),
            notifier,
        );

        Fixture {
            engine,
            book,
            conversation,
            reputation,
            ledger,
            events,
        }
    }

    async fn post_ad(f: &Fixture, side: AdSide, auto_reply: Option<&str>) -> Advertisement {
        f.book
            .create(CreateAdRequest {
                owner: "maker".to_string(),
                side,
                asset: "USDT".to_string(),
                fiat_currency: "EUR".to_string(),
                price: dec!(100),
                quantity: dec!(10),
                min_amount: Some(dec!(200)),
                max_amount: Some(dec!(600)),
                payment_methods: vec!["sepa".into()],
                terms: None,
                auto_reply: auto_reply.map(str::to_string),
                time_limit_minutes: Some(15),
            })
            .await
            .unwrap()
    }

    fn request(ad: &Advertisement, quantity: Decimal) -> OpenTradeRequest {
        OpenTradeRequest {
            ad_id: ad.id,
            requester: "taker".to_string(),
            quantity,
            payment_method: "sepa".into(),
            initial_message: None,
        }
    }

    #[tokio::test]
    async fn test_open_on_sell_ad() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, Some("Send the reference code")).await;

        let mut open = request(&ad, dec!(3));
        open.initial_message = Some("Hi, paying now".to_string());
        let trade = f.engine.open(open).await.unwrap();

        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.buyer, "taker");
        assert_eq!(trade.seller, "maker");
        assert_eq!(trade.fiat_amount, dec!(300));
        assert_eq!(trade.platform_fee, dec!(0.015));
        assert_eq!(trade.escrow_source, EscrowSource::Advertisement);
        assert_eq!(f.book.get(ad.id).await.unwrap().remaining_quantity, dec!(7));
        // SELL escrow came from the ad; the taker's funds are untouched
        assert_eq!(f.ledger.balance("taker", "USDT").await.locked, Decimal::ZERO);

        let messages = f.conversation.list_since(trade.id, "taker", None).await.unwrap();
        let kinds: Vec<MessageKind> = messages.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::System, MessageKind::Text, MessageKind::AutoReply]
        );
        assert!(messages[2].sender.is("maker"));

        let created = f.events.inbox("maker").await;
        assert!(created.iter().any(|e| e.kind == EventKind::TradeCreated));
        assert_eq!(f.events.count(EventKind::TradeCreated).await, 1);
    }

    #[tokio::test]
    async fn test_open_rejections_leave_ad_untouched() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;

        assert!(matches!(
            f.engine.open(request(&ad, dec!(1))).await,
            Err(EscrowError::AmountOutOfRange { .. })
        ));
        assert!(matches!(
            f.engine.open(request(&ad, Decimal::ZERO)).await,
            Err(EscrowError::Validation(_))
        ));
        let mut wrong_method = request(&ad, dec!(2));
        wrong_method.payment_method = "paypal".into();
        assert!(matches!(
            f.engine.open(wrong_method).await,
            Err(EscrowError::Validation(_))
        ));
        let mut own = request(&ad, dec!(2));
        own.requester = "maker".to_string();
        assert!(matches!(f.engine.open(own).await, Err(EscrowError::SelfTrade)));
        let mut missing = request(&ad, dec!(2));
        missing.ad_id = Uuid::new_v4();
        assert!(matches!(
            f.engine.open(missing).await,
            Err(EscrowError::AdNotFound(_))
        ));

        assert_eq!(f.book.get(ad.id).await.unwrap().remaining_quantity, dec!(10));
        assert_eq!(f.engine.len().await, 0);
    }

    #[tokio::test]
    async fn test_open_on_buy_ad_locks_requester() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Buy, None).await;

        let trade = f.engine.open(request(&ad, dec!(4))).await.unwrap();
        assert_eq!(trade.buyer, "maker");
        assert_eq!(trade.seller, "taker");
        assert_eq!(f.ledger.balance("taker", "USDT").await.locked, dec!(4));

        // a seller without funds is rejected and the reservation released
        let mut broke = request(&ad, dec!(4));
        broke.requester = "broke".to_string();
        assert!(matches!(
            f.engine.open(broke).await,
            Err(EscrowError::InsufficientFunds(_))
        ));
        assert_eq!(f.book.get(ad.id).await.unwrap().remaining_quantity, dec!(6));
    }

    #[tokio::test]
    async fn test_happy_path_moves_escrow_once() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;
        let trade = f.engine.open(request(&ad, dec!(3))).await.unwrap();

        assert!(matches!(
            f.engine.mark_payment_sent(trade.id, "maker").await,
            Err(EscrowError::Forbidden(_))
        ));
        assert!(matches!(
            f.engine.confirm_payment_received(trade.id, "maker").await,
            Err(EscrowError::InvalidState { .. })
        ));

        f.engine.mark_payment_sent(trade.id, "taker").await.unwrap();
        assert!(matches!(
            f.engine.confirm_payment_received(trade.id, "taker").await,
            Err(EscrowError::Forbidden(_))
        ));
        let completed = f
            .engine
            .confirm_payment_received(trade.id, "maker")
            .await
            .unwrap();

        assert_eq!(completed.status, TradeStatus::Completed);
        assert!(completed.completed_at.is_some());
        let statuses: Vec<TradeStatus> = completed.history.iter().map(|c| c.to).collect();
        assert_eq!(statuses, vec![TradeStatus::PaymentSent, TradeStatus::Completed]);

        assert_eq!(f.ledger.balance("taker", "USDT").await.available, dec!(103));
        let maker = f.ledger.balance("maker", "USDT").await;
        assert_eq!(maker.locked, dec!(7));
        assert_eq!(maker.total(), dec!(97));

        let ad = f.book.get(ad.id).await.unwrap();
        assert_eq!(ad.completed_trades, 1);
        assert_eq!(ad.total_volume, dec!(300));
        assert_eq!(f.reputation.get("taker").await.completed_trades, 1);

        assert!(matches!(
            f.engine.confirm_payment_received(trade.id, "maker").await,
            Err(EscrowError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_payment_sent() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;
        let trade = f.engine.open(request(&ad, dec!(3))).await.unwrap();
        f.engine.mark_payment_sent(trade.id, "taker").await.unwrap();

        f.ledger.fail_next(LedgerOp::Transfer, 1).await;
        let err = f
            .engine
            .confirm_payment_received(trade.id, "maker")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            f.engine.get_trade(trade.id).await.unwrap().status,
            TradeStatus::PaymentSent
        );
        assert_eq!(f.ledger.balance("taker", "USDT").await.available, dec!(100));

        f.engine
            .confirm_payment_received(trade.id, "maker")
            .await
            .unwrap();
        assert_eq!(f.ledger.balance("taker", "USDT").await.available, dec!(103));
    }

    #[tokio::test]
    async fn test_expire_restores_completed_ad() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;
        f.engine.open(request(&ad, dec!(6))).await.unwrap();
        let trade = f.engine.open(request(&ad, dec!(4))).await.unwrap();
        assert_eq!(f.book.get(ad.id).await.unwrap().status, AdStatus::Completed);

        assert!(matches!(
            f.engine.expire(trade.id).await,
            Err(EscrowError::InvalidState { .. })
        ));

        let later = trade.payment_deadline + ChronoDuration::seconds(1);
        let expired = f.engine.expire_at(trade.id, later).await.unwrap();
        assert_eq!(expired.status, TradeStatus::Cancelled);
        assert_eq!(expired.history[0].actor, SYSTEM_ACTOR);

        let ad = f.book.get(ad.id).await.unwrap();
        assert_eq!(ad.status, AdStatus::Active);
        assert_eq!(ad.remaining_quantity, dec!(4));
        // restored quantity stays escrowed by the ad
        assert_eq!(f.ledger.balance("maker", "USDT").await.locked, dec!(10));
        assert_eq!(f.reputation.get("taker").await.cancelled_trades, 1);

        assert!(f.engine.expire_at(trade.id, later).await.is_err());
    }

    #[tokio::test]
    async fn test_payment_sent_blocks_expiry() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;
        let trade = f.engine.open(request(&ad, dec!(3))).await.unwrap();
        f.engine.mark_payment_sent(trade.id, "taker").await.unwrap();

        let later = trade.payment_deadline + ChronoDuration::minutes(5);
        assert!(f.engine.list_expiring(later).await.is_empty());
        assert!(matches!(
            f.engine.expire_at(trade.id, later).await,
            Err(EscrowError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_seller_cancel_needs_buyer_agreement() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;
        let trade = f.engine.open(request(&ad, dec!(3))).await.unwrap();

        let outcome = f.engine.cancel(trade.id, "maker").await.unwrap();
        assert!(!outcome.is_cancelled());
        assert_eq!(outcome.trade().cancel_requested_by.as_deref(), Some("maker"));
        assert!(matches!(
            f.engine.cancel(trade.id, "stranger").await,
            Err(EscrowError::Forbidden(_))
        ));

        let outcome = f.engine.cancel(trade.id, "taker").await.unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(f.book.get(ad.id).await.unwrap().remaining_quantity, dec!(10));
        // mutual cancellation blames nobody
        assert_eq!(f.reputation.get("taker").await.score, 500);

        assert!(matches!(
            f.engine.cancel(trade.id, "taker").await,
            Err(EscrowError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_ad_withdrawn_unlocks_seller() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;
        let trade = f.engine.open(request(&ad, dec!(3))).await.unwrap();
        f.book.cancel(ad.id, "maker").await.unwrap();
        assert_eq!(f.ledger.balance("maker", "USDT").await.locked, dec!(3));

        f.engine.cancel(trade.id, "taker").await.unwrap();

        let maker = f.ledger.balance("maker", "USDT").await;
        assert_eq!(maker.locked, Decimal::ZERO);
        assert_eq!(maker.available, dec!(100));
        assert_eq!(f.book.get(ad.id).await.unwrap().status, AdStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_on_buy_ad_unlocks_requester() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Buy, None).await;
        let trade = f.engine.open(request(&ad, dec!(5))).await.unwrap();

        // the maker is the buyer here
        f.engine.cancel(trade.id, "maker").await.unwrap();
        let taker = f.ledger.balance("taker", "USDT").await;
        assert_eq!(taker.locked, Decimal::ZERO);
        assert_eq!(taker.available, dec!(100));
    }

    #[tokio::test]
    async fn test_failed_unlock_keeps_trade_pending() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Buy, None).await;
        let trade = f.engine.open(request(&ad, dec!(5))).await.unwrap();

        f.ledger.fail_next(LedgerOp::Unlock, 1).await;
        assert!(f.engine.cancel(trade.id, "maker").await.unwrap_err().is_retryable());
        assert_eq!(
            f.engine.get_trade(trade.id).await.unwrap().status,
            TradeStatus::Pending
        );
        assert_eq!(f.book.get(ad.id).await.unwrap().remaining_quantity, dec!(5));

        f.engine.cancel(trade.id, "maker").await.unwrap();
        assert_eq!(f.book.get(ad.id).await.unwrap().remaining_quantity, dec!(10));
    }

    #[tokio::test]
    async fn test_confirm_completes_when_caller_stops_waiting() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;
        let trade = f.engine.open(request(&ad, dec!(3))).await.unwrap();
        f.engine.mark_payment_sent(trade.id, "taker").await.unwrap();
        f.ledger.set_latency(Some(Duration::from_millis(300))).await;

        let engine = f.engine.clone();
        let trade_id = trade.id;
        let caller = tokio::spawn(async move {
            engine.confirm_payment_received(trade_id, "maker").await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let settled = f.engine.get_trade(trade.id).await.unwrap();
        assert_eq!(settled.status, TradeStatus::Completed);
        f.ledger.set_latency(None).await;
        assert_eq!(f.ledger.balance("taker", "USDT").await.available, dec!(103));
        assert_eq!(f.ledger.balance("maker", "USDT").await.locked, dec!(7));
        assert_eq!(f.events.count(EventKind::TradeCompleted).await, 1);

        // nothing is left claimed
        assert!(matches!(
            f.engine.cancel(trade.id, "taker").await,
            Err(EscrowError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_registers_trade_when_caller_stops_waiting() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Buy, None).await;
        f.ledger.set_latency(Some(Duration::from_millis(300))).await;

        let engine = f.engine.clone();
        let open = request(&ad, dec!(4));
        let caller = tokio::spawn(async move { engine.open(open).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        f.ledger.set_latency(None).await;

        // the reservation and the lock both belong to a registered trade
        assert_eq!(f.engine.len().await, 1);
        let trades = f.engine.list_trades_for("taker", Some(TradeStatus::Pending)).await;
        assert_eq!(trades.len(), 1);
        assert_eq!(f.book.get(ad.id).await.unwrap().remaining_quantity, dec!(6));
        assert_eq!(f.ledger.balance("taker", "USDT").await.locked, dec!(4));

        f.engine.cancel(trades[0].id, "maker").await.unwrap();
        assert_eq!(f.book.get(ad.id).await.unwrap().remaining_quantity, dec!(10));
        assert_eq!(f.ledger.balance("taker", "USDT").await.locked, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_release_refused_after_refund_reached_ledger() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Buy, None).await;
        let trade = f.engine.open(request(&ad, dec!(5))).await.unwrap();

        // a refund applied at the ledger whose response never came back
        f.ledger
            .unlock(
                "taker",
                "USDT",
                dec!(5),
                &IdempotencyKey::new(trade.id, REFUND_TRANSITION),
            )
            .await
            .unwrap();

        f.engine.mark_payment_sent(trade.id, "maker").await.unwrap();
        assert!(matches!(
            f.engine.confirm_payment_received(trade.id, "taker").await,
            Err(EscrowError::InvalidState { .. })
        ));
        assert_eq!(
            f.engine.get_trade(trade.id).await.unwrap().status,
            TradeStatus::PaymentSent
        );
        assert_eq!(f.ledger.balance("maker", "USDT").await.available, dec!(100));
        assert_eq!(f.ledger.balance("taker", "USDT").await.available, dec!(100));
    }

    #[tokio::test]
    async fn test_sweep_expires_overdue_trades() {
        let f = fixture().await;
        let ad = post_ad(&f, AdSide::Sell, None).await;
        let first = f.engine.open(request(&ad, dec!(2))).await.unwrap();
        let second = f.engine.open(request(&ad, dec!(2))).await.unwrap();
        f.engine.mark_payment_sent(second.id, "taker").await.unwrap();

        let later = first.payment_deadline + ChronoDuration::minutes(1);
        let report = f.engine.sweep_expired(later).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            f.engine.get_trade(first.id).await.unwrap().status,
            TradeStatus::Cancelled
        );

        assert_eq!(f.engine.list_trades_for("taker", None).await.len(), 2);
        let pending = f
            .engine
            .list_trades_for("maker", Some(TradeStatus::PaymentSent))
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let f = fixture().await;
        let engine = Arc::new(f.engine);
        let (stop, shutdown) = watch::channel(false);

        let handle = DeadlineSweeper::new(engine, &SweeperConfig::default()).spawn(shutdown);
        stop.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
