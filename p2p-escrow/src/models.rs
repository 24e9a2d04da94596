//! Core data models for the escrow engine
//!
//! This module contains the advertisement, trade, dispute and message
//! records, their state machines, and the opaque payload wrappers the engine
//! stores and forwards without inspecting.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::EscrowError, EscrowResult};

/// Actor id used for transitions performed by the engine itself
pub const SYSTEM_ACTOR: &str = "system";

/// Which way the advertisement owner wants to trade the asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdSide {
    /// Owner buys the asset, pays fiat
    Buy,
    /// Owner sells the asset, receives fiat
    Sell,
}

/// Advertisement lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdStatus {
    /// Open for new trades
    Active,
    /// Remaining quantity fully reserved; reverts to Active if a trade is cancelled
    Completed,
    /// Withdrawal started; closed to new trades until its escrow release is confirmed
    Cancelling,
    /// Withdrawn by the owner
    Cancelled,
}

impl AdStatus {
    /// Whether capacity released by a cancelled trade may flow back into the ad
    pub fn accepts_restore(&self) -> bool {
        matches!(self, Self::Active | Self::Completed)
    }
}

/// Trade state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    /// Matched, waiting for the buyer's off-platform payment
    Pending,
    /// Buyer says the fiat payment has been sent
    PaymentSent,
    /// Frozen pending arbitration
    Disputed,
    /// Asset released to the buyer
    Completed,
    /// Escrow released back to the seller
    Cancelled,
}

impl TradeStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Check if this state allows the buyer to mark payment as sent
    pub fn can_mark_paid(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if this state allows the seller to confirm receipt
    pub fn can_confirm(&self) -> bool {
        matches!(self, Self::PaymentSent)
    }

    /// Check if this state allows disputes
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Pending | Self::PaymentSent)
    }

    /// Check if this state allows cancellation or expiry
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check whether `to` is a legal successor of this state
    pub fn allows(&self, to: TradeStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::PaymentSent)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Disputed)
                | (Self::PaymentSent, Self::Completed)
                | (Self::PaymentSent, Self::Disputed)
                | (Self::Disputed, Self::Completed)
                | (Self::Disputed, Self::Cancelled)
        )
    }
}

/// Where the seller's escrowed asset for a trade is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowSource {
    /// Part of the SELL advertisement's escrow, locked at ad creation
    Advertisement,
    /// Locked from the seller when the trade was opened (BUY advertisements)
    Trade,
}

/// Which side of a trade a user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeRole {
    Buyer,
    Seller,
}

/// Dispute lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    /// Awaiting arbitrator review
    Open,
    /// Outcome executed; irreversible
    Resolved,
}

/// Arbitrator's binary decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeOutcome {
    /// Complete the trade: transfer the escrowed asset to the buyer
    ReleaseToBuyer,
    /// Cancel the trade: return the escrowed asset to the seller
    ReleaseToSeller,
}

/// Conversation message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    AutoReply,
    System,
}

/// Author of a conversation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Sender {
    User(String),
    System,
}

impl Sender {
    /// Convenience constructor for a user sender
    pub fn user<S: Into<String>>(id: S) -> Self {
        Self::User(id.into())
    }

    /// Whether this sender is the given user
    pub fn is(&self, user_id: &str) -> bool {
        matches!(self, Self::User(id) if id == user_id)
    }
}

/// Opaque payment-method payload, stored and forwarded as-is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentMethodRef(pub serde_json::Value);

impl PaymentMethodRef {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<&str> for PaymentMethodRef {
    fn from(value: &str) -> Self {
        Self(serde_json::Value::String(value.to_string()))
    }
}

/// Opaque dispute evidence payload (file references, screenshots, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceRef(pub serde_json::Value);

impl From<&str> for EvidenceRef {
    fn from(value: &str) -> Self {
        Self(serde_json::Value::String(value.to_string()))
    }
}

/// Standing buy/sell offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: Uuid,
    pub owner: String,
    pub side: AdSide,
    pub asset: String,
    pub fiat_currency: String,

    // Terms
    pub price: Decimal,
    pub total_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub payment_methods: Vec<PaymentMethodRef>,
    pub terms: Option<String>,
    pub auto_reply: Option<String>,
    pub time_limit_minutes: u32,

    pub status: AdStatus,

    // Statistics
    pub completed_trades: u32,
    pub total_volume: Decimal,

    /// Bumped on every reservation, restore and status change
    pub version: u64,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Advertisement {
    /// Fiat amount for a given quantity at this ad's price
    pub fn fiat_for(&self, quantity: Decimal) -> Decimal {
        quantity * self.price
    }

    /// Quantity currently committed to open trades
    pub fn committed_quantity(&self) -> Decimal {
        self.total_quantity - self.remaining_quantity
    }

    /// Derive (buyer, seller) for a trade between the owner and `requester`
    pub fn parties_with(&self, requester: &str) -> (String, String) {
        match self.side {
            AdSide::Sell => (requester.to_string(), self.owner.clone()),
            AdSide::Buy => (self.owner.clone(), requester.to_string()),
        }
    }

    /// Whether the seller's asset is already escrowed by the ad itself
    pub fn escrow_source(&self) -> EscrowSource {
        match self.side {
            AdSide::Sell => EscrowSource::Advertisement,
            AdSide::Buy => EscrowSource::Trade,
        }
    }
}

/// One recorded status change, kept for audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: TradeStatus,
    pub to: TradeStatus,
    pub actor: String,
    pub at: DateTime<Utc>,
}

/// One match against an advertisement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub ad_id: Uuid,

    // Parties
    pub buyer: String,
    pub seller: String,

    // Immutable terms, copied from the ad at match time
    pub asset: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fiat_amount: Decimal,
    pub fiat_currency: String,
    pub payment_method: PaymentMethodRef,
    pub platform_fee: Decimal,
    pub escrow_source: EscrowSource,

    pub status: TradeStatus,
    pub payment_deadline: DateTime<Utc>,
    pub cancel_requested_by: Option<String>,
    pub dispute_id: Option<Uuid>,
    pub history: Vec<StatusChange>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payment_sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Create a new PENDING trade against `ad`
    pub fn new(
        ad: &Advertisement,
        requester: &str,
        quantity: Decimal,
        payment_method: PaymentMethodRef,
        platform_fee: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let (buyer, seller) = ad.parties_with(requester);
        Self {
            id: Uuid::new_v4(),
            ad_id: ad.id,
            buyer,
            seller,
            asset: ad.asset.clone(),
            quantity,
            price: ad.price,
            fiat_amount: ad.fiat_for(quantity),
            fiat_currency: ad.fiat_currency.clone(),
            payment_method,
            platform_fee,
            escrow_source: ad.escrow_source(),
            status: TradeStatus::Pending,
            payment_deadline: now + Duration::minutes(i64::from(ad.time_limit_minutes)),
            cancel_requested_by: None,
            dispute_id: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            payment_sent_at: None,
            completed_at: None,
        }
    }

    /// Which side `user_id` is on, if any
    pub fn role_of(&self, user_id: &str) -> Option<TradeRole> {
        if self.buyer == user_id {
            Some(TradeRole::Buyer)
        } else if self.seller == user_id {
            Some(TradeRole::Seller)
        } else {
            None
        }
    }

    pub fn is_party(&self, user_id: &str) -> bool {
        self.role_of(user_id).is_some()
    }

    /// The other party of the trade
    pub fn counterparty_of(&self, user_id: &str) -> Option<&str> {
        match self.role_of(user_id)? {
            TradeRole::Buyer => Some(&self.seller),
            TradeRole::Seller => Some(&self.buyer),
        }
    }

    /// A PENDING trade past its deadline; still PENDING until `expire` runs
    pub fn is_expiring(&self, now: DateTime<Utc>) -> bool {
        self.status == TradeStatus::Pending && now > self.payment_deadline
    }

    /// Validate a state transition
    pub fn validate_transition(&self, to: TradeStatus) -> EscrowResult<()> {
        if self.status.allows(to) {
            Ok(())
        } else {
            Err(EscrowError::invalid_state(
                format!("trade {}", self.id),
                self.status,
                format!("transition to {:?}", to),
            ))
        }
    }

    /// Apply a validated transition and record it
    pub fn transition(
        &mut self,
        to: TradeStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<()> {
        self.validate_transition(to)?;
        self.history.push(StatusChange {
            from: self.status,
            to,
            actor: actor.to_string(),
            at: now,
        });
        self.status = to;
        self.updated_at = now;
        match to {
            TradeStatus::PaymentSent => self.payment_sent_at = Some(now),
            TradeStatus::Completed | TradeStatus::Cancelled => self.completed_at = Some(now),
            _ => {}
        }
        Ok(())
    }
}

/// Arbitration case against an in-flight trade (1:1 with the trade)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub trade_id: Uuid,

    // Parties
    pub initiator: String,
    pub respondent: String,

    // Reason
    pub reason: String,
    pub evidence: Vec<EvidenceRef>,

    // Arbitration
    pub status: DisputeStatus,
    pub outcome: Option<DisputeOutcome>,
    pub resolver: Option<String>,
    pub resolution_notes: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Dispute {
    /// Create new dispute
    pub fn new(
        trade_id: Uuid,
        initiator: String,
        respondent: String,
        reason: String,
        evidence: Vec<EvidenceRef>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trade_id,
            initiator,
            respondent,
            reason,
            evidence,
            status: DisputeStatus::Open,
            outcome: None,
            resolver: None,
            resolution_notes: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Append-only chat entry scoped to a trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub trade_id: Uuid,
    /// Monotonic per trade, starting at 1
    pub seq: u64,
    pub sender: Sender,
    pub body: String,
    pub kind: MessageKind,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
