//! Dispute Arbiter - freezes contested trades and executes arbitration
//!
//! A dispute can be raised by either party while the trade is PENDING or
//! PAYMENT_SENT; raising it moves the trade to DISPUTED in the same
//! critical section that checks its state. Only the arbiter may settle a
//! DISPUTED trade, and a resolution is final.
//!
//! The trade transition and the dispute record change together on a
//! detached task, so the two never disagree when a caller stops waiting.

use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::{
    engine::{detached, TradeEngine},
    error::EscrowError,
    models::{Dispute, DisputeOutcome, DisputeStatus, EvidenceRef, Trade},
    notifier::{deliver, EngineEvent, EventKind, NotificationPort, Subject},
    reputation::ReputationBook,
    EscrowResult,
};

#[derive(Default)]
struct DisputeStore {
    disputes: HashMap<Uuid, Dispute>,
    by_trade: HashMap<Uuid, Uuid>,
}

/// Owns dispute records and the arbitration queue
pub struct DisputeArbiter {
    store: Arc<RwLock<DisputeStore>>,
    engine: Arc<TradeEngine>,
    reputation: Arc<ReputationBook>,
    notifier: Arc<dyn NotificationPort>,
}

impl DisputeArbiter {
    pub fn new(
        engine: Arc<TradeEngine>,
        reputation: Arc<ReputationBook>,
        notifier: Arc<dyn NotificationPort>,
    ) -> Self {
        Self {
            store: Arc::new(RwLock::new(DisputeStore::default())),
            engine,
            reputation,
            notifier,
        }
    }

    /// Open a dispute and freeze the trade
    pub async fn raise(
        &self,
        trade_id: Uuid,
        initiator: &str,
        reason: &str,
        evidence: Vec<EvidenceRef>,
    ) -> EscrowResult<Dispute> {
        info!("Raising dispute on trade {} by {}", trade_id, initiator);

        if reason.trim().is_empty() {
            return Err(EscrowError::validation("Dispute reason cannot be empty"));
        }

        let trade = self.engine.get_trade(trade_id).await?;
        let respondent = trade
            .counterparty_of(initiator)
            .ok_or_else(|| {
                EscrowError::forbidden(format!(
                    "{} is not a party to trade {}",
                    initiator, trade_id
                ))
            })?
            .to_string();

        let dispute = Dispute::new(
            trade_id,
            initiator.to_string(),
            respondent.clone(),
            reason.trim().to_string(),
            evidence,
        );
        let engine = self.engine.clone();
        let store = self.store.clone();
        let initiator = initiator.to_string();
        let record = dispute.clone();
        let trade = detached(async move {
            let trade = engine.begin_dispute(trade_id, &initiator, record.id).await?;
            let mut store = store.write().await;
            store.by_trade.insert(trade_id, record.id);
            store.disputes.insert(record.id, record);
            Ok::<_, EscrowError>(trade)
        })
        .await?;

        deliver(
            self.notifier.as_ref(),
            EngineEvent::new(
                EventKind::TradeDisputed,
                Subject::Trade(trade_id),
                dispute_payload(&dispute, &trade),
            )
            .to([respondent]),
        )
        .await;
        deliver(
            self.notifier.as_ref(),
            EngineEvent::new(
                EventKind::ArbitrationRequested,
                Subject::Dispute(dispute.id),
                dispute_payload(&dispute, &trade),
            ),
        )
        .await;

        info!("Opened dispute {} on trade {}", dispute.id, trade_id);

        Ok(dispute)
    }

    /// Execute the arbitrator's decision
    pub async fn resolve(
        &self,
        dispute_id: Uuid,
        arbitrator: &str,
        outcome: DisputeOutcome,
        notes: Option<String>,
    ) -> EscrowResult<Dispute> {
        info!(
            "Resolving dispute {} as {:?} by {}",
            dispute_id, outcome, arbitrator
        );

        if arbitrator.trim().is_empty() {
            return Err(EscrowError::validation("Arbitrator cannot be empty"));
        }

        let dispute = self.get(dispute_id).await?;
        if dispute.status != DisputeStatus::Open {
            return Err(EscrowError::invalid_state(
                format!("dispute {}", dispute_id),
                dispute.status,
                "resolve",
            ));
        }
        if dispute.initiator == arbitrator || dispute.respondent == arbitrator {
            return Err(EscrowError::forbidden(
                "A trade party cannot arbitrate its own dispute",
            ));
        }

        let engine = self.engine.clone();
        let store = self.store.clone();
        let reputation = self.reputation.clone();
        let arbitrator = arbitrator.to_string();
        let trade_id = dispute.trade_id;
        let (trade, resolved) = detached(async move {
            let trade = engine
                .settle_dispute(trade_id, outcome, &arbitrator)
                .await?;

            let resolved = {
                let mut store = store.write().await;
                let dispute = store
                    .disputes
                    .get_mut(&dispute_id)
                    .ok_or_else(|| EscrowError::DisputeNotFound(dispute_id.to_string()))?;
                dispute.status = DisputeStatus::Resolved;
                dispute.outcome = Some(outcome);
                dispute.resolver = Some(arbitrator);
                dispute.resolution_notes = notes;
                dispute.resolved_at = Some(Utc::now());
                dispute.clone()
            };

            let (winner, loser) = match outcome {
                DisputeOutcome::ReleaseToBuyer => (&trade.buyer, &trade.seller),
                DisputeOutcome::ReleaseToSeller => (&trade.seller, &trade.buyer),
            };
            reputation.record_dispute(winner, loser).await;

            Ok::<_, EscrowError>((trade, resolved))
        })
        .await?;

        deliver(
            self.notifier.as_ref(),
            EngineEvent::new(
                EventKind::TradeResolved,
                Subject::Trade(trade.id),
                dispute_payload(&resolved, &trade),
            )
            .to([trade.buyer.clone(), trade.seller.clone()]),
        )
        .await;

        info!(
            "Resolved dispute {}: trade {} is {:?}",
            dispute_id, trade.id, trade.status
        );

        Ok(resolved)
    }

    /// Get a dispute by ID
    pub async fn get(&self, dispute_id: Uuid) -> EscrowResult<Dispute> {
        self.store
            .read()
            .await
            .disputes
            .get(&dispute_id)
            .cloned()
            .ok_or_else(|| EscrowError::DisputeNotFound(dispute_id.to_string()))
    }

    /// The dispute raised on a trade, if any
    pub async fn get_by_trade(&self, trade_id: Uuid) -> Option<Dispute> {
        let store = self.store.read().await;
        let dispute_id = store.by_trade.get(&trade_id)?;
        store.disputes.get(dispute_id).cloned()
    }

    /// Arbitration queue: OPEN disputes, oldest first
    pub async fn list_open(&self) -> Vec<Dispute> {
        let mut open: Vec<Dispute> = self
            .store
            .read()
            .await
            .disputes
            .values()
            .filter(|d| d.status == DisputeStatus::Open)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        open
    }
}

fn dispute_payload(dispute: &Dispute, trade: &Trade) -> serde_json::Value {
    serde_json::json!({
        "dispute_id": dispute.id,
        "trade_id": trade.id,
        "initiator": dispute.initiator,
        "reason": dispute.reason,
        "status": dispute.status,
        "outcome": dispute.outcome,
        "trade_status": trade.status,
    })
}
