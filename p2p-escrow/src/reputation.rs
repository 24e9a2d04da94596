//! Reputation Book - trader track record and counterparty feedback
//!
//! Profiles are updated by the trade engine when a trade completes or is
//! cancelled and by the dispute arbiter when a dispute is resolved. Parties
//! of a completed trade may each leave one rating for their counterparty.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::EscrowError,
    models::{Trade, TradeStatus},
    EscrowResult,
};

/// Configuration for reputation scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Score given to a trader on first sight
    pub initial_score: i32,
    /// Upper bound for any score
    pub max_score: i32,
    /// Lower bound for any score
    pub min_score: i32,
    /// Points for each completed trade
    pub completion_points: i32,
    /// Points removed from the party blamed for a cancellation
    pub cancellation_penalty: i32,
    /// Points removed from the losing side of a dispute
    pub dispute_loss_penalty: i32,
    /// Points per star above (or below) a neutral 3-star rating
    pub rating_weight: i32,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: 500,
            max_score: 1000,
            min_score: 0,
            completion_points: 10,
            cancellation_penalty: 15,
            dispute_loss_penalty: 50,
            rating_weight: 5,
        }
    }
}

/// Reputation tier derived from score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationTier {
    Restricted,
    Newcomer,
    Verified,
    Trusted,
    Elite,
}

impl ReputationTier {
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 900 => Self::Elite,
            s if s >= 700 => Self::Trusted,
            s if s >= 550 => Self::Verified,
            s if s >= 300 => Self::Newcomer,
            _ => Self::Restricted,
        }
    }
}

/// Per-trader track record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderProfile {
    pub user_id: String,

    // Trades
    pub total_trades: u32,
    pub completed_trades: u32,
    pub cancelled_trades: u32,
    /// Fiat volume of completed trades, summed across currencies
    pub total_volume: Decimal,

    // Disputes
    pub disputes_total: u32,
    pub disputes_won: u32,
    pub disputes_lost: u32,

    // Feedback
    pub rating_sum: u32,
    pub rating_count: u32,

    pub score: i32,
    pub tier: ReputationTier,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TraderProfile {
    fn new(user_id: &str, score: i32) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            total_trades: 0,
            completed_trades: 0,
            cancelled_trades: 0,
            total_volume: Decimal::ZERO,
            disputes_total: 0,
            disputes_won: 0,
            disputes_lost: 0,
            rating_sum: 0,
            rating_count: 0,
            score,
            tier: ReputationTier::from_score(score),
            created_at: now,
            updated_at: now,
        }
    }

    /// Mean rating received, if any
    pub fn average_rating(&self) -> Option<Decimal> {
        if self.rating_count == 0 {
            return None;
        }
        Some((Decimal::from(self.rating_sum) / Decimal::from(self.rating_count)).round_dp(2))
    }

    /// Share of finished trades that completed, as a percentage
    pub fn completion_rate(&self) -> Option<Decimal> {
        if self.total_trades == 0 {
            return None;
        }
        Some(
            (Decimal::from(self.completed_trades) * Decimal::ONE_HUNDRED
                / Decimal::from(self.total_trades))
            .round_dp(2),
        )
    }
}

/// Rating left by one trade party for the other
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub trade_id: Uuid,
    pub from: String,
    pub to: String,
    /// 1..=5 stars
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate view over every known trader
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReputationStats {
    pub total_traders: usize,
    pub avg_score: i32,
    pub tier_distribution: HashMap<ReputationTier, usize>,
}

/// Trader reputation store
pub struct ReputationBook {
    config: ReputationConfig,
    profiles: RwLock<HashMap<String, TraderProfile>>,
    feedback: RwLock<HashMap<(Uuid, String), Feedback>>,
}

impl ReputationBook {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            profiles: RwLock::new(HashMap::new()),
            feedback: RwLock::new(HashMap::new()),
        }
    }

    /// Profile for `user_id`; unseen traders get a fresh profile
    pub async fn get(&self, user_id: &str) -> TraderProfile {
        self.profiles
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| TraderProfile::new(user_id, self.config.initial_score))
    }

    /// Apply `update_fn` to a profile, then clamp its score and refresh its tier
    pub async fn update<F>(&self, user_id: &str, update_fn: F) -> TraderProfile
    where
        F: FnOnce(&mut TraderProfile),
    {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| TraderProfile::new(user_id, self.config.initial_score));

        update_fn(profile);
        profile.score = profile
            .score
            .clamp(self.config.min_score, self.config.max_score);
        profile.tier = ReputationTier::from_score(profile.score);
        profile.updated_at = Utc::now();
        profile.clone()
    }

    /// Both parties finished a trade successfully
    pub async fn record_completion(&self, trade: &Trade) {
        let points = self.config.completion_points;
        for party in [&trade.buyer, &trade.seller] {
            self.update(party, |profile| {
                profile.total_trades += 1;
                profile.completed_trades += 1;
                profile.total_volume += trade.fiat_amount;
                profile.score += points;
            })
            .await;
        }
        debug!("Recorded completion of trade {} for both parties", trade.id);
    }

    /// A trade was cancelled; `blamed` (if any) loses points
    pub async fn record_cancellation(&self, trade: &Trade, blamed: Option<&str>) {
        let penalty = self.config.cancellation_penalty;
        for party in [&trade.buyer, &trade.seller] {
            let at_fault = blamed == Some(party.as_str());
            self.update(party, |profile| {
                profile.total_trades += 1;
                profile.cancelled_trades += 1;
                if at_fault {
                    profile.score -= penalty;
                }
            })
            .await;
        }
    }

    /// Dispute resolved in favour of `winner` against `loser`
    pub async fn record_dispute(&self, winner: &str, loser: &str) {
        let penalty = self.config.dispute_loss_penalty;
        self.update(winner, |profile| {
            profile.disputes_total += 1;
            profile.disputes_won += 1;
        })
        .await;
        self.update(loser, |profile| {
            profile.disputes_total += 1;
            profile.disputes_lost += 1;
            profile.score -= penalty;
        })
        .await;
    }

    /// Rate the counterparty of a completed trade
    pub async fn leave_feedback(
        &self,
        trade: &Trade,
        from: &str,
        rating: u8,
        comment: Option<String>,
    ) -> EscrowResult<Feedback> {
        if !(1..=5).contains(&rating) {
            return Err(EscrowError::validation("Rating must be between 1 and 5"));
        }
        let to = trade
            .counterparty_of(from)
            .ok_or_else(|| {
                EscrowError::forbidden(format!("{} is not a party to trade {}", from, trade.id))
            })?
            .to_string();
        if trade.status != TradeStatus::Completed {
            return Err(EscrowError::invalid_state(
                format!("trade {}", trade.id),
                trade.status,
                "leave feedback",
            ));
        }

        let feedback = Feedback {
            trade_id: trade.id,
            from: from.to_string(),
            to: to.clone(),
            rating,
            comment,
            created_at: Utc::now(),
        };
        {
            let mut given = self.feedback.write().await;
            let key = (trade.id, from.to_string());
            if given.contains_key(&key) {
                return Err(EscrowError::invalid_state(
                    format!("feedback on trade {}", trade.id),
                    "AlreadyGiven",
                    "leave feedback",
                ));
            }
            given.insert(key, feedback.clone());
        }

        let delta = (i32::from(rating) - 3) * self.config.rating_weight;
        self.update(&to, |profile| {
            profile.rating_sum += u32::from(rating);
            profile.rating_count += 1;
            profile.score += delta;
        })
        .await;

        info!("{} rated {} {}/5 for trade {}", from, to, rating, trade.id);

        Ok(feedback)
    }

    /// Feedback received by `user_id`, newest first
    pub async fn feedback_for(&self, user_id: &str) -> Vec<Feedback> {
        let mut received: Vec<Feedback> = self
            .feedback
            .read()
            .await
            .values()
            .filter(|f| f.to == user_id)
            .cloned()
            .collect();
        received.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        received
    }

    /// Highest-scoring traders
    pub async fn top(&self, limit: usize) -> Vec<TraderProfile> {
        let mut profiles: Vec<_> = self.profiles.read().await.values().cloned().collect();
        profiles.sort_by(|a, b| b.score.cmp(&a.score));
        profiles.truncate(limit);
        profiles
    }

    pub async fn stats(&self) -> ReputationStats {
        let profiles = self.profiles.read().await;
        if profiles.is_empty() {
            return ReputationStats::default();
        }

        let total_traders = profiles.len();
        let avg_score = profiles.values().map(|p| p.score).sum::<i32>() / total_traders as i32;
        let mut tier_distribution = HashMap::new();
        for profile in profiles.values() {
            *tier_distribution.entry(profile.tier).or_insert(0) += 1;
        }

        ReputationStats {
            total_traders,
            avg_score,
            tier_distribution,
        }
    }
}
