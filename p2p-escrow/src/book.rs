//! Advertisement Book - lifecycle of posted buy/sell advertisements
//!
//! The book owns every advertisement record. `remaining_quantity` is only
//! ever changed through [`AdvertisementBook::reserve`] and
//! [`AdvertisementBook::restore`], which the trade engine drives. Each ad
//! lives behind its own mutex: reservations against one ad are serialized,
//! reservations against different ads never wait on each other. No ledger
//! or notification call is made while an ad's mutex is held.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::EscrowError,
    ledger::{GuardedLedger, IdempotencyKey},
    models::{AdSide, AdStatus, Advertisement, PaymentMethodRef},
    notifier::{deliver, EngineEvent, EventKind, NotificationPort, Subject},
    EscrowResult,
};

/// Configuration for the advertisement book
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BookConfig {
    /// Payment time limit used when an ad does not specify one
    pub default_time_limit_minutes: u32,
    /// Longest payment window an ad may ask for
    pub max_time_limit_minutes: u32,
    /// Largest quantity a single ad may offer
    pub max_ad_quantity: Decimal,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            default_time_limit_minutes: 15,
            max_time_limit_minutes: 24 * 60, // 1 day
            max_ad_quantity: Decimal::from(1_000_000_000u64),
        }
    }
}

/// Advertisement creation request
#[derive(Debug, Clone)]
pub struct CreateAdRequest {
    pub owner: String,
    pub side: AdSide,
    pub asset: String,
    pub fiat_currency: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Defaults to the full ad value when omitted
    pub min_amount: Option<Decimal>,
    /// Defaults to the full ad value when omitted
    pub max_amount: Option<Decimal>,
    pub payment_methods: Vec<PaymentMethodRef>,
    pub terms: Option<String>,
    pub auto_reply: Option<String>,
    pub time_limit_minutes: Option<u32>,
}

/// Filters for listing active advertisements
#[derive(Debug, Clone, Default)]
pub struct AdFilter {
    pub side: Option<AdSide>,
    pub asset: Option<String>,
    pub fiat_currency: Option<String>,
    pub payment_method: Option<PaymentMethodRef>,
}

impl AdFilter {
    fn matches(&self, ad: &Advertisement) -> bool {
        ad.status == AdStatus::Active
            && self.side.map_or(true, |side| ad.side == side)
            && self
                .asset
                .as_ref()
                .map_or(true, |asset| ad.asset.eq_ignore_ascii_case(asset))
            && self
                .fiat_currency
                .as_ref()
                .map_or(true, |fiat| ad.fiat_currency.eq_ignore_ascii_case(fiat))
            && self
                .payment_method
                .as_ref()
                .map_or(true, |method| ad.payment_methods.contains(method))
    }
}

type AdSlot = Arc<Mutex<Advertisement>>;

/// Owns advertisements and their remaining tradable quantity
pub struct AdvertisementBook {
    config: BookConfig,
    ads: RwLock<HashMap<Uuid, AdSlot>>,
    ledger: GuardedLedger,
    notifier: Arc<dyn NotificationPort>,
}

impl AdvertisementBook {
    /// Create a new advertisement book
    pub fn new(
        config: BookConfig,
        ledger: GuardedLedger,
        notifier: Arc<dyn NotificationPort>,
    ) -> Self {
        Self {
            config,
            ads: RwLock::new(HashMap::new()),
            ledger,
            notifier,
        }
    }

    /// Post a new advertisement
    ///
    /// SELL ads escrow the whole quantity from the owner up front; the ad is
    /// only stored once that lock has succeeded.
    pub async fn create(&self, request: CreateAdRequest) -> EscrowResult<Advertisement> {
        info!(
            "Creating {:?} ad: {} {} @ {} {} by {}",
            request.side,
            request.quantity,
            request.asset,
            request.price,
            request.fiat_currency,
            request.owner
        );

        let ad = self.build_ad(request)?;

        if ad.side == AdSide::Sell {
            self.ledger
                .lock(
                    &ad.owner,
                    &ad.asset,
                    ad.total_quantity,
                    &IdempotencyKey::new(ad.id, "ad-escrow"),
                )
                .await?;
        }

        self.ads
            .write()
            .await
            .insert(ad.id, Arc::new(Mutex::new(ad.clone())));

        deliver(
            self.notifier.as_ref(),
            EngineEvent::new(EventKind::AdCreated, Subject::Ad(ad.id), ad_payload(&ad))
                .to([ad.owner.clone()]),
        )
        .await;

        info!("Created ad: {}", ad.id);

        Ok(ad)
    }

    /// Get an advertisement by ID
    pub async fn get(&self, ad_id: Uuid) -> EscrowResult<Advertisement> {
        let slot = self.slot(ad_id).await?;
        let ad = slot.lock().await.clone();
        Ok(ad)
    }

    /// Active advertisements matching `filter`, best price first
    pub async fn list(&self, filter: &AdFilter) -> Vec<Advertisement> {
        let mut ads = Vec::new();
        for slot in self.slots().await {
            let ad = slot.lock().await;
            if filter.matches(&ad) {
                ads.push(ad.clone());
            }
        }

        ads.sort_by(|a, b| {
            let by_price = match a.side {
                AdSide::Sell => a.price.cmp(&b.price),
                AdSide::Buy => b.price.cmp(&a.price),
            };
            by_price.then(a.created_at.cmp(&b.created_at))
        });
        ads
    }

    /// Every advertisement posted by `owner`, in any status
    pub async fn list_by_owner(&self, owner: &str) -> Vec<Advertisement> {
        let mut ads = Vec::new();
        for slot in self.slots().await {
            let ad = slot.lock().await;
            if ad.owner == owner {
                ads.push(ad.clone());
            }
        }
        ads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        ads
    }

    /// Withdraw an advertisement and release its un-traded escrow
    ///
    /// Trades already matched against the ad are unaffected. A SELL ad moves
    /// to CANCELLING before the ledger call and stays there, closed to new
    /// reservations and restores, until the unlock is confirmed. An unlock
    /// that failed or timed out may still have been applied, so it is never
    /// rolled back: the owner calls `cancel` again, which repeats the same
    /// unlock (same key, same frozen quantity).
    pub async fn cancel(&self, ad_id: Uuid, caller: &str) -> EscrowResult<Advertisement> {
        info!("Cancelling ad: {}", ad_id);

        let slot = self.slot(ad_id).await?;
        let mut snapshot = {
            let mut ad = slot.lock().await;
            if ad.owner != caller {
                return Err(EscrowError::NotOwner(ad_id.to_string()));
            }
            match ad.status {
                AdStatus::Active if ad.remaining_quantity > Decimal::ZERO => {}
                AdStatus::Cancelling => debug!("Retrying escrow release of ad {}", ad_id),
                status => {
                    return Err(EscrowError::invalid_state(
                        format!("ad {}", ad_id),
                        status,
                        "cancel",
                    ))
                }
            }
            ad.status = match ad.side {
                AdSide::Sell => AdStatus::Cancelling,
                AdSide::Buy => AdStatus::Cancelled,
            };
            ad.updated_at = Utc::now();
            ad.version += 1;
            ad.clone()
        };

        if snapshot.status == AdStatus::Cancelling {
            if let Err(e) = self
                .ledger
                .unlock(
                    &snapshot.owner,
                    &snapshot.asset,
                    snapshot.remaining_quantity,
                    &IdempotencyKey::new(ad_id, "ad-cancel"),
                )
                .await
            {
                warn!("Escrow release of ad {} unresolved; ad stays closed: {}", ad_id, e);
                return Err(e);
            }

            let mut ad = slot.lock().await;
            ad.status = AdStatus::Cancelled;
            ad.updated_at = Utc::now();
            ad.version += 1;
            snapshot = ad.clone();
        }

        deliver(
            self.notifier.as_ref(),
            EngineEvent::new(
                EventKind::AdCancelled,
                Subject::Ad(ad_id),
                ad_payload(&snapshot),
            )
            .to([snapshot.owner.clone()]),
        )
        .await;

        info!(
            "Cancelled ad: {} ({} {} released)",
            ad_id, snapshot.remaining_quantity, snapshot.asset
        );

        Ok(snapshot)
    }

    /// Reservation protocol: atomically check and decrement remaining quantity
    ///
    /// Runs entirely under the ad's mutex: re-read remaining quantity, check
    /// the request against it and against the fiat limits, decrement, and
    /// flip to COMPLETED at zero. Returns the post-reservation ad.
    pub(crate) async fn reserve(
        &self,
        ad_id: Uuid,
        requester: &str,
        quantity: Decimal,
    ) -> EscrowResult<Advertisement> {
        let slot = self.slot(ad_id).await?;
        let reserved = {
            let mut ad = slot.lock().await;

            if ad.status != AdStatus::Active {
                return Err(EscrowError::AdInactive {
                    id: ad_id.to_string(),
                    status: format!("{:?}", ad.status),
                });
            }
            if ad.owner == requester {
                return Err(EscrowError::SelfTrade);
            }
            if quantity > ad.remaining_quantity {
                return Err(EscrowError::QuantityUnavailable {
                    requested: quantity,
                    available: ad.remaining_quantity,
                });
            }
            let amount = ad.fiat_for(quantity);
            if amount < ad.min_amount || amount > ad.max_amount {
                return Err(EscrowError::AmountOutOfRange {
                    amount,
                    min: ad.min_amount,
                    max: ad.max_amount,
                });
            }

            ad.remaining_quantity -= quantity;
            if ad.remaining_quantity.is_zero() {
                ad.status = AdStatus::Completed;
            }
            ad.version += 1;
            ad.updated_at = Utc::now();
            ad.clone()
        };

        debug!(
            "Reserved {} {} on ad {} (remaining {})",
            quantity, reserved.asset, ad_id, reserved.remaining_quantity
        );

        if reserved.status == AdStatus::Completed {
            deliver(
                self.notifier.as_ref(),
                EngineEvent::new(
                    EventKind::AdCompleted,
                    Subject::Ad(ad_id),
                    ad_payload(&reserved),
                )
                .to([reserved.owner.clone()]),
            )
            .await;
        }

        Ok(reserved)
    }

    /// Give reserved quantity back to the ad
    ///
    /// Returns `false` without touching the ad when it has been cancelled
    /// in the meantime; the caller then owns releasing the escrow itself.
    pub(crate) async fn restore(&self, ad_id: Uuid, quantity: Decimal) -> EscrowResult<bool> {
        let slot = self.slot(ad_id).await?;
        let mut ad = slot.lock().await;

        if !ad.status.accepts_restore() {
            debug!("Ad {} is {:?}; skipping restore of {}", ad_id, ad.status, quantity);
            return Ok(false);
        }

        let restored = ad.remaining_quantity + quantity;
        if restored > ad.total_quantity {
            return Err(EscrowError::internal(format!(
                "restoring {} to ad {} would exceed its total quantity {}",
                quantity, ad_id, ad.total_quantity
            )));
        }

        ad.remaining_quantity = restored;
        ad.status = AdStatus::Active;
        ad.version += 1;
        ad.updated_at = Utc::now();

        debug!("Restored {} to ad {} (remaining {})", quantity, ad_id, restored);

        Ok(true)
    }

    /// Record a completed trade in the ad's statistics
    pub(crate) async fn record_completion(&self, ad_id: Uuid, fiat_amount: Decimal) -> EscrowResult<()> {
        let slot = self.slot(ad_id).await?;
        let mut ad = slot.lock().await;
        ad.completed_trades += 1;
        ad.total_volume += fiat_amount;
        ad.updated_at = Utc::now();
        Ok(())
    }

    /// Number of advertisements held, in any status
    pub async fn len(&self) -> usize {
        self.ads.read().await.len()
    }

    async fn slot(&self, ad_id: Uuid) -> EscrowResult<AdSlot> {
        self.ads
            .read()
            .await
            .get(&ad_id)
            .cloned()
            .ok_or_else(|| EscrowError::AdNotFound(ad_id.to_string()))
    }

    async fn slots(&self) -> Vec<AdSlot> {
        self.ads.read().await.values().cloned().collect()
    }

    /// Validate a creation request and build the ACTIVE ad
    fn build_ad(&self, request: CreateAdRequest) -> EscrowResult<Advertisement> {
        if request.owner.trim().is_empty() {
            return Err(EscrowError::validation("Owner cannot be empty"));
        }
        if request.asset.trim().is_empty() || request.fiat_currency.trim().is_empty() {
            return Err(EscrowError::validation("Asset and fiat currency are required"));
        }
        if request.price <= Decimal::ZERO {
            return Err(EscrowError::validation("Price must be greater than 0"));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(EscrowError::validation("Quantity must be greater than 0"));
        }
        if request.quantity > self.config.max_ad_quantity {
            return Err(EscrowError::validation(format!(
                "Quantity {} exceeds maximum {}",
                request.quantity, self.config.max_ad_quantity
            )));
        }
        if request.payment_methods.is_empty() {
            return Err(EscrowError::validation(
                "At least one payment method is required",
            ));
        }

        let full_value = request.quantity * request.price;
        let min_amount = request.min_amount.unwrap_or(full_value);
        let max_amount = request.max_amount.unwrap_or(full_value);
        if min_amount <= Decimal::ZERO {
            return Err(EscrowError::validation("Minimum amount must be greater than 0"));
        }
        if min_amount > max_amount {
            return Err(EscrowError::validation(format!(
                "Minimum amount {} exceeds maximum amount {}",
                min_amount, max_amount
            )));
        }

        let time_limit = request
            .time_limit_minutes
            .unwrap_or(self.config.default_time_limit_minutes);
        if time_limit == 0 || time_limit > self.config.max_time_limit_minutes {
            return Err(EscrowError::validation(format!(
                "Payment time limit must be between 1 and {} minutes",
                self.config.max_time_limit_minutes
            )));
        }

        let now = Utc::now();
        Ok(Advertisement {
            id: Uuid::new_v4(),
            owner: request.owner,
            side: request.side,
            asset: request.asset.to_uppercase(),
            fiat_currency: request.fiat_currency.to_uppercase(),
            price: request.price,
            total_quantity: request.quantity,
            remaining_quantity: request.quantity,
            min_amount,
            max_amount,
            payment_methods: request.payment_methods,
            terms: request.terms,
            auto_reply: request.auto_reply.filter(|text| !text.trim().is_empty()),
            time_limit_minutes: time_limit,
            status: AdStatus::Active,
            completed_trades: 0,
            total_volume: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

fn ad_payload(ad: &Advertisement) -> serde_json::Value {
    serde_json::json!({
        "ad_id": ad.id,
        "owner": ad.owner,
        "side": ad.side,
        "asset": ad.asset,
        "fiat_currency": ad.fiat_currency,
        "price": ad.price,
        "remaining_quantity": ad.remaining_quantity,
        "status": ad.status,
    })
}
