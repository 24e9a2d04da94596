//! Ledger Port - balance lock/unlock/transfer for escrow
//!
//! The engine never owns balances. It asks the ledger to lock a seller's
//! asset when escrow starts, to transfer locked funds to the buyer on
//! completion, and to unlock them on cancellation. Every call carries an
//! idempotency key so a retry after a timeout cannot move funds twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::EscrowError, EscrowResult};

/// Configuration for ledger calls made by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Upper bound for a single ledger call in milliseconds
    pub call_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
        }
    }
}

/// Idempotency key: `<entity id>:<transition>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(entity: Uuid, transition: &str) -> Self {
        Self(format!("{}:{}", entity, transition))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerOp {
    Lock,
    Unlock,
    Transfer,
}

/// Proof that a ledger operation was applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub key: IdempotencyKey,
    pub op: LedgerOp,
    pub account: String,
    pub counterparty: Option<String>,
    pub asset: String,
    pub amount: Decimal,
    /// True when the key had already been applied and nothing moved
    pub replayed: bool,
    pub applied_at: DateTime<Utc>,
}

/// Balance management interface consumed by the engine
#[async_trait]
pub trait LedgerPort: Send + Sync {
    /// Move `amount` from the account's available balance into its locked balance
    async fn lock(
        &self,
        account: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt>;

    /// Move `amount` from the account's locked balance back to available
    async fn unlock(
        &self,
        account: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt>;

    /// Move `amount` out of `from`'s locked balance into `to`'s available balance
    async fn transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt>;

    /// The receipt recorded under `key`, if that operation was ever applied
    async fn receipt(&self, key: &IdempotencyKey) -> EscrowResult<Option<LedgerReceipt>>;
}

/// Timeout-guarded handle the engine uses for every ledger call
#[derive(Clone)]
pub struct GuardedLedger {
    inner: Arc<dyn LedgerPort>,
    timeout: Duration,
}

impl GuardedLedger {
    pub fn new(inner: Arc<dyn LedgerPort>, config: &LedgerConfig) -> Self {
        Self {
            inner,
            timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    pub async fn lock(
        &self,
        account: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt> {
        debug!("ledger.lock {} {} {} ({})", account, amount, asset, key);
        self.guard(key, self.inner.lock(account, asset, amount, key))
            .await
    }

    pub async fn unlock(
        &self,
        account: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt> {
        debug!("ledger.unlock {} {} {} ({})", account, amount, asset, key);
        self.guard(key, self.inner.unlock(account, asset, amount, key))
            .await
    }

    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt> {
        debug!(
            "ledger.transfer {} -> {} {} {} ({})",
            from, to, amount, asset, key
        );
        self.guard(key, self.inner.transfer(from, to, asset, amount, key))
            .await
    }

    /// Look up whether `key` was applied
    pub async fn receipt(&self, key: &IdempotencyKey) -> EscrowResult<Option<LedgerReceipt>> {
        self.guard(key, self.inner.receipt(key)).await
    }

    async fn guard<T, F>(&self, key: &IdempotencyKey, call: F) -> EscrowResult<T>
    where
        F: std::future::Future<Output = EscrowResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(e)) => {
                warn!("Ledger call {} failed: {}", key, e);
                Err(e)
            }
            Err(_) => {
                warn!("Ledger call {} timed out after {:?}", key, self.timeout);
                Err(EscrowError::timeout(format!(
                    "ledger call {} exceeded {:?}",
                    key, self.timeout
                )))
            }
        }
    }
}

/// Available/locked split for one (account, asset)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub available: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<(String, String), Balance>,
    receipts: HashMap<IdempotencyKey, LedgerReceipt>,
    injected_failures: HashMap<LedgerOp, u32>,
    latency: Option<Duration>,
}

impl LedgerState {
    fn balance_mut(&mut self, account: &str, asset: &str) -> &mut Balance {
        self.balances
            .entry((account.to_string(), asset.to_string()))
            .or_default()
    }

    fn take_failure(&mut self, op: LedgerOp) -> bool {
        match self.injected_failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Replay an applied key, or reject its reuse for a different operation
    fn replay(
        &self,
        key: &IdempotencyKey,
        op: LedgerOp,
        account: &str,
        amount: Decimal,
    ) -> Option<EscrowResult<LedgerReceipt>> {
        let existing = self.receipts.get(key)?;
        if existing.op != op || existing.account != account || existing.amount != amount {
            return Some(Err(EscrowError::IdempotencyConflict(format!(
                "idempotency key {} reused with different parameters",
                key
            ))));
        }
        Some(Ok(LedgerReceipt {
            replayed: true,
            ..existing.clone()
        }))
    }
}

/// In-memory reference ledger
///
/// Used by tests and the CLI. Supports fault injection so dependency
/// failures can be exercised.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an account's available balance
    pub async fn deposit(&self, account: &str, asset: &str, amount: Decimal) {
        let mut state = self.state.lock().await;
        state.balance_mut(account, asset).available += amount;
    }

    pub async fn balance(&self, account: &str, asset: &str) -> Balance {
        let state = self.state.lock().await;
        state
            .balances
            .get(&(account.to_string(), asset.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Make the next `times` calls of `op` fail with a retryable error
    pub async fn fail_next(&self, op: LedgerOp, times: u32) {
        let mut state = self.state.lock().await;
        *state.injected_failures.entry(op).or_insert(0) += times;
    }

    /// Delay every call by `latency` (used to exercise call timeouts)
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Number of distinct idempotency keys applied
    pub async fn applied_operations(&self) -> usize {
        self.state.lock().await.receipts.len()
    }

    async fn apply<F>(
        &self,
        op: LedgerOp,
        account: &str,
        counterparty: Option<&str>,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
        mutate: F,
    ) -> EscrowResult<LedgerReceipt>
    where
        F: FnOnce(&mut LedgerState) -> EscrowResult<()>,
    {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if state.take_failure(op) {
            return Err(EscrowError::ledger(format!("injected {:?} failure", op)));
        }
        if let Some(replayed) = state.replay(key, op, account, amount) {
            return replayed;
        }
        if amount <= Decimal::ZERO {
            return Err(EscrowError::validation("Ledger amount must be positive"));
        }

        mutate(&mut state)?;

        let receipt = LedgerReceipt {
            key: key.clone(),
            op,
            account: account.to_string(),
            counterparty: counterparty.map(str::to_string),
            asset: asset.to_string(),
            amount,
            replayed: false,
            applied_at: Utc::now(),
        };
        state.receipts.insert(key.clone(), receipt.clone());
        Ok(receipt)
    }
}

#[async_trait]
impl LedgerPort for InMemoryLedger {
    async fn lock(
        &self,
        account: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt> {
        self.apply(LedgerOp::Lock, account, None, asset, amount, key, |state| {
            let balance = state.balance_mut(account, asset);
            if balance.available < amount {
                return Err(EscrowError::insufficient_funds(format!(
                    "{} has {} {} available, {} required",
                    account, balance.available, asset, amount
                )));
            }
            balance.available -= amount;
            balance.locked += amount;
            Ok(())
        })
        .await
    }

    async fn unlock(
        &self,
        account: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt> {
        self.apply(LedgerOp::Unlock, account, None, asset, amount, key, |state| {
            let balance = state.balance_mut(account, asset);
            if balance.locked < amount {
                return Err(EscrowError::ledger(format!(
                    "{} has only {} {} locked, cannot unlock {}",
                    account, balance.locked, asset, amount
                )));
            }
            balance.locked -= amount;
            balance.available += amount;
            Ok(())
        })
        .await
    }

    async fn transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: Decimal,
        key: &IdempotencyKey,
    ) -> EscrowResult<LedgerReceipt> {
        self.apply(
            LedgerOp::Transfer,
            from,
            Some(to),
            asset,
            amount,
            key,
            |state| {
                let source = state.balance_mut(from, asset);
                if source.locked < amount {
                    return Err(EscrowError::ledger(format!(
                        "{} has only {} {} locked, cannot transfer {}",
                        from, source.locked, asset, amount
                    )));
                }
                source.locked -= amount;
                state.balance_mut(to, asset).available += amount;
                Ok(())
            },
        )
        .await
    }

    async fn receipt(&self, key: &IdempotencyKey) -> EscrowResult<Option<LedgerReceipt>> {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.state.lock().await.receipts.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn key(transition: &str) -> IdempotencyKey {
        IdempotencyKey::new(Uuid::nil(), transition)
    }

    #[tokio::test]
    async fn test_lock_requires_available_balance() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("alice", "BTC", dec!(1)).await;

        let err = ledger
            .lock("alice", "BTC", dec!(2), &key("lock"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientFunds(_)));

        ledger.lock("alice", "BTC", dec!(0.4), &key("lock")).await.unwrap();
        let balance = ledger.balance("alice", "BTC").await;
        assert_eq!(balance.available, dec!(0.6));
        assert_eq!(balance.locked, dec!(0.4));
    }

    #[tokio::test]
    async fn test_replayed_key_moves_funds_once() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("alice", "BTC", dec!(1)).await;
        ledger.lock("alice", "BTC", dec!(1), &key("lock")).await.unwrap();

        let first = ledger
            .transfer("alice", "bob", "BTC", dec!(1), &key("release"))
            .await
            .unwrap();
        let second = ledger
            .transfer("alice", "bob", "BTC", dec!(1), &key("release"))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(ledger.balance("bob", "BTC").await.available, dec!(1));
        assert_eq!(ledger.balance("alice", "BTC").await.total(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_key_reuse_with_other_amount_is_rejected() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("alice", "BTC", dec!(1)).await;
        ledger.lock("alice", "BTC", dec!(0.5), &key("lock")).await.unwrap();

        let err = ledger
            .lock("alice", "BTC", dec!(0.2), &key("lock"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::IdempotencyConflict(_)));
        assert!(!err.is_retryable());
        assert_eq!(ledger.balance("alice", "BTC").await.locked, dec!(0.5));
    }

    #[tokio::test]
    async fn test_receipt_reports_applied_keys() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("alice", "BTC", dec!(1)).await;

        assert!(ledger.receipt(&key("lock")).await.unwrap().is_none());
        ledger.lock("alice", "BTC", dec!(1), &key("lock")).await.unwrap();

        let receipt = ledger.receipt(&key("lock")).await.unwrap().unwrap();
        assert_eq!(receipt.op, LedgerOp::Lock);
        assert_eq!(receipt.amount, dec!(1));
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_balances_untouched() {
        let ledger = InMemoryLedger::new();
        ledger.deposit("alice", "BTC", dec!(1)).await;
        ledger.fail_next(LedgerOp::Lock, 1).await;

        assert!(ledger.lock("alice", "BTC", dec!(1), &key("lock")).await.is_err());
        assert_eq!(ledger.balance("alice", "BTC").await.available, dec!(1));
        assert!(ledger.lock("alice", "BTC", dec!(1), &key("lock")).await.is_ok());
    }

    #[tokio::test]
    async fn test_guarded_ledger_times_out() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.deposit("alice", "BTC", dec!(1)).await;
        ledger.set_latency(Some(Duration::from_millis(200))).await;

        let guarded = GuardedLedger::new(ledger.clone(), &LedgerConfig { call_timeout_ms: 20 });
        let err = guarded
            .lock("alice", "BTC", dec!(1), &key("lock"))
            .await
            .unwrap_err();

        assert!(matches!(err, EscrowError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
