//! Error types for the escrow engine
//!
//! Every rejected operation maps to a specific variant so the API layer can
//! translate it into a precise response. Dependency failures (ledger,
//! timeouts) are the only retryable class; they always leave the entity in
//! its pre-call state.

use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Bad input shape or range, rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// Advertisement does not exist
    #[error("Advertisement {0} not found")]
    AdNotFound(String),

    /// Advertisement exists but is not ACTIVE
    #[error("Advertisement {id} is not active (status: {status})")]
    AdInactive { id: String, status: String },

    /// Trade does not exist
    #[error("Trade {0} not found")]
    TradeNotFound(String),

    /// Dispute does not exist
    #[error("Dispute {0} not found")]
    DisputeNotFound(String),

    /// Requester tried to trade against their own advertisement
    #[error("Cannot trade against your own advertisement")]
    SelfTrade,

    /// Caller does not own the advertisement
    #[error("Caller is not the owner of advertisement {0}")]
    NotOwner(String),

    /// Caller is not allowed to perform this action
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Operation not permitted in the entity's current state
    #[error("Invalid state for {action} on {entity}: current state is {from}")]
    InvalidState {
        entity: String,
        from: String,
        action: String,
    },

    /// Reservation rejected: not enough remaining quantity
    #[error("Quantity unavailable: requested {requested}, available {available}")]
    QuantityUnavailable {
        requested: Decimal,
        available: Decimal,
    },

    /// Computed fiat amount falls outside the advertisement's limits
    #[error("Fiat amount {amount} outside advertisement limits [{min}, {max}]")]
    AmountOutOfRange {
        amount: Decimal,
        min: Decimal,
        max: Decimal,
    },

    /// Ledger could not lock the requested balance
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Ledger call failed; retryable
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Idempotency key already applied with different parameters
    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),

    /// Ledger or persistence call timed out; retryable
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Notification delivery failed (never rolls back engine state)
    #[error("Notification error: {0}")]
    Notification(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classification used by callers to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    StateConflict,
    Authorization,
    Dependency,
    Internal,
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<E, F, A>(entity: E, from: F, action: A) -> Self
    where
        E: Into<String>,
        F: std::fmt::Debug,
        A: Into<String>,
    {
        Self::InvalidState {
            entity: entity.into(),
            from: format!("{:?}", from),
            action: action.into(),
        }
    }

    /// Create an insufficient funds error
    pub fn insufficient_funds<S: Into<String>>(msg: S) -> Self {
        Self::InsufficientFunds(msg.into())
    }

    /// Create a ledger error
    pub fn ledger<S: Into<String>>(msg: S) -> Self {
        Self::Ledger(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a notification error
    pub fn notification<S: Into<String>>(msg: S) -> Self {
        Self::Notification(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::AdNotFound(_) | Self::TradeNotFound(_) | Self::DisputeNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::AdInactive { .. }
            | Self::InvalidState { .. }
            | Self::QuantityUnavailable { .. }
            | Self::AmountOutOfRange { .. }
            | Self::InsufficientFunds(_)
            | Self::IdempotencyConflict(_) => ErrorKind::StateConflict,
            Self::SelfTrade | Self::NotOwner(_) | Self::Forbidden(_) => ErrorKind::Authorization,
            Self::Ledger(_) | Self::Timeout(_) | Self::Notification(_) => ErrorKind::Dependency,
            Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same call may succeed if retried unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Dependency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_errors_are_retryable() {
        assert!(EscrowError::ledger("down").is_retryable());
        assert!(EscrowError::timeout("ledger.transfer").is_retryable());
        assert!(!EscrowError::SelfTrade.is_retryable());
        assert!(!EscrowError::insufficient_funds("alice").is_retryable());
        assert!(!EscrowError::IdempotencyConflict("t1:release".into()).is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            EscrowError::invalid_state("trade", "Completed", "cancel").kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(EscrowError::NotOwner("ad".into()).kind(), ErrorKind::Authorization);
        assert_eq!(EscrowError::AdNotFound("x".into()).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_invalid_state_message() {
        let err = EscrowError::invalid_state("trade t1", "PaymentSent", "expire");
        assert_eq!(
            err.to_string(),
            "Invalid state for expire on trade t1: current state is \"PaymentSent\""
        );
    }
}
