//! Node configuration
//!
//! Defaults for every component, optionally overridden by a TOML file and
//! then by `P2P_ESCROW__<SECTION>__<KEY>` environment variables.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{
    book::BookConfig,
    engine::{EngineConfig, SweeperConfig},
    error::EscrowError,
    fees::FeeConfig,
    ledger::LedgerConfig,
    reputation::ReputationConfig,
    EscrowResult,
};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "P2P_ESCROW";
/// Separator between prefix, section and key
pub const ENV_SEPARATOR: &str = "__";

/// Configuration for the escrow node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowNodeConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub log_level: String,
    /// Advertisement book configuration
    pub book: BookConfig,
    /// Trade engine configuration
    pub engine: EngineConfig,
    /// Ledger call configuration
    pub ledger: LedgerConfig,
    /// Platform fee configuration
    pub fees: FeeConfig,
    /// Reputation scoring configuration
    pub reputation: ReputationConfig,
    /// Deadline sweeper configuration
    pub sweeper: SweeperConfig,
}

impl Default for EscrowNodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            book: BookConfig::default(),
            engine: EngineConfig::default(),
            ledger: LedgerConfig::default(),
            fees: FeeConfig::default(),
            reputation: ReputationConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl EscrowNodeConfig {
    /// Load defaults, then `path` (if given), then the environment
    pub fn load(path: Option<&Path>) -> EscrowResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR),
        );

        let loaded: Self = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| EscrowError::config(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> EscrowResult<()> {
        if self.ledger.call_timeout_ms == 0 {
            return Err(EscrowError::config("ledger.call_timeout_ms must be positive"));
        }
        if self.book.default_time_limit_minutes == 0
            || self.book.default_time_limit_minutes > self.book.max_time_limit_minutes
        {
            return Err(EscrowError::config(format!(
                "book.default_time_limit_minutes must be between 1 and {}",
                self.book.max_time_limit_minutes
            )));
        }
        if self.book.max_ad_quantity <= Decimal::ZERO {
            return Err(EscrowError::config("book.max_ad_quantity must be positive"));
        }
        if self.fees.rate_percent < Decimal::ZERO
            || self.fees.rate_percent > Decimal::ONE_HUNDRED
        {
            return Err(EscrowError::config("fees.rate_percent must be within 0..=100"));
        }
        let reputation = &self.reputation;
        if reputation.min_score > reputation.initial_score
            || reputation.initial_score > reputation.max_score
        {
            return Err(EscrowError::config(
                "reputation scores must satisfy min_score <= initial_score <= max_score",
            ));
        }
        if self.engine.sweep_batch_size == 0 {
            return Err(EscrowError::config("engine.sweep_batch_size must be positive"));
        }
        if !matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(EscrowError::config(format!(
                "unknown log_level {:?}",
                self.log_level
            )));
        }
        Ok(())
    }
}
