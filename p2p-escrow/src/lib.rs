//! Peer-to-peer trade escrow engine
//!
//! Turns posted buy/sell advertisements into matched trades, holds the
//! traded asset in escrow while the fiat payment happens off-platform, and
//! releases or returns it according to the trade state machine:
//! - Advertisement book with a per-advertisement reservation protocol
//! - Trade engine driving escrow through an external ledger port
//! - Dispute arbitration, trade chat and trader reputation
//! - Best-effort event delivery through a notification port

pub mod book;
pub mod config;
pub mod conversation;
pub mod dispute;
pub mod engine;
pub mod error;
pub mod fees;
pub mod ledger;
pub mod models;
pub mod node;
pub mod notifier;
pub mod reputation;

pub use crate::book::{AdFilter, CreateAdRequest};
pub use crate::config::EscrowNodeConfig;
pub use crate::engine::{CancelOutcome, OpenTradeRequest, SweepReport};
pub use crate::error::{ErrorKind, EscrowError};
pub use crate::node::{EscrowNode, NodeHealth};

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
