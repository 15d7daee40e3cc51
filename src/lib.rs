//! Coin Rewards Engine Library
//! # Overview
//!
//! This library implements the payment engine of a coin-rewards platform. Users
//! buy coins, pay merchant bills with them at a category discount, send coins to
//! each other, get refunds, and merchants settle their accrued coins.
//!
//! Two stores are kept in step: a double-entry **ledger** holds balances, a
//! **record store** holds the business rows (purchases, transactions,
//! settlements, referral rewards) that history is built from. Neither store
//! coordinates with the other; the coordinator writes an intent row before
//! every ledger transfer and closes it afterwards, and a background reconciler
//! closes the rows a crash left open.
//!
//! # Architecture
//!
//! - [`types`] - Core data types (coins, identifiers, records, history, errors)
//! - [`core`] - Business logic components:
//!   - [`core::ledger`] - Typed ledger adapter
//!   - [`core::policy`] - Discount pricing and the seven payment gates
//!   - [`core::coordinator`] - Value-moving operations
//!   - [`core::history`] - Financial history projection
//!   - [`core::reconciler`] - Pending-intent reconciliation
//!   - [`core::memory`] - In-process ledger, record store and directory
//! - [`service`] - Protocol-agnostic service surface and engine wiring
//! - [`rpc`] - JSON-over-HTTP transport
//! - [`config`] - YAML configuration
//! - [`cli`] - CLI arguments parsing
//!
//! # Operations
//!
//! - **Top-up**: SYSTEM -> user, fiat converted 1:1 into coins
//! - **Merchant payment**: user -> merchant for the discount value of the bill
//! - **Transfer**: user -> user
//! - **Refund**: reverse of a transaction (partial or full) or of a coin purchase
//! - **Settlement**: merchant -> SETTLEMENT
//! - **Referral rewards**: SYSTEM -> referrer and referee

// Module declarations
pub mod cli;
pub mod config;
pub mod core;
pub mod rpc;
pub mod service;
pub mod types;

pub use config::{Config, ConfigError};
pub use core::{HistoryProjector, LedgerAdapter, PaymentCoordinator, Policy, Reconciler};
pub use service::{Engine, EngineBuilder, PaymentService};
pub use types::{Coins, EngineError, MerchantId, RecordId, UserId};
