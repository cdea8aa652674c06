//! Wallet Ledger - per-user wallet balances with escrow
//!
//! Deposit, withdraw, lock, unlock and capture funds in integer minor units,
//! with per-day limits, idempotent external calls and an audit trail.
//! Concurrency is optimistic: every commit is a version compare-and-swap.
//!
//! # Modules
//!
//! - [`core_types`] - Core type aliases (WalletId, UserId, MinorUnits, Version)
//! - [`money`] - Strict amount decoding into minor units
//! - [`wallet`] - Wallet document and enforced balance type
//! - [`store`] - WalletStore trait, in-memory and PostgreSQL backends
//! - [`limits`] - Daily limit policy (pure)
//! - [`idempotency`] - Two-phase idempotency guard
//! - [`transaction_log`] - Append-only audit log
//! - [`clock`] - Injectable time source
//! - [`engine`] - Ledger state machine
//! - [`api`] - Request/response DTOs
//! - [`error`] - Error taxonomy
//! - [`config`] / [`logging`] - Application configuration and tracing setup

// Core types - must be first!
pub mod core_types;

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod money;

// Ledger components
pub mod api;
pub mod engine;
pub mod idempotency;
pub mod limits;
pub mod store;
pub mod transaction_log;
pub mod wallet;

// Convenient re-exports at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, LedgerConfig};
pub use core_types::{MinorUnits, UserId, Version, WalletId};
pub use engine::{LedgerCommand, LedgerEngine};
pub use error::{ErrorCategory, LedgerError, StoreError};
pub use limits::{DailyLimitPolicy, DailyLimitStatus, LimitDecision, LimitReason};
pub use store::{MemoryWalletStore, PgWalletStore, WalletStore};
pub use transaction_log::{EntryOutcome, TransactionEntry, TransactionLog};
pub use wallet::{BalanceView, OperationKind, Wallet};
