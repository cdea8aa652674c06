//! Wallet record
//!
//! One wallet per user. Mutated only through `LedgerEngine`, never deleted;
//! deactivation blocks further mutation while preserving history.

pub mod balance;
pub mod models;

pub use balance::{BalanceError, WalletBalance};
pub use models::{
    AppliedKey, BalanceView, DailyLimits, OperationKind, Verification, Wallet, WalletStats,
};
