//! Core types used throughout the ledger
//!
//! These are fundamental type aliases shared by every module.
//! They give semantic meaning to raw integers and ids.

/// Wallet ID - globally unique, immutable after creation.
///
/// # Usage:
/// - Primary key of the wallet record
/// - Key of every idempotency record and transaction log entry
pub type WalletId = uuid::Uuid;

/// User ID - owner of exactly one wallet.
///
/// The wallet keeps it as a lookup-only back-reference.
pub type UserId = u64;

/// Monetary amount in minor currency units (e.g. cents).
///
/// # Constraints:
/// - **Integral**: no fractional minor units exist
/// - **Unsigned**: balances can never go negative
pub type MinorUnits = u64;

/// Optimistic concurrency version of a wallet record
pub type Version = u64;
