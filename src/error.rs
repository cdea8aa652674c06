//! Ledger Error Types
//!
//! Every failure the engine can surface, with a stable code for API responses.
//! Business outcomes (insufficient funds, limits, inactive account) are plain
//! `Err` values; only `StoreError::VersionConflict` is retried internally.

use thiserror::Error;

use crate::core_types::{Version, WalletId};
use crate::limits::LimitReason;
use crate::money::MoneyError;

/// Error family, used by callers that only care about the broad class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    State,
    Policy,
    Concurrency,
    NotFound,
    Inactive,
    Internal,
}

/// Ledger error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Amount must be a positive whole number of minor units")]
    InvalidAmount,

    #[error("Idempotency key reused with a different operation")]
    IdempotencyKeyMismatch,

    // === State Errors ===
    #[error("Insufficient available balance")]
    InsufficientAvailableBalance,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // === Policy Errors ===
    #[error("Daily limit exceeded: {0}")]
    LimitExceeded(LimitReason),

    // === Concurrency Errors ===
    #[error("Wallet is busy, retry later")]
    Busy,

    #[error("Idempotency key outcome cannot be determined")]
    IdempotencyInDoubt,

    // === Not Found / Lifecycle ===
    #[error("Wallet not found")]
    WalletNotFound,

    #[error("Wallet already exists for this user")]
    WalletExists,

    #[error("Account is inactive")]
    AccountInactive,

    // === System Errors ===
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount => "INVALID_AMOUNT",
            LedgerError::IdempotencyKeyMismatch => "IDEMPOTENCY_KEY_MISMATCH",
            LedgerError::InsufficientAvailableBalance => "INSUFFICIENT_AVAILABLE_BALANCE",
            LedgerError::InvalidState(_) => "INVALID_STATE",
            LedgerError::LimitExceeded(reason) => reason.code(),
            LedgerError::Busy => "BUSY",
            LedgerError::IdempotencyInDoubt => "IDEMPOTENCY_IN_DOUBT",
            LedgerError::WalletNotFound => "WALLET_NOT_FOUND",
            LedgerError::WalletExists => "WALLET_EXISTS",
            LedgerError::AccountInactive => "ACCOUNT_INACTIVE",
            LedgerError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::InvalidAmount | LedgerError::IdempotencyKeyMismatch => {
                ErrorCategory::Validation
            }
            LedgerError::InsufficientAvailableBalance
            | LedgerError::InvalidState(_)
            | LedgerError::WalletExists => ErrorCategory::State,
            LedgerError::LimitExceeded(_) => ErrorCategory::Policy,
            LedgerError::Busy | LedgerError::IdempotencyInDoubt => ErrorCategory::Concurrency,
            LedgerError::WalletNotFound => ErrorCategory::NotFound,
            LedgerError::AccountInactive => ErrorCategory::Inactive,
            LedgerError::InvariantViolation(_)
            | LedgerError::Storage(_)
            | LedgerError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self.category() {
            ErrorCategory::Validation => 400,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Concurrency => 409,
            ErrorCategory::State | ErrorCategory::Policy | ErrorCategory::Inactive => 422,
            ErrorCategory::Internal => 500,
        }
    }
}

impl From<MoneyError> for LedgerError {
    fn from(_: MoneyError) -> Self {
        LedgerError::InvalidAmount
    }
}

/// Storage seam errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: Version, actual: Version },

    #[error("Record not found: {0}")]
    NotFound(WalletId),

    #[error("Record already exists")]
    AlreadyExists,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => LedgerError::WalletNotFound,
            StoreError::AlreadyExists => LedgerError::WalletExists,
            // A conflict that escapes the retry loop means the loop gave up
            StoreError::VersionConflict { .. } => LedgerError::Busy,
            StoreError::Database(msg) | StoreError::Corrupt(msg) => LedgerError::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::InvalidAmount.code(), "INVALID_AMOUNT");
        assert_eq!(
            LedgerError::InsufficientAvailableBalance.code(),
            "INSUFFICIENT_AVAILABLE_BALANCE"
        );
        assert_eq!(
            LedgerError::LimitExceeded(LimitReason::WithdrawalCountExceeded).code(),
            "WITHDRAWAL_COUNT_EXCEEDED"
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            LedgerError::InvalidAmount.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            LedgerError::InvalidState("x".into()).category(),
            ErrorCategory::State
        );
        assert_eq!(
            LedgerError::LimitExceeded(LimitReason::DepositAmountExceeded).category(),
            ErrorCategory::Policy
        );
        assert_eq!(LedgerError::Busy.category(), ErrorCategory::Concurrency);
        assert_eq!(
            LedgerError::WalletNotFound.category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            LedgerError::AccountInactive.category(),
            ErrorCategory::Inactive
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::InvalidAmount.http_status(), 400);
        assert_eq!(LedgerError::WalletNotFound.http_status(), 404);
        assert_eq!(LedgerError::Busy.http_status(), 409);
        assert_eq!(LedgerError::InsufficientAvailableBalance.http_status(), 422);
        assert_eq!(LedgerError::Storage("io".into()).http_status(), 500);
    }

    #[test]
    fn test_store_error_mapping() {
        let conflict = StoreError::VersionConflict {
            expected: 3,
            actual: 4,
        };
        assert_eq!(LedgerError::from(conflict), LedgerError::Busy);
        assert_eq!(
            LedgerError::from(StoreError::AlreadyExists),
            LedgerError::WalletExists
        );
        assert_eq!(
            LedgerError::from(MoneyError::Fractional),
            LedgerError::InvalidAmount
        );
    }

    #[test]
    fn test_display() {
        let err = LedgerError::LimitExceeded(LimitReason::DepositCountExceeded);
        assert_eq!(
            err.to_string(),
            "Daily limit exceeded: daily deposit count exceeded"
        );
    }
}
