//! Daily Limit Policy
//!
//! Pure evaluation of rolling per-calendar-day deposit and withdrawal limits.
//! No I/O: the engine feeds it a wallet copy and decides what to persist.
//!
//! # Day boundary
//!
//! Days are calendar days in one fixed configured offset. Counters are reset
//! by [`DailyLimitPolicy::reset_if_needed`] whenever `now` falls on a later
//! day than `lastResetDate`, and the engine calls it before every evaluation.
//!
//! # Quota
//!
//! [`DailyLimitPolicy::record`] is applied only to the state being committed,
//! so a rejected or failed operation never consumes quota.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LedgerConfig;
use crate::core_types::MinorUnits;
use crate::wallet::{DailyLimits, OperationKind, Wallet};

/// Why a limit check denied the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitReason {
    DepositCountExceeded,
    WithdrawalCountExceeded,
    DepositAmountExceeded,
    WithdrawalAmountExceeded,
}

impl LimitReason {
    pub fn code(&self) -> &'static str {
        match self {
            LimitReason::DepositCountExceeded => "DEPOSIT_COUNT_EXCEEDED",
            LimitReason::WithdrawalCountExceeded => "WITHDRAWAL_COUNT_EXCEEDED",
            LimitReason::DepositAmountExceeded => "DEPOSIT_AMOUNT_EXCEEDED",
            LimitReason::WithdrawalAmountExceeded => "WITHDRAWAL_AMOUNT_EXCEEDED",
        }
    }
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LimitReason::DepositCountExceeded => "daily deposit count exceeded",
            LimitReason::WithdrawalCountExceeded => "daily withdrawal count exceeded",
            LimitReason::DepositAmountExceeded => "daily deposit amount exceeded",
            LimitReason::WithdrawalAmountExceeded => "daily withdrawal amount exceeded",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allow,
    Deny(LimitReason),
}

/// Usage of one direction (deposit or withdrawal) for the current day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitUsage {
    pub count: u32,
    pub max_count: u32,
    pub remaining_count: u32,
    pub amount: MinorUnits,
    pub max_amount: MinorUnits,
    pub remaining_amount: MinorUnits,
}

impl LimitUsage {
    fn new(count: u32, max_count: u32, amount: MinorUnits, max_amount: MinorUnits) -> Self {
        Self {
            count,
            max_count,
            remaining_count: max_count.saturating_sub(count),
            amount,
            max_amount,
            remaining_amount: max_amount.saturating_sub(amount),
        }
    }
}

/// Result of `GetDailyLimitStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLimitStatus {
    pub day: NaiveDate,
    pub deposit: LimitUsage,
    pub withdrawal: LimitUsage,
}

#[derive(Debug, Clone, Copy)]
pub struct DailyLimitPolicy {
    offset: FixedOffset,
    max_deposit_count: u32,
    max_withdrawal_count: u32,
}

impl Default for DailyLimitPolicy {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

impl DailyLimitPolicy {
    pub fn new(offset: FixedOffset, max_deposit_count: u32, max_withdrawal_count: u32) -> Self {
        Self {
            offset,
            max_deposit_count,
            max_withdrawal_count,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(
            config.day_offset(),
            config.max_deposit_count,
            config.max_withdrawal_count,
        )
    }

    /// Calendar day of an instant in the configured offset
    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// Zero today's counters if `now` is on a later day than the last reset
    ///
    /// Returns true when a reset happened. A clock that moved backwards
    /// across midnight is a no-op.
    pub fn reset_if_needed(&self, wallet: &mut Wallet, now: DateTime<Utc>) -> bool {
        self.reset_limits(&mut wallet.daily_limits, now)
    }

    fn reset_limits(&self, limits: &mut DailyLimits, now: DateTime<Utc>) -> bool {
        if self.day_of(now) <= self.day_of(limits.last_reset_date) {
            return false;
        }
        limits.deposit_count = 0;
        limits.withdrawal_count = 0;
        limits.deposit_amount_today = 0;
        limits.withdrawal_amount_today = 0;
        limits.last_reset_date = now;
        true
    }

    /// Check an operation against today's usage
    ///
    /// Lock, Unlock and CaptureLocked are not limited.
    pub fn evaluate(&self, wallet: &Wallet, kind: OperationKind, amount: MinorUnits) -> LimitDecision {
        let limits = &wallet.daily_limits;
        match kind {
            OperationKind::Deposit => {
                if limits.deposit_count >= self.max_deposit_count {
                    return LimitDecision::Deny(LimitReason::DepositCountExceeded);
                }
                if exceeds(limits.deposit_amount_today, amount, limits.max_deposit) {
                    return LimitDecision::Deny(LimitReason::DepositAmountExceeded);
                }
                LimitDecision::Allow
            }
            OperationKind::Withdraw => {
                if limits.withdrawal_count >= self.max_withdrawal_count {
                    return LimitDecision::Deny(LimitReason::WithdrawalCountExceeded);
                }
                if exceeds(limits.withdrawal_amount_today, amount, limits.max_withdrawal) {
                    return LimitDecision::Deny(LimitReason::WithdrawalAmountExceeded);
                }
                LimitDecision::Allow
            }
            OperationKind::Lock | OperationKind::Unlock | OperationKind::CaptureLocked => {
                LimitDecision::Allow
            }
        }
    }

    /// Consume quota on the state being committed
    pub fn record(&self, wallet: &mut Wallet, kind: OperationKind, amount: MinorUnits) {
        let limits = &mut wallet.daily_limits;
        match kind {
            OperationKind::Deposit => {
                limits.deposit_count = limits.deposit_count.saturating_add(1);
                limits.deposit_amount_today = limits.deposit_amount_today.saturating_add(amount);
            }
            OperationKind::Withdraw => {
                limits.withdrawal_count = limits.withdrawal_count.saturating_add(1);
                limits.withdrawal_amount_today =
                    limits.withdrawal_amount_today.saturating_add(amount);
            }
            OperationKind::Lock | OperationKind::Unlock | OperationKind::CaptureLocked => {}
        }
    }

    /// Usage as of `now`, computed on a copy so a read never persists a reset
    pub fn status(&self, wallet: &Wallet, now: DateTime<Utc>) -> DailyLimitStatus {
        let mut limits = wallet.daily_limits.clone();
        self.reset_limits(&mut limits, now);
        DailyLimitStatus {
            day: self.day_of(now),
            deposit: LimitUsage::new(
                limits.deposit_count,
                self.max_deposit_count,
                limits.deposit_amount_today,
                limits.max_deposit,
            ),
            withdrawal: LimitUsage::new(
                limits.withdrawal_count,
                self.max_withdrawal_count,
                limits.withdrawal_amount_today,
                limits.max_withdrawal,
            ),
        }
    }
}

#[inline]
fn exceeds(today: MinorUnits, amount: MinorUnits, max: MinorUnits) -> bool {
    today.checked_add(amount).is_none_or(|total| total > max)
}
