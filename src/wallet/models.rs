//! Wallet data model
//!
//! The persisted wallet document and the read-only views derived from it.
//! Derived values (available balance, limit status) are computed, never stored.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::balance::WalletBalance;
use crate::core_types::{MinorUnits, UserId, Version, WalletId};

/// Ledger operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Deposit,
    Withdraw,
    Lock,
    Unlock,
    CaptureLocked,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "DEPOSIT",
            OperationKind::Withdraw => "WITHDRAW",
            OperationKind::Lock => "LOCK",
            OperationKind::Unlock => "UNLOCK",
            OperationKind::CaptureLocked => "CAPTURE_LOCKED",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "DEPOSIT" => Some(OperationKind::Deposit),
            "WITHDRAW" => Some(OperationKind::Withdraw),
            "LOCK" => Some(OperationKind::Lock),
            "UNLOCK" => Some(OperationKind::Unlock),
            "CAPTURE_LOCKED" => Some(OperationKind::CaptureLocked),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-calendar-day caps and today's usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLimits {
    pub max_deposit: MinorUnits,
    pub max_withdrawal: MinorUnits,
    pub deposit_count: u32,
    pub withdrawal_count: u32,
    pub deposit_amount_today: MinorUnits,
    pub withdrawal_amount_today: MinorUnits,
    pub last_reset_date: DateTime<Utc>,
}

impl DailyLimits {
    pub fn new(max_deposit: MinorUnits, max_withdrawal: MinorUnits, now: DateTime<Utc>) -> Self {
        Self {
            max_deposit,
            max_withdrawal,
            deposit_count: 0,
            withdrawal_count: 0,
            deposit_amount_today: 0,
            withdrawal_amount_today: 0,
            last_reset_date: now,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub verified_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletStats {
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub failed_transactions: u64,
    pub last_activity_date: Option<DateTime<Utc>>,
}

/// An idempotency key committed together with the wallet version it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedKey {
    pub idempotency_key: String,
    pub version: Version,
    pub balance: MinorUnits,
    pub locked_balance: MinorUnits,
}

impl AppliedKey {
    /// Outcome the key produced, as returned to the original caller
    pub fn view(&self, wallet_id: WalletId) -> BalanceView {
        BalanceView {
            wallet_id,
            balance: self.balance,
            locked_balance: self.locked_balance,
            available_balance: self.balance.saturating_sub(self.locked_balance),
            version: self.version,
        }
    }
}

/// Persisted wallet document (one per user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    #[serde(flatten)]
    pub funds: WalletBalance,
    pub total_deposits: MinorUnits,
    pub total_withdrawals: MinorUnits,
    pub daily_limits: DailyLimits,
    pub verification: Verification,
    pub stats: WalletStats,
    /// Most recent keyed commits, oldest first, bounded by the configured window
    #[serde(default)]
    pub recent_keys: VecDeque<AppliedKey>,
    pub version: Version,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Fresh wallet for a newly onboarded user
    pub fn new(
        user_id: UserId,
        max_deposit: MinorUnits,
        max_withdrawal: MinorUnits,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WalletId::new_v4(),
            user_id,
            funds: WalletBalance::default(),
            total_deposits: 0,
            total_withdrawals: 0,
            daily_limits: DailyLimits::new(max_deposit, max_withdrawal, now),
            verification: Verification::default(),
            stats: WalletStats::default(),
            recent_keys: VecDeque::new(),
            version: 0,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn balance(&self) -> MinorUnits {
        self.funds.balance()
    }

    #[inline]
    pub fn locked_balance(&self) -> MinorUnits {
        self.funds.locked()
    }

    #[inline]
    pub fn available_balance(&self) -> MinorUnits {
        self.funds.available()
    }

    pub fn balance_view(&self) -> BalanceView {
        BalanceView {
            wallet_id: self.id,
            balance: self.balance(),
            locked_balance: self.locked_balance(),
            available_balance: self.available_balance(),
            version: self.version,
        }
    }

    /// Look up a key committed within the recent window
    pub fn applied_key(&self, idempotency_key: &str) -> Option<&AppliedKey> {
        self.recent_keys
            .iter()
            .find(|k| k.idempotency_key == idempotency_key)
    }

    /// Remember a keyed commit, evicting the oldest entries past `window`
    pub fn remember_key(&mut self, applied: AppliedKey, window: usize) {
        self.recent_keys.push_back(applied);
        while self.recent_keys.len() > window {
            self.recent_keys.pop_front();
        }
    }

    /// Check the state about to be committed against its predecessor
    pub fn check_invariants(&self, previous: &Wallet) -> Result<(), String> {
        if self.locked_balance() > self.balance() {
            return Err(format!(
                "locked {} exceeds balance {}",
                self.locked_balance(),
                self.balance()
            ));
        }
        if self.version <= previous.version {
            return Err(format!(
                "version {} does not advance past {}",
                self.version, previous.version
            ));
        }
        if self.total_deposits < previous.total_deposits
            || self.total_withdrawals < previous.total_withdrawals
        {
            return Err("lifetime totals decreased".to_string());
        }
        if self.id != previous.id || self.user_id != previous.user_id {
            return Err("wallet identity changed".to_string());
        }
        Ok(())
    }
}

/// Result of every successful ledger operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub wallet_id: WalletId,
    pub balance: MinorUnits,
    pub locked_balance: MinorUnits,
    pub available_balance: MinorUnits,
    pub version: Version,
}
