/// ENFORCED WALLET BALANCE TYPE - Used by LedgerEngine
///
/// ALL balance mutations MUST go through these methods.
///
/// # Enforcement Strategy:
/// 1. Fields are PRIVATE - no direct access
/// 2. All mutations return Result - errors are explicit
/// 3. checked_add/sub - overflow protection
/// 4. Every method validates before it writes, so a failed call leaves the
///    value untouched
use serde::{Deserialize, Serialize};

use crate::core_types::MinorUnits;

/// Why a balance mutation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceError {
    /// available (balance - locked) is smaller than the amount
    InsufficientAvailable,
    /// locked is smaller than the amount
    InsufficientLocked,
    /// balance is smaller than the amount
    InsufficientBalance,
    Overflow,
}

/// Balance and escrow of one wallet
///
/// # Invariants (ENFORCED by private fields):
/// - `locked <= balance`, so available is never negative
/// - No overflow/underflow (checked arithmetic)
///
/// # Usage:
/// ```ignore
/// let mut bal = WalletBalance::default();
/// bal.credit(1000)?;   // balance = 1000
/// bal.lock(400)?;      // locked = 400, available = 600
/// bal.capture(100)?;   // balance = 900, locked = 300
/// bal.unlock(300)?;    // locked = 0, available = 900
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawWalletBalance")]
pub struct WalletBalance {
    balance: MinorUnits, // PRIVATE - modified by credit/debit/capture
    #[serde(rename = "lockedBalance")]
    locked: MinorUnits, // PRIVATE - modified by lock/unlock/capture
}

/// Wire shape, validated on the way in
#[derive(Deserialize)]
struct RawWalletBalance {
    balance: MinorUnits,
    #[serde(rename = "lockedBalance")]
    locked: MinorUnits,
}

impl TryFrom<RawWalletBalance> for WalletBalance {
    type Error = String;

    fn try_from(raw: RawWalletBalance) -> Result<Self, Self::Error> {
        WalletBalance::from_parts(raw.balance, raw.locked).ok_or_else(|| {
            format!(
                "lockedBalance {} exceeds balance {}",
                raw.locked, raw.balance
            )
        })
    }
}

impl WalletBalance {
    /// Rebuild from persisted columns, rejecting rows that break the invariant
    pub fn from_parts(balance: MinorUnits, locked: MinorUnits) -> Option<Self> {
        (locked <= balance).then_some(Self { balance, locked })
    }

    // ============================================================
    // READ-ONLY GETTERS
    // ============================================================

    #[inline(always)]
    pub const fn balance(&self) -> MinorUnits {
        self.balance
    }

    #[inline(always)]
    pub const fn locked(&self) -> MinorUnits {
        self.locked
    }

    /// Spendable funds: balance - locked
    #[inline(always)]
    pub const fn available(&self) -> MinorUnits {
        // locked <= balance holds for every constructed value
        self.balance.saturating_sub(self.locked)
    }

    // ============================================================
    // VALIDATED MUTATIONS
    // ============================================================

    /// Add funds to balance
    pub fn credit(&mut self, amount: MinorUnits) -> Result<(), BalanceError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        Ok(())
    }

    /// Remove funds from balance, checked against available
    pub fn debit(&mut self, amount: MinorUnits) -> Result<(), BalanceError> {
        if self.available() < amount {
            return Err(BalanceError::InsufficientAvailable);
        }
        self.balance -= amount;
        Ok(())
    }

    /// Reserve funds; balance is untouched
    pub fn lock(&mut self, amount: MinorUnits) -> Result<(), BalanceError> {
        if self.available() < amount {
            return Err(BalanceError::InsufficientAvailable);
        }
        self.locked = self
            .locked
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        Ok(())
    }

    /// Release a reservation back to available
    pub fn unlock(&mut self, amount: MinorUnits) -> Result<(), BalanceError> {
        if self.locked < amount {
            return Err(BalanceError::InsufficientLocked);
        }
        self.locked -= amount;
        Ok(())
    }

    /// Finalize a reservation: balance and locked both drop by `amount`
    ///
    /// Atomic - either both change or neither does.
    pub fn capture(&mut self, amount: MinorUnits) -> Result<(), BalanceError> {
        if self.locked < amount {
            return Err(BalanceError::InsufficientLocked);
        }
        if self.balance < amount {
            return Err(BalanceError::InsufficientBalance);
        }
        self.locked -= amount;
        self.balance -= amount;
        Ok(())
    }
}
