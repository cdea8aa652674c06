//! In-memory stores
//!
//! DashMap shards give per-wallet atomicity: a CAS holds the shard write lock
//! of exactly one wallet, so distinct wallets never contend on a global lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use super::WalletStore;
use crate::core_types::{UserId, Version, WalletId};
use crate::error::StoreError;
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
use crate::wallet::{BalanceView, Wallet};

#[derive(Default)]
pub struct MemoryWalletStore {
    wallets: DashMap<WalletId, Wallet>,
    by_user: DashMap<UserId, WalletId>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, wallet_id: WalletId) -> Result<Option<Wallet>, StoreError> {
        Ok(self.wallets.get(&wallet_id).map(|w| w.value().clone()))
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Option<Wallet>, StoreError> {
        let wallet_id = match self.by_user.get(&user_id) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get(wallet_id).await
    }

    async fn create(&self, wallet: &Wallet) -> Result<(), StoreError> {
        // The user entry lock is held until both maps are written
        match self.by_user.entry(wallet.user_id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists),
            Entry::Vacant(slot) => {
                if self.wallets.contains_key(&wallet.id) {
                    return Err(StoreError::AlreadyExists);
                }
                self.wallets.insert(wallet.id, wallet.clone());
                slot.insert(wallet.id);
                Ok(())
            }
        }
    }

    async fn compare_and_swap(
        &self,
        new_state: &Wallet,
        expected_version: Version,
    ) -> Result<(), StoreError> {
        let mut current = self
            .wallets
            .get_mut(&new_state.id)
            .ok_or(StoreError::NotFound(new_state.id))?;

        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        *current = new_state.clone();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryIdempotencyStore {
    records: DashMap<(WalletId, String), IdempotencyRecord>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn claim_id_of(record: &IdempotencyRecord) -> Option<Ulid> {
    match record.status {
        IdempotencyStatus::Claimed { claim_id, .. } => Some(claim_id),
        IdempotencyStatus::Completed { .. } => None,
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(
        &self,
        wallet_id: WalletId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self
            .records
            .get(&(wallet_id, key.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn insert_claim(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        match self
            .records
            .entry((record.wallet_id, record.idempotency_key.clone()))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn replace_claim(
        &self,
        wallet_id: WalletId,
        key: &str,
        previous: Ulid,
        next: &IdempotencyStatus,
    ) -> Result<bool, StoreError> {
        match self.records.get_mut(&(wallet_id, key.to_string())) {
            Some(mut record) if claim_id_of(&record) == Some(previous) => {
                record.status = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        wallet_id: WalletId,
        key: &str,
        claim_id: Ulid,
        outcome: &BalanceView,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut record = self
            .records
            .get_mut(&(wallet_id, key.to_string()))
            .ok_or(StoreError::NotFound(wallet_id))?;

        if claim_id_of(&record) != Some(claim_id) {
            return Ok(false);
        }
        record.status = IdempotencyStatus::Completed {
            outcome: *outcome,
            completed_at,
        };
        Ok(true)
    }

    async fn release(
        &self,
        wallet_id: WalletId,
        key: &str,
        claim_id: Ulid,
    ) -> Result<(), StoreError> {
        self.records
            .remove_if(&(wallet_id, key.to_string()), |_, record| {
                claim_id_of(record) == Some(claim_id)
            });
        Ok(())
    }
}
