//! Wallet persistence
//!
//! `WalletStore` is the sole persistence abstraction for wallets. It holds no
//! business logic and never retries: a stale writer gets
//! `StoreError::VersionConflict` and must reload.
//!
//! Implementations:
//! - [`MemoryWalletStore`] - DashMap-backed, per-wallet atomic CAS
//! - [`PgWalletStore`] - PostgreSQL `wallets_tb`, CAS via `WHERE version = $n`

pub mod memory;
pub mod postgres;

pub use memory::{MemoryIdempotencyStore, MemoryWalletStore};
pub use postgres::{PgIdempotencyStore, PgWalletStore};

use async_trait::async_trait;

use crate::core_types::{UserId, Version, WalletId};
use crate::error::StoreError;
use crate::wallet::Wallet;

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &'static str;

    async fn get(&self, wallet_id: WalletId) -> Result<Option<Wallet>, StoreError>;

    /// Identity resolution: wallet owned by `user_id`
    async fn find_by_user(&self, user_id: UserId) -> Result<Option<Wallet>, StoreError>;

    /// Persist a new wallet
    ///
    /// # Errors
    /// `AlreadyExists` if the user already owns a wallet.
    async fn create(&self, wallet: &Wallet) -> Result<(), StoreError>;

    /// Replace the stored wallet with `new_state` iff its version is still
    /// `expected_version`.
    ///
    /// All fields change together or none do.
    async fn compare_and_swap(
        &self,
        new_state: &Wallet,
        expected_version: Version,
    ) -> Result<(), StoreError>;
}
