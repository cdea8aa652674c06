//! Idempotency Guard
//!
//! At-most-once application of ledger operations carrying an external key
//! (e.g. payment-gateway callbacks that are retried on timeout).
//!
//! # Two-phase protocol
//!
//! The idempotency store and the wallet store are separate records, so the
//! guard does not rely on a transaction spanning both:
//!
//! ```text
//! (absent) --claim--> CLAIMED --complete--> COMPLETED (immutable)
//!                        |
//!                        +--release--> (absent)      definite no-commit
//!                        +--takeover--> CLAIMED'     stale claim, provably unapplied
//! ```
//!
//! The wallet commit itself carries the key in `recentKeys`, so the wallet
//! is the source of truth for "did this key commit". An unfinished claim is
//! resolved on the next read:
//!
//! - key present in the wallet's `recentKeys` => finalize and replay
//! - claim younger than the TTL => another caller is in flight, `Busy`
//! - claim stale and fewer commits than the window since it was taken =>
//!   provably never committed, take it over and execute
//! - otherwise => `IdempotencyInDoubt`

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::core_types::{MinorUnits, Version, WalletId};
use crate::error::{LedgerError, StoreError};
use crate::wallet::{BalanceView, OperationKind, Wallet};

/// Lifecycle of one idempotency record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    /// Claimed before the wallet mutation; `observed_version` is the wallet
    /// version at claim time
    #[serde(rename_all = "camelCase")]
    Claimed {
        claim_id: Ulid,
        observed_version: Version,
        claimed_at: DateTime<Utc>,
    },
    /// Finalized with the committed outcome
    #[serde(rename_all = "camelCase")]
    Completed {
        outcome: BalanceView,
        completed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub wallet_id: WalletId,
    pub idempotency_key: String,
    pub kind: OperationKind,
    pub amount: MinorUnits,
    pub status: IdempotencyStatus,
}

impl IdempotencyRecord {
    fn matches(&self, kind: OperationKind, amount: MinorUnits) -> bool {
        self.kind == kind && self.amount == amount
    }
}

/// Storage for idempotency records, keyed by `(wallet_id, idempotency_key)`
///
/// Every method is a single-record atomic operation.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(
        &self,
        wallet_id: WalletId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Insert a CLAIMED record; false if any record already exists
    async fn insert_claim(&self, record: &IdempotencyRecord) -> Result<bool, StoreError>;

    /// Replace CLAIMED(`previous`) with CLAIMED(`next`); false if the claim changed
    async fn replace_claim(
        &self,
        wallet_id: WalletId,
        key: &str,
        previous: Ulid,
        next: &IdempotencyStatus,
    ) -> Result<bool, StoreError>;

    /// Turn CLAIMED(`claim_id`) into COMPLETED; false if the record is
    /// completed already or now owned by another claim
    async fn complete(
        &self,
        wallet_id: WalletId,
        key: &str,
        claim_id: Ulid,
        outcome: &BalanceView,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete a CLAIMED record still owned by `claim_id`
    async fn release(&self, wallet_id: WalletId, key: &str, claim_id: Ulid)
    -> Result<(), StoreError>;
}

/// Proof that this caller owns the claim on a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    pub wallet_id: WalletId,
    pub idempotency_key: String,
    pub claim_id: Ulid,
}

/// What the guard decided for an incoming keyed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Execute; the ticket must later be completed or released
    Fresh(ClaimTicket),
    /// Already applied; return this outcome without re-executing
    Replay(BalanceView),
}

pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    claim_ttl: Duration,
    window: usize,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, claim_ttl: Duration, window: usize) -> Self {
        Self {
            store,
            claim_ttl,
            window,
        }
    }

    /// Size of the wallet's `recentKeys` window this guard relies on
    pub fn window(&self) -> usize {
        self.window
    }

    /// Look up `key` and either claim it or return the stored outcome
    ///
    /// `wallet` must be a fresh read of the wallet the key belongs to.
    pub async fn record_and_check(
        &self,
        wallet: &Wallet,
        key: &str,
        kind: OperationKind,
        amount: MinorUnits,
        now: DateTime<Utc>,
    ) -> Result<Admission, LedgerError> {
        // Two rounds: a lost insert race re-reads the winner's record once
        for _ in 0..2 {
            let existing = self.store.get(wallet.id, key).await?;
            let record = match existing {
                Some(record) => record,
                None => {
                    let claim_id = Ulid::new();
                    let record = IdempotencyRecord {
                        wallet_id: wallet.id,
                        idempotency_key: key.to_string(),
                        kind,
                        amount,
                        status: IdempotencyStatus::Claimed {
                            claim_id,
                            observed_version: wallet.version,
                            claimed_at: now,
                        },
                    };
                    if self.store.insert_claim(&record).await? {
                        return Ok(Admission::Fresh(ClaimTicket {
                            wallet_id: wallet.id,
                            idempotency_key: key.to_string(),
                            claim_id,
                        }));
                    }
                    continue;
                }
            };

            if !record.matches(kind, amount) {
                warn!(
                    wallet_id = %wallet.id,
                    key = key,
                    stored_kind = %record.kind,
                    stored_amount = record.amount,
                    "Idempotency key reused with a different operation"
                );
                return Err(LedgerError::IdempotencyKeyMismatch);
            }

            return match record.status {
                IdempotencyStatus::Completed { outcome, .. } => {
                    debug!(wallet_id = %wallet.id, key = key, "Idempotency hit");
                    Ok(Admission::Replay(outcome))
                }
                IdempotencyStatus::Claimed {
                    claim_id,
                    observed_version,
                    claimed_at,
                } => {
                    self.resolve_unfinished(wallet, key, claim_id, observed_version, claimed_at, now)
                        .await
                }
            };
        }

        // Inserted and deleted twice under us: someone is actively working the key
        Err(LedgerError::Busy)
    }

    async fn resolve_unfinished(
        &self,
        wallet: &Wallet,
        key: &str,
        claim_id: Ulid,
        observed_version: Version,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Admission, LedgerError> {
        if let Some(applied) = wallet.applied_key(key) {
            let outcome = applied.view(wallet.id);
            self.store
                .complete(wallet.id, key, claim_id, &outcome, now)
                .await?;
            info!(
                wallet_id = %wallet.id,
                key = key,
                version = applied.version,
                "Recovered unfinished idempotency claim as completed"
            );
            return Ok(Admission::Replay(outcome));
        }

        if now - claimed_at < self.claim_ttl {
            debug!(wallet_id = %wallet.id, key = key, "Idempotency claim in flight");
            return Err(LedgerError::Busy);
        }

        let commits_since = wallet.version.saturating_sub(observed_version);
        if commits_since >= self.window as u64 {
            warn!(
                wallet_id = %wallet.id,
                key = key,
                commits_since = commits_since,
                window = self.window,
                "Stale idempotency claim outside recovery window"
            );
            return Err(LedgerError::IdempotencyInDoubt);
        }

        let next_id = Ulid::new();
        let next = IdempotencyStatus::Claimed {
            claim_id: next_id,
            observed_version: wallet.version,
            claimed_at: now,
        };
        if !self
            .store
            .replace_claim(wallet.id, key, claim_id, &next)
            .await?
        {
            return Err(LedgerError::Busy);
        }

        info!(
            wallet_id = %wallet.id,
            key = key,
            "Took over stale idempotency claim"
        );
        Ok(Admission::Fresh(ClaimTicket {
            wallet_id: wallet.id,
            idempotency_key: key.to_string(),
            claim_id: next_id,
        }))
    }

    /// Finalize a claim with the committed outcome
    ///
    /// False if the ticket no longer owns the claim (taken over or already
    /// completed); the record is left as it is.
    pub async fn complete(
        &self,
        ticket: &ClaimTicket,
        outcome: &BalanceView,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.store
            .complete(
                ticket.wallet_id,
                &ticket.idempotency_key,
                ticket.claim_id,
                outcome,
                now,
            )
            .await
    }

    /// Drop a claim after a definite no-commit outcome
    pub async fn release(&self, ticket: &ClaimTicket) -> Result<(), StoreError> {
        self.store
            .release(ticket.wallet_id, &ticket.idempotency_key, ticket.claim_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryIdempotencyStore;
    use crate::wallet::AppliedKey;

    fn guard(store: Arc<MemoryIdempotencyStore>) -> IdempotencyGuard {
        IdempotencyGuard::new(store, Duration::seconds(30), 4)
    }

    fn wallet() -> Wallet {
        Wallet::new(1, 1_000_000, 1_000_000, Utc::now())
    }

    fn view(w: &Wallet, balance: u64, version: u64) -> BalanceView {
        BalanceView {
            wallet_id: w.id,
            balance,
            locked_balance: 0,
            available_balance: balance,
            version,
        }
    }

    #[tokio::test]
    async fn test_first_call_claims_then_replays() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let g = guard(store.clone());
        let w = wallet();
        let now = Utc::now();

        let ticket = match g
            .record_and_check(&w, "k1", OperationKind::Deposit, 100, now)
            .await
            .unwrap()
        {
            Admission::Fresh(t) => t,
            other => panic!("expected claim, got {:?}", other),
        };

        assert!(g.complete(&ticket, &view(&w, 100, 1), now).await.unwrap());

        let again = g
            .record_and_check(&w, "k1", OperationKind::Deposit, 100, now)
            .await
            .unwrap();
        assert_eq!(again, Admission::Replay(view(&w, 100, 1)));
    }

    #[tokio::test]
    async fn test_key_reuse_with_different_amount() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let g = guard(store);
        let w = wallet();
        let now = Utc::now();

        g.record_and_check(&w, "k1", OperationKind::Deposit, 100, now)
            .await
            .unwrap();
        let err = g
            .record_and_check(&w, "k1", OperationKind::Deposit, 101, now)
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::IdempotencyKeyMismatch);

        let err = g
            .record_and_check(&w, "k1", OperationKind::Withdraw, 100, now)
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::IdempotencyKeyMismatch);
    }

    #[tokio::test]
    async fn test_live_claim_is_busy() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let g = guard(store);
        let w = wallet();
        let now = Utc::now();

        g.record_and_check(&w, "k1", OperationKind::Lock, 5, now)
            .await
            .unwrap();
        let err = g
            .record_and_check(&w, "k1", OperationKind::Lock, 5, now + Duration::seconds(1))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::Busy);
    }

    #[tokio::test]
    async fn test_unfinished_claim_with_committed_wallet_is_completed() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let g = guard(store.clone());
        let mut w = wallet();
        let now = Utc::now();

        g.record_and_check(&w, "k1", OperationKind::Deposit, 100, now)
            .await
            .unwrap();

        // Wallet committed, process died before finalizing the claim
        w.funds.credit(100).unwrap();
        w.version = 1;
        w.remember_key(
            AppliedKey {
                idempotency_key: "k1".into(),
                version: 1,
                balance: 100,
                locked_balance: 0,
            },
            4,
        );

        let admission = g
            .record_and_check(&w, "k1", OperationKind::Deposit, 100, now)
            .await
            .unwrap();
        assert_eq!(admission, Admission::Replay(view(&w, 100, 1)));

        let stored = store.get(w.id, "k1").await.unwrap().unwrap();
        assert!(matches!(stored.status, IdempotencyStatus::Completed { .. }));
    }

    #[tokio::test]
    async fn test_stale_unapplied_claim_is_taken_over() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let g = guard(store.clone());
        let w = wallet();
        let then = Utc::now();

        let first = match g
            .record_and_check(&w, "k1", OperationKind::Deposit, 100, then)
            .await
            .unwrap()
        {
            Admission::Fresh(t) => t,
            other => panic!("expected claim, got {:?}", other),
        };

        let later = then + Duration::seconds(31);
        let second = match g
            .record_and_check(&w, "k1", OperationKind::Deposit, 100, later)
            .await
            .unwrap()
        {
            Admission::Fresh(t) => t,
            other => panic!("expected takeover, got {:?}", other),
        };
        assert_ne!(first.claim_id, second.claim_id);

        // The original owner can no longer release or finalize the new claim
        g.release(&first).await.unwrap();
        assert!(store.get(w.id, "k1").await.unwrap().is_some());
        assert!(!g.complete(&first, &view(&w, 100, 1), later).await.unwrap());
        let stored = store.get(w.id, "k1").await.unwrap().unwrap();
        assert!(matches!(stored.status, IdempotencyStatus::Claimed { claim_id, .. } if claim_id == second.claim_id));

        assert!(g.complete(&second, &view(&w, 100, 1), later).await.unwrap());
        let again = g
            .record_and_check(&w, "k1", OperationKind::Deposit, 100, later)
            .await
            .unwrap();
        assert_eq!(again, Admission::Replay(view(&w, 100, 1)));
    }

    #[tokio::test]
    async fn test_stale_claim_outside_window_is_in_doubt() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let g = guard(store);
        let mut w = wallet();
        let then = Utc::now();

        g.record_and_check(&w, "k1", OperationKind::Deposit, 100, then)
            .await
            .unwrap();

        w.version = 4; // window is 4 commits
        let err = g
            .record_and_check(&w, "k1", OperationKind::Deposit, 100, then + Duration::minutes(5))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::IdempotencyInDoubt);
    }

    #[tokio::test]
    async fn test_release_allows_fresh_claim() {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let g = guard(store);
        let w = wallet();
        let now = Utc::now();

        let ticket = match g
            .record_and_check(&w, "k1", OperationKind::Withdraw, 100, now)
            .await
            .unwrap()
        {
            Admission::Fresh(t) => t,
            other => panic!("expected claim, got {:?}", other),
        };
        g.release(&ticket).await.unwrap();

        let again = g
            .record_and_check(&w, "k1", OperationKind::Withdraw, 100, now)
            .await
            .unwrap();
        assert!(matches!(again, Admission::Fresh(_)));
    }
}
