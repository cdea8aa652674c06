//! Ledger Engine - wallet state machine
//!
//! Applies Deposit / Withdraw / Lock / Unlock / CaptureLocked to one wallet
//! with optimistic concurrency. There is no lock: every operation reads the
//! wallet, computes the next state and commits it with a version
//! compare-and-swap, retrying on conflict.
//!
//! # Commit protocol
//!
//! ```text
//! load -> amount -> idempotency guard -> [ reset day -> active -> funds
//!      -> daily limits -> next state -> invariants -> CAS ]  (retry on conflict)
//!                                                   |
//!                        success: complete claim, log COMMITTED
//!                        rejected: release claim, count failure, log REJECTED
//! ```
//!
//! # Failed attempts
//!
//! A rejected operation never writes the wallet. Rejections are counted in
//! process and folded into `stats.failedTransactions` by the next successful
//! commit on that wallet; read views include the pending count.
//!
//! # Cancellation
//!
//! Mutations run on a spawned task. Dropping the caller's future detaches
//! from the result but never aborts a commit half way.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::core_types::{MinorUnits, UserId, WalletId};
use crate::error::{LedgerError, StoreError};
use crate::idempotency::{Admission, ClaimTicket, IdempotencyGuard, IdempotencyStore};
use crate::limits::{DailyLimitPolicy, DailyLimitStatus, LimitDecision};
use crate::money::check_positive;
use crate::store::{MemoryIdempotencyStore, MemoryWalletStore, WalletStore};
use crate::transaction_log::{EntryOutcome, MemoryTransactionLog, TransactionEntry, TransactionLog};
use crate::wallet::{AppliedKey, BalanceError, BalanceView, OperationKind, Wallet};

/// Backoff exponent cap: base * 2^6
const MAX_BACKOFF_SHIFT: u32 = 6;

/// One balance-moving request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerCommand {
    pub kind: OperationKind,
    pub wallet_id: WalletId,
    /// Raw amount in minor units; non-positive values are rejected
    pub amount: i64,
    pub idempotency_key: Option<String>,
}

/// Why a commit loop ended without a commit
enum CommitFailure {
    /// Nothing was written; carries the last wallet state read
    Rejected(LedgerError, Box<Wallet>),
    /// The wallet already carries the key, committed by another attempt
    AlreadyApplied(BalanceView),
    /// The store failed mid-write; the commit may or may not have landed
    Unknown(LedgerError),
}

#[derive(Clone)]
pub struct LedgerEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn WalletStore>,
    guard: IdempotencyGuard,
    log: Arc<dyn TransactionLog>,
    clock: Arc<dyn Clock>,
    policy: DailyLimitPolicy,
    config: LedgerConfig,
    pending_failures: DashMap<WalletId, u64>,
}

impl LedgerEngine {
    pub fn new(
        config: LedgerConfig,
        store: Arc<dyn WalletStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        log: Arc<dyn TransactionLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let guard = IdempotencyGuard::new(
            idempotency,
            config.claim_ttl(),
            config.idempotency_window,
        );
        Self {
            inner: Arc::new(EngineInner {
                store,
                guard,
                log,
                clock,
                policy: DailyLimitPolicy::from_config(&config),
                config,
                pending_failures: DashMap::new(),
            }),
        }
    }

    /// Engine over in-memory stores and an in-memory transaction log
    pub fn in_memory(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config,
            Arc::new(MemoryWalletStore::new()),
            Arc::new(MemoryIdempotencyStore::new()),
            Arc::new(MemoryTransactionLog::new()),
            clock,
        )
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    pub fn store_name(&self) -> &'static str {
        self.inner.store.name()
    }

    /// Audit trail, for reconciliation
    pub fn transaction_log(&self) -> Arc<dyn TransactionLog> {
        self.inner.log.clone()
    }

    // ========================================================================
    // Wallet lifecycle
    // ========================================================================

    /// Onboard a user
    ///
    /// # Errors
    /// `WalletExists` if the user already owns a wallet.
    pub async fn create_wallet(&self, user_id: UserId) -> Result<Wallet, LedgerError> {
        let inner = self.inner.clone();
        spawn_op(async move {
            let now = inner.clock.now();
            let wallet = Wallet::new(
                user_id,
                inner.config.default_max_deposit,
                inner.config.default_max_withdrawal,
                now,
            );
            inner.store.create(&wallet).await?;
            info!(
                wallet_id = %wallet.id,
                user_id = user_id,
                store = inner.store.name(),
                "Wallet created"
            );
            Ok(wallet)
        })
        .await
    }

    /// Identity resolution: wallet owned by `user_id`
    pub async fn wallet_for_user(&self, user_id: UserId) -> Result<Wallet, LedgerError> {
        let wallet = self
            .inner
            .store
            .find_by_user(user_id)
            .await?
            .ok_or(LedgerError::WalletNotFound)?;
        Ok(self.inner.with_pending(wallet))
    }

    // ========================================================================
    // Read views
    // ========================================================================

    /// Full persisted document, with not-yet-folded failures counted
    pub async fn get_wallet(&self, wallet_id: WalletId) -> Result<Wallet, LedgerError> {
        let wallet = self.inner.load(wallet_id).await?;
        Ok(self.inner.with_pending(wallet))
    }

    pub async fn get_balance(&self, wallet_id: WalletId) -> Result<BalanceView, LedgerError> {
        Ok(self.inner.load(wallet_id).await?.balance_view())
    }

    /// Today's limit usage; a day rollover is applied to the read copy only
    pub async fn get_daily_limit_status(
        &self,
        wallet_id: WalletId,
    ) -> Result<DailyLimitStatus, LedgerError> {
        let wallet = self.inner.load(wallet_id).await?;
        Ok(self.inner.policy.status(&wallet, self.inner.clock.now()))
    }

    // ========================================================================
    // Balance operations
    // ========================================================================

    pub async fn deposit(
        &self,
        wallet_id: WalletId,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> Result<BalanceView, LedgerError> {
        self.submit(command(OperationKind::Deposit, wallet_id, amount, idempotency_key))
            .await
    }

    pub async fn withdraw(
        &self,
        wallet_id: WalletId,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> Result<BalanceView, LedgerError> {
        self.submit(command(OperationKind::Withdraw, wallet_id, amount, idempotency_key))
            .await
    }

    /// Reserve available funds
    pub async fn lock(
        &self,
        wallet_id: WalletId,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> Result<BalanceView, LedgerError> {
        self.submit(command(OperationKind::Lock, wallet_id, amount, idempotency_key))
            .await
    }

    /// Release a reservation back to available funds
    pub async fn unlock(
        &self,
        wallet_id: WalletId,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> Result<BalanceView, LedgerError> {
        self.submit(command(OperationKind::Unlock, wallet_id, amount, idempotency_key))
            .await
    }

    /// Finalize a reservation: balance and locked both drop by `amount`
    pub async fn capture_locked(
        &self,
        wallet_id: WalletId,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> Result<BalanceView, LedgerError> {
        self.submit(command(
            OperationKind::CaptureLocked,
            wallet_id,
            amount,
            idempotency_key,
        ))
        .await
    }

    /// Run one command on its own task
    pub async fn submit(&self, cmd: LedgerCommand) -> Result<BalanceView, LedgerError> {
        let inner = self.inner.clone();
        spawn_op(async move { inner.execute(cmd).await }).await
    }

    // ========================================================================
    // Administrative mutations (no quota, no stats)
    // ========================================================================

    /// Deactivate or reactivate; an inactive wallet rejects balance operations
    pub async fn set_active(&self, wallet_id: WalletId, active: bool) -> Result<Wallet, LedgerError> {
        let inner = self.inner.clone();
        spawn_op(async move {
            let current = inner.load(wallet_id).await?;
            if current.is_active == active {
                return Ok(current);
            }
            let wallet = inner
                .admin_commit(current, "set_active", |w, _| {
                    w.is_active = active;
                })
                .await?;
            info!(wallet_id = %wallet_id, active = active, version = wallet.version, "Wallet activation changed");
            Ok(wallet)
        })
        .await
    }

    pub async fn verify(&self, wallet_id: WalletId, verified_by: &str) -> Result<Wallet, LedgerError> {
        let inner = self.inner.clone();
        let verified_by = verified_by.to_string();
        spawn_op(async move {
            let current = inner.load(wallet_id).await?;
            let wallet = inner
                .admin_commit(current, "verify", |w, now| {
                    w.verification.verified = true;
                    w.verification.verified_at = Some(now);
                    w.verification.verified_by = Some(verified_by.clone());
                })
                .await?;
            info!(wallet_id = %wallet_id, verified_by = %verified_by, "Wallet verified");
            Ok(wallet)
        })
        .await
    }

    /// Change the per-day amount caps; today's usage is kept
    pub async fn set_daily_limits(
        &self,
        wallet_id: WalletId,
        max_deposit: MinorUnits,
        max_withdrawal: MinorUnits,
    ) -> Result<Wallet, LedgerError> {
        let inner = self.inner.clone();
        spawn_op(async move {
            let current = inner.load(wallet_id).await?;
            let wallet = inner
                .admin_commit(current, "set_daily_limits", |w, _| {
                    w.daily_limits.max_deposit = max_deposit;
                    w.daily_limits.max_withdrawal = max_withdrawal;
                })
                .await?;
            info!(
                wallet_id = %wallet_id,
                max_deposit = max_deposit,
                max_withdrawal = max_withdrawal,
                "Daily limits updated"
            );
            Ok(wallet)
        })
        .await
    }
}

fn command(
    kind: OperationKind,
    wallet_id: WalletId,
    amount: i64,
    idempotency_key: Option<&str>,
) -> LedgerCommand {
    LedgerCommand {
        kind,
        wallet_id,
        amount,
        idempotency_key: idempotency_key.map(str::to_string),
    }
}

/// Detach `fut` from the caller's cancellation
async fn spawn_op<T, F>(fut: F) -> Result<T, LedgerError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, LedgerError>> + Send + 'static,
{
    tokio::spawn(fut).await.map_err(|e| {
        error!(error = %e, "Ledger task failed");
        LedgerError::Internal(e.to_string())
    })?
}

/// Apply the funds movement of `kind`
fn apply_funds(wallet: &mut Wallet, kind: OperationKind, amount: MinorUnits) -> Result<(), LedgerError> {
    let funds = &mut wallet.funds;
    let result = match kind {
        OperationKind::Deposit => funds.credit(amount),
        OperationKind::Withdraw => funds.debit(amount),
        OperationKind::Lock => funds.lock(amount),
        OperationKind::Unlock => funds.unlock(amount),
        OperationKind::CaptureLocked => funds.capture(amount),
    };
    result.map_err(|e| match e {
        BalanceError::InsufficientAvailable => LedgerError::InsufficientAvailableBalance,
        BalanceError::InsufficientLocked => {
            LedgerError::InvalidState(format!("{} amount exceeds locked balance", kind))
        }
        BalanceError::InsufficientBalance => {
            LedgerError::InvalidState(format!("{} amount exceeds balance", kind))
        }
        BalanceError::Overflow => LedgerError::InvalidState("balance overflow".to_string()),
    })?;

    match kind {
        OperationKind::Deposit => {
            wallet.total_deposits = wallet
                .total_deposits
                .checked_add(amount)
                .ok_or_else(|| LedgerError::InvalidState("total deposits overflow".to_string()))?;
        }
        OperationKind::Withdraw | OperationKind::CaptureLocked => {
            wallet.total_withdrawals = wallet
                .total_withdrawals
                .checked_add(amount)
                .ok_or_else(|| LedgerError::InvalidState("total withdrawals overflow".to_string()))?;
        }
        OperationKind::Lock | OperationKind::Unlock => {}
    }
    Ok(())
}

impl EngineInner {
    async fn load(&self, wallet_id: WalletId) -> Result<Wallet, LedgerError> {
        self.store
            .get(wallet_id)
            .await?
            .ok_or(LedgerError::WalletNotFound)
    }

    fn pending_failures(&self, wallet_id: WalletId) -> u64 {
        self.pending_failures.get(&wallet_id).map(|n| *n).unwrap_or(0)
    }

    fn with_pending(&self, mut wallet: Wallet) -> Wallet {
        let pending = self.pending_failures(wallet.id);
        wallet.stats.failed_transactions += pending;
        wallet.stats.total_transactions += pending;
        wallet
    }

    fn take_pending(&self, wallet_id: WalletId) -> u64 {
        self.pending_failures
            .remove(&wallet_id)
            .map(|(_, n)| n)
            .unwrap_or(0)
    }

    fn add_pending(&self, wallet_id: WalletId, n: u64) {
        if n > 0 {
            *self.pending_failures.entry(wallet_id).or_insert(0) += n;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay().as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT));
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }

    async fn execute(&self, cmd: LedgerCommand) -> Result<BalanceView, LedgerError> {
        let wallet = self.load(cmd.wallet_id).await?;

        let amount = match check_positive(cmd.amount) {
            Ok(amount) => amount,
            Err(_) => {
                return self
                    .reject(&cmd, &wallet, LedgerError::InvalidAmount, None)
                    .await;
            }
        };

        let ticket = match cmd.idempotency_key.as_deref() {
            Some(key) => {
                let admission = self
                    .guard
                    .record_and_check(&wallet, key, cmd.kind, amount, self.clock.now())
                    .await;
                match admission {
                    Ok(Admission::Replay(view)) => return Ok(view),
                    Ok(Admission::Fresh(ticket)) => Some(ticket),
                    Err(LedgerError::IdempotencyKeyMismatch) => {
                        return self
                            .reject(&cmd, &wallet, LedgerError::IdempotencyKeyMismatch, None)
                            .await;
                    }
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };

        let key = cmd.idempotency_key.as_deref();
        let result = self
            .commit(wallet, key, true, |current, now| {
                self.next_state(current, cmd.kind, amount, key, now)
            })
            .await;

        match result {
            Ok(committed) => Ok(self.on_committed(&cmd, &committed, ticket.as_ref()).await),
            Err(CommitFailure::Rejected(e, last)) => {
                self.reject(&cmd, &last, e, ticket.as_ref()).await
            }
            Err(CommitFailure::AlreadyApplied(view)) => {
                // Our claim was taken over and the new owner committed first
                info!(
                    wallet_id = %cmd.wallet_id,
                    kind = %cmd.kind,
                    key = ?key,
                    version = view.version,
                    "Key committed by another attempt, returning its outcome"
                );
                Ok(view)
            }
            Err(CommitFailure::Unknown(e)) => {
                // Claim is kept: the next attempt with this key resolves it
                // against the wallet's recent keys
                error!(
                    wallet_id = %cmd.wallet_id,
                    kind = %cmd.kind,
                    amount = cmd.amount,
                    error = %e,
                    "Ledger commit outcome unknown"
                );
                Err(e)
            }
        }
    }

    /// Steps 3-6 on a copy of `current`
    fn next_state(
        &self,
        current: &Wallet,
        kind: OperationKind,
        amount: MinorUnits,
        key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Wallet, LedgerError> {
        let mut next = current.clone();
        if self.policy.reset_if_needed(&mut next, now) {
            debug!(wallet_id = %next.id, day = %self.policy.day_of(now), "Daily limits reset");
        }

        if !next.is_active {
            return Err(LedgerError::AccountInactive);
        }

        apply_funds(&mut next, kind, amount)?;

        if let LimitDecision::Deny(reason) = self.policy.evaluate(&next, kind, amount) {
            return Err(LedgerError::LimitExceeded(reason));
        }
        self.policy.record(&mut next, kind, amount);

        next.stats.total_transactions += 1;
        next.stats.successful_transactions += 1;
        next.stats.last_activity_date = Some(now);
        next.version = current.version + 1;
        next.updated_at = now;

        if let Some(key) = key {
            let applied = AppliedKey {
                idempotency_key: key.to_string(),
                version: next.version,
                balance: next.balance(),
                locked_balance: next.locked_balance(),
            };
            next.remember_key(applied, self.guard.window());
        }

        self.check_invariants(&next, current)?;
        Ok(next)
    }

    fn check_invariants(&self, next: &Wallet, current: &Wallet) -> Result<(), LedgerError> {
        next.check_invariants(current).map_err(|reason| {
            error!(
                wallet_id = %next.id,
                version = next.version,
                reason = %reason,
                "Invariant violation, commit refused"
            );
            LedgerError::InvariantViolation(reason)
        })
    }

    /// Administrative mutation through the same CAS path
    async fn admin_commit<F>(&self, current: Wallet, op: &'static str, mut mutate: F) -> Result<Wallet, LedgerError>
    where
        F: FnMut(&mut Wallet, DateTime<Utc>),
    {
        let result = self
            .commit(current, None, false, |current, now| {
                let mut next = current.clone();
                mutate(&mut next, now);
                next.version = current.version + 1;
                next.updated_at = now;
                self.check_invariants(&next, current)?;
                Ok(next)
            })
            .await;

        match result {
            Ok(wallet) => Ok(self.with_pending(wallet)),
            Err(CommitFailure::Rejected(e, _)) | Err(CommitFailure::Unknown(e)) => {
                warn!(op = op, error = %e, "Administrative update failed");
                Err(e)
            }
            Err(CommitFailure::AlreadyApplied(_)) => Err(LedgerError::Internal(
                "administrative update carries no idempotency key".to_string(),
            )),
        }
    }

    /// Optimistic commit loop
    ///
    /// `build` computes the next state from a fresh read; a `VersionConflict`
    /// reloads and rebuilds, up to `max_commit_attempts` times. A read that
    /// already carries `key` ends the loop without applying it again. With
    /// `fold_failures` the pending failure count rides along in the commit.
    async fn commit<F>(
        &self,
        mut current: Wallet,
        key: Option<&str>,
        fold_failures: bool,
        mut build: F,
    ) -> Result<Wallet, CommitFailure>
    where
        F: FnMut(&Wallet, DateTime<Utc>) -> Result<Wallet, LedgerError>,
    {
        let max_attempts = self.config.max_commit_attempts.max(1);
        let mut attempt = 1;

        loop {
            if let Some(applied) = key.and_then(|k| current.applied_key(k)) {
                return Err(CommitFailure::AlreadyApplied(applied.view(current.id)));
            }

            let mut next = match build(&current, self.clock.now()) {
                Ok(next) => next,
                Err(e) => return Err(CommitFailure::Rejected(e, Box::new(current))),
            };

            let folded = if fold_failures {
                self.take_pending(current.id)
            } else {
                0
            };
            next.stats.failed_transactions += folded;
            next.stats.total_transactions += folded;

            match self.store.compare_and_swap(&next, current.version).await {
                Ok(()) => return Ok(next),
                Err(StoreError::VersionConflict { expected, actual }) => {
                    self.add_pending(current.id, folded);
                    if attempt >= max_attempts {
                        warn!(
                            wallet_id = %current.id,
                            attempts = attempt,
                            "Commit retries exhausted"
                        );
                        return Err(CommitFailure::Rejected(LedgerError::Busy, Box::new(current)));
                    }
                    debug!(
                        wallet_id = %current.id,
                        expected = expected,
                        actual = actual,
                        attempt = attempt,
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;

                    current = match self.store.get(current.id).await {
                        Ok(Some(wallet)) => wallet,
                        Ok(None) => {
                            return Err(CommitFailure::Rejected(
                                LedgerError::WalletNotFound,
                                Box::new(current),
                            ));
                        }
                        Err(e) => return Err(CommitFailure::Rejected(e.into(), Box::new(current))),
                    };
                }
                Err(StoreError::NotFound(_)) => {
                    self.add_pending(current.id, folded);
                    return Err(CommitFailure::Rejected(
                        LedgerError::WalletNotFound,
                        Box::new(current),
                    ));
                }
                Err(e) => {
                    // Folded count is not restored: the write may have landed
                    error!(
                        wallet_id = %current.id,
                        store = self.store.name(),
                        error = %e,
                        "Wallet commit failed"
                    );
                    return Err(CommitFailure::Unknown(e.into()));
                }
            }
        }
    }

    async fn on_committed(
        &self,
        cmd: &LedgerCommand,
        wallet: &Wallet,
        ticket: Option<&ClaimTicket>,
    ) -> BalanceView {
        let view = wallet.balance_view();
        let now = self.clock.now();

        if let Some(ticket) = ticket {
            match self.guard.complete(ticket, &view, now).await {
                Ok(true) => {}
                Ok(false) => debug!(
                    wallet_id = %wallet.id,
                    key = %ticket.idempotency_key,
                    "Idempotency claim no longer ours, left to its owner"
                ),
                // The wallet carries the key; the next read of the claim finalizes it
                Err(e) => warn!(
                    wallet_id = %wallet.id,
                    key = %ticket.idempotency_key,
                    error = %e,
                    "Failed to finalize idempotency claim"
                ),
            }
        }

        info!(
            wallet_id = %wallet.id,
            kind = %cmd.kind,
            amount = cmd.amount,
            version = wallet.version,
            balance = wallet.balance(),
            locked = wallet.locked_balance(),
            "Ledger operation committed"
        );

        self.append_log(cmd, wallet, EntryOutcome::Committed {
            version: wallet.version,
        }, now)
        .await;
        view
    }

    /// Definite no-commit: free the key, count the failure, audit it
    async fn reject(
        &self,
        cmd: &LedgerCommand,
        wallet: &Wallet,
        err: LedgerError,
        ticket: Option<&ClaimTicket>,
    ) -> Result<BalanceView, LedgerError> {
        if let Some(ticket) = ticket
            && let Err(e) = self.guard.release(ticket).await
        {
            warn!(
                wallet_id = %wallet.id,
                key = %ticket.idempotency_key,
                error = %e,
                "Failed to release idempotency claim"
            );
        }

        self.add_pending(wallet.id, 1);
        info!(
            wallet_id = %wallet.id,
            kind = %cmd.kind,
            amount = cmd.amount,
            code = err.code(),
            "Ledger operation rejected"
        );

        self.append_log(
            cmd,
            wallet,
            EntryOutcome::Rejected {
                code: err.code().to_string(),
            },
            self.clock.now(),
        )
        .await;
        Err(err)
    }

    async fn append_log(
        &self,
        cmd: &LedgerCommand,
        wallet: &Wallet,
        outcome: EntryOutcome,
        timestamp: DateTime<Utc>,
    ) {
        let entry = TransactionEntry {
            entry_id: Ulid::new(),
            wallet_id: wallet.id,
            kind: cmd.kind,
            amount: cmd.amount,
            resulting_balance: wallet.balance(),
            resulting_locked: wallet.locked_balance(),
            idempotency_key: cmd.idempotency_key.clone(),
            timestamp,
            outcome,
        };
        if let Err(e) = self.log.append(&entry).await {
            error!(
                wallet_id = %wallet.id,
                entry_id = %entry.entry_id,
                error = %e,
                "Failed to append transaction log entry"
            );
        }
    }
}
