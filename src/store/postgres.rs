//! PostgreSQL stores
//!
//! `wallets_tb` holds one row per wallet; every update is an atomic CAS on
//! the `version` column. `idempotency_tb` holds claims and outcomes keyed by
//! `(wallet_id, idempotency_key)`.
//!
//! Amount columns are NUMERIC and decoded through `rust_decimal`, so an
//! out-of-range value surfaces as `StoreError::Corrupt` instead of wrapping.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use ulid::Ulid;

use super::WalletStore;
use crate::core_types::{MinorUnits, UserId, Version, WalletId};
use crate::error::StoreError;
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
use crate::wallet::{
    AppliedKey, BalanceView, DailyLimits, OperationKind, Verification, Wallet, WalletBalance,
    WalletStats,
};

const STATUS_CLAIMED: i16 = 0;
const STATUS_COMPLETED: i16 = 1;

const WALLET_COLUMNS: &str = r#"
    wallet_id, user_id, balance, locked_balance, total_deposits, total_withdrawals,
    max_deposit, max_withdrawal, deposit_count, withdrawal_count,
    deposit_amount_today, withdrawal_amount_today, last_reset_date,
    verified, verified_at, verified_by,
    total_transactions, successful_transactions, failed_transactions, last_activity_date,
    recent_keys, version, is_active, created_at, updated_at
"#;

/// Connect a pool with the same sizing the services use elsewhere
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(50)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Create tables if missing
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wallets_tb (
            wallet_id               UUID PRIMARY KEY,
            user_id                 BIGINT NOT NULL UNIQUE,
            balance                 NUMERIC(30, 0) NOT NULL CHECK (balance >= 0),
            locked_balance          NUMERIC(30, 0) NOT NULL CHECK (locked_balance >= 0),
            total_deposits          NUMERIC(30, 0) NOT NULL,
            total_withdrawals       NUMERIC(30, 0) NOT NULL,
            max_deposit             NUMERIC(30, 0) NOT NULL,
            max_withdrawal          NUMERIC(30, 0) NOT NULL,
            deposit_count           INTEGER NOT NULL,
            withdrawal_count        INTEGER NOT NULL,
            deposit_amount_today    NUMERIC(30, 0) NOT NULL,
            withdrawal_amount_today NUMERIC(30, 0) NOT NULL,
            last_reset_date         TIMESTAMPTZ NOT NULL,
            verified                BOOLEAN NOT NULL DEFAULT FALSE,
            verified_at             TIMESTAMPTZ,
            verified_by             TEXT,
            total_transactions      BIGINT NOT NULL DEFAULT 0,
            successful_transactions BIGINT NOT NULL DEFAULT 0,
            failed_transactions     BIGINT NOT NULL DEFAULT 0,
            last_activity_date      TIMESTAMPTZ,
            recent_keys             JSONB NOT NULL DEFAULT '[]'::jsonb,
            version                 BIGINT NOT NULL,
            is_active               BOOLEAN NOT NULL DEFAULT TRUE,
            created_at              TIMESTAMPTZ NOT NULL,
            updated_at              TIMESTAMPTZ NOT NULL,
            CHECK (locked_balance <= balance)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_tb (
            wallet_id         UUID NOT NULL,
            idempotency_key   TEXT NOT NULL,
            kind              TEXT NOT NULL,
            amount            NUMERIC(30, 0) NOT NULL,
            status            SMALLINT NOT NULL,
            claim_id          TEXT,
            observed_version  BIGINT,
            claimed_at        TIMESTAMPTZ,
            balance           NUMERIC(30, 0),
            locked_balance    NUMERIC(30, 0),
            result_version    BIGINT,
            completed_at      TIMESTAMPTZ,
            PRIMARY KEY (wallet_id, idempotency_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn to_units(value: Decimal, column: &str) -> Result<MinorUnits, StoreError> {
    value
        .to_u64()
        .ok_or_else(|| StoreError::Corrupt(format!("{} out of range: {}", column, value)))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} negative: {}", column, value)))
}

fn to_u64(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} negative: {}", column, value)))
}

fn to_i64(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{} exceeds BIGINT: {}", column, value)))
}

fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{} exceeds INTEGER: {}", column, value)))
}

fn row_to_wallet(row: &PgRow) -> Result<Wallet, StoreError> {
    let balance = to_units(row.try_get("balance")?, "balance")?;
    let locked = to_units(row.try_get("locked_balance")?, "locked_balance")?;
    let funds = WalletBalance::from_parts(balance, locked).ok_or_else(|| {
        StoreError::Corrupt(format!("locked {} exceeds balance {}", locked, balance))
    })?;

    let recent_keys: sqlx::types::Json<VecDeque<AppliedKey>> = row.try_get("recent_keys")?;

    Ok(Wallet {
        id: row.try_get("wallet_id")?,
        user_id: to_u64(row.try_get("user_id")?, "user_id")?,
        funds,
        total_deposits: to_units(row.try_get("total_deposits")?, "total_deposits")?,
        total_withdrawals: to_units(row.try_get("total_withdrawals")?, "total_withdrawals")?,
        daily_limits: DailyLimits {
            max_deposit: to_units(row.try_get("max_deposit")?, "max_deposit")?,
            max_withdrawal: to_units(row.try_get("max_withdrawal")?, "max_withdrawal")?,
            deposit_count: to_u32(row.try_get("deposit_count")?, "deposit_count")?,
            withdrawal_count: to_u32(row.try_get("withdrawal_count")?, "withdrawal_count")?,
            deposit_amount_today: to_units(
                row.try_get("deposit_amount_today")?,
                "deposit_amount_today",
            )?,
            withdrawal_amount_today: to_units(
                row.try_get("withdrawal_amount_today")?,
                "withdrawal_amount_today",
            )?,
            last_reset_date: row.try_get("last_reset_date")?,
        },
        verification: Verification {
            verified: row.try_get("verified")?,
            verified_at: row.try_get("verified_at")?,
            verified_by: row.try_get("verified_by")?,
        },
        stats: WalletStats {
            total_transactions: to_u64(row.try_get("total_transactions")?, "total_transactions")?,
            successful_transactions: to_u64(
                row.try_get("successful_transactions")?,
                "successful_transactions",
            )?,
            failed_transactions: to_u64(
                row.try_get("failed_transactions")?,
                "failed_transactions",
            )?,
            last_activity_date: row.try_get("last_activity_date")?,
        },
        recent_keys: recent_keys.0,
        version: to_u64(row.try_get("version")?, "version")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct PgWalletStore {
    pool: PgPool,
}

impl PgWalletStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_version(&self, wallet_id: WalletId) -> Result<Option<Version>, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM wallets_tb WHERE wallet_id = $1")
                .bind(wallet_id)
                .fetch_optional(&self.pool)
                .await?;
        version.map(|v| to_u64(v, "version")).transpose()
    }
}

#[async_trait]
impl WalletStore for PgWalletStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, wallet_id: WalletId) -> Result<Option<Wallet>, StoreError> {
        let sql = format!("SELECT {} FROM wallets_tb WHERE wallet_id = $1", WALLET_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Option<Wallet>, StoreError> {
        let sql = format!("SELECT {} FROM wallets_tb WHERE user_id = $1", WALLET_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(to_i64(user_id, "user_id")?)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn create(&self, wallet: &Wallet) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO wallets_tb ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
            ON CONFLICT DO NOTHING
            "#,
            WALLET_COLUMNS
        );
        let result = bind_wallet(sqlx::query(&sql), wallet)?
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists);
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        new_state: &Wallet,
        expected_version: Version,
    ) -> Result<(), StoreError> {
        // $1..$25 follow WALLET_COLUMNS order; $26 is the expected version
        let result = bind_wallet(
            sqlx::query(
                r#"
                UPDATE wallets_tb SET
                    user_id = $2, balance = $3, locked_balance = $4,
                    total_deposits = $5, total_withdrawals = $6,
                    max_deposit = $7, max_withdrawal = $8,
                    deposit_count = $9, withdrawal_count = $10,
                    deposit_amount_today = $11, withdrawal_amount_today = $12,
                    last_reset_date = $13,
                    verified = $14, verified_at = $15, verified_by = $16,
                    total_transactions = $17, successful_transactions = $18,
                    failed_transactions = $19, last_activity_date = $20,
                    recent_keys = $21, version = $22, is_active = $23,
                    created_at = $24, updated_at = $25
                WHERE wallet_id = $1 AND version = $26
                "#,
            ),
            new_state,
        )?
        .bind(to_i64(expected_version, "version")?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.current_version(new_state.id).await? {
            None => Err(StoreError::NotFound(new_state.id)),
            Some(actual) => Err(StoreError::VersionConflict {
                expected: expected_version,
                actual,
            }),
        }
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

/// Bind the 25 wallet columns in WALLET_COLUMNS order
fn bind_wallet<'q>(query: PgQuery<'q>, w: &Wallet) -> Result<PgQuery<'q>, StoreError> {
    let limits = &w.daily_limits;
    Ok(query
        .bind(w.id)
        .bind(to_i64(w.user_id, "user_id")?)
        .bind(Decimal::from(w.balance()))
        .bind(Decimal::from(w.locked_balance()))
        .bind(Decimal::from(w.total_deposits))
        .bind(Decimal::from(w.total_withdrawals))
        .bind(Decimal::from(limits.max_deposit))
        .bind(Decimal::from(limits.max_withdrawal))
        .bind(to_i32(limits.deposit_count, "deposit_count")?)
        .bind(to_i32(limits.withdrawal_count, "withdrawal_count")?)
        .bind(Decimal::from(limits.deposit_amount_today))
        .bind(Decimal::from(limits.withdrawal_amount_today))
        .bind(limits.last_reset_date)
        .bind(w.verification.verified)
        .bind(w.verification.verified_at)
        .bind(w.verification.verified_by.clone())
        .bind(to_i64(w.stats.total_transactions, "total_transactions")?)
        .bind(to_i64(w.stats.successful_transactions, "successful_transactions")?)
        .bind(to_i64(w.stats.failed_transactions, "failed_transactions")?)
        .bind(w.stats.last_activity_date)
        .bind(sqlx::types::Json(w.recent_keys.clone()))
        .bind(to_i64(w.version, "version")?)
        .bind(w.is_active)
        .bind(w.created_at)
        .bind(w.updated_at))
}

pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let wallet_id: WalletId = row.try_get("wallet_id")?;
    let kind_str: String = row.try_get("kind")?;
    let kind = OperationKind::from_str_opt(&kind_str)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown kind: {}", kind_str)))?;
    let status_id: i16 = row.try_get("status")?;

    let status = match status_id {
        STATUS_CLAIMED => {
            let claim_id: String = row.try_get("claim_id")?;
            let observed: i64 = row.try_get("observed_version")?;
            IdempotencyStatus::Claimed {
                claim_id: Ulid::from_string(&claim_id)
                    .map_err(|e| StoreError::Corrupt(format!("claim_id: {}", e)))?,
                observed_version: to_u64(observed, "observed_version")?,
                claimed_at: row.try_get("claimed_at")?,
            }
        }
        STATUS_COMPLETED => {
            let balance = to_units(row.try_get("balance")?, "balance")?;
            let locked = to_units(row.try_get("locked_balance")?, "locked_balance")?;
            let version: i64 = row.try_get("result_version")?;
            IdempotencyStatus::Completed {
                outcome: BalanceView {
                    wallet_id,
                    balance,
                    locked_balance: locked,
                    available_balance: balance.saturating_sub(locked),
                    version: to_u64(version, "result_version")?,
                },
                completed_at: row.try_get("completed_at")?,
            }
        }
        other => return Err(StoreError::Corrupt(format!("unknown status: {}", other))),
    };

    Ok(IdempotencyRecord {
        wallet_id,
        idempotency_key: row.try_get("idempotency_key")?,
        kind,
        amount: to_units(row.try_get("amount")?, "amount")?,
        status,
    })
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn get(
        &self,
        wallet_id: WalletId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT wallet_id, idempotency_key, kind, amount, status, claim_id,
                   observed_version, claimed_at, balance, locked_balance,
                   result_version, completed_at
            FROM idempotency_tb
            WHERE wallet_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(wallet_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn insert_claim(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        let IdempotencyStatus::Claimed {
            claim_id,
            observed_version,
            claimed_at,
        } = &record.status
        else {
            return Err(StoreError::Corrupt("insert_claim needs a CLAIMED record".into()));
        };

        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_tb
                (wallet_id, idempotency_key, kind, amount, status, claim_id, observed_version, claimed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (wallet_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.wallet_id)
        .bind(&record.idempotency_key)
        .bind(record.kind.as_str())
        .bind(Decimal::from(record.amount))
        .bind(STATUS_CLAIMED)
        .bind(claim_id.to_string())
        .bind(to_i64(*observed_version, "observed_version")?)
        .bind(*claimed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_claim(
        &self,
        wallet_id: WalletId,
        key: &str,
        previous: Ulid,
        next: &IdempotencyStatus,
    ) -> Result<bool, StoreError> {
        let IdempotencyStatus::Claimed {
            claim_id,
            observed_version,
            claimed_at,
        } = next
        else {
            return Err(StoreError::Corrupt("replace_claim needs a CLAIMED status".into()));
        };

        let result = sqlx::query(
            r#"
            UPDATE idempotency_tb
            SET claim_id = $1, observed_version = $2, claimed_at = $3
            WHERE wallet_id = $4 AND idempotency_key = $5 AND status = $6 AND claim_id = $7
            "#,
        )
        .bind(claim_id.to_string())
        .bind(to_i64(*observed_version, "observed_version")?)
        .bind(*claimed_at)
        .bind(wallet_id)
        .bind(key)
        .bind(STATUS_CLAIMED)
        .bind(previous.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        wallet_id: WalletId,
        key: &str,
        claim_id: Ulid,
        outcome: &BalanceView,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // status guard keeps COMPLETED rows immutable
        let result = sqlx::query(
            r#"
            UPDATE idempotency_tb
            SET status = $1, balance = $2, locked_balance = $3, result_version = $4,
                completed_at = $5
            WHERE wallet_id = $6 AND idempotency_key = $7 AND status = $8 AND claim_id = $9
            "#,
        )
        .bind(STATUS_COMPLETED)
        .bind(Decimal::from(outcome.balance))
        .bind(Decimal::from(outcome.locked_balance))
        .bind(to_i64(outcome.version, "result_version")?)
        .bind(completed_at)
        .bind(wallet_id)
        .bind(key)
        .bind(STATUS_CLAIMED)
        .bind(claim_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(
        &self,
        wallet_id: WalletId,
        key: &str,
        claim_id: Ulid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM idempotency_tb
            WHERE wallet_id = $1 AND idempotency_key = $2 AND status = $3 AND claim_id = $4
            "#,
        )
        .bind(wallet_id)
        .bind(key)
        .bind(STATUS_CLAIMED)
        .bind(claim_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
