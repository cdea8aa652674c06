//! Transaction Log - append-only audit trail
//!
//! Records every ledger operation outcome, committed or rejected, for audit
//! and reconciliation. Entries are never mutated or deleted, and the engine
//! never reads them on its hot path.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

use crate::core_types::{MinorUnits, Version, WalletId};
use crate::wallet::OperationKind;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryOutcome {
    Committed { version: Version },
    Rejected { code: String },
}

/// One audit record; balances are the wallet's state after the attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    pub entry_id: Ulid,
    pub wallet_id: WalletId,
    pub kind: OperationKind,
    pub amount: i64,
    pub resulting_balance: MinorUnits,
    pub resulting_locked: MinorUnits,
    pub idempotency_key: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub outcome: EntryOutcome,
}

impl TransactionEntry {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, EntryOutcome::Committed { .. })
    }
}

#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn append(&self, entry: &TransactionEntry) -> Result<(), LogError>;

    /// All entries of one wallet in append order (audit / reconciliation only)
    async fn entries_for(&self, wallet_id: WalletId) -> Result<Vec<TransactionEntry>, LogError>;
}

/// Replay committed entries into `(balance, locked)`
///
/// Reconciliation check: for a wallet whose every commit was logged, the
/// result equals the stored balances.
pub fn replay_balances(entries: &[TransactionEntry]) -> (MinorUnits, MinorUnits) {
    entries
        .iter()
        .filter(|e| e.is_committed())
        .fold((0, 0), |(balance, locked), e| {
            let amount = e.amount.unsigned_abs();
            match e.kind {
                OperationKind::Deposit => (balance.saturating_add(amount), locked),
                OperationKind::Withdraw => (balance.saturating_sub(amount), locked),
                OperationKind::Lock => (balance, locked.saturating_add(amount)),
                OperationKind::Unlock => (balance, locked.saturating_sub(amount)),
                OperationKind::CaptureLocked => {
                    (balance.saturating_sub(amount), locked.saturating_sub(amount))
                }
            }
        })
}

#[derive(Default)]
pub struct MemoryTransactionLog {
    entries: Mutex<Vec<TransactionEntry>>,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TransactionLog for MemoryTransactionLog {
    async fn append(&self, entry: &TransactionEntry) -> Result<(), LogError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        Ok(())
    }

    async fn entries_for(&self, wallet_id: WalletId) -> Result<Vec<TransactionEntry>, LogError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.wallet_id == wallet_id)
            .cloned()
            .collect())
    }
}

/// JSON-lines file, one entry per line, opened in append mode
pub struct FileTransactionLog {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileTransactionLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl TransactionLog for FileTransactionLog {
    async fn append(&self, entry: &TransactionEntry) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn entries_for(&self, wallet_id: WalletId) -> Result<Vec<TransactionEntry>, LogError> {
        // Hold the writer lock so a half-written line is never read
        let _writer = self.file.lock().await;
        let content = tokio::fs::read_to_string(&self.path).await?;

        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry: TransactionEntry = serde_json::from_str(line)?;
            if entry.wallet_id == wallet_id {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(wallet_id: WalletId, kind: OperationKind, amount: i64, committed: bool) -> TransactionEntry {
        TransactionEntry {
            entry_id: Ulid::new(),
            wallet_id,
            kind,
            amount,
            resulting_balance: 0,
            resulting_locked: 0,
            idempotency_key: None,
            timestamp: Utc::now(),
            outcome: if committed {
                EntryOutcome::Committed { version: 1 }
            } else {
                EntryOutcome::Rejected {
                    code: "INSUFFICIENT_AVAILABLE_BALANCE".into(),
                }
            },
        }
    }

    #[test]
    fn test_replay_balances_skips_rejections() {
        let w = WalletId::new_v4();
        let entries = vec![
            entry(w, OperationKind::Deposit, 1_000, true),
            entry(w, OperationKind::Lock, 400, true),
            entry(w, OperationKind::Withdraw, 5_000, false),
            entry(w, OperationKind::CaptureLocked, 300, true),
            entry(w, OperationKind::Unlock, 100, true),
            entry(w, OperationKind::Withdraw, 200, true),
        ];
        assert_eq!(replay_balances(&entries), (500, 0));
    }

    #[tokio::test]
    async fn test_memory_log_filters_by_wallet() {
        let log = MemoryTransactionLog::new();
        let a = WalletId::new_v4();
        let b = WalletId::new_v4();
        log.append(&entry(a, OperationKind::Deposit, 10, true))
            .await
            .unwrap();
        log.append(&entry(b, OperationKind::Deposit, 20, true))
            .await
            .unwrap();

        assert_eq!(log.len(), 2);
        let only_a = log.entries_for(a).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].amount, 10);
    }

    #[tokio::test]
    async fn test_file_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("transactions.jsonl");
        let w = WalletId::new_v4();

        {
            let log = FileTransactionLog::open(&path).await.unwrap();
            log.append(&entry(w, OperationKind::Deposit, 10, true))
                .await
                .unwrap();
            log.append(&entry(w, OperationKind::Withdraw, 99, false))
                .await
                .unwrap();
        }

        // Reopen: existing lines are kept
        let log = FileTransactionLog::open(&path).await.unwrap();
        log.append(&entry(w, OperationKind::Lock, 5, true))
            .await
            .unwrap();

        let entries = log.entries_for(w).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(!entries[1].is_committed());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.contains("\"status\":\"REJECTED\""));
    }
}
