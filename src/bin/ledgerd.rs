//! ledgerd - JSON-lines ledger driver
//!
//! Reads one request per line on stdin and writes one response per line on
//! stdout. Logs go to the configured file (and stderr in text mode).
//!
//! ```text
//! ledgerd --env dev < requests.jsonl
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use wallet_ledger::api::{LedgerRequest, LedgerResponse, dispatch};
use wallet_ledger::clock::SystemClock;
use wallet_ledger::config::AppConfig;
use wallet_ledger::engine::LedgerEngine;
use wallet_ledger::idempotency::IdempotencyStore;
use wallet_ledger::logging::init_logging;
use wallet_ledger::store::{
    MemoryIdempotencyStore, MemoryWalletStore, PgIdempotencyStore, PgWalletStore, WalletStore,
    postgres,
};
use wallet_ledger::transaction_log::{FileTransactionLog, MemoryTransactionLog, TransactionLog};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn build_engine(config: &AppConfig) -> anyhow::Result<LedgerEngine> {
    let (store, idempotency): (Arc<dyn WalletStore>, Arc<dyn IdempotencyStore>) =
        match &config.postgres_url {
            Some(url) => {
                let pool = postgres::connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                postgres::migrate(&pool)
                    .await
                    .context("Failed to initialize ledger schema")?;
                (
                    Arc::new(PgWalletStore::new(pool.clone())),
                    Arc::new(PgIdempotencyStore::new(pool)),
                )
            }
            None => {
                warn!("No postgres_url configured, wallets are kept in memory only");
                (
                    Arc::new(MemoryWalletStore::new()),
                    Arc::new(MemoryIdempotencyStore::new()),
                )
            }
        };

    let log: Arc<dyn TransactionLog> = match &config.transaction_log_path {
        Some(path) => Arc::new(
            FileTransactionLog::open(path)
                .await
                .with_context(|| format!("Failed to open transaction log {}", path))?,
        ),
        None => Arc::new(MemoryTransactionLog::new()),
    };

    Ok(LedgerEngine::new(
        config.ledger.clone(),
        store,
        idempotency,
        log,
        Arc::new(SystemClock),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&config);

    info!("Starting ledgerd in {} mode", env);
    let engine = build_engine(&config).await?;
    info!(store = engine.store_name(), "Ledger engine ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut served = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<LedgerRequest>(&line) {
            Ok(request) => dispatch(&engine, request).await,
            Err(e) => LedgerResponse::bad_request(e.to_string()),
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
        served += 1;
    }

    info!(requests = served, "stdin closed, shutting down");
    Ok(())
}
