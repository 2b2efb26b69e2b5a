use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use partlock::{Coordinator, CoordinatorConfig, LockTable, MutexArbiter, Priority};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(5);
// long enough for spawned requesters to queue up
const STEP: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "partlock", about = "Replays lock table and arbiter scenarios")]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Identifiers to resolve to their resource keys
    ids: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("partlock=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoordinatorConfig::default(),
    };
    let coord = Coordinator::new(&config).context("building coordinator")?;

    for id in &cli.ids {
        println!("{id} -> {}", coord.key_for(id));
    }

    read_after_write(coord.locks()).await?;
    read_behind_pending_writer(coord.locks()).await?;
    arbiter_order(coord.arbiter()).await?;
    Ok(())
}

async fn read_after_write(locks: &LockTable) -> Result<()> {
    let key = "k";
    let a = locks.acquire_write("A", key, TIMEOUT).await?;
    tokio::time::sleep(STEP).await;
    let b = tokio::spawn({
        let locks = locks.clone();
        async move { locks.acquire_read("B", key, TIMEOUT).await }
    });
    tokio::time::sleep(STEP).await;
    info!(status = ?locks.status(key), "A writing, B queued");

    locks.release(&a.holder, key);
    let b = b.await??;
    info!(holder = %b.holder, mode = %b.mode, waited = ?b.waited, "granted after release");
    locks.release(&b.holder, key);
    Ok(())
}

async fn read_behind_pending_writer(locks: &LockTable) -> Result<()> {
    let key = "k";
    let a = locks.acquire_read("A", key, TIMEOUT).await?;
    let b = tokio::spawn({
        let locks = locks.clone();
        async move { locks.acquire_write("B", key, TIMEOUT).await }
    });
    tokio::time::sleep(STEP).await;
    let c = tokio::spawn({
        let locks = locks.clone();
        async move { locks.acquire_read("C", key, TIMEOUT).await }
    });
    tokio::time::sleep(STEP).await;
    info!(status = ?locks.status(key), "A reading, B writer pending, C queued behind it");

    locks.release(&a.holder, key);
    let b = b.await??;
    info!(holder = %b.holder, status = ?locks.status(key), "writer granted first");
    locks.release(&b.holder, key);
    let c = c.await??;
    info!(holder = %c.holder, status = ?locks.status(key), "reader granted after writer");
    locks.release(&c.holder, key);
    Ok(())
}

async fn arbiter_order(arbiter: &MutexArbiter) -> Result<()> {
    let key = "k";
    let first = arbiter.acquire("A", key, Priority::Normal).await;
    // C asks last but outranks B
    let waiters = [("B", Priority::Normal), ("C", Priority::High)].map(|(holder, priority)| {
        let arbiter = arbiter.clone();
        tokio::spawn(async move {
            let handle = arbiter.acquire(holder, key, priority).await;
            info!(
                holder,
                timestamp = %handle.timestamp(),
                ?priority,
                "entered critical section"
            );
            handle.release();
        })
    });
    tokio::time::sleep(STEP).await;
    info!(status = ?arbiter.queue_status(key), "A in critical section");

    arbiter.release(&first);
    for waiter in waiters {
        waiter.await?;
    }
    Ok(())
}
