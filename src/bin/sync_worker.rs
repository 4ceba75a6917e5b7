//! Standalone catalog-sync worker. Runs one sync job to completion (or
//! failure) and exits — suitable for a `CATALOG_SYNC_CONCURRENCY`-many
//! fleet of worker processes behind the same Redis queue.

use clap::Parser;
use tracing::{error, info};

use tradeup_backend::config::Config;
use tradeup_backend::init_tracing;
use tradeup_backend::queue::JobBroker;
use tradeup_backend::{build_state, sync::SyncWorker};

#[derive(Parser, Debug)]
#[command(name = "sync-worker")]
struct Args {
    /// Run a single job then exit, instead of polling for the next
    /// in-flight job forever.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = Config::from_env()?;
    let state = build_state(config)?;

    loop {
        let job = match state.broker.find_in_flight().await? {
            Some(job) => job,
            None => {
                if args.once {
                    info!("no in-flight job found, exiting");
                    return Ok(());
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        let worker = SyncWorker::new(
            state.market.clone(),
            state.store.clone(),
            state.float_catalog.clone(),
            state.broker.clone(),
            &state.config,
        );

        info!(job_id = %job.id, "picked up sync job");
        if let Err(e) = worker.run(&job.id).await {
            error!(job_id = %job.id, error = %e, "sync job failed");
        }

        if args.once {
            return Ok(());
        }
    }
}
