use anyhow::Result;
use clap::Parser;
use juju_lease::{open_store, LeaseConfig, LeaseMetrics, LeaseWorker, StaticModelCatalog, SystemClock, WorkerDeps};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Runs the lease managers of one controller.
#[derive(Debug, Parser)]
#[command(name = "lease-worker", version, about)]
struct Args {
    /// Config file (TOML or JSON). Defaults are used if it does not exist.
    #[arg(long, env = "LEASE_CONFIG", default_value = "/etc/juju/lease.toml")]
    config: PathBuf,

    /// Overrides `data_dir` from the config file.
    #[arg(long, env = "LEASE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = LeaseConfig::load_or_default(&args.config)?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let (kv, store) = open_store(&config)?;
    let worker = LeaseWorker::start(
        &config,
        WorkerDeps {
            clock: Arc::new(SystemClock),
            store,
            models: Arc::new(StaticModelCatalog::new()),
            metrics: Arc::new(LeaseMetrics::new()),
        },
    )?;
    let shutdown = worker.shutdown_token();

    // Managers are lazy; start the configured ones so their leases expire on time.
    for model in config.all_models() {
        worker.registry().manager(model)?;
    }

    let interval = config.checkpoint_interval();
    let checkpoint_kv = kv.clone();
    let checkpoint_shutdown = shutdown.clone();
    let checkpoint_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = checkpoint_shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let kv = checkpoint_kv.clone();
            match tokio::task::spawn_blocking(move || kv.checkpoint()).await {
                Ok(Ok(())) => tracing::debug!("lease store checkpointed"),
                Ok(Err(e)) => tracing::error!(error = %e, "checkpoint failed"),
                Err(e) => tracing::error!(error = %e, "checkpoint task failed"),
            }
        }
    });

    let metrics = worker.metrics().clone();
    let signal = install_shutdown_handler();
    tokio::select! {
        _ = signal.cancelled() => {}
        _ = shutdown.cancelled() => {}
    }

    worker.shutdown().await;
    let _ = checkpoint_handle.await;
    tokio::task::spawn_blocking(move || kv.checkpoint()).await??;
    tracing::info!(
        snapshot = %serde_json::to_string(&metrics.snapshot())?,
        "lease worker exited"
    );
    Ok(())
}

fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received interrupt, shutting down"),
            Err(e) => tracing::error!(error = %e, "failed to listen for interrupt"),
        }
        token_clone.cancel();
    });

    token
}
