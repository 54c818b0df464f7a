//! Standalone shuffle tracker.
//!
//! Runs the tracker for one shuffle until interrupted. Mappers publish their
//! splits to it and reducers rendezvous through it, all from other processes.

use anyhow::Context;
use barks_common::ShuffleConfig;
use barks_shuffle::tracker::{ShuffleTracker, TrackerServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shuffle-tracker", about = "Tracker for a peer-to-peer shuffle")]
struct Args {
    /// JSON configuration file; missing keys keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides masterHostAddress
    #[arg(long)]
    host: Option<String>,

    /// Overrides masterTrackerPort
    #[arg(long)]
    port: Option<u16>,

    /// Number of reducers whose completion finishes the shuffle
    #[arg(long)]
    reducers: u32,

    /// Shuffle id reported in logs
    #[arg(long, default_value = "standalone")]
    shuffle_id: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ShuffleConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ShuffleConfig::default(),
    };
    if let Some(host) = args.host {
        config.master_host_address = host;
    }
    if let Some(port) = args.port {
        config.master_tracker_port = port;
    }
    config.validate()?;

    let tracker = Arc::new(ShuffleTracker::new(
        args.shuffle_id,
        args.reducers,
        config.max_tx_connections,
    ));
    let server = TrackerServer::bind(config.tracker_addr()?, Arc::clone(&tracker)).await?;

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("Interrupted, final status {:?}", tracker.status());
    shutdown.cancel();
    serving.await??;
    Ok(())
}
