use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use pirate::config::Config;
use pirate::limit::IpLimiter;
use pirate::server::UdpServer;
use pirate::stats::Stats;
use pirate::writer::MetricWriter;
use pirate::{monitor, pipeline};

/// UDP metric edge ingestor relaying to a Graphite-style line sink.
#[derive(Parser)]
#[command(name = "pirate-server", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "/etc/pirate/config.yml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting pirate-server");
    cfg.log_summary();

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);
    let stats = Arc::new(Stats::new());
    let cancel = CancellationToken::new();

    // Open the sink first; a dead target is a startup failure, not a retry.
    let writer = Arc::new(
        MetricWriter::open(&cfg.sink_target, Arc::clone(&stats))
            .await
            .context("opening sink")?,
    );
    writer.spawn_rotation_handler(cancel.child_token());

    let limiter = if cfg.per_ip_rate_limit.enabled {
        let limiter = Arc::new(IpLimiter::new(
            cfg.per_ip_rate_limit.amount,
            cfg.per_ip_rate_limit.interval,
        ));
        Arc::clone(&limiter).spawn_gc(cancel.child_token());
        Some(limiter)
    } else {
        None
    };

    let pipeline = pipeline::start(Arc::clone(&cfg), Arc::clone(&stats), writer);

    monitor::spawn(
        Arc::clone(&cfg),
        Arc::clone(&stats),
        pipeline.metric_tx.clone(),
        cancel.child_token(),
    );

    let server = UdpServer::bind(&cfg.udp_address, limiter, stats, pipeline.raw_tx.clone())
        .await
        .context("starting UDP server")?;

    tokio::select! {
        result = server.run() => result,
        _ = shutdown_signal() => {
            info!("shutting down");
            cancel.cancel();
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
