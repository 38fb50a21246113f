//! Self-metrics loop.
//!
//! Once per minute the counter registry is snapshot-and-reset. Every
//! counter is logged, and with monitoring enabled each one is also turned
//! into a synthetic metric and fed straight into the writer's queue. These
//! metrics are system-authored and skip validation entirely.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::message::{Header, Metric};
use crate::stats::Stats;
use crate::template::ResolveContext;

/// How often counters are snapshot and emitted.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the monitoring worker; it runs until `cancel` fires.
pub fn spawn(
    cfg: Arc<Config>,
    stats: Arc<Stats>,
    metric_tx: flume::Sender<Metric>,
    cancel: CancellationToken,
) {
    info!("starting monitoring worker");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => report(&cfg, &stats, &metric_tx),
            }
        }
    });
}

/// Snapshot the registry, log every counter and inject the synthetic
/// metrics. Increments racing with the snapshot land in the next window.
pub fn report(cfg: &Config, stats: &Stats, metric_tx: &flume::Sender<Metric>) {
    let now = SystemTime::now();
    let no_attrs = Header::new();

    for (key, value) in stats.reset() {
        info!(counter = key, value, "monitoring snapshot");

        if !cfg.monitoring_enabled {
            continue;
        }

        let probe = Metric::from_value(key, value as f64, now);
        let path = match cfg.monitoring.resolve(&ResolveContext {
            attrs: &no_attrs,
            metric: &probe,
        }) {
            Ok(path) => path,
            Err(e) => {
                error!(counter = key, error = %e, "failed to resolve monitoring path");
                continue;
            }
        };

        let metric = Metric::new(path, probe.value, probe.timestamp);
        if metric_tx.try_send(metric).is_err() {
            warn!(counter = key, "metric queue full, dropping monitoring metric");
        }
    }
}
