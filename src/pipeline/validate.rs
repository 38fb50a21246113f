//! Schema validation stage.
//!
//! Messages are checked against their project's declared attributes and
//! metric bounds. Attribute failures drop the whole message; metric
//! failures drop only the offending metric, compacting the survivors in
//! place so their relative order is preserved.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info};

use crate::config::{Config, ProjectConfig};
use crate::message::{Message, Metric};
use crate::stats::{self, Stats};

/// Clock skew tolerated ahead of wall clock, in seconds.
const MAX_FUTURE_SKEW_SECS: i64 = 10;

/// Oldest accepted metric age, in seconds.
const MAX_AGE_SECS: i64 = 3 * 60 * 60;

/// Spawn the validation stage.
pub fn spawn(
    workers: usize,
    cfg: Arc<Config>,
    stats: Arc<Stats>,
    rx: flume::Receiver<Message>,
    tx: flume::Sender<Message>,
) {
    info!(workers, "starting validation workers");

    for _ in 0..workers {
        let rx = rx.clone();
        let tx = tx.clone();
        let cfg = Arc::clone(&cfg);
        let stats = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok(mut msg) = rx.recv_async().await {
                let before = msg.metrics.len();
                stats.add(stats::MESSAGES_RECEIVED, 1);
                stats.add(stats::METRICS_RECEIVED, before as i64);

                match validate_message(&cfg, &mut msg, unix_now()) {
                    Ok(()) => {
                        stats.add(stats::METRICS_DROPPED, (before - msg.metrics.len()) as i64);
                        debug!(
                            kept = msg.metrics.len(),
                            total = before,
                            "message validated",
                        );

                        if tx.send_async(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        stats.add(stats::MESSAGES_DROPPED, 1);
                        stats.add(stats::METRICS_DROPPED, before as i64);
                        info!(reason = %e, "dropping message");
                    }
                }
            }
        });
    }
}

/// Validate one message in place against the configured schema.
///
/// On success `msg.metrics` holds the surviving metrics in their original
/// order. An error means the whole message must be dropped.
pub fn validate_message(cfg: &Config, msg: &mut Message, now: i64) -> Result<()> {
    let pid = msg
        .header
        .get("project")
        .ok_or_else(|| anyhow!("missing project attribute"))?;
    let pid = String::from_utf8_lossy(pid).into_owned();

    let project = cfg
        .projects
        .get(&pid)
        .ok_or_else(|| anyhow!(r#"unknown project id "{pid}""#))?;

    for (key, value) in &msg.header {
        // The project key routed us here; everything else must be declared.
        if key == "project" {
            continue;
        }

        let pattern = project
            .patterns
            .get(key)
            .ok_or_else(|| anyhow!(r#"unknown attribute "{key}" in project "{pid}""#))?;

        let value = String::from_utf8_lossy(value);
        if !pattern.is_match(&value) {
            bail!(r#"attribute value "{value}" does not match pattern for {pid}.{key}"#);
        }
    }

    if msg.metrics.is_empty() {
        bail!("message contains no metrics");
    }

    msg.metrics.retain(|metric| {
        match validate_metric(project, metric, now) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    project = %pid,
                    metric = %String::from_utf8_lossy(&metric.name),
                    reason = %e,
                    "dropping metric",
                );
                false
            }
        }
    });

    if msg.metrics.is_empty() {
        bail!("no valid metrics left");
    }

    Ok(())
}

fn validate_metric(project: &ProjectConfig, metric: &Metric, now: i64) -> Result<()> {
    let name = String::from_utf8_lossy(&metric.name);
    let metric_cfg = project
        .metrics
        .get(name.as_ref())
        .ok_or_else(|| anyhow!(r#"unknown metric key "{name}""#))?;

    let timestamp: i64 = std::str::from_utf8(&metric.timestamp)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("timestamp must be a base-10 integer"))?;

    if timestamp > now + MAX_FUTURE_SKEW_SECS {
        bail!("timestamp too far in the future");
    }

    if timestamp < now - MAX_AGE_SECS {
        bail!("timestamp too old");
    }

    let value: f64 = std::str::from_utf8(&metric.value)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("value must be a decimal number"))?;

    if !value.is_finite() {
        bail!("value must be finite");
    }

    if value < metric_cfg.min {
        bail!("value below configured minimum");
    }

    if value > metric_cfg.max {
        bail!("value above configured maximum");
    }

    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const NOW: i64 = 1_711_000_000;

    fn config() -> Config {
        Config::from_yaml(
            r#"
projects:
  my_proj:
    graphite_path: "{attr.version}.{metric.name}"
    attributes:
      version: '\d+\.\d+\.\d+'
    metrics:
      fps:
        min: 0
        max: 120
      memory_mb:
        min: 0
        max: 65536
"#,
        )
        .expect("test config should load")
    }

    fn message(headers: &[(&str, &str)], metrics: &[(&str, &str, &str)]) -> Message {
        Message {
            header: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
            metrics: metrics
                .iter()
                .map(|(name, value, ts)| {
                    Metric::new(
                        name.as_bytes().to_vec(),
                        value.as_bytes().to_vec(),
                        ts.as_bytes().to_vec(),
                    )
                })
                .collect(),
        }
    }

    fn ts(offset: i64) -> String {
        (NOW + offset).to_string()
    }

    #[test]
    fn test_valid_message_passes() {
        let cfg = config();
        let mut msg = message(
            &[("project", "my_proj"), ("version", "1.2.3")],
            &[("fps", "30", &ts(-5))],
        );

        validate_message(&cfg, &mut msg, NOW).expect("should validate");
        assert_eq!(msg.metrics.len(), 1);
    }

    #[test]
    fn test_missing_project_header() {
        let cfg = config();
        let mut msg = message(&[("version", "1.2.3")], &[("fps", "30", &ts(0))]);

        let err = validate_message(&cfg, &mut msg, NOW).unwrap_err();
        assert!(err.to_string().contains("missing project"));
    }

    #[test]
    fn test_unknown_project() {
        let cfg = config();
        let mut msg = message(&[("project", "nope")], &[("fps", "30", &ts(0))]);

        let err = validate_message(&cfg, &mut msg, NOW).unwrap_err();
        assert!(err.to_string().contains("unknown project"));
    }

    #[test]
    fn test_unknown_attribute_drops_message() {
        let cfg = config();
        let mut msg = message(
            &[
                ("project", "my_proj"),
                ("version", "1.2.3"),
                ("region", "eu"),
            ],
            &[("fps", "30", &ts(0))],
        );

        let err = validate_message(&cfg, &mut msg, NOW).unwrap_err();
        assert!(err.to_string().contains(r#"unknown attribute "region""#));
    }

    #[test]
    fn test_attribute_regex_mismatch() {
        let cfg = config();
        let mut msg = message(
            &[("project", "my_proj"), ("version", "latest")],
            &[("fps", "30", &ts(0))],
        );

        assert!(validate_message(&cfg, &mut msg, NOW).is_err());
    }

    #[test]
    fn test_empty_metric_list_rejected() {
        let cfg = config();
        let mut msg = message(&[("project", "my_proj")], &[]);

        let err = validate_message(&cfg, &mut msg, NOW).unwrap_err();
        assert!(err.to_string().contains("no metrics"));
    }

    #[test]
    fn test_unknown_metric_dropped_individually() {
        let cfg = config();
        let mut msg = message(
            &[("project", "my_proj")],
            &[
                ("fps", "30", &ts(0)),
                ("bogus", "1", &ts(0)),
                ("memory_mb", "512.5", &ts(0)),
            ],
        );

        validate_message(&cfg, &mut msg, NOW).expect("should validate");

        // Survivors keep their original order.
        assert_eq!(msg.metrics.len(), 2);
        assert_eq!(msg.metrics[0].name, b"fps");
        assert_eq!(msg.metrics[1].name, b"memory_mb");
    }

    #[test]
    fn test_out_of_bounds_value_dropped() {
        let cfg = config();
        let mut msg = message(
            &[("project", "my_proj")],
            &[("fps", "30", &ts(0)), ("fps", "500", &ts(0))],
        );

        validate_message(&cfg, &mut msg, NOW).expect("should validate");
        assert_eq!(msg.metrics.len(), 1);
        assert_eq!(msg.metrics[0].value, b"30");
    }

    #[test]
    fn test_lexically_valid_nonsense_value_dropped() {
        // The parser lets "..." through; it dies here.
        let cfg = config();
        let mut msg = message(&[("project", "my_proj")], &[("fps", "...", &ts(0))]);

        let err = validate_message(&cfg, &mut msg, NOW).unwrap_err();
        assert!(err.to_string().contains("no valid metrics"));
    }

    #[test]
    fn test_timestamp_window() {
        let cfg = config();
        let project = &cfg.projects["my_proj"];

        let metric = |ts_offset: i64| {
            Metric::new(
                b"fps".to_vec(),
                b"30".to_vec(),
                (NOW + ts_offset).to_string().into_bytes(),
            )
        };

        assert!(validate_metric(project, &metric(0), NOW).is_ok());
        assert!(validate_metric(project, &metric(9), NOW).is_ok());
        assert!(validate_metric(project, &metric(11), NOW).is_err());
        assert!(validate_metric(project, &metric(-MAX_AGE_SECS + 1), NOW).is_ok());
        assert!(validate_metric(project, &metric(-MAX_AGE_SECS - 1), NOW).is_err());
    }

    #[test]
    fn test_non_integer_timestamp_dropped() {
        let cfg = config();
        let project = &cfg.projects["my_proj"];

        let metric = Metric::new(b"fps".to_vec(), b"30".to_vec(), b"12.5".to_vec());
        let err = validate_metric(project, &metric, NOW).unwrap_err();
        assert!(err.to_string().contains("base-10 integer"));
    }

    #[test]
    fn test_whole_message_dropped_when_no_metric_survives() {
        let cfg = config();
        let mut msg = message(
            &[("project", "my_proj")],
            &[("fps", "999", &ts(0)), ("fps", "30", "0")],
        );

        let err = validate_message(&cfg, &mut msg, NOW).unwrap_err();
        assert!(err.to_string().contains("no valid metrics"));
    }

    #[tokio::test]
    async fn test_stage_counters() {
        let cfg = Arc::new(config());
        let stats = Arc::new(Stats::new());
        let (in_tx, in_rx) = flume::bounded(4);
        let (out_tx, out_rx) = flume::bounded(4);

        spawn(1, cfg, Arc::clone(&stats), in_rx, out_tx);

        // One message with a partial drop, one dropped whole.
        let now = unix_now();
        in_tx
            .send_async(message(
                &[("project", "my_proj")],
                &[
                    ("fps", "30", &now.to_string()),
                    ("fps", "999", &now.to_string()),
                ],
            ))
            .await
            .expect("send");
        in_tx
            .send_async(message(
                &[("project", "unknown")],
                &[("fps", "30", &now.to_string())],
            ))
            .await
            .expect("send");

        let forwarded = out_rx.recv_async().await.expect("recv");
        assert_eq!(forwarded.metrics.len(), 1);

        // Wait for the second message to be counted as dropped.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            {
                let snap = stats.reset();
                if snap.get(stats::MESSAGES_DROPPED) == Some(&1) {
                    assert_eq!(snap.get(stats::MESSAGES_RECEIVED), Some(&2));
                    assert_eq!(snap.get(stats::METRICS_RECEIVED), Some(&3));
                    assert_eq!(snap.get(stats::METRICS_DROPPED), Some(&2));
                    break;
                }
                // Partial snapshot: put it back and retry.
                for (key, value) in snap {
                    stats.add(key, value);
                }
            }

            assert!(
                tokio::time::Instant::now() < deadline,
                "validator counters never settled"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
