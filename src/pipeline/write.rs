use std::sync::Arc;

use tracing::{info, warn};

use crate::message::Metric;
use crate::writer::MetricWriter;

/// Spawn the single serialized writer worker.
///
/// A metric whose write still fails after the writer's own reconnect cycle
/// is re-enqueued onto this stage's input queue for another attempt. The
/// re-enqueue is best-effort: with the queue saturated the metric is
/// dropped rather than deadlocking the worker against itself.
pub fn spawn(
    writer: Arc<MetricWriter>,
    rx: flume::Receiver<Metric>,
    retry_tx: flume::Sender<Metric>,
) {
    info!("starting writer worker");

    tokio::spawn(async move {
        while let Ok(metric) = rx.recv_async().await {
            if let Err(e) = writer.write(&metric).await {
                warn!(error = %e, "sink write failed, re-enqueueing metric");

                if retry_tx.try_send(metric).is_err() {
                    warn!("metric queue full, dropping metric after failed write");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;

    #[tokio::test]
    async fn test_worker_drains_queue_to_sink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.out");
        let target = format!("file://{}", path.display());

        let writer = Arc::new(
            MetricWriter::open(&target, Arc::new(Stats::new()))
                .await
                .expect("open sink"),
        );

        let (tx, rx) = flume::bounded(8);
        spawn(writer, rx, tx.clone());

        tx.send_async(Metric::new(
            b"a.b".to_vec(),
            b"1".to_vec(),
            b"10".to_vec(),
        ))
        .await
        .expect("send");

        // Poll until the worker has flushed the frame.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if std::fs::read_to_string(&path).unwrap_or_default() == "a.b 1 10\n" {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "frame never reached the sink"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
