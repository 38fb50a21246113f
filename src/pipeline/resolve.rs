use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::message::{Message, Metric};
use crate::template::ResolveContext;

/// Spawn the path resolution stage: validated messages in, sink-ready
/// metrics out. Each surviving metric gets its name replaced by the
/// rendered path of its configured template.
pub fn spawn(
    workers: usize,
    cfg: Arc<Config>,
    rx: flume::Receiver<Message>,
    tx: flume::Sender<Metric>,
) {
    info!(workers, "starting resolver workers");

    for _ in 0..workers {
        let rx = rx.clone();
        let tx = tx.clone();
        let cfg = Arc::clone(&cfg);

        tokio::spawn(async move {
            while let Ok(msg) = rx.recv_async().await {
                let Message { header, metrics } = msg;

                // The validator only forwards messages whose project and
                // metric keys are configured.
                let pid = header.get("project").map(|p| String::from_utf8_lossy(p).into_owned());
                let Some(project) = pid.as_deref().and_then(|p| cfg.projects.get(p)) else {
                    continue;
                };

                for metric in metrics {
                    let name = String::from_utf8_lossy(&metric.name).into_owned();
                    let Some(metric_cfg) = project.metrics.get(&name) else {
                        continue;
                    };

                    let path = match metric_cfg.template.resolve(&ResolveContext {
                        attrs: &header,
                        metric: &metric,
                    }) {
                        Ok(path) => path,
                        Err(e) => {
                            warn!(metric = %name, error = %e, "failed to resolve metric path");
                            continue;
                        }
                    };

                    debug!(
                        metric = %name,
                        path = %String::from_utf8_lossy(&path),
                        "resolved metric path",
                    );

                    let out = Metric::new(path, metric.value, metric.timestamp);
                    if tx.send_async(out).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
}
