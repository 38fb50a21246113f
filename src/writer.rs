//! Reconnecting line-protocol sink.
//!
//! One metric per line, `path SP value SP timestamp NL`, compatible with a
//! Graphite-style line receiver. The underlying byte sink is either an
//! append-only file or a TCP connection; both are reopened in place behind
//! a mutex when a write fails.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::message::Metric;
use crate::stats::{self, Stats};

/// Delay between TCP redial attempts while the sink is down.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
enum SinkTarget {
    File(PathBuf),
    Tcp(String),
}

#[derive(Debug)]
enum SinkConn {
    File(tokio::fs::File),
    Tcp(TcpStream),
}

impl SinkConn {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            SinkConn::File(file) => {
                file.write_all(buf).await?;
                file.flush().await
            }
            SinkConn::Tcp(stream) => stream.write_all(buf).await,
        }
    }
}

async fn open_file(path: &PathBuf) -> Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
        .with_context(|| format!("opening sink file {}", path.display()))
}

/// Shared metric writer with sink-specific reopen logic.
#[derive(Debug)]
pub struct MetricWriter {
    target: SinkTarget,
    conn: Mutex<SinkConn>,
    stats: Arc<Stats>,
}

impl MetricWriter {
    /// Open the sink named by `target` (`tcp://host:port` or
    /// `file:///absolute/path`). Failure here is fatal to startup.
    pub async fn open(target: &str, stats: Arc<Stats>) -> Result<Self> {
        let url = Url::parse(target).with_context(|| format!("parsing sink target {target}"))?;

        match url.scheme() {
            "file" => {
                let path = PathBuf::from(url.path());
                let file = open_file(&path).await?;

                Ok(Self {
                    target: SinkTarget::File(path),
                    conn: Mutex::new(SinkConn::File(file)),
                    stats,
                })
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .with_context(|| format!("sink target {target} has no host"))?;
                let port = url
                    .port()
                    .with_context(|| format!("sink target {target} has no port"))?;
                let addr = format!("{host}:{port}");

                let stream = TcpStream::connect(&addr)
                    .await
                    .with_context(|| format!("connecting to sink {addr}"))?;

                Ok(Self {
                    target: SinkTarget::Tcp(addr),
                    conn: Mutex::new(SinkConn::Tcp(stream)),
                    stats,
                })
            }
            other => bail!(r#"unsupported sink target scheme "{other}", must be "tcp" or "file""#),
        }
    }

    /// Serialize and write one metric frame.
    ///
    /// On a failed write the frame is retried once (the connection may have
    /// been reopened underneath us), then the sink is reopened and the
    /// frame retried a final time. The last error is surfaced to the
    /// caller. For a TCP sink `reopen` blocks until the peer is reachable
    /// again, which stalls the writer worker on purpose.
    pub async fn write(&self, metric: &Metric) -> Result<()> {
        let frame = frame(metric);

        let mut conn = self.conn.lock().await;

        if conn.write_all(&frame).await.is_ok() {
            self.record(frame.len());
            return Ok(());
        }

        if conn.write_all(&frame).await.is_ok() {
            self.record(frame.len());
            return Ok(());
        }

        warn!("sink write failed twice, reopening");
        self.reopen_locked(&mut conn).await?;

        conn.write_all(&frame)
            .await
            .context("writing metric after sink reopen")?;

        self.record(frame.len());
        Ok(())
    }

    fn record(&self, len: usize) {
        self.stats.add(stats::BYTES_OUT, len as i64);
        self.stats.add(stats::METRICS_WRITTEN, 1);
    }

    /// Close and reopen the underlying sink.
    pub async fn reopen(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        self.reopen_locked(&mut conn).await
    }

    async fn reopen_locked(&self, conn: &mut SinkConn) -> Result<()> {
        match &self.target {
            SinkTarget::File(path) => {
                *conn = SinkConn::File(open_file(path).await?);
                Ok(())
            }
            SinkTarget::Tcp(addr) => {
                // Redial until the downstream comes back. Writers queue up
                // behind the connection mutex meanwhile.
                loop {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => {
                            *conn = SinkConn::Tcp(stream);
                            info!(addr = %addr, "sink reconnected");
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(error = %e, "sink reconnect failed, retrying in 500ms");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            }
        }
    }

    /// Listen for SIGUSR1 and reopen the file sink out of band, so external
    /// log rotation can move the target file away. No-op for TCP sinks.
    pub fn spawn_rotation_handler(self: &Arc<Self>, cancel: CancellationToken) {
        if !matches!(self.target, SinkTarget::File(_)) {
            return;
        }

        let writer = Arc::clone(self);
        tokio::spawn(async move {
            let mut usr1 =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
                {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!(error = %e, "failed to register SIGUSR1 handler");
                        return;
                    }
                };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = usr1.recv() => {
                        debug!("reopening sink file after SIGUSR1");
                        if let Err(e) = writer.reopen().await {
                            error!(error = %e, "sink file reopen failed");
                        }
                    }
                }
            }
        });
    }
}

/// Render one sink frame: `path SP value SP timestamp NL`.
fn frame(metric: &Metric) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(metric.name.len() + metric.value.len() + metric.timestamp.len() + 3);
    buf.extend_from_slice(&metric.name);
    buf.push(b' ');
    buf.extend_from_slice(&metric.value);
    buf.push(b' ');
    buf.extend_from_slice(&metric.timestamp);
    buf.push(b'\n');
    buf
}
