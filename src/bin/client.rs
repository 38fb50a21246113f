//! Synthetic metric load generator.
//!
//! Sends one datagram per second containing a second's worth of samples at
//! the configured frequency, optionally gzip-encoded. Useful for smoke
//! tests and load experiments against a running server.

use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "pirate-client", version, about)]
struct Cli {
    /// Server address to send UDP packets to.
    #[arg(long, default_value = "127.0.0.1:33333")]
    addr: String,

    /// Header attribute line, e.g. "project=my_proj; version=1.2.3".
    #[arg(long, default_value = "")]
    attr: String,

    /// Metric name to generate.
    #[arg(long)]
    name: String,

    /// Minimum for random values.
    #[arg(long, default_value_t = 0.0)]
    min: f64,

    /// Maximum for random values.
    #[arg(long, default_value_t = 0.0)]
    max: f64,

    /// Frequency to generate metrics at.
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    freq: Duration,

    /// Gzip-encode each datagram.
    #[arg(long)]
    gzip: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::new("info"))
        .with_target(false)
        .init();

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("binding local UDP socket")?;
    socket
        .connect(&cli.addr)
        .await
        .with_context(|| format!("connecting to {}", cli.addr))?;

    let per_second = (Duration::from_secs(1).as_nanos() / cli.freq.as_nanos().max(1)).max(1) as u64;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let buf = build_datagram(&cli, per_second as usize)?;

        info!(metrics = per_second, bytes = buf.len(), "sending datagram");

        socket.send(&buf).await.context("sending UDP datagram")?;
    }
}

fn build_datagram(cli: &Cli, amount: usize) -> Result<Vec<u8>> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut rng = rand::thread_rng();

    let mut buf = Vec::with_capacity(64 + amount * 48);
    buf.extend_from_slice(cli.attr.as_bytes());
    buf.push(b'\n');

    for _ in 0..amount {
        let value: f64 = if cli.max > cli.min {
            rng.gen_range(cli.min..=cli.max)
        } else {
            cli.min
        };

        writeln!(buf, "{} {:.6} {}", cli.name, value, now).context("formatting metric line")?;
    }

    if cli.gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&buf).context("gzip write")?;
        return encoder.finish().context("gzip finish");
    }

    Ok(buf)
}
