use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::limit::IpLimiter;
use crate::stats::{self, Stats};

/// Scratch buffer size for one datagram; the OS truncates anything larger.
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// UDP receiver: the head of the pipeline and the only stage allowed to
/// drop on downstream pressure.
pub struct UdpServer {
    socket: UdpSocket,
    limiter: Option<Arc<IpLimiter>>,
    stats: Arc<Stats>,
    raw_tx: flume::Sender<Vec<u8>>,
}

impl UdpServer {
    /// Bind the receive socket. Failure here is fatal to startup.
    pub async fn bind(
        address: &str,
        limiter: Option<Arc<IpLimiter>>,
        stats: Arc<Stats>,
        raw_tx: flume::Sender<Vec<u8>>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("binding UDP socket on {address}"))?;

        info!(address = %address, "UDP server listening");

        Ok(Self {
            socket,
            limiter,
            stats,
            raw_tx,
        })
    }

    /// The actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("reading UDP socket address")
    }

    /// Receive datagrams forever.
    ///
    /// The receiver never awaits the raw queue: when it is full the
    /// datagram is dropped and counted, keeping the socket drained no
    /// matter how slow the rest of the pipeline is.
    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    info!(error = %e, "failed to read datagram");
                    continue;
                }
            };

            self.stats.add(stats::BYTES_IN, n as i64);
            self.stats.add(stats::UDP_RECEIVED, 1);

            if let Some(limiter) = &self.limiter {
                if !limiter.allow(peer.ip()) {
                    self.stats.add(stats::UDP_DROPPED, 1);
                    debug!(peer = %peer, "rate limit exceeded, dropping datagram");
                    continue;
                }
            }

            debug!(bytes = n, peer = %peer, "received datagram");

            if self.raw_tx.try_send(buf[..n].to_vec()).is_err() {
                self.stats.add(stats::UDP_DROPPED, 1);
                debug!("raw queue full, dropping datagram");
            }
        }
    }
}
