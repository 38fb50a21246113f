use std::io::Read;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

/// Upper bound for one decompressed datagram; larger payloads are dropped.
pub const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024 * 1024;

/// Decompress one gzip-encoded datagram, enforcing the size cap.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut reader = GzDecoder::new(data).take(MAX_DECOMPRESSED_SIZE + 1);

    reader
        .read_to_end(&mut out)
        .context("decoding gzip payload")?;

    if out.len() as u64 > MAX_DECOMPRESSED_SIZE {
        bail!("decompressed payload exceeds {MAX_DECOMPRESSED_SIZE} bytes");
    }

    Ok(out)
}

/// Spawn the decompression stage.
///
/// With gzip disabled the stage is a passthrough, keeping the queue
/// topology identical in both modes.
pub fn spawn(
    workers: usize,
    gzip: bool,
    rx: flume::Receiver<Vec<u8>>,
    tx: flume::Sender<Vec<u8>>,
) {
    info!(workers, gzip, "starting decompression workers");

    for _ in 0..workers {
        let rx = rx.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            while let Ok(data) = rx.recv_async().await {
                let out = if gzip {
                    match gunzip(&data) {
                        Ok(out) => {
                            debug!(
                                compressed = data.len(),
                                decompressed = out.len(),
                                "decompressed datagram",
                            );
                            out
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to decompress datagram");
                            continue;
                        }
                    }
                } else {
                    data
                };

                if tx.send_async(out).await.is_err() {
                    return;
                }
            }
        });
    }
}
