use tracing::{debug, info, warn};

use crate::message::Message;
use crate::parser::decode_message;

/// Spawn the parsing stage: raw datagram bytes in, decoded messages out.
/// Undecodable datagrams are dropped whole.
pub fn spawn(workers: usize, rx: flume::Receiver<Vec<u8>>, tx: flume::Sender<Message>) {
    info!(workers, "starting parser workers");

    for _ in 0..workers {
        let rx = rx.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            while let Ok(data) = rx.recv_async().await {
                let msg = match decode_message(&data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, bytes = data.len(), "dropping undecodable datagram");
                        continue;
                    }
                };

                debug!(
                    bytes = data.len(),
                    headers = msg.header.len(),
                    metrics = msg.metrics.len(),
                    "parsed datagram",
                );

                if tx.send_async(msg).await.is_err() {
                    return;
                }
            }
        });
    }
}
