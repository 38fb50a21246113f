//! The staged ingest datapath.
//!
//! Five bounded queues connect the stages:
//!
//! ```text
//! raw -> decompressed -> messages -> valid messages -> out metrics
//! ```
//!
//! Each stage runs a fixed pool of workers that share one receiver.
//! Hand-off between stages awaits queue space, so backpressure propagates
//! naturally upstream; only the UDP boundary (and the self-metrics loop)
//! drop instead of blocking.

pub mod decompress;
pub mod parse;
pub mod resolve;
pub mod validate;
pub mod write;

use std::sync::Arc;

use crate::config::Config;
use crate::message::Metric;
use crate::stats::Stats;
use crate::writer::MetricWriter;

pub const RAW_QUEUE_CAPACITY: usize = 100;
pub const DECOMPRESSED_QUEUE_CAPACITY: usize = 100;
pub const MESSAGE_QUEUE_CAPACITY: usize = 100;
pub const VALID_MESSAGE_QUEUE_CAPACITY: usize = 100;
pub const OUT_METRICS_QUEUE_CAPACITY: usize = 1000;

/// Handles into a running pipeline.
pub struct Pipeline {
    /// Feed for raw datagrams (the UDP receiver).
    pub raw_tx: flume::Sender<Vec<u8>>,

    /// Feed for already-resolved metrics (the self-metrics loop).
    pub metric_tx: flume::Sender<Metric>,
}

/// Spawn every stage worker and return the pipeline's input handles.
///
/// Parallel stages get one worker per logical CPU; the writer is a single
/// serialized worker.
pub fn start(cfg: Arc<Config>, stats: Arc<Stats>, writer: Arc<MetricWriter>) -> Pipeline {
    let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);

    let (raw_tx, raw_rx) = flume::bounded(RAW_QUEUE_CAPACITY);
    let (plain_tx, plain_rx) = flume::bounded(DECOMPRESSED_QUEUE_CAPACITY);
    let (msg_tx, msg_rx) = flume::bounded(MESSAGE_QUEUE_CAPACITY);
    let (valid_tx, valid_rx) = flume::bounded(VALID_MESSAGE_QUEUE_CAPACITY);
    let (metric_tx, metric_rx) = flume::bounded(OUT_METRICS_QUEUE_CAPACITY);

    decompress::spawn(workers, cfg.gzip, raw_rx, plain_tx);
    parse::spawn(workers, plain_rx, msg_tx);
    validate::spawn(workers, Arc::clone(&cfg), Arc::clone(&stats), msg_rx, valid_tx);
    resolve::spawn(workers, cfg, valid_rx, metric_tx.clone());
    write::spawn(writer, metric_rx, metric_tx.clone());

    Pipeline { raw_tx, metric_tx }
}
