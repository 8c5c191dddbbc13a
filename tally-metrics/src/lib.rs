//! Concurrent aggregation of statsd and graphite style metrics.
//!
//! Data points are `(path, value)` pairs applied to one of four aggregation types:
//!
//!  - **Adders** sum values and report the total of each period, `0` when idle.
//!  - **Gauges** hold the last absolute value, optionally adjusted by relative updates.
//!  - **Stats** collect raw samples and report count, sum, mean, extremes, median and configured
//!    percentiles, plus optional moments and mode.
//!  - **Histograms** count samples into buckets of a configured block.
//!
//! # Architecture
//!
//! Each type has its own [`PathTable`], a fixed size hash table with lock-free lookups and
//! striped locks for insertion. Every [`Record`] has two sides: ingestion appends to the input
//! side under a short lock, and once per tick a [`PassWorker`] swaps it into the processing side
//! and computes from there without contention. Each type runs several workers, each owning a
//! static shard of the table's buckets.
//!
//! Synthetic metrics are adders derived from other adders. The synthetic engine runs between the
//! swap and the report of the adder workers, fenced by a [`TickBarrier`], so it always reads the
//! values of the current tick and its results are reported in the same tick.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use tally_metrics::{Engine, EngineConfig, GaugeOp, MetricKind, VecSink};
//!
//! let mut config = EngineConfig::default();
//! config.self_stats.enable = false;
//!
//! let sink = VecSink::new();
//! let mut engine = Engine::new(&config, Arc::new(sink.clone())).unwrap();
//!
//! for _ in 0..5 {
//!     engine.ingest(MetricKind::Adder, "svc.requests", 1.0, GaugeOp::Set).unwrap();
//! }
//!
//! engine.tick(1_700_000_000_000);
//! assert_eq!(sink.take_text(), "svc.requests 5.000000\n");
//! ```

#![warn(missing_docs)]

mod barrier;
mod checks;
mod config;
mod engine;
mod gc;
mod hash;
mod histogram;
mod maths;
mod output;
mod pass;
mod predict;
mod record;
mod sort;
mod statsd;
mod synth;
mod table;
mod ticker;

pub mod protocol;

pub use self::barrier::*;
pub use self::checks::*;
pub use self::config::*;
pub use self::engine::{Engine, EngineHandle, IngestStats, Ingester};
pub use self::hash::*;
pub use self::histogram::{BucketCounts, HistogramBlock, HistogramSet};
pub use self::maths::*;
pub use self::output::*;
pub use self::pass::{PassWorker, WorkerStats};
pub use self::predict::*;
pub use self::record::*;
pub use self::sort::*;
pub use self::synth::*;
pub use self::table::{IdAllocator, PathTable};
pub use self::ticker::*;
