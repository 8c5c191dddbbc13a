//! Per-path aggregation records and their point accumulators.

use std::fmt;
use std::mem;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::checks::Checks;
use crate::histogram::{BucketCounts, HistogramBlock};
use crate::predict::Predictor;
use crate::statsd::MetricCounters;

/// Number of samples in one stats chunk.
pub const CHUNK_SIZE: usize = 2046;

/// Empty counter value of records that are never collected.
const GC_EXEMPT: i64 = -1;

/// The aggregation semantics of a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Sums values and resets every tick.
    Adder,
    /// Holds the last absolute value, optionally adjusted relatively.
    Gauge,
    /// Collects raw samples for percentiles.
    Stats,
    /// Counts samples into configured buckets.
    Histogram,
}

impl MetricKind {
    /// All kinds, in the order their passes run within a tick.
    pub const ALL: [MetricKind; 4] = [Self::Adder, Self::Gauge, Self::Stats, Self::Histogram];

    /// Returns the short name used in thread names, self stats and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adder => "adder",
            Self::Gauge => "gauge",
            Self::Stats => "stats",
            Self::Histogram => "histo",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a gauge update applies to the current value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum GaugeOp {
    /// Replace the value.
    #[default]
    Set,
    /// Add to the value.
    Add,
    /// Subtract from the value.
    Subtract,
}

/// Failure to apply a single data point.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum UpdateError {
    /// NaN and infinities are not aggregated.
    #[error("value {0} is not finite")]
    NonFinite(f64),
    /// A new stats chunk could not be allocated, the point was dropped.
    #[error("could not allocate a sample chunk")]
    ChunkAllocation,
    /// The aggregation type is switched off in the configuration.
    #[error("{0} metrics are disabled")]
    Disabled(MetricKind),
}

/// Running total and number of updates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Totals {
    /// Sum of the values, or the gauge value.
    pub total: f64,
    /// Number of updates.
    pub count: u64,
}

/// Raw stats samples in fixed capacity chunks.
#[derive(Debug, Default)]
pub struct Points {
    chunks: Vec<Vec<f64>>,
    count: usize,
}

impl Points {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of chunks holding the samples.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| !c.is_empty()).count()
    }

    fn push(&mut self, value: f64) -> Result<(), UpdateError> {
        let needs_chunk = self.chunks.last().is_none_or(|c| c.len() >= CHUNK_SIZE);
        if needs_chunk {
            let mut chunk = Vec::new();
            chunk
                .try_reserve_exact(CHUNK_SIZE)
                .map_err(|_| UpdateError::ChunkAllocation)?;
            self.chunks
                .try_reserve(1)
                .map_err(|_| UpdateError::ChunkAllocation)?;
            self.chunks.push(chunk);
        }

        // The last chunk always has room at this point.
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.push(value);
            self.count += 1;
        }

        Ok(())
    }

    /// Copies all samples into `out`, replacing its contents.
    pub fn flatten_into(&self, out: &mut Vec<f64>) {
        out.clear();
        out.reserve(self.count);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
    }

    /// Drops the samples but keeps one chunk allocated for the next tick.
    fn clear(&mut self) {
        self.chunks.truncate(1);
        if let Some(chunk) = self.chunks.first_mut() {
            chunk.clear();
        }
        self.count = 0;
    }
}

/// The type-specific state of one side of a record.
#[derive(Debug)]
pub enum Sample {
    /// Adder totals.
    Adder(Totals),
    /// Gauge value.
    Gauge(Totals),
    /// Timer samples.
    Stats(Points),
    /// Histogram bucket counts.
    Histogram(BucketCounts),
}

impl Sample {
    /// Creates an empty sample for `kind`.
    ///
    /// Histogram samples count into `block`, or into the fallback layout if there is none.
    pub(crate) fn new(kind: MetricKind, block: Option<Arc<HistogramBlock>>) -> Self {
        match kind {
            MetricKind::Adder => Self::Adder(Totals::default()),
            MetricKind::Gauge => Self::Gauge(Totals::default()),
            MetricKind::Stats => Self::Stats(Points::default()),
            MetricKind::Histogram => Self::Histogram(BucketCounts::new(
                block.unwrap_or_else(|| Arc::new(HistogramBlock::fallback())),
            )),
        }
    }

    /// Number of updates applied since the last swap.
    pub fn count(&self) -> u64 {
        match self {
            Self::Adder(t) | Self::Gauge(t) => t.count,
            Self::Stats(p) => p.count as u64,
            Self::Histogram(h) => h.count(),
        }
    }

    fn apply(&mut self, value: f64, op: GaugeOp) -> Result<(), UpdateError> {
        match self {
            Self::Adder(t) => {
                t.total += value;
                t.count += 1;
            }
            Self::Gauge(t) => {
                match op {
                    GaugeOp::Set => t.total = value,
                    GaugeOp::Add => t.total += value,
                    GaugeOp::Subtract => t.total -= value,
                }
                t.count += 1;
            }
            Self::Stats(p) => p.push(value)?,
            Self::Histogram(h) => h.add(value),
        }
        Ok(())
    }

    /// Prepares a side that was just swapped out of processing for new input.
    ///
    /// `processed` is the side now holding this tick's data. Gauges carry their value over.
    fn reset_from(&mut self, processed: &Sample) {
        match (self, processed) {
            (Self::Adder(t), _) => *t = Totals::default(),
            (Self::Gauge(t), Self::Gauge(p)) => {
                t.total = p.total;
                t.count = 0;
            }
            (Self::Gauge(t), _) => t.count = 0,
            (Self::Stats(p), _) => p.clear(),
            (Self::Histogram(h), Self::Histogram(p)) => h.reset(p.block().clone()),
            (Self::Histogram(h), _) => h.reset(h.block().clone()),
        }
    }
}

/// State owned by the pass worker of a record's shard.
#[derive(Debug)]
pub struct Processing {
    /// The snapshot swapped out of the input side.
    pub sample: Sample,
    /// Optional forecaster of adder values.
    pub predictor: Option<Predictor>,
}

#[derive(Clone, Copy, Debug)]
struct Extras {
    id: u64,
    checks: Checks,
}

/// Aggregation state of one path.
///
/// Ingestion writes to the input side under a short lock. Once per tick, the pass worker owning
/// the record's shard swaps the input side into the processing side and computes from there. The
/// two locks are always taken in the order processing, then input.
pub struct Record {
    path: Box<str>,
    hash: u64,
    kind: MetricKind,
    valid: AtomicBool,
    empty: AtomicI64,
    extras: OnceLock<Extras>,
    input: Mutex<Sample>,
    processing: Mutex<Processing>,
}

impl Record {
    /// Creates a record with both sides initialized from `sample`.
    pub(crate) fn new(path: &str, hash: u64, kind: MetricKind, sample: Sample) -> Self {
        let block = match &sample {
            Sample::Histogram(h) => Some(h.block().clone()),
            _ => None,
        };
        let mut processed = Sample::new(kind, block);
        processed.reset_from(&sample);

        Self {
            path: path.into(),
            hash,
            kind,
            valid: AtomicBool::new(true),
            empty: AtomicI64::new(0),
            extras: OnceLock::new(),
            input: Mutex::new(sample),
            processing: Mutex::new(Processing {
                sample: processed,
                predictor: None,
            }),
        }
    }

    /// The metric path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The hash of the path.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The aggregation kind.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Returns `false` once the record has been removed.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Marks the record as removed. Lookups no longer find it.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// The unique id, once assigned after creation.
    pub fn id(&self) -> Option<u64> {
        self.extras.get().map(|e| e.id)
    }

    /// The enabled optional features.
    pub fn checks(&self) -> Checks {
        self.extras.get().map(|e| e.checks).unwrap_or_default()
    }

    /// Sets id and checks. Only the first call has an effect.
    pub(crate) fn resolve(&self, id: u64, checks: Checks) -> bool {
        self.extras.set(Extras { id, checks }).is_ok()
    }

    /// Applies a data point to the input side.
    pub fn update(&self, value: f64, op: GaugeOp) -> Result<(), UpdateError> {
        if !value.is_finite() {
            return Err(UpdateError::NonFinite(value));
        }

        let result = self.input.lock().apply(value, op);
        if let Err(UpdateError::ChunkAllocation) = result {
            tally_log::error!(path = %self.path, "could not allocate a sample chunk, dropping point");
            tally_statsd::metric!(counter(MetricCounters::ChunkAllocationFailed) += 1);
        }
        result
    }

    /// Number of updates on the input side since the last swap.
    pub fn pending(&self) -> u64 {
        self.input.lock().count()
    }

    /// Runs `f` with the current input side.
    pub fn with_input<R>(&self, f: impl FnOnce(&Sample) -> R) -> R {
        f(&self.input.lock())
    }

    /// Locks the processing side.
    pub(crate) fn processing(&self) -> MutexGuard<'_, Processing> {
        self.processing.lock()
    }

    /// Moves the input side into `processing` and installs a fresh input side.
    ///
    /// Returns the number of updates in the new snapshot and tracks empty ticks for collection.
    pub(crate) fn swap(&self, processing: &mut Processing) -> u64 {
        let count = {
            let mut input = self.input.lock();
            mem::swap(&mut *input, &mut processing.sample);
            input.reset_from(&processing.sample);
            processing.sample.count()
        };

        self.track_activity(count);
        count
    }

    /// Installs a new bucket layout on both sides of a histogram record, dropping its counts.
    pub(crate) fn retarget(&self, block: &Arc<HistogramBlock>) {
        let mut processing = self.processing.lock();
        let mut input = self.input.lock();
        for sample in [&mut processing.sample, &mut *input] {
            if let Sample::Histogram(counts) = sample {
                counts.reset(block.clone());
            }
        }
    }

    fn track_activity(&self, count: u64) {
        if count > 0 {
            let _ = self
                .empty
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |empty| {
                    (empty > 0).then_some(0)
                });
        } else {
            let _ = self
                .empty
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |empty| {
                    (empty != GC_EXEMPT).then_some(empty + 1)
                });
        }
    }

    /// Number of consecutive ticks without data, or `None` if exempt from collection.
    pub fn empty_ticks(&self) -> Option<u64> {
        let empty = self.empty.load(Ordering::Acquire);
        (empty != GC_EXEMPT).then_some(empty as u64)
    }

    /// Exempts this record from collection of idle paths.
    pub fn exempt_from_gc(&self) {
        self.empty.store(GC_EXEMPT, Ordering::Release);
    }
}

/// Adds `value` to an adder record.
pub fn update_adder(record: &Record, value: f64) -> Result<(), UpdateError> {
    debug_assert_eq!(record.kind(), MetricKind::Adder);
    record.update(value, GaugeOp::Set)
}

/// Sets or adjusts a gauge record.
pub fn update_gauge(record: &Record, value: f64, op: GaugeOp) -> Result<(), UpdateError> {
    debug_assert_eq!(record.kind(), MetricKind::Gauge);
    record.update(value, op)
}

/// Appends a sample to a stats record.
pub fn update_stats(record: &Record, value: f64) -> Result<(), UpdateError> {
    debug_assert_eq!(record.kind(), MetricKind::Stats);
    record.update(value, GaugeOp::Set)
}

/// Counts a sample into the buckets of a histogram record.
pub fn update_histogram(record: &Record, value: f64) -> Result<(), UpdateError> {
    debug_assert_eq!(record.kind(), MetricKind::Histogram);
    record.update(value, GaugeOp::Set)
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("valid", &self.is_valid())
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::hash::path_hash;

    fn record(kind: MetricKind) -> Record {
        let path = "svc.requests";
        Record::new(path, path_hash(path.as_bytes()), kind, Sample::new(kind, None))
    }

    fn totals(sample: &Sample) -> Totals {
        match sample {
            Sample::Adder(t) | Sample::Gauge(t) => *t,
            other => panic!("not a totals sample: {other:?}"),
        }
    }

    #[test]
    fn test_adder_accumulates_and_resets() {
        let record = record(MetricKind::Adder);
        for value in [1.5, 2.5, 6.0] {
            record.update(value, GaugeOp::Set).unwrap();
        }
        record.with_input(|s| {
            assert_eq!(
                totals(s),
                Totals {
                    total: 10.0,
                    count: 3
                }
            )
        });

        let mut processing = record.processing();
        assert_eq!(record.swap(&mut processing), 3);
        assert_eq!(totals(&processing.sample).total, 10.0);
        drop(processing);

        record.with_input(|s| assert_eq!(totals(s), Totals::default()));
    }

    #[test]
    fn test_gauge_operations() {
        let record = record(MetricKind::Gauge);
        record.update(10.0, GaugeOp::Set).unwrap();
        record.update(5.0, GaugeOp::Add).unwrap();
        record.update(3.0, GaugeOp::Subtract).unwrap();
        record.with_input(|s| assert_eq!(totals(s).total, 12.0));

        // The value survives a swap, only the count resets.
        let mut processing = record.processing();
        record.swap(&mut processing);
        assert_eq!(totals(&processing.sample).total, 12.0);
        drop(processing);
        record.with_input(|s| {
            assert_eq!(
                totals(s),
                Totals {
                    total: 12.0,
                    count: 0
                }
            )
        });
    }

    #[test]
    fn test_gauge_relative_on_fresh_record() {
        let record = record(MetricKind::Gauge);
        record.update(5.0, GaugeOp::Subtract).unwrap();
        record.with_input(|s| assert_eq!(totals(s).total, -5.0));
    }

    #[test]
    fn test_stats_chunks() {
        let record = record(MetricKind::Stats);
        for i in 0..(CHUNK_SIZE + 10) {
            record.update(i as f64, GaugeOp::Set).unwrap();
        }

        let mut processing = record.processing();
        assert_eq!(record.swap(&mut processing), (CHUNK_SIZE + 10) as u64);
        let Sample::Stats(points) = &processing.sample else {
            panic!("expected stats sample");
        };
        assert_eq!(points.chunk_count(), 2);

        let mut flat = Vec::new();
        points.flatten_into(&mut flat);
        assert_eq!(flat.len(), CHUNK_SIZE + 10);
        assert_eq!(flat[CHUNK_SIZE], CHUNK_SIZE as f64);
    }

    #[test]
    fn test_non_finite_rejected() {
        let record = record(MetricKind::Adder);
        assert_eq!(
            record.update(f64::NAN, GaugeOp::Set).unwrap_err().to_string(),
            "value NaN is not finite"
        );
        assert!(matches!(
            record.update(f64::INFINITY, GaugeOp::Set),
            Err(UpdateError::NonFinite(_))
        ));
        assert_eq!(record.pending(), 0);
    }

    #[test]
    fn test_empty_tracking() {
        let record = record(MetricKind::Adder);
        let mut processing = record.processing();
        record.swap(&mut processing);
        record.swap(&mut processing);
        assert_eq!(record.empty_ticks(), Some(2));

        record.update(1.0, GaugeOp::Set).unwrap();
        record.swap(&mut processing);
        assert_eq!(record.empty_ticks(), Some(0));

        record.exempt_from_gc();
        record.swap(&mut processing);
        assert_eq!(record.empty_ticks(), None);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let record = Arc::new(record(MetricKind::Adder));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let record = Arc::clone(&record);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        record.update(1.0, GaugeOp::Set).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        record.with_input(|s| {
            assert_eq!(
                totals(s),
                Totals {
                    total: 8000.0,
                    count: 8000
                }
            )
        });
    }
}
