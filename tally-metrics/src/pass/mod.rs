//! Per-tick swap, compute and emit over one shard of a path table.
//!
//! Every aggregation type runs a fixed number of [`PassWorker`]s. Worker `id` of `n` owns the
//! buckets whose index is `id` modulo `n`, so it is the only thread touching the processing side
//! of its records and computes without contention. Adder workers split their pass in two around
//! the synthetic engine; all other types run straight through.

mod adder;
mod gauge;
mod histogram;
mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::Shared;
use crate::output::{LineBuffer, OutputSink};
use crate::record::MetricKind;
use crate::sort::SortWorkspace;
use crate::statsd::{MetricGauges, MetricTimers};

/// Counters of one worker for the last tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WorkerStats {
    /// Records that had data.
    pub active: u64,
    /// Data points processed.
    pub points: u64,
    /// Largest number of points in a single record.
    pub highest: u64,
    /// Forecasts computed.
    pub predictions: u64,
    /// Capacity of the sort buffers in samples.
    pub workspace: usize,
    /// Time from the start of the swap to the last emitted line.
    pub duration: Duration,
}

impl WorkerStats {
    fn record(&mut self, points: u64) {
        if points > 0 {
            self.active += 1;
            self.points += points;
            self.highest = self.highest.max(points);
        }
    }
}

/// A worker processing one shard of one aggregation type.
#[derive(Debug)]
pub struct PassWorker {
    kind: MetricKind,
    id: usize,
    shards: usize,
    out: LineBuffer,
    stats: WorkerStats,
    started: Option<Instant>,
    flat: Vec<f64>,
    workspace: SortWorkspace,
}

impl PassWorker {
    /// Creates worker `id` of `shards` for `kind`.
    pub(crate) fn new(
        kind: MetricKind,
        id: usize,
        shards: usize,
        shared: &Shared,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let settings = &shared.settings;
        Self {
            kind,
            id,
            shards,
            out: LineBuffer::new(sink, settings.dialect, settings.buffer_size),
            stats: WorkerStats::default(),
            started: None,
            flat: Vec::new(),
            workspace: SortWorkspace::new(),
        }
    }

    /// The aggregation type.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Index of the shard.
    pub fn id(&self) -> usize {
        self.id
    }

    /// A name for threads and logs, such as `stats-3`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.kind, self.id)
    }

    /// Counters of the last completed tick.
    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    fn begin(&mut self, now_ms: u64) {
        self.stats = WorkerStats::default();
        self.started = Some(Instant::now());
        self.out.set_timestamp(now_ms / 1000);
    }

    fn finish(&mut self, shared: &Shared) {
        let duration = self.started.take().map(|s| s.elapsed()).unwrap_or_default();
        self.stats.duration = duration;
        self.stats.workspace = self.workspace.capacity().max(self.flat.capacity());

        if shared.settings.self_stats {
            self.emit_self_stats(&shared.settings.self_prefix);
        }
        self.out.flush();

        let kind = self.kind.as_str();
        tally_statsd::metric!(timer(MetricTimers::PassDuration) = duration, kind = kind);
        tally_statsd::metric!(
            gauge(MetricGauges::ActiveRecords) = self.stats.active,
            kind = kind,
            worker = &self.id.to_string(),
        );
    }

    fn emit_self_stats(&mut self, prefix: &str) {
        let WorkerStats {
            active,
            points,
            highest,
            predictions,
            workspace,
            duration,
        } = self.stats;
        let (kind, id) = (self.kind, self.id);

        self.out.push(format_args!("{prefix}{kind}.{id}.active"), active as f64);
        self.out.push(format_args!("{prefix}{kind}.{id}.points"), points as f64);
        self.out.push(format_args!("{prefix}{kind}.{id}.highest"), highest as f64);
        match kind {
            MetricKind::Stats => {
                self.out.push(format_args!("{prefix}{kind}.{id}.workspace"), workspace as f64)
            }
            MetricKind::Adder => self.out.push(
                format_args!("{prefix}{kind}.{id}.predictions"),
                predictions as f64,
            ),
            _ => {}
        }
        self.out.push(
            format_args!("{prefix}{kind}.{id}.usec"),
            duration.as_micros() as f64,
        );
    }

    /// Runs a complete pass for gauges, stats or histograms.
    ///
    /// Adder passes are split around the synthetic engine and use
    /// [`swap_adders`](Self::swap_adders) and [`emit_adders`](Self::emit_adders) instead.
    pub(crate) fn run(&mut self, shared: &Shared, now_ms: u64) {
        self.begin(now_ms);
        match self.kind {
            MetricKind::Adder => {
                self.swap_shard(shared);
                self.emit_shard(shared, now_ms);
            }
            MetricKind::Gauge => self.gauge_pass(shared),
            MetricKind::Stats => self.stats_pass(shared),
            MetricKind::Histogram => self.histogram_pass(shared),
        }
        self.finish(shared);
    }

    /// First half of an adder pass: swaps the shard.
    pub(crate) fn swap_adders(&mut self, shared: &Shared, now_ms: u64) {
        self.begin(now_ms);
        self.swap_shard(shared);
    }

    /// Second half of an adder pass: reports the shard.
    pub(crate) fn emit_adders(&mut self, shared: &Shared, now_ms: u64) {
        self.emit_shard(shared, now_ms);
        self.finish(shared);
    }
}
