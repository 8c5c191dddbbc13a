//! The aggregation engine: tables, pass workers, synthetics and their threads.

use std::fmt;
use std::io;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};

use crate::barrier::TickBarrier;
use crate::checks::{Check, Checks, MatchConfig, PathMatcher};
use crate::config::{
    EngineConfig, EngineConfigError, GcConfig, HistogramBlockConfig, Threshold, TypeSettings,
};
use crate::gc;
use crate::histogram::HistogramSet;
use crate::output::{Dialect, OutputSink};
use crate::pass::{PassWorker, WorkerStats};
use crate::predict::Predictor;
use crate::protocol::{self, ParseMetricError};
use crate::record::{GaugeOp, MetricKind, Record, Sample, UpdateError};
use crate::statsd::{MetricCounters, MetricTimers};
use crate::synth::{SynthDefinition, SyntheticEngine};
use crate::table::{IdAllocator, PathTable};
use crate::ticker::Ticker;

/// One value per aggregation type.
#[derive(Debug)]
pub(crate) struct PerKind<T>([T; 4]);

impl<T> PerKind<T> {
    fn from_fn(f: impl FnMut(MetricKind) -> T) -> Self {
        Self(MetricKind::ALL.map(f))
    }
}

impl<T> Index<MetricKind> for PerKind<T> {
    type Output = T;

    fn index(&self, kind: MetricKind) -> &T {
        &self.0[kind as usize]
    }
}

impl<T> IndexMut<MetricKind> for PerKind<T> {
    fn index_mut(&mut self, kind: MetricKind) -> &mut T {
        &mut self.0[kind as usize]
    }
}

/// Configuration resolved once at startup and read by every worker.
#[derive(Debug)]
pub(crate) struct Settings {
    pub types: PerKind<TypeSettings>,
    pub period: Duration,
    pub offset: Duration,
    pub sync: bool,
    pub period_secs: f64,
    pub dialect: Dialect,
    pub buffer_size: usize,
    pub thresholds: Vec<Threshold>,
    pub qsort_threshold: usize,
    pub moments_min_points: usize,
    pub mode_min_points: usize,
    pub predict_size: usize,
    pub pmax: u32,
    pub self_stats: bool,
    pub self_prefix: String,
    pub gc: GcConfig,
}

impl Settings {
    fn from_config(config: &EngineConfig) -> Result<Self, EngineConfigError> {
        Ok(Self {
            types: PerKind::from_fn(|kind| config.type_settings(kind)),
            period: config.period(),
            offset: config.offset(),
            sync: config.sync,
            period_secs: config.period().as_secs_f64(),
            dialect: config.dialect,
            buffer_size: config.buffer_size,
            thresholds: config.stats.parse_thresholds()?,
            qsort_threshold: config.stats.qsort_threshold(),
            moments_min_points: config.moments.min_points,
            mode_min_points: config.mode.min_points,
            predict_size: config.predict.size,
            pmax: config.predict.pmax(),
            self_stats: config.self_stats.enable,
            self_prefix: config.self_stats.prefix(),
            gc: config.gc.clone(),
        })
    }
}

/// Matchers of the optional per-path features. `None` if a feature is disabled.
#[derive(Debug, Default)]
struct CheckMatchers {
    moments: Option<PathMatcher>,
    mode: Option<PathMatcher>,
    predict: Option<PathMatcher>,
}

impl CheckMatchers {
    fn from_config(config: &EngineConfig) -> Result<Self, EngineConfigError> {
        let compile = |enable: bool, matching: &MatchConfig| {
            enable.then(|| PathMatcher::new(matching)).transpose()
        };

        Ok(Self {
            moments: compile(config.moments.enable, &config.moments.matching)?,
            mode: compile(config.mode.enable, &config.mode.matching)?,
            predict: compile(config.predict.enable, &config.predict.matching)?,
        })
    }

    fn resolve(&self, kind: MetricKind, path: &str) -> Checks {
        let matches = |m: &Option<PathMatcher>| m.as_ref().is_some_and(|m| m.is_match(path));
        let mut checks = Checks::empty();

        match kind {
            MetricKind::Stats => {
                if matches(&self.moments) {
                    checks.insert(Check::Moments);
                }
                if matches(&self.mode) {
                    checks.insert(Check::Mode);
                }
            }
            MetricKind::Adder => {
                if matches(&self.predict) {
                    checks.insert(Check::Predict);
                }
            }
            MetricKind::Gauge | MetricKind::Histogram => {}
        }

        checks
    }
}

/// State shared by ingestion, pass workers and the synthetic engine.
#[derive(Debug)]
pub(crate) struct Shared {
    pub settings: Settings,
    tables: PerKind<PathTable>,
    ids: IdAllocator,
    histograms: ArcSwap<HistogramSet>,
    matchers: CheckMatchers,
}

impl Shared {
    fn new(config: &EngineConfig) -> Result<Self, EngineConfigError> {
        config.validate()?;
        let settings = Settings::from_config(config)?;
        let tables = PerKind::from_fn(|kind| PathTable::new(kind, settings.types[kind].hash_size));

        Ok(Self {
            tables,
            ids: IdAllocator::new(),
            histograms: ArcSwap::from_pointee(HistogramSet::from_config(&config.histograms)?),
            matchers: CheckMatchers::from_config(config)?,
            settings,
        })
    }

    /// The path table of `kind`.
    pub fn table(&self, kind: MetricKind) -> &PathTable {
        &self.tables[kind]
    }

    fn get_or_create(&self, kind: MetricKind, path: &str) -> Arc<Record> {
        let table = self.table(kind);
        if let Some(record) = table.locate(path) {
            return record;
        }

        let block = match kind {
            MetricKind::Histogram => Some(self.histograms.load().resolve(path)),
            _ => None,
        };

        let (record, created) = table.get_or_insert_with(path, |hash| {
            Record::new(path, hash, kind, Sample::new(kind, block))
        });

        if created {
            self.resolve_extras(&record);
        }

        record
    }

    fn resolve_extras(&self, record: &Record) {
        let checks = self.matchers.resolve(record.kind(), record.path());
        let id = self.ids.allocate();

        if checks.contains(Check::Predict) {
            record.processing().predictor = Some(Predictor::new(self.settings.predict_size));
        }
        record.resolve(id, checks);

        tally_log::trace!(path = record.path(), kind = %record.kind(), id, ?checks, "record created");
        tally_statsd::metric!(
            counter(MetricCounters::RecordsCreated) += 1,
            kind = record.kind().as_str(),
        );
    }

    fn ingest(
        &self,
        kind: MetricKind,
        path: &str,
        value: f64,
        op: GaugeOp,
    ) -> Result<(), UpdateError> {
        if !self.settings.types[kind].enable {
            return Err(UpdateError::Disabled(kind));
        }
        if !value.is_finite() {
            return Err(UpdateError::NonFinite(value));
        }

        self.get_or_create(kind, path).update(value, op)
    }

    fn reconfigure_histograms(
        &self,
        configs: &[HistogramBlockConfig],
    ) -> Result<(), EngineConfigError> {
        let set = Arc::new(HistogramSet::from_config(configs)?);
        self.histograms.store(set.clone());

        let mut retargeted = 0;
        self.table(MetricKind::Histogram).for_each(|record| {
            record.retarget(&set.resolve(record.path()));
            retargeted += 1;
        });

        tally_log::info!(blocks = configs.len(), retargeted, "histogram configuration replaced");
        Ok(())
    }
}

/// Number of points accepted and rejected by [`Ingester::ingest_lines`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IngestStats {
    /// Points applied to a record.
    pub accepted: usize,
    /// Lines or points that were dropped.
    pub rejected: usize,
}

/// A cloneable handle for feeding data points into a running or stopped engine.
#[derive(Clone)]
pub struct Ingester {
    shared: Arc<Shared>,
}

impl Ingester {
    /// Looks up the record of `path` without creating it.
    pub fn locate(&self, kind: MetricKind, path: &str) -> Option<Arc<Record>> {
        self.shared.table(kind).locate(path)
    }

    /// Returns the record of `path`, creating it on first use.
    ///
    /// Pass the handle to the `update_*` functions to apply points without a lookup.
    pub fn get_or_create(&self, kind: MetricKind, path: &str) -> Arc<Record> {
        self.shared.get_or_create(kind, path)
    }

    /// Applies one data point to the record of `path`.
    pub fn ingest(
        &self,
        kind: MetricKind,
        path: &str,
        value: f64,
        op: GaugeOp,
    ) -> Result<(), UpdateError> {
        self.shared.ingest(kind, path, value, op)
    }

    /// Parses statsd lines and applies every valid point.
    ///
    /// Invalid lines and rejected points are logged and counted, they do not stop ingestion.
    pub fn ingest_lines(&self, input: &str) -> IngestStats {
        let mut stats = IngestStats::default();
        let mut accepted = PerKind::from_fn(|_| 0i64);

        for parsed in protocol::parse_all(input) {
            let result = parsed
                .map_err(RejectReason::Parse)
                .and_then(|m| {
                    self.ingest(m.kind, m.path, m.value, m.op)
                        .map(|()| m.kind)
                        .map_err(RejectReason::Update)
                });

            match result {
                Ok(kind) => {
                    accepted[kind] += 1;
                    stats.accepted += 1;
                }
                Err(reason) => {
                    tally_log::debug!(error = &reason as &dyn std::error::Error, "dropped data point");
                    tally_statsd::metric!(
                        counter(MetricCounters::PointsRejected) += 1,
                        reason = reason.tag(),
                    );
                    stats.rejected += 1;
                }
            }
        }

        for kind in MetricKind::ALL {
            tally_statsd::metric!(
                counter(MetricCounters::PointsIngested) += accepted[kind],
                kind = kind.as_str(),
            );
        }
        stats
    }

    /// Marks the record of `path` as removed.
    pub fn remove(&self, kind: MetricKind, path: &str) -> Option<Arc<Record>> {
        self.shared.table(kind).remove(path)
    }
}

impl fmt::Debug for Ingester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingester").finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
enum RejectReason {
    #[error("could not parse line")]
    Parse(#[source] ParseMetricError),
    #[error("could not apply point")]
    Update(#[source] UpdateError),
}

impl RejectReason {
    fn tag(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Update(UpdateError::NonFinite(_)) => "non_finite",
            Self::Update(UpdateError::ChunkAllocation) => "allocation",
            Self::Update(UpdateError::Disabled(_)) => "disabled",
        }
    }
}

/// The aggregation engine.
///
/// An engine either runs ticks on the calling thread through [`tick`](Self::tick), or is
/// [started](Self::start) on its own threads and driven by the wall clock until
/// [shut down](EngineHandle::shutdown).
pub struct Engine {
    shared: Arc<Shared>,
    sink: Arc<dyn OutputSink>,
    workers: PerKind<Vec<PassWorker>>,
    synths: SyntheticEngine,
}

impl Engine {
    /// Builds an engine writing its output to `sink`.
    ///
    /// Fails if any part of the configuration is invalid. Synthetic targets are created right
    /// away.
    pub fn new(config: &EngineConfig, sink: Arc<dyn OutputSink>) -> Result<Self, EngineConfigError> {
        let shared = Arc::new(Shared::new(config)?);

        let mut definitions = Vec::new();
        for (index, synth) in config.synths.iter().enumerate() {
            if let Some(definition) = SynthDefinition::from_config(index, synth)? {
                definitions.push(definition);
            }
        }

        if !definitions.is_empty() && !shared.settings.types[MetricKind::Adder].enable {
            tally_log::warn!(
                count = definitions.len(),
                "adders are disabled, ignoring synthetic definitions"
            );
            definitions.clear();
        }

        let synths =
            SyntheticEngine::new(definitions, |path| shared.get_or_create(MetricKind::Adder, path));

        let workers = PerKind::from_fn(|kind| {
            let settings = &shared.settings.types[kind];
            if !settings.enable {
                return Vec::new();
            }

            (0..settings.threads)
                .map(|id| PassWorker::new(kind, id, settings.threads, &shared, sink.clone()))
                .collect()
        });

        Ok(Self {
            shared,
            sink,
            workers,
            synths,
        })
    }

    /// Returns a handle for ingesting data points.
    pub fn ingester(&self) -> Ingester {
        Ingester {
            shared: self.shared.clone(),
        }
    }

    /// Shorthand for [`Ingester::ingest`].
    pub fn ingest(
        &self,
        kind: MetricKind,
        path: &str,
        value: f64,
        op: GaugeOp,
    ) -> Result<(), UpdateError> {
        self.shared.ingest(kind, path, value, op)
    }

    /// Looks up the record of `path` without creating it.
    pub fn locate(&self, kind: MetricKind, path: &str) -> Option<Arc<Record>> {
        self.shared.table(kind).locate(path)
    }

    /// Returns the record of `path`, creating it on first use.
    pub fn get_or_create(&self, kind: MetricKind, path: &str) -> Arc<Record> {
        self.shared.get_or_create(kind, path)
    }

    /// Marks the record of `path` as removed.
    pub fn remove(&self, kind: MetricKind, path: &str) -> Option<Arc<Record>> {
        self.shared.table(kind).remove(path)
    }

    /// The path table of `kind`.
    pub fn table(&self, kind: MetricKind) -> &PathTable {
        self.shared.table(kind)
    }

    /// Number of synthetic definitions.
    pub fn synth_count(&self) -> usize {
        self.synths.len()
    }

    /// Counters of the last tick of every worker of `kind`, ordered by shard.
    pub fn worker_stats(&self, kind: MetricKind) -> Vec<WorkerStats> {
        self.workers[kind].iter().map(PassWorker::stats).collect()
    }

    /// Replaces the histogram blocks and moves every histogram record onto its new block.
    ///
    /// Bucket counts of the current tick are dropped.
    pub fn reconfigure_histograms(
        &self,
        configs: &[HistogramBlockConfig],
    ) -> Result<(), EngineConfigError> {
        self.shared.reconfigure_histograms(configs)
    }

    /// Runs one complete tick on the calling thread.
    ///
    /// Adders are swapped first, then synthetics computed, then adders reported, followed by the
    /// passes of all other types and garbage collection.
    pub fn tick(&mut self, now_ms: u64) {
        let Self {
            shared,
            workers,
            synths,
            ..
        } = self;

        for worker in &mut workers[MetricKind::Adder] {
            worker.swap_adders(shared, now_ms);
        }

        if !synths.is_empty() {
            tally_statsd::metric!(timer(MetricTimers::SynthDuration), {
                synths.generate(shared.table(MetricKind::Adder))
            });
        }

        for worker in &mut workers[MetricKind::Adder] {
            worker.emit_adders(shared, now_ms);
        }

        for kind in [MetricKind::Gauge, MetricKind::Stats, MetricKind::Histogram] {
            for worker in &mut workers[kind] {
                worker.run(shared, now_ms);
            }
        }

        gc::collect(shared);
    }

    /// Starts all workers on their own threads.
    ///
    /// Every worker ticks on the wall clock. If there are synthetic definitions, adder workers
    /// and the synthetic engine are fenced by a barrier once per tick.
    pub fn start(self) -> io::Result<EngineHandle> {
        let Self {
            shared,
            sink,
            workers,
            synths,
        } = self;

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let adders = workers[MetricKind::Adder].len();
        let barrier =
            (!synths.is_empty() && adders > 0).then(|| Arc::new(TickBarrier::new(adders)));

        let mut handle = EngineHandle {
            shared: shared.clone(),
            sink,
            shutdown: Some(shutdown_tx),
            barrier: barrier.clone(),
            workers: Vec::new(),
            synth: None,
            gc: None,
        };

        if let Err(error) = handle.spawn_all(workers, synths, barrier, shutdown_rx) {
            tally_log::error!(error = &error as &dyn std::error::Error, "could not start engine");
            handle.stop();
            return Err(error);
        }

        tally_log::info!(threads = handle.thread_count(), "engine started");
        Ok(handle)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("workers", &self.workers)
            .field("synths", &self.synths)
            .finish_non_exhaustive()
    }
}

/// A running engine.
pub struct EngineHandle {
    shared: Arc<Shared>,
    sink: Arc<dyn OutputSink>,
    shutdown: Option<Sender<()>>,
    barrier: Option<Arc<TickBarrier>>,
    workers: Vec<JoinHandle<PassWorker>>,
    synth: Option<JoinHandle<SyntheticEngine>>,
    gc: Option<JoinHandle<()>>,
}

impl EngineHandle {
    fn spawn_all(
        &mut self,
        workers: PerKind<Vec<PassWorker>>,
        synths: SyntheticEngine,
        barrier: Option<Arc<TickBarrier>>,
        shutdown: Receiver<()>,
    ) -> io::Result<()> {
        let PerKind(workers) = workers;
        for worker in workers.into_iter().flatten() {
            let fence = match worker.kind() {
                MetricKind::Adder => barrier.clone(),
                _ => None,
            };
            let thread = spawn_worker(worker, self.shared.clone(), fence, shutdown.clone())?;
            self.workers.push(thread);
        }

        match barrier {
            Some(barrier) => self.synth = Some(spawn_synth(synths, self.shared.clone(), barrier)?),
            None => drop(synths),
        }

        if self.shared.settings.gc.enable {
            self.gc = Some(spawn_gc(self.shared.clone(), shutdown)?);
        }

        Ok(())
    }

    fn thread_count(&self) -> usize {
        self.workers.len() + usize::from(self.synth.is_some()) + usize::from(self.gc.is_some())
    }

    fn stop(&mut self) {
        if let Some(barrier) = &self.barrier {
            barrier.close();
        }
        self.shutdown = None;
    }

    /// Returns a handle for ingesting data points.
    pub fn ingester(&self) -> Ingester {
        Ingester {
            shared: self.shared.clone(),
        }
    }

    /// Replaces the histogram blocks of the running engine.
    pub fn reconfigure_histograms(
        &self,
        configs: &[HistogramBlockConfig],
    ) -> Result<(), EngineConfigError> {
        self.shared.reconfigure_histograms(configs)
    }

    /// Stops all threads after their current tick and returns the stopped engine.
    ///
    /// Records and their pending data are kept, so the engine can be ticked manually or
    /// started again.
    pub fn shutdown(mut self) -> Engine {
        self.stop();

        let mut workers = PerKind::from_fn(|_| Vec::new());
        for thread in self.workers.drain(..) {
            match thread.join() {
                Ok(worker) => workers[worker.kind()].push(worker),
                Err(_) => tally_log::error!("pass worker panicked"),
            }
        }

        let synths = match self.synth.take().map(JoinHandle::join) {
            Some(Ok(synths)) => synths,
            Some(Err(_)) => {
                tally_log::error!("synthetic engine panicked, synthetics are lost");
                SyntheticEngine::default()
            }
            None => SyntheticEngine::default(),
        };

        if let Some(Err(_)) = self.gc.take().map(JoinHandle::join) {
            tally_log::error!("garbage collection panicked");
        }

        // Replace workers lost to a panic so every shard is covered again.
        for kind in MetricKind::ALL {
            let settings = &self.shared.settings.types[kind];
            if !settings.enable {
                continue;
            }

            let list = &mut workers[kind];
            for id in 0..settings.threads {
                if !list.iter().any(|w| w.id() == id) {
                    list.push(PassWorker::new(
                        kind,
                        id,
                        settings.threads,
                        &self.shared,
                        self.sink.clone(),
                    ));
                }
            }
            list.sort_by_key(PassWorker::id);
        }

        tally_log::info!("engine stopped");
        Engine {
            shared: self.shared.clone(),
            sink: self.sink.clone(),
            workers,
            synths,
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("threads", &self.thread_count())
            .finish_non_exhaustive()
    }
}

fn spawn_worker(
    mut worker: PassWorker,
    shared: Arc<Shared>,
    barrier: Option<Arc<TickBarrier>>,
    shutdown: Receiver<()>,
) -> io::Result<JoinHandle<PassWorker>> {
    thread::Builder::new().name(worker.name()).spawn(move || {
        let settings = &shared.settings;
        let mut ticker = Ticker::new(settings.period, settings.offset, settings.sync);

        while let Some(now_ms) = ticker.wait(&shutdown) {
            let Some(barrier) = &barrier else {
                worker.run(&shared, now_ms);
                continue;
            };

            worker.swap_adders(&shared, now_ms);
            let released = barrier.arrive();
            worker.emit_adders(&shared, now_ms);
            if !released {
                break;
            }
        }

        tally_log::debug!(worker = worker.name(), "pass worker stopped");
        worker
    })
}

fn spawn_synth(
    mut synths: SyntheticEngine,
    shared: Arc<Shared>,
    barrier: Arc<TickBarrier>,
) -> io::Result<JoinHandle<SyntheticEngine>> {
    thread::Builder::new().name("synth".to_owned()).spawn(move || {
        let adders = shared.table(MetricKind::Adder);

        while barrier.release_after(|| {
            tally_statsd::metric!(timer(MetricTimers::SynthDuration), {
                synths.generate(adders)
            });
        }) {}

        tally_log::debug!("synthetic engine stopped");
        synths
    })
}

fn spawn_gc(shared: Arc<Shared>, shutdown: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("gc".to_owned()).spawn(move || {
        let settings = &shared.settings;
        let mut ticker = Ticker::new(settings.period, settings.offset, settings.sync);

        while ticker.wait(&shutdown).is_some() {
            gc::collect(&shared);
        }
    })
}
