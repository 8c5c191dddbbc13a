use tally_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Counter metrics of the aggregation engine.
pub enum MetricCounters {
    /// Incremented for every data point from parsed input lines that was applied to a record.
    ///
    /// Points applied directly through `ingest` or the `update_*` functions are not counted.
    /// Tagged by `kind`.
    PointsIngested,

    /// Incremented for every point rejected before reaching a record.
    ///
    /// Tagged by `reason`.
    PointsRejected,

    /// Incremented every time a record is created.
    ///
    /// Tagged by `kind`.
    RecordsCreated,

    /// Incremented when a stats chunk could not be allocated and a point was dropped.
    ChunkAllocationFailed,

    /// Number of synthetic targets written in a tick.
    SynthsGenerated,

    /// Records unlinked by garbage collection.
    ///
    /// Tagged by `kind`.
    RecordsCollected,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::PointsIngested => "engine.points.ingested",
            Self::PointsRejected => "engine.points.rejected",
            Self::RecordsCreated => "engine.records.created",
            Self::ChunkAllocationFailed => "engine.chunk.allocation_failed",
            Self::SynthsGenerated => "engine.synths.generated",
            Self::RecordsCollected => "engine.records.collected",
        }
    }
}

/// Gauge metrics of the aggregation engine.
pub enum MetricGauges {
    /// Records reported by one pass worker in the last tick.
    ///
    /// Tagged by `kind` and `worker`.
    ActiveRecords,

    /// Records linked in a path table, including invalid ones not yet collected.
    ///
    /// Tagged by `kind`.
    TableSize,
}

impl GaugeMetric for MetricGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::ActiveRecords => "engine.records.active",
            Self::TableSize => "engine.table.size",
        }
    }
}

/// Timer metrics of the aggregation engine.
pub enum MetricTimers {
    /// Duration of one pass over a shard, from swap to the last emitted line.
    ///
    /// Tagged by `kind`.
    PassDuration,

    /// Duration of evaluating all synthetic metrics.
    SynthDuration,

    /// Duration of a garbage collection run over all tables.
    GcDuration,
}

impl TimerMetric for MetricTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::PassDuration => "engine.pass.duration",
            Self::SynthDuration => "engine.synths.duration",
            Self::GcDuration => "engine.gc.duration",
        }
    }
}
