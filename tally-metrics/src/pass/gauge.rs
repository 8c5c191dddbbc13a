use crate::engine::Shared;
use crate::record::{MetricKind, Sample};

use super::PassWorker;

impl PassWorker {
    /// Swaps and reports every gauge of the shard.
    ///
    /// Gauges keep their value between ticks, so idle gauges repeat their last value.
    pub(super) fn gauge_pass(&mut self, shared: &Shared) {
        let prefix = &shared.settings.types[MetricKind::Gauge].prefix;
        let Self {
            id,
            shards,
            out,
            stats,
            ..
        } = self;

        shared
            .table(MetricKind::Gauge)
            .for_each_in_shard(*id, *shards, |record| {
                let mut processing = record.processing();
                let points = record.swap(&mut processing);
                stats.record(points);

                if let Sample::Gauge(totals) = processing.sample {
                    let path = record.path();
                    out.push(format_args!("{prefix}{path}"), totals.total);
                }
            });
    }
}
