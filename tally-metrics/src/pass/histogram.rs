use crate::engine::Shared;
use crate::record::{MetricKind, Sample};

use super::PassWorker;

impl PassWorker {
    /// Swaps every histogram of the shard and reports those with data.
    pub(super) fn histogram_pass(&mut self, shared: &Shared) {
        let prefix = &shared.settings.types[MetricKind::Histogram].prefix;
        let Self {
            id,
            shards,
            out,
            stats,
            ..
        } = self;

        shared
            .table(MetricKind::Histogram)
            .for_each_in_shard(*id, *shards, |record| {
                let mut processing = record.processing();
                let points = record.swap(&mut processing);
                if points == 0 {
                    return;
                }
                stats.record(points);

                let Sample::Histogram(counts) = &processing.sample else {
                    return;
                };

                let path = record.path();
                let bounds = counts.block().bounds();
                for (i, (bound, count)) in bounds.iter().zip(counts.counts()).enumerate() {
                    out.push(format_args!("{prefix}{path}.{i}.bound"), *bound);
                    out.push(format_args!("{prefix}{path}.{i}.count"), *count as f64);
                }

                let overflow = counts.counts().last().copied().unwrap_or_default();
                out.push(format_args!("{prefix}{path}.inf.count"), overflow as f64);
                out.push(format_args!("{prefix}{path}.total"), counts.count() as f64);
            });
    }
}
