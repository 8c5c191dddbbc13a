use crate::checks::Check;
use crate::engine::Shared;
use crate::maths::{KahanSum, Mode, Moments, fraction_index};
use crate::record::{MetricKind, Sample};
use crate::sort::sort_ascending;

use super::PassWorker;

impl PassWorker {
    /// Swaps every timer of the shard, sorts the samples of those with data and reports them.
    pub(super) fn stats_pass(&mut self, shared: &Shared) {
        let settings = &shared.settings;
        let prefix = &settings.types[MetricKind::Stats].prefix;
        let Self {
            id,
            shards,
            out,
            stats,
            flat,
            workspace,
            ..
        } = self;

        shared
            .table(MetricKind::Stats)
            .for_each_in_shard(*id, *shards, |record| {
                {
                    let mut processing = record.processing();
                    if record.swap(&mut processing) == 0 {
                        return;
                    }
                    let Sample::Stats(points) = &processing.sample else {
                        return;
                    };
                    points.flatten_into(flat);
                }

                let count = flat.len();
                stats.record(count as u64);
                sort_ascending(flat, settings.qsort_threshold, workspace);

                let path = record.path();
                let sum = flat.iter().copied().collect::<KahanSum>().total();
                let mean = sum / count as f64;
                let lower = flat[0];
                let upper = flat[count - 1];

                out.push(format_args!("{prefix}{path}.count"), count as f64);
                out.push(format_args!("{prefix}{path}.sum"), sum);
                out.push(format_args!("{prefix}{path}.mean"), mean);
                out.push(format_args!("{prefix}{path}.upper"), upper);
                out.push(format_args!("{prefix}{path}.lower"), lower);
                out.push(
                    format_args!("{prefix}{path}.median"),
                    flat[fraction_index(count, 1, 2)],
                );
                out.push(format_args!("{prefix}{path}.spread"), upper - lower);

                for threshold in &settings.thresholds {
                    let value = flat[fraction_index(count, threshold.value, threshold.max)];
                    out.push(format_args!("{prefix}{path}.{threshold}"), value);
                }

                let checks = record.checks();
                if checks.contains(Check::Moments) && count >= settings.moments_min_points {
                    if let Some(moments) = Moments::compute(flat, mean) {
                        out.push(format_args!("{prefix}{path}.stddev"), moments.stddev);
                        out.push(format_args!("{prefix}{path}.skewness"), moments.skewness);
                        out.push(format_args!("{prefix}{path}.kurtosis"), moments.kurtosis);
                    }
                }

                if checks.contains(Check::Mode) && count >= settings.mode_min_points {
                    if let Some(mode) = Mode::find(flat) {
                        out.push(format_args!("{prefix}{path}.mode"), mode.value);
                        out.push(format_args!("{prefix}{path}.mode_ct"), mode.count as f64);
                    }
                }
            });
    }
}
