use crate::checks::Check;
use crate::engine::Shared;
use crate::record::{MetricKind, Sample, Totals};

use super::PassWorker;

impl PassWorker {
    /// Swaps every adder of the shard and substitutes predictions for idle predicted paths.
    pub(super) fn swap_shard(&mut self, shared: &Shared) {
        let pmax = shared.settings.pmax;

        shared
            .table(MetricKind::Adder)
            .for_each_in_shard(self.id, self.shards, |record| {
                let mut processing = record.processing();
                if record.swap(&mut processing) > 0 {
                    return;
                }

                let substitute = processing
                    .predictor
                    .as_mut()
                    .and_then(|predictor| predictor.substitute(pmax));

                if let Some(total) = substitute {
                    tally_log::trace!(path = record.path(), total, "using predicted value");
                    processing.sample = Sample::Adder(Totals { total, count: 1 });
                }
            });
    }

    /// Reports every adder of the shard, idle ones with a value of zero.
    pub(super) fn emit_shard(&mut self, shared: &Shared, now_ms: u64) {
        let settings = &shared.settings;
        let prefix = &settings.types[MetricKind::Adder].prefix;
        let ts = now_ms as f64 / 1000.0;
        let next_ts = ts + settings.period_secs;
        let pmax = settings.pmax;

        let Self {
            id,
            shards,
            out,
            stats,
            ..
        } = self;

        shared
            .table(MetricKind::Adder)
            .for_each_in_shard(*id, *shards, |record| {
                let mut processing = record.processing();
                let Sample::Adder(totals) = processing.sample else {
                    return;
                };
                stats.record(totals.count);

                let path = record.path();
                let predictor = processing
                    .predictor
                    .as_mut()
                    .filter(|_| record.checks().contains(Check::Predict));

                let Some(predictor) = predictor else {
                    out.push(format_args!("{prefix}{path}"), totals.total);
                    return;
                };

                out.push(format_args!("{prefix}{path}.input"), totals.total);
                let Some(forecast) = predictor.observe(ts, totals.total, next_ts, pmax) else {
                    return;
                };

                if let Some(diff) = forecast.diff {
                    out.push(format_args!("{prefix}{path}.diff"), diff);
                }
                out.push_with_precision(format_args!("{prefix}{path}.lr_a"), forecast.line.a, 10);
                out.push_with_precision(format_args!("{prefix}{path}.lr_b"), forecast.line.b, 10);
                out.push(format_args!("{prefix}{path}.fit"), forecast.line.fit);
                out.push(format_args!("{prefix}{path}.predict"), forecast.prediction);
                stats.predictions += 1;
            });
    }
}
