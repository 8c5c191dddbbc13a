//! Collection of records that stopped receiving data.

use crate::engine::Shared;
use crate::record::MetricKind;
use crate::statsd::{MetricCounters, MetricGauges, MetricTimers};

/// Removes records idle for longer than their type's threshold and unlinks invalid records.
///
/// Returns the number of unlinked records. Synthetic targets and sources never expire.
pub(crate) fn collect(shared: &Shared) -> usize {
    let gc = &shared.settings.gc;
    if !gc.enable {
        return 0;
    }

    tally_statsd::metric!(timer(MetricTimers::GcDuration), {
        let mut total = 0;

        for kind in MetricKind::ALL {
            let threshold = gc.threshold_for(kind);
            let table = shared.table(kind);
            let removed =
                table.collect(|record| record.empty_ticks().is_some_and(|idle| idle > threshold));

            for record in &removed {
                tally_log::debug!(path = record.path(), %kind, "removed idle record");
            }

            total += removed.len();
            tally_statsd::metric!(
                counter(MetricCounters::RecordsCollected) += removed.len() as i64,
                kind = kind.as_str(),
            );
            tally_statsd::metric!(
                gauge(MetricGauges::TableSize) = table.len() as u64,
                kind = kind.as_str(),
            );
        }

        total
    })
}
