//! The tally daemon.
//!
//! Reads statsd style lines from standard input, aggregates them into adders, gauges, stats and
//! histograms, and writes the aggregated values to standard output once per period.
//!
//! ```text
//! tally --config .tally run
//! tally config show --format debug
//! ```
//!
//! Configuration is read from `config.yml` in the config folder. See `tally_config` for the
//! available options and `tally_metrics::protocol` for the accepted input format.

mod cli;
mod cliapp;
mod ingest;
mod setup;

use std::process;

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tally_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
