//! Helpers shared by the test suites of the tally crates.

use bytes::Bytes;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate and mutes all other logs.
pub fn setup() {
    tally_log::init_test!();
}

/// Concatenates emitted output buffers into one string.
///
/// Output buffers are handed off whenever they fill up, so a single tick may span several of
/// them. Invalid UTF-8 is replaced rather than rejected.
pub fn join_buffers<'a, I>(buffers: I) -> String
where
    I: IntoIterator<Item = &'a Bytes>,
{
    buffers
        .into_iter()
        .map(|buffer| String::from_utf8_lossy(buffer))
        .collect()
}

/// Returns the emitted lines sorted, for assertions independent of shard order.
pub fn sorted_lines(output: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = output.lines().collect();
    lines.sort_unstable();
    lines
}
