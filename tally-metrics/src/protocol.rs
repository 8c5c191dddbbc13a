//! Parser for statsd style text lines.
//!
//! A line has the form `path:value|type[|@rate]`:
//!
//! - `c`: adder. The value is scaled by `1 / rate` if a sample rate is given.
//! - `g`: gauge. A leading `+` or `-` adjusts the current value instead of setting it.
//! - `ms` or `h`: stats sample.
//! - `hg`: histogram sample.
//!
//! ```
//! use tally_metrics::{GaugeOp, MetricKind, protocol};
//!
//! let metric = protocol::parse_line("queue.depth:-3|g").unwrap();
//! assert_eq!(metric.kind, MetricKind::Gauge);
//! assert_eq!(metric.op, GaugeOp::Subtract);
//! assert_eq!(metric.value, 3.0);
//! ```

use crate::record::{GaugeOp, MetricKind};

/// A parsed data point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParsedMetric<'a> {
    /// The metric path.
    pub path: &'a str,
    /// The aggregation type selected by the type field.
    pub kind: MetricKind,
    /// The value, already scaled by the sample rate.
    pub value: f64,
    /// How a gauge value applies. Always [`GaugeOp::Set`] for other types.
    pub op: GaugeOp,
}

/// A line that could not be parsed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseMetricError {
    /// The line has no `:` separating path and value.
    #[error("missing value separator")]
    MissingValue,
    /// The path before the `:` is empty.
    #[error("empty metric path")]
    EmptyPath,
    /// The line has no `|` type field.
    #[error("missing metric type")]
    MissingType,
    /// The type field is not one of `c`, `g`, `ms`, `h` or `hg`.
    #[error("unknown metric type {0:?}")]
    UnknownType(String),
    /// The value is not a number.
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    /// The value is NaN or infinite.
    #[error("value {0:?} is not finite")]
    NonFinite(String),
    /// The sample rate is not a number in `(0, 1]`.
    #[error("invalid sample rate {0:?}")]
    InvalidRate(String),
}

fn parse_kind(ty: &str) -> Result<MetricKind, ParseMetricError> {
    match ty {
        "c" => Ok(MetricKind::Adder),
        "g" => Ok(MetricKind::Gauge),
        "ms" | "h" => Ok(MetricKind::Stats),
        "hg" => Ok(MetricKind::Histogram),
        other => Err(ParseMetricError::UnknownType(other.to_owned())),
    }
}

fn parse_rate<'a>(fields: impl Iterator<Item = &'a str>) -> Result<f64, ParseMetricError> {
    let mut rate = 1.0;

    for field in fields {
        // Tags and other extensions are ignored.
        let Some(raw) = field.strip_prefix('@') else {
            continue;
        };

        rate = raw
            .parse::<f64>()
            .ok()
            .filter(|r| *r > 0.0 && *r <= 1.0)
            .ok_or_else(|| ParseMetricError::InvalidRate(raw.to_owned()))?;
    }

    Ok(rate)
}

/// Parses a single line without its line terminator.
pub fn parse_line(line: &str) -> Result<ParsedMetric<'_>, ParseMetricError> {
    let (path, rest) = line.split_once(':').ok_or(ParseMetricError::MissingValue)?;
    if path.is_empty() {
        return Err(ParseMetricError::EmptyPath);
    }

    let mut fields = rest.split('|');
    let raw_value = fields.next().unwrap_or_default();
    let kind = parse_kind(fields.next().ok_or(ParseMetricError::MissingType)?)?;
    let rate = parse_rate(fields)?;

    let (op, digits) = match (kind, raw_value.as_bytes().first()) {
        (MetricKind::Gauge, Some(b'+')) => (GaugeOp::Add, &raw_value[1..]),
        (MetricKind::Gauge, Some(b'-')) => (GaugeOp::Subtract, &raw_value[1..]),
        _ => (GaugeOp::Set, raw_value),
    };

    let value = digits
        .parse::<f64>()
        .map_err(|_| ParseMetricError::InvalidValue(raw_value.to_owned()))?;
    if !value.is_finite() {
        return Err(ParseMetricError::NonFinite(raw_value.to_owned()));
    }

    let value = match kind {
        MetricKind::Adder => value / rate,
        _ => value,
    };

    Ok(ParsedMetric {
        path,
        kind,
        value,
        op,
    })
}

/// Parses all lines of `input`, skipping empty lines.
///
/// Both `\n` and `\r\n` terminate a line. Errors are yielded in place and do not stop iteration.
pub fn parse_all(input: &str) -> impl Iterator<Item = Result<ParsedMetric<'_>, ParseMetricError>> {
    input
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(parse_line)
}
