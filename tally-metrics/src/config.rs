use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checks::MatchConfig;
use crate::output::Dialect;
use crate::record::MetricKind;
use crate::sort::{DEFAULT_QSORT_THRESHOLD, MIN_QSORT_THRESHOLD};

/// Maximum number of stats thresholds.
pub const MAX_THRESHOLDS: usize = 20;

/// Maximum number of bounds in a histogram block.
pub const MAX_HISTOGRAM_BOUNDS: usize = 10;

/// Maximum number of histogram blocks.
pub const MAX_HISTOGRAM_BLOCKS: usize = 64;

/// Valid range of the prediction history size.
pub const PREDICT_SIZE_RANGE: std::ops::RangeInclusive<usize> = 10..=500;

/// An error validating the [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum EngineConfigError {
    /// A whitelist or blacklist pattern does not compile.
    #[error("invalid regex {pattern:?}")]
    InvalidRegex {
        /// The pattern as configured.
        pattern: String,
        /// The compile error.
        #[source]
        source: regex::Error,
    },
    /// A synthetic definition lacks a required field.
    #[error("synthetic definition #{index} has no {field}")]
    IncompleteSynthetic {
        /// Position of the definition in the config.
        index: usize,
        /// The missing field.
        field: &'static str,
    },
    /// The operation name of a synthetic definition is not known.
    #[error("synthetic {target}: unknown operation {operation:?}")]
    UnknownOperation {
        /// The target path of the definition.
        target: String,
        /// The configured name.
        operation: String,
    },
    /// A synthetic definition has fewer sources than its operation needs.
    #[error("synthetic {target} does not have enough sources (needs {min}, has {parts})")]
    TooFewSources {
        /// The target path of the definition.
        target: String,
        /// The minimum for the operation.
        min: usize,
        /// The configured number of sources.
        parts: usize,
    },
    /// A synthetic definition has more sources than supported.
    #[error("synthetic {target} has {parts} sources, at most 32 are supported")]
    TooManySources {
        /// The target path of the definition.
        target: String,
        /// The configured number of sources.
        parts: usize,
    },
    /// A stats threshold cannot be parsed or is out of range.
    #[error("invalid threshold {threshold:?}: {reason}")]
    InvalidThreshold {
        /// The threshold as configured.
        threshold: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// More thresholds than supported.
    #[error("{0} thresholds configured, at most 20 are allowed")]
    TooManyThresholds(usize),
    /// A histogram block is malformed.
    #[error("histogram block {name:?}: {reason}")]
    InvalidHistogram {
        /// Name of the block.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// More histogram blocks than supported.
    #[error("{0} histogram blocks configured, at most 64 are allowed")]
    TooManyHistograms(usize),
    /// The prediction history size is outside of its range.
    #[error("prediction size {0} is outside of 10..=500")]
    PredictSize(usize),
    /// The tick period is zero.
    #[error("the tick period must be positive")]
    ZeroPeriod,
}

/// Worker and table settings of one aggregation type.
///
/// Unset fields fall back to per-type defaults, see [`TypeSettings`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TypeConfig {
    /// Whether records of this type are reported.
    ///
    /// Defaults to `true`.
    pub enable: bool,

    /// Number of pass worker threads.
    ///
    /// Defaults to `6` for stats and `2` for all other types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    /// Path prefix of emitted lines.
    ///
    /// Defaults to `stats.timers.` for stats, `stats.histograms.` for histograms and an empty
    /// prefix otherwise. A trailing `.` is added to non-empty prefixes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Number of buckets in the path table.
    ///
    /// Defaults to `100003`, and `5003` for histograms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_size: Option<usize>,
}

impl Default for TypeConfig {
    fn default() -> Self {
        Self {
            enable: true,
            threads: None,
            prefix: None,
            hash_size: None,
        }
    }
}

impl TypeConfig {
    /// Resolves the configured values against the defaults of `kind`.
    pub fn resolve(&self, kind: MetricKind) -> TypeSettings {
        let (threads, prefix, hash_size) = match kind {
            MetricKind::Adder | MetricKind::Gauge => (2, "", 100_003),
            MetricKind::Stats => (6, "stats.timers.", 100_003),
            MetricKind::Histogram => (2, "stats.histograms.", 5_003),
        };

        TypeSettings {
            kind,
            enable: self.enable,
            threads: self.threads.unwrap_or(threads).max(1),
            prefix: normalize_prefix(self.prefix.as_deref().unwrap_or(prefix)),
            hash_size: self.hash_size.unwrap_or(hash_size).max(1),
        }
    }
}

/// Resolved settings of one aggregation type.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeSettings {
    /// The aggregation type.
    pub kind: MetricKind,
    /// Whether records are reported.
    pub enable: bool,
    /// Number of pass workers, at least one.
    pub threads: usize,
    /// Path prefix, empty or ending in `.`.
    pub prefix: String,
    /// Number of table buckets.
    pub hash_size: usize,
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('.') {
        prefix.to_owned()
    } else {
        format!("{prefix}.")
    }
}

/// Stats specific settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    /// Worker and table settings.
    #[serde(flatten)]
    pub base: TypeConfig,

    /// Comma separated percentiles to report, entries ending in `m` are per-mille.
    ///
    /// Defaults to `"90,99"`.
    pub thresholds: String,

    /// Batches with at least this many samples are radix sorted.
    ///
    /// Defaults to `10000`. Lower values are raised to `2048`.
    pub qsort_threshold: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            base: TypeConfig::default(),
            thresholds: "90,99".to_owned(),
            qsort_threshold: DEFAULT_QSORT_THRESHOLD,
        }
    }
}

impl StatsConfig {
    /// Parses the configured thresholds.
    pub fn parse_thresholds(&self) -> Result<Vec<Threshold>, EngineConfigError> {
        let thresholds = self
            .thresholds
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Threshold>, _>>()?;

        if thresholds.len() > MAX_THRESHOLDS {
            return Err(EngineConfigError::TooManyThresholds(thresholds.len()));
        }

        Ok(thresholds)
    }

    /// The effective sort threshold.
    pub fn qsort_threshold(&self) -> usize {
        if self.qsort_threshold < MIN_QSORT_THRESHOLD {
            tally_log::warn!(
                configured = self.qsort_threshold,
                "sort threshold raised to the minimum of {MIN_QSORT_THRESHOLD}"
            );
            MIN_QSORT_THRESHOLD
        } else {
            self.qsort_threshold
        }
    }
}

/// A percentile reported for stats records.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Threshold {
    /// The numerator of the fraction.
    pub value: usize,
    /// `100` for percent, `1000` for per-mille.
    pub max: usize,
    /// Suffix of the emitted line, such as `upper_90` or `lower_005`.
    pub label: String,
}

impl FromStr for Threshold {
    type Err = EngineConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| EngineConfigError::InvalidThreshold {
            threshold: s.to_owned(),
            reason,
        };

        let (digits, max) = match s.strip_suffix('m') {
            Some(digits) => (digits, 1000),
            None => (s, 100),
        };
        let value: usize = digits.parse().map_err(|_| invalid("not a number"))?;
        let mid = max / 2;

        if value == 0 || value >= max {
            return Err(invalid("must be between zero and the top"));
        }
        if value == mid {
            return Err(invalid("the median is always reported"));
        }

        let side = if value < mid { "lower" } else { "upper" };
        let label = if max == 1000 {
            format!("{side}_{value:03}")
        } else {
            format!("{side}_{value:02}")
        };

        Ok(Self { value, max, label })
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Settings of an optional stats feature.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CheckConfig {
    /// Enables the feature for matching paths.
    ///
    /// Defaults to `false`.
    pub enable: bool,

    /// Minimum number of samples in a tick for the feature to report.
    ///
    /// Defaults to `30`.
    pub min_points: usize,

    /// Which paths the feature applies to.
    #[serde(flatten)]
    pub matching: MatchConfig,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            enable: false,
            min_points: 30,
            matching: MatchConfig::default(),
        }
    }
}

/// Settings of the adder value predictor.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PredictConfig {
    /// Enables prediction for matching adder paths.
    ///
    /// Defaults to `false`.
    pub enable: bool,

    /// Number of ticks in the history.
    ///
    /// Defaults to `30`. Must be within `10..=500`.
    pub size: usize,

    /// Which paths are predicted.
    #[serde(flatten)]
    pub matching: MatchConfig,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            enable: false,
            size: 30,
            matching: MatchConfig::default(),
        }
    }
}

impl PredictConfig {
    /// Maximum number of consecutive substituted predictions.
    pub fn pmax(&self) -> u32 {
        (self.size / 3) as u32
    }
}

/// A named set of histogram bucket bounds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HistogramBlockConfig {
    /// Name for diagnostics.
    pub name: String,

    /// Disabled blocks never match.
    ///
    /// Defaults to `true`.
    pub enable: bool,

    /// Marks the block used for paths no block matches.
    ///
    /// Defaults to `false`. Without a marked default, the first enabled block is used.
    pub default: bool,

    /// Ascending upper bounds of the buckets. At most ten.
    pub bounds: Vec<f64>,

    /// Which paths use this block.
    #[serde(flatten)]
    pub matching: MatchConfig,
}

impl Default for HistogramBlockConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enable: true,
            default: false,
            bounds: Vec::new(),
            matching: MatchConfig::default(),
        }
    }
}

/// A derived adder metric.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SynthConfig {
    /// Path of the derived record.
    pub target: String,

    /// Paths of the adder records the value is computed from, in order.
    pub source: Vec<String>,

    /// Name of the operation, such as `sum` or `meanIf`.
    pub operation: String,

    /// Scale applied to the result.
    ///
    /// Defaults to `1.0`.
    pub factor: f64,

    /// How many sources may have no data before the target is skipped for a tick.
    ///
    /// Unset or negative values select the operation's default, which for some operations is
    /// relative to the number of sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_absent: Option<i32>,

    /// Disabled definitions are dropped at startup.
    ///
    /// Defaults to `true`.
    pub enable: bool,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            source: Vec::new(),
            operation: String::new(),
            factor: 1.0,
            max_absent: None,
            enable: true,
        }
    }
}

/// Collection of idle records.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GcConfig {
    /// Enables collection.
    ///
    /// Defaults to `true`.
    pub enable: bool,

    /// Ticks without data after which a record is removed.
    ///
    /// Defaults to `8640`.
    pub threshold: u64,

    /// Ticks without data after which a gauge is removed.
    ///
    /// Defaults to `25920`.
    pub gauge_threshold: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enable: true,
            threshold: 8640,
            gauge_threshold: 25920,
        }
    }
}

impl GcConfig {
    /// The threshold for records of `kind`.
    pub fn threshold_for(&self, kind: MetricKind) -> u64 {
        match kind {
            MetricKind::Gauge => self.gauge_threshold,
            _ => self.threshold,
        }
    }
}

/// Self stats settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SelfStatsConfig {
    /// Emits per worker statistics every tick.
    ///
    /// Defaults to `true`.
    pub enable: bool,

    /// Prefix of the emitted lines.
    ///
    /// Defaults to `self.tally.`.
    pub prefix: String,
}

impl Default for SelfStatsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            prefix: "self.tally.".to_owned(),
        }
    }
}

impl SelfStatsConfig {
    /// The prefix with a trailing `.`.
    pub fn prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }
}

/// Configuration of the aggregation engine.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Tick period in milliseconds.
    ///
    /// Defaults to `10000`.
    pub period_ms: u64,

    /// Offset of ticks within the period in milliseconds.
    ///
    /// Defaults to `0`.
    pub offset_ms: u64,

    /// Aligns ticks to multiples of the period on the wall clock.
    ///
    /// Defaults to `true`.
    pub sync: bool,

    /// Format of emitted lines.
    pub dialect: Dialect,

    /// Output buffers are handed off once they reach this many bytes.
    ///
    /// Defaults to `32768`.
    pub buffer_size: usize,

    /// Counter settings.
    pub adder: TypeConfig,
    /// Gauge settings.
    pub gauge: TypeConfig,
    /// Timer settings.
    pub stats: StatsConfig,
    /// Histogram settings.
    pub histo: TypeConfig,
    /// Self stats settings.
    pub self_stats: SelfStatsConfig,

    /// Standard deviation, skewness and kurtosis for stats paths.
    pub moments: CheckConfig,
    /// Most frequent sample for stats paths.
    pub mode: CheckConfig,
    /// Linear prediction of adder paths.
    pub predict: PredictConfig,

    /// Histogram bucket layouts.
    pub histograms: Vec<HistogramBlockConfig>,
    /// Derived adder metrics.
    pub synths: Vec<SynthConfig>,
    /// Collection of idle records.
    pub gc: GcConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            period_ms: 10_000,
            offset_ms: 0,
            sync: true,
            dialect: Dialect::default(),
            buffer_size: 32_768,
            adder: TypeConfig::default(),
            gauge: TypeConfig::default(),
            stats: StatsConfig::default(),
            histo: TypeConfig::default(),
            self_stats: SelfStatsConfig::default(),
            moments: CheckConfig::default(),
            mode: CheckConfig::default(),
            predict: PredictConfig::default(),
            histograms: Vec::new(),
            synths: Vec::new(),
            gc: GcConfig::default(),
        }
    }
}

impl EngineConfig {
    /// The tick period.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// The tick offset within the period.
    pub fn offset(&self) -> Duration {
        Duration::from_millis(self.offset_ms)
    }

    /// Returns the settings of the table for `kind`.
    pub fn type_settings(&self, kind: MetricKind) -> TypeSettings {
        match kind {
            MetricKind::Adder => self.adder.resolve(kind),
            MetricKind::Gauge => self.gauge.resolve(kind),
            MetricKind::Stats => self.stats.base.resolve(kind),
            MetricKind::Histogram => self.histo.resolve(kind),
        }
    }

    /// Checks the values that are not covered by compiling the engine's components.
    pub fn validate(&self) -> Result<(), EngineConfigError> {
        if self.period_ms == 0 {
            return Err(EngineConfigError::ZeroPeriod);
        }

        if self.predict.enable && !PREDICT_SIZE_RANGE.contains(&self.predict.size) {
            return Err(EngineConfigError::PredictSize(self.predict.size));
        }

        self.stats.parse_thresholds()?;
        Ok(())
    }
}
