//! Derived adder metrics computed from other adder records.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::config::{EngineConfigError, SynthConfig};
use crate::record::{Record, Sample, Totals};
use crate::statsd::MetricCounters;
use crate::table::PathTable;

/// Maximum number of sources of one synthetic metric.
pub const MAX_SOURCES: usize = 32;

/// The function computing a synthetic value from its sources.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SynthOp {
    /// Scaled sum of all sources.
    Sum,
    /// Scaled difference of the first two sources.
    Diff,
    /// Scaled quotient of the first two sources, `0` for a zero divisor.
    Ratio,
    /// Scaled product of the present sources.
    Product,
    /// The smaller of the first two sources.
    Cap,
    /// Scaled maximum of the present sources.
    Max,
    /// Scaled minimum of the present sources.
    Min,
    /// Scaled difference between maximum and minimum of the present sources.
    Spread,
    /// Scaled sum divided by the number of sources.
    Mean,
    /// Scaled sum divided by the number of present sources.
    MeanIf,
    /// Scaled number of present sources.
    Count,
    /// `1` whenever any source is present.
    Active,
}

impl SynthOp {
    /// Looks up an operation by its name or one of its aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sum" | "add" | "plus" => Self::Sum,
            "diff" | "minus" => Self::Diff,
            "ratio" | "div" => Self::Ratio,
            "mult" | "product" => Self::Product,
            "cap" | "limit" => Self::Cap,
            "max" | "highest" => Self::Max,
            "min" | "lowest" => Self::Min,
            "spread" | "width" => Self::Spread,
            "mean" | "average" => Self::Mean,
            "meanIf" | "avgIf" => Self::MeanIf,
            "count" | "nonzero" => Self::Count,
            "active" | "present" => Self::Active,
            _ => return None,
        })
    }

    /// The canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Diff => "diff",
            Self::Ratio => "ratio",
            Self::Product => "mult",
            Self::Cap => "cap",
            Self::Max => "max",
            Self::Min => "min",
            Self::Spread => "spread",
            Self::Mean => "mean",
            Self::MeanIf => "meanIf",
            Self::Count => "count",
            Self::Active => "active",
        }
    }

    fn min_sources(&self) -> usize {
        match self {
            Self::Sum | Self::Product | Self::Count | Self::Active => 1,
            _ => 2,
        }
    }

    /// Number of sources the operation reads, if limited.
    fn used_sources(&self) -> Option<usize> {
        match self {
            Self::Diff | Self::Ratio | Self::Cap => Some(2),
            _ => None,
        }
    }

    /// Default tolerance of absent sources. Negative values count from the number of sources.
    fn default_max_absent(&self) -> i64 {
        match self {
            Self::Diff | Self::Ratio | Self::Cap => 0,
            Self::Spread => -2,
            Self::Mean | Self::MeanIf => -1,
            _ => MAX_SOURCES as i64,
        }
    }

    /// Computes the value from the processed totals of the sources.
    ///
    /// `absent` is the number of sources without data this tick. Callers ensure there are at
    /// least [`min_sources`](Self::min_sources) values and at least one present source.
    pub fn apply(&self, values: &[Totals], factor: f64, absent: usize) -> f64 {
        let parts = values.len();
        let sum = || values.iter().map(|v| v.total).sum::<f64>() * factor;
        let mut present = values.iter().filter(|v| v.count > 0).map(|v| v.total);

        match self {
            Self::Sum => sum(),
            Self::Diff => match values {
                [a, b, ..] => factor * (a.total - b.total),
                _ => 0.0,
            },
            Self::Ratio => match values {
                [_, b, ..] if b.total == 0.0 => 0.0,
                [a, b, ..] => a.total * factor / b.total,
                _ => 0.0,
            },
            Self::Product => present.fold(factor, |acc, v| acc * v),
            Self::Cap => match values {
                [a, b, ..] => a.total.min(b.total),
                _ => 0.0,
            },
            Self::Max => present.reduce(f64::max).unwrap_or(0.0) * factor,
            Self::Min => present.reduce(f64::min).unwrap_or(0.0) * factor,
            Self::Spread => {
                let Some(first) = present.next() else {
                    return 0.0;
                };
                let (min, max) = present.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
                factor * (max - min)
            }
            Self::Mean => sum() / parts as f64,
            Self::MeanIf => sum() / (parts - absent) as f64,
            Self::Count => factor * (parts - absent) as f64,
            Self::Active => 1.0,
        }
    }
}

impl fmt::Display for SynthOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A validated synthetic metric definition.
#[derive(Clone, Debug, PartialEq)]
pub struct SynthDefinition {
    /// Path of the derived record.
    pub target: String,
    /// Source paths in order.
    pub sources: Vec<String>,
    /// The operation.
    pub op: SynthOp,
    /// Scale of the result.
    pub factor: f64,
    /// Resolved tolerance of absent sources.
    pub max_absent: usize,
}

impl SynthDefinition {
    /// Validates a configured definition. Returns `Ok(None)` for disabled definitions.
    pub fn from_config(index: usize, config: &SynthConfig) -> Result<Option<Self>, EngineConfigError> {
        if config.target.is_empty() {
            return Err(EngineConfigError::IncompleteSynthetic {
                index,
                field: "target",
            });
        }
        if config.operation.is_empty() {
            return Err(EngineConfigError::IncompleteSynthetic {
                index,
                field: "operation",
            });
        }
        if config.source.is_empty() {
            return Err(EngineConfigError::IncompleteSynthetic {
                index,
                field: "source",
            });
        }

        let op = SynthOp::from_name(&config.operation).ok_or_else(|| {
            EngineConfigError::UnknownOperation {
                target: config.target.clone(),
                operation: config.operation.clone(),
            }
        })?;

        let parts = config.source.len();
        if parts > MAX_SOURCES {
            return Err(EngineConfigError::TooManySources {
                target: config.target.clone(),
                parts,
            });
        }
        if parts < op.min_sources() {
            return Err(EngineConfigError::TooFewSources {
                target: config.target.clone(),
                min: op.min_sources(),
                parts,
            });
        }
        if let Some(used) = op.used_sources().filter(|&used| parts > used) {
            tally_log::warn!(
                target_path = %config.target,
                parts,
                "synthetic has more sources than {op} uses, only {used} are read"
            );
        }

        if !config.enable {
            tally_log::debug!(target_path = %config.target, "dropping disabled synthetic");
            return Ok(None);
        }

        // Unset or negative values fall back to the operation's default.
        let max_absent = match config.max_absent {
            Some(configured) if configured >= 0 => configured as usize,
            _ => match op.default_max_absent() {
                default if default >= 0 => default as usize,
                default => (parts as i64 + default).max(0) as usize,
            },
        };

        Ok(Some(Self {
            target: config.target.clone(),
            sources: config.source.clone(),
            op,
            factor: config.factor,
            max_absent,
        }))
    }
}

/// A definition bound to its target record, with lazily resolved sources.
struct Synthetic {
    def: SynthDefinition,
    target: Arc<Record>,
    sources: Vec<Option<Arc<Record>>>,
    missing: usize,
}

impl Synthetic {
    fn resolve_sources(&mut self, adders: &PathTable) {
        for (path, slot) in self.def.sources.iter().zip(&mut self.sources) {
            if slot.is_some() {
                continue;
            }

            if let Some(record) = adders.locate(path) {
                record.exempt_from_gc();
                tally_log::debug!(source = %path, target_path = %self.def.target, "found synthetic source");
                *slot = Some(record);
                self.missing = self.missing.saturating_sub(1);
            }
        }
    }

    /// Computes the target value. Returns `true` if a value was written.
    fn generate(&mut self, adders: &PathTable) -> bool {
        if self.missing > 0 {
            self.resolve_sources(adders);
            if self.missing > 0 {
                return false;
            }
        }

        let mut values: SmallVec<[Totals; MAX_SOURCES]> = SmallVec::new();
        for source in self.sources.iter().flatten() {
            let processing = source.processing();
            values.push(match &processing.sample {
                Sample::Adder(totals) => *totals,
                _ => Totals::default(),
            });
        }

        let absent = values.iter().filter(|v| v.count == 0).count();
        let points: u64 = values.iter().map(|v| v.count).sum();
        let generate = points > 0 && absent <= self.def.max_absent;

        let totals = if generate {
            Totals {
                total: self.def.op.apply(&values, self.def.factor, absent),
                count: points,
            }
        } else {
            Totals::default()
        };
        self.target.processing().sample = Sample::Adder(totals);

        generate
    }
}

impl fmt::Debug for Synthetic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synthetic")
            .field("target", &self.def.target)
            .field("op", &self.def.op)
            .field("missing", &self.missing)
            .finish()
    }
}

/// Computes all synthetic metrics once per tick.
#[derive(Debug, Default)]
pub struct SyntheticEngine {
    synths: Vec<Synthetic>,
}

impl SyntheticEngine {
    /// Binds definitions to target records created by `create_target`.
    ///
    /// Targets are exempt from collection. Definitions are evaluated in order, so a definition
    /// may use the target of an earlier one as a source.
    pub fn new<F>(definitions: Vec<SynthDefinition>, mut create_target: F) -> Self
    where
        F: FnMut(&str) -> Arc<Record>,
    {
        let synths = definitions
            .into_iter()
            .map(|def| {
                let target = create_target(&def.target);
                target.exempt_from_gc();
                tally_log::info!(target_path = %def.target, op = %def.op, "synthetic created");

                Synthetic {
                    missing: def.sources.len(),
                    sources: vec![None; def.sources.len()],
                    target,
                    def,
                }
            })
            .collect();

        Self { synths }
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.synths.len()
    }

    /// Returns `true` if there are no definitions.
    pub fn is_empty(&self) -> bool {
        self.synths.is_empty()
    }

    /// Evaluates every definition against the processed adder values of this tick.
    ///
    /// Must only run while no adder worker is swapping. Returns the number of targets written.
    pub fn generate(&mut self, adders: &PathTable) -> usize {
        let generated = self
            .synths
            .iter_mut()
            .map(|synth| synth.generate(adders))
            .filter(|&generated| generated)
            .count();

        tally_statsd::metric!(counter(MetricCounters::SynthsGenerated) += generated as i64);
        generated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(values: &[(f64, u64)]) -> Vec<Totals> {
        values
            .iter()
            .map(|&(total, count)| Totals { total, count })
            .collect()
    }

    fn definition(op: &str, sources: usize, max_absent: Option<i32>) -> SynthDefinition {
        let config = SynthConfig {
            target: "t".to_owned(),
            source: (0..sources).map(|i| format!("s.{i}")).collect(),
            operation: op.to_owned(),
            max_absent,
            ..Default::default()
        };
        SynthDefinition::from_config(0, &config).unwrap().unwrap()
    }

    #[test]
    fn test_operations() {
        let v = totals(&[(2.0, 1), (3.0, 1), (4.0, 1)]);
        assert_eq!(SynthOp::Sum.apply(&v, 2.0, 0), 18.0);
        assert_eq!(SynthOp::Diff.apply(&v, 2.0, 0), -2.0);
        assert_eq!(SynthOp::Ratio.apply(&v, 3.0, 0), 2.0);
        assert_eq!(SynthOp::Product.apply(&v, 2.0, 0), 48.0);
        assert_eq!(SynthOp::Cap.apply(&v, 10.0, 0), 2.0);
        assert_eq!(SynthOp::Max.apply(&v, 2.0, 0), 8.0);
        assert_eq!(SynthOp::Min.apply(&v, 2.0, 0), 4.0);
        assert_eq!(SynthOp::Spread.apply(&v, 2.0, 0), 4.0);
        assert_eq!(SynthOp::Mean.apply(&v, 1.0, 0), 3.0);
        assert_eq!(SynthOp::Count.apply(&v, 1.0, 0), 3.0);
        assert_eq!(SynthOp::Active.apply(&v, 5.0, 0), 1.0);
    }

    #[test]
    fn test_absent_sources() {
        let v = totals(&[(3.0, 1), (0.0, 0), (9.0, 2)]);
        assert_eq!(SynthOp::MeanIf.apply(&v, 1.0, 1), 6.0);
        assert_eq!(SynthOp::Mean.apply(&v, 1.0, 1), 4.0);
        assert_eq!(SynthOp::Count.apply(&v, 1.0, 1), 2.0);
        // Folds skip absent sources.
        assert_eq!(SynthOp::Min.apply(&v, 1.0, 1), 3.0);
        assert_eq!(SynthOp::Product.apply(&v, 1.0, 1), 27.0);
        assert_eq!(SynthOp::Spread.apply(&v, 1.0, 1), 6.0);
    }

    #[test]
    fn test_ratio_by_zero() {
        let v = totals(&[(3.0, 1), (0.0, 1)]);
        assert_eq!(SynthOp::Ratio.apply(&v, 1.0, 0), 0.0);
    }

    #[test]
    fn test_names_and_aliases() {
        assert_eq!(SynthOp::from_name("avgIf"), Some(SynthOp::MeanIf));
        assert_eq!(SynthOp::from_name("product"), Some(SynthOp::Product));
        assert_eq!(SynthOp::from_name("median"), None);
        assert_eq!(SynthOp::Product.to_string(), "mult");
    }

    #[test]
    fn test_max_absent_resolution() {
        assert_eq!(definition("sum", 3, None).max_absent, MAX_SOURCES);
        assert_eq!(definition("diff", 2, None).max_absent, 0);
        assert_eq!(definition("mean", 3, None).max_absent, 2);
        assert_eq!(definition("spread", 4, None).max_absent, 2);
        assert_eq!(definition("spread", 2, None).max_absent, 0);
        assert_eq!(definition("sum", 3, Some(1)).max_absent, 1);
        // Negative values select the operation default.
        assert_eq!(definition("sum", 3, Some(-1)).max_absent, MAX_SOURCES);
        assert_eq!(definition("sum", 3, Some(-5)).max_absent, MAX_SOURCES);
        assert_eq!(definition("mean", 4, Some(-3)).max_absent, 3);
        assert_eq!(definition("diff", 2, Some(-1)).max_absent, 0);
        assert_eq!(definition("mean", 4, Some(0)).max_absent, 0);
    }

    #[test]
    fn test_invalid_definitions() {
        let config = SynthConfig {
            target: "t".to_owned(),
            source: vec!["a".to_owned()],
            operation: "diff".to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            SynthDefinition::from_config(0, &config),
            Err(EngineConfigError::TooFewSources { min: 2, parts: 1, .. })
        ));

        let config = SynthConfig {
            operation: "bogus".to_owned(),
            ..config
        };
        assert!(matches!(
            SynthDefinition::from_config(0, &config),
            Err(EngineConfigError::UnknownOperation { .. })
        ));

        let config = SynthConfig {
            operation: "sum".to_owned(),
            source: (0..33).map(|i| i.to_string()).collect(),
            ..config
        };
        assert!(matches!(
            SynthDefinition::from_config(0, &config),
            Err(EngineConfigError::TooManySources { parts: 33, .. })
        ));

        let config = SynthConfig {
            target: String::new(),
            ..config
        };
        assert_eq!(
            SynthDefinition::from_config(3, &config)
                .unwrap_err()
                .to_string(),
            "synthetic definition #3 has no target"
        );
    }

    #[test]
    fn test_disabled_definition_is_dropped() {
        let config = SynthConfig {
            target: "t".to_owned(),
            source: vec!["a".to_owned()],
            operation: "sum".to_owned(),
            enable: false,
            ..Default::default()
        };
        assert_eq!(SynthDefinition::from_config(0, &config).unwrap(), None);
    }
}
