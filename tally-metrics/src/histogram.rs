//! Histogram bucket layouts and per-record bucket counts.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::checks::PathMatcher;
use crate::config::{
    EngineConfigError, HistogramBlockConfig, MAX_HISTOGRAM_BLOCKS, MAX_HISTOGRAM_BOUNDS,
};

/// A named set of ascending bucket bounds.
///
/// Blocks are shared by all records using them and replaced as a whole on reconfiguration.
#[derive(Debug)]
pub struct HistogramBlock {
    name: String,
    bounds: SmallVec<[f64; MAX_HISTOGRAM_BOUNDS]>,
    matcher: PathMatcher,
    enabled: bool,
}

impl HistogramBlock {
    fn from_config(config: &HistogramBlockConfig) -> Result<Self, EngineConfigError> {
        let invalid = |reason| EngineConfigError::InvalidHistogram {
            name: config.name.clone(),
            reason,
        };

        if config.bounds.is_empty() {
            return Err(invalid("no bounds"));
        }
        if config.bounds.len() > MAX_HISTOGRAM_BOUNDS {
            return Err(invalid("more than 10 bounds"));
        }
        if config.bounds.iter().any(|b| !b.is_finite()) {
            return Err(invalid("bounds must be finite"));
        }

        let mut bounds: SmallVec<[f64; MAX_HISTOGRAM_BOUNDS]> =
            config.bounds.iter().copied().collect();
        bounds.sort_by(f64::total_cmp);
        if bounds.windows(2).any(|w| w[0] == w[1]) {
            return Err(invalid("duplicate bounds"));
        }

        Ok(Self {
            name: config.name.clone(),
            bounds,
            matcher: PathMatcher::new(&config.matching)?,
            enabled: config.enable,
        })
    }

    /// The block installed when no histograms are configured.
    ///
    /// It has a single bound of `1.0` and matches every path.
    pub fn fallback() -> Self {
        Self {
            name: "default".to_owned(),
            bounds: smallvec::smallvec![1.0],
            matcher: PathMatcher::all(),
            enabled: true,
        }
    }

    /// The name of the block.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ascending upper bounds.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Number of buckets including the overflow bucket.
    pub fn bucket_count(&self) -> usize {
        self.bounds.len() + 1
    }

    /// Index of the bucket a value falls into.
    ///
    /// This is the first bound at or above `value`, or the overflow bucket at index
    /// `bounds().len()`.
    pub fn bucket_index(&self, value: f64) -> usize {
        self.bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bounds.len())
    }
}

/// The configured histogram blocks and the default for unmatched paths.
#[derive(Debug)]
pub struct HistogramSet {
    blocks: Vec<Arc<HistogramBlock>>,
    default: Arc<HistogramBlock>,
}

impl HistogramSet {
    /// Compiles the configured blocks.
    ///
    /// Without any configured block a [`fallback`](HistogramBlock::fallback) block is used. The
    /// default is the block flagged `default`, or else the first enabled block.
    pub fn from_config(configs: &[HistogramBlockConfig]) -> Result<Self, EngineConfigError> {
        if configs.is_empty() {
            let default = Arc::new(HistogramBlock::fallback());
            return Ok(Self {
                blocks: vec![default.clone()],
                default,
            });
        }

        if configs.len() > MAX_HISTOGRAM_BLOCKS {
            return Err(EngineConfigError::TooManyHistograms(configs.len()));
        }

        let mut blocks = Vec::with_capacity(configs.len());
        let mut default = None;

        for config in configs {
            let mut block = HistogramBlock::from_config(config)?;

            if config.default {
                if default.is_some() {
                    return Err(EngineConfigError::InvalidHistogram {
                        name: config.name.clone(),
                        reason: "more than one default block",
                    });
                }
                if !block.enabled {
                    tally_log::warn!(
                        block = block.name(),
                        "default histogram block is disabled, enabling it"
                    );
                    block.enabled = true;
                }
                default = Some(blocks.len());
            }

            blocks.push(Arc::new(block));
        }

        let default = default
            .or_else(|| blocks.iter().position(|b| b.enabled))
            .map(|index| blocks[index].clone())
            .ok_or_else(|| EngineConfigError::InvalidHistogram {
                name: configs[0].name.clone(),
                reason: "no enabled block",
            })?;

        Ok(Self { blocks, default })
    }

    /// Returns the block for `path`.
    pub fn resolve(&self, path: &str) -> Arc<HistogramBlock> {
        self.blocks
            .iter()
            .find(|b| b.enabled && b.matcher.is_match(path))
            .unwrap_or(&self.default)
            .clone()
    }

    /// The block used for unmatched paths.
    pub fn default_block(&self) -> &Arc<HistogramBlock> {
        &self.default
    }
}

impl Default for HistogramSet {
    fn default() -> Self {
        let default = Arc::new(HistogramBlock::fallback());
        Self {
            blocks: vec![default.clone()],
            default,
        }
    }
}

/// Per-bucket counts of one histogram record.
#[derive(Clone, Debug)]
pub struct BucketCounts {
    block: Arc<HistogramBlock>,
    counts: SmallVec<[u64; MAX_HISTOGRAM_BOUNDS + 1]>,
    count: u64,
}

impl BucketCounts {
    /// Creates zeroed counts for the buckets of `block`.
    pub fn new(block: Arc<HistogramBlock>) -> Self {
        let counts = smallvec::smallvec![0; block.bucket_count()];
        Self {
            block,
            counts,
            count: 0,
        }
    }

    /// The bucket layout.
    pub fn block(&self) -> &Arc<HistogramBlock> {
        &self.block
    }

    /// Counts per bucket, the last being the overflow bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Total number of values.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn add(&mut self, value: f64) {
        let index = self.block.bucket_index(value);
        self.counts[index] += 1;
        self.count += 1;
    }

    /// Zeroes all counts and installs `block` as the layout.
    pub(crate) fn reset(&mut self, block: Arc<HistogramBlock>) {
        if !Arc::ptr_eq(&self.block, &block) {
            self.counts = smallvec::smallvec![0; block.bucket_count()];
            self.block = block;
        } else {
            self.counts.iter_mut().for_each(|c| *c = 0);
        }
        self.count = 0;
    }
}

#[cfg(test)]
pub(crate) fn block_config(
    name: &str,
    bounds: &[f64],
    pattern: Option<&str>,
) -> HistogramBlockConfig {
    HistogramBlockConfig {
        name: name.to_owned(),
        bounds: bounds.to_vec(),
        matching: crate::checks::MatchConfig {
            whitelist: pattern.map(|p| vec![p.to_owned()]).unwrap_or_default(),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index_boundaries() {
        let set = HistogramSet::from_config(&[block_config("ms", &[10.0, 100.0, 1000.0], None)])
            .unwrap();
        let block = set.default_block();

        assert_eq!(block.bucket_index(-5.0), 0);
        assert_eq!(block.bucket_index(10.0), 0);
        assert_eq!(block.bucket_index(10.5), 1);
        assert_eq!(block.bucket_index(100.0), 1);
        assert_eq!(block.bucket_index(1000.0), 2);
        assert_eq!(block.bucket_index(1000.1), 3);
        assert_eq!(block.bucket_index(f64::MAX), block.bounds().len());
    }

    #[test]
    fn test_counts() {
        let block = Arc::new(HistogramBlock::fallback());
        let mut counts = BucketCounts::new(block.clone());
        for value in [0.5, 1.0, 1.5, 20.0] {
            counts.add(value);
        }
        assert_eq!(counts.counts(), &[2, 2]);
        assert_eq!(counts.count(), 4);

        counts.reset(block);
        assert_eq!(counts.counts(), &[0, 0]);
        assert_eq!(counts.count(), 0);
    }

    #[test]
    fn test_reset_with_new_layout() {
        let mut counts = BucketCounts::new(Arc::new(HistogramBlock::fallback()));
        counts.add(3.0);

        let set =
            HistogramSet::from_config(&[block_config("wide", &[1.0, 2.0, 4.0], None)]).unwrap();
        counts.reset(set.default_block().clone());
        assert_eq!(counts.counts(), &[0, 0, 0, 0]);
        assert_eq!(counts.block().name(), "wide");
    }

    #[test]
    fn test_resolve_first_match_then_default() {
        let set = HistogramSet::from_config(&[
            block_config("api", &[5.0], Some(r"^api\.")),
            block_config("db", &[50.0], Some(r"^db\.")),
        ])
        .unwrap();

        assert_eq!(set.resolve("api.latency").name(), "api");
        assert_eq!(set.resolve("db.query").name(), "db");
        // Neither matches, so the first enabled block is the default.
        assert_eq!(set.resolve("web.render").name(), "api");
    }

    #[test]
    fn test_flagged_default_and_disabled_blocks() {
        let mut disabled = block_config("off", &[1.0], Some("."));
        disabled.enable = false;
        let mut flagged = block_config("catchall", &[100.0], Some("^nothing$"));
        flagged.default = true;

        let set = HistogramSet::from_config(&[disabled, flagged]).unwrap();
        assert_eq!(set.resolve("anything").name(), "catchall");
    }

    #[test]
    fn test_invalid_blocks() {
        let too_many = block_config("big", &[1., 2., 3., 4., 5., 6., 7., 8., 9., 10., 11.], None);
        assert!(matches!(
            HistogramSet::from_config(&[too_many]),
            Err(EngineConfigError::InvalidHistogram { .. })
        ));

        assert!(HistogramSet::from_config(&[block_config("empty", &[], None)]).is_err());

        let mut off = block_config("off", &[1.0], None);
        off.enable = false;
        assert!(HistogramSet::from_config(&[off]).is_err());
    }

    #[test]
    fn test_unsorted_bounds_are_sorted() {
        let set = HistogramSet::from_config(&[block_config("x", &[100.0, 1.0, 10.0], None)])
            .unwrap();
        assert_eq!(set.default_block().bounds(), &[1.0, 10.0, 100.0]);
    }

    #[test]
    fn test_empty_config_uses_fallback() {
        let set = HistogramSet::from_config(&[]).unwrap();
        assert_eq!(set.resolve("any.path").bounds(), &[1.0]);
    }
}
