//! Numeric helpers for stats reporting.

/// Compensated running sum.
///
/// Keeps a correction term for the low-order bits lost in each addition, which matters when
/// summing many samples of very different magnitudes.
#[derive(Clone, Copy, Debug, Default)]
pub struct KahanSum {
    sum: f64,
    low: f64,
}

impl KahanSum {
    /// Creates a zero sum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value.
    #[inline]
    pub fn add(&mut self, value: f64) {
        let y = value - self.low;
        let t = self.sum + y;
        self.low = (t - self.sum) - y;
        self.sum = t;
    }

    /// Returns the compensated total.
    pub fn total(&self) -> f64 {
        self.sum + self.low
    }
}

impl FromIterator<f64> for KahanSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut sum = Self::new();
        for value in iter {
            sum.add(value);
        }
        sum
    }
}

/// Standardized moments of a full population of samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Moments {
    /// Population standard deviation.
    pub stddev: f64,
    /// Skewness, with the sample size correction applied above five samples.
    pub skewness: f64,
    /// Excess kurtosis.
    pub kurtosis: f64,
}

impl Moments {
    /// Computes the moments of `values` around a known `mean`.
    ///
    /// Returns `None` for an empty slice. When all samples are equal the deviation is zero and
    /// skewness and kurtosis are reported as zero rather than dividing by it.
    pub fn compute(values: &[f64], mean: f64) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut second = KahanSum::new();
        let mut third = KahanSum::new();
        let mut fourth = KahanSum::new();

        for &value in values {
            let diff = value - mean;
            let mut prod = diff * diff;
            second.add(prod);
            prod *= diff;
            third.add(prod);
            prod *= diff;
            fourth.add(prod);
        }

        let n = values.len();
        let count = n as f64;

        let variance = second.total() / count;
        let stddev = variance.sqrt();

        if stddev == 0.0 {
            return Some(Self {
                stddev,
                skewness: 0.0,
                kurtosis: 0.0,
            });
        }

        let skew = if n > 5 {
            third.total() * count / ((n - 1) * (n - 2)) as f64
        } else {
            third.total() / count
        };

        Some(Self {
            stddev,
            skewness: skew / (stddev * stddev * stddev),
            kurtosis: fourth.total() / count / (variance * variance) - 3.0,
        })
    }
}

/// The most frequent value of a sorted slice.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mode {
    /// The repeated value.
    pub value: f64,
    /// How often it occurs.
    pub count: usize,
}

impl Mode {
    /// Finds the longest run of equal values in `sorted`.
    ///
    /// Ties go to the lowest value. Returns `None` unless some value occurs at least twice.
    pub fn find(sorted: &[f64]) -> Option<Self> {
        let mut best: Option<Self> = None;
        let mut iter = sorted.iter().copied();
        let mut current = iter.next()?;
        let mut run = 1;

        for value in iter.chain(std::iter::once(f64::NAN)) {
            if value == current {
                run += 1;
                continue;
            }

            if run > 1 && best.is_none_or(|b| run > b.count) {
                best = Some(Self {
                    value: current,
                    count: run,
                });
            }
            current = value;
            run = 1;
        }

        best
    }
}

/// Index of the sample at `numerator / denominator` of a sorted batch of `count` samples.
///
/// This is `floor(fraction * (count - 1))`, so the result is always a valid index for a non-empty
/// batch.
#[inline]
pub fn fraction_index(count: usize, numerator: usize, denominator: usize) -> usize {
    count.saturating_sub(1) * numerator / denominator
}
