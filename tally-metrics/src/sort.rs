//! Ascending sorts over timer samples.
//!
//! Two strategies produce identical output and are picked by input length: an iterative
//! quicksort for small batches and an LSD radix sort over the IEEE-754 bit patterns for large
//! ones. Both order values by [`f64::total_cmp`], so ties, signed zeros and NaN payloads end up in
//! the same places regardless of the strategy.

use std::fmt;

use smallvec::SmallVec;

/// Partitions at or below this size are left for the final insertion sort.
const MAX_THRESH: isize = 4;

/// Bits per radix digit.
const RADIX_BITS: u32 = 11;

/// Number of buckets per radix digit.
const RADIX_SIZE: usize = 1 << RADIX_BITS;

/// Number of digit passes needed to cover 64 bits.
const RADIX_PASSES: usize = 6;

/// The default length at which the radix sort takes over.
pub const DEFAULT_QSORT_THRESHOLD: usize = 10_000;

/// Below this threshold the radix sort's counting overhead always dominates.
pub const MIN_QSORT_THRESHOLD: usize = 2_048;

/// The sort strategy picked for a batch of samples.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortStrategy {
    /// Iterative median-of-three quicksort with a final insertion pass.
    Quick,
    /// Six pass, 11-bit LSD radix sort.
    Radix,
}

impl SortStrategy {
    /// Picks the strategy for `len` samples.
    pub fn for_len(len: usize, qsort_threshold: usize) -> Self {
        if len < qsort_threshold {
            Self::Quick
        } else {
            Self::Radix
        }
    }
}

impl fmt::Display for SortStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quick => f.write_str("quick"),
            Self::Radix => f.write_str("radix"),
        }
    }
}

/// Reusable scratch space for [`radix_sort`].
///
/// Each stats worker owns one, so buffers grow to the largest batch seen and are not reallocated
/// on every tick.
#[derive(Default)]
pub struct SortWorkspace {
    keys: Vec<u64>,
    scratch: Vec<u64>,
    counts: Vec<[usize; RADIX_SIZE]>,
}

impl SortWorkspace {
    /// Creates an empty workspace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of samples the workspace can sort without growing.
    pub fn capacity(&self) -> usize {
        self.keys.capacity().min(self.scratch.capacity())
    }
}

impl fmt::Debug for SortWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortWorkspace")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Sorts `values` ascending using the strategy chosen by `qsort_threshold`.
///
/// Returns the strategy that was used.
pub fn sort_ascending(
    values: &mut [f64],
    qsort_threshold: usize,
    workspace: &mut SortWorkspace,
) -> SortStrategy {
    let strategy = SortStrategy::for_len(values.len(), qsort_threshold);
    match strategy {
        SortStrategy::Quick => quicksort(values),
        SortStrategy::Radix => radix_sort(values, workspace),
    }
    strategy
}

#[inline(always)]
fn less(a: f64, b: f64) -> bool {
    a.total_cmp(&b).is_lt()
}

/// Sorts `values` ascending with an iterative quicksort.
///
/// Pivots are chosen by median of three. Partitions of four elements or fewer are left
/// unsorted and fixed up by a single insertion sort pass at the end, which is seeded by moving the
/// minimum of the leading elements to the front as a sentinel.
pub fn quicksort(values: &mut [f64]) {
    let n = values.len() as isize;
    if n < 2 {
        return;
    }

    if n > MAX_THRESH {
        let mut stack: SmallVec<[(isize, isize); 64]> = SmallVec::new();
        let mut lo: isize = 0;
        let mut hi: isize = n - 1;

        loop {
            let mut mid = lo + ((hi - lo) >> 1);

            if less(values[mid as usize], values[lo as usize]) {
                values.swap(mid as usize, lo as usize);
            }
            if less(values[hi as usize], values[mid as usize]) {
                values.swap(mid as usize, hi as usize);
                if less(values[mid as usize], values[lo as usize]) {
                    values.swap(mid as usize, lo as usize);
                }
            }

            let mut left = lo + 1;
            let mut right = hi - 1;

            // Collapse the walls.
            loop {
                while less(values[left as usize], values[mid as usize]) {
                    left += 1;
                }
                while less(values[mid as usize], values[right as usize]) {
                    right -= 1;
                }

                if left < right {
                    values.swap(left as usize, right as usize);
                    if mid == left {
                        mid = right;
                    } else if mid == right {
                        mid = left;
                    }
                    left += 1;
                    right -= 1;
                } else if left == right {
                    left += 1;
                    right -= 1;
                    break;
                }

                if left > right {
                    break;
                }
            }

            // Continue with the larger partition pushed, or pop when both are small.
            if right - lo <= MAX_THRESH {
                if hi - left <= MAX_THRESH {
                    match stack.pop() {
                        Some((l, h)) => {
                            lo = l;
                            hi = h;
                        }
                        None => break,
                    }
                } else {
                    lo = left;
                }
            } else if hi - left <= MAX_THRESH {
                hi = right;
            } else if right - lo > hi - left {
                stack.push((lo, right));
                lo = left;
            } else {
                stack.push((left, hi));
                hi = right;
            }
        }
    }

    insertion_pass(values);
}

/// Insertion sort over a nearly sorted slice.
fn insertion_pass(values: &mut [f64]) {
    let end = values.len() - 1;
    let thresh = end.min(MAX_THRESH as usize);

    // The smallest of the first partition is the global minimum and acts as a sentinel.
    let mut smallest = 0;
    for run in 1..=thresh {
        if less(values[run], values[smallest]) {
            smallest = run;
        }
    }
    if smallest != 0 {
        values.swap(smallest, 0);
    }

    for run in 2..=end {
        let value = values[run];
        let mut pos = run - 1;
        while less(value, values[pos]) {
            pos -= 1;
        }
        pos += 1;

        if pos != run {
            values.copy_within(pos..run, pos + 1);
            values[pos] = value;
        }
    }
}

/// Maps the bit pattern of a double to an unsigned key with the same ordering.
///
/// Negative values have all bits inverted, non-negative values only the sign bit.
#[inline(always)]
fn flip(bits: u64) -> u64 {
    let mask = ((bits >> 63) as i64).wrapping_neg() as u64 | 0x8000_0000_0000_0000;
    bits ^ mask
}

/// Inverse of [`flip`].
#[inline(always)]
fn unflip(key: u64) -> u64 {
    let mask = (key >> 63).wrapping_sub(1) | 0x8000_0000_0000_0000;
    key ^ mask
}

#[inline(always)]
fn digit(key: u64, pass: usize) -> usize {
    ((key >> (pass as u32 * RADIX_BITS)) as usize) & (RADIX_SIZE - 1)
}

/// Sorts `values` ascending with a stable six pass radix sort.
///
/// All six digit histograms are built in a single read of the input, then each pass scatters the
/// keys between two buffers of the workspace.
pub fn radix_sort(values: &mut [f64], workspace: &mut SortWorkspace) {
    let n = values.len();
    if n < 2 {
        return;
    }

    let SortWorkspace {
        keys,
        scratch,
        counts,
    } = workspace;

    keys.clear();
    keys.extend(values.iter().map(|v| flip(v.to_bits())));
    scratch.clear();
    scratch.resize(n, 0);

    counts.clear();
    counts.resize(RADIX_PASSES, [0; RADIX_SIZE]);

    for &key in keys.iter() {
        for (pass, histogram) in counts.iter_mut().enumerate() {
            histogram[digit(key, pass)] += 1;
        }
    }

    // Turn the histograms into exclusive offsets.
    for histogram in counts.iter_mut() {
        let mut sum = 0;
        for slot in histogram.iter_mut() {
            let count = *slot;
            *slot = sum;
            sum += count;
        }
    }

    let mut src = &mut keys[..];
    let mut dst = &mut scratch[..];
    for (pass, offsets) in counts.iter_mut().enumerate() {
        for &key in src.iter() {
            let slot = &mut offsets[digit(key, pass)];
            dst[*slot] = key;
            *slot += 1;
        }
        std::mem::swap(&mut src, &mut dst);
    }

    // An even number of passes leaves the sorted keys in `keys`.
    for (value, &key) in values.iter_mut().zip(src.iter()) {
        *value = f64::from_bits(unflip(key));
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn bits(values: &[f64]) -> Vec<u64> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    fn assert_both_sort(input: &[f64]) {
        let mut expected = input.to_vec();
        expected.sort_by(f64::total_cmp);

        let mut quick = input.to_vec();
        quicksort(&mut quick);

        let mut radix = input.to_vec();
        radix_sort(&mut radix, &mut SortWorkspace::new());

        assert_eq!(bits(&quick), bits(&expected), "quicksort of {input:?}");
        assert_eq!(bits(&radix), bits(&expected), "radix sort of {input:?}");
    }

    #[test]
    fn test_flip_roundtrip_preserves_order() {
        let values = [
            f64::NEG_INFINITY,
            -1e300,
            -1.5,
            -0.0,
            0.0,
            f64::MIN_POSITIVE,
            2.5,
            f64::INFINITY,
        ];

        for pair in values.windows(2) {
            assert!(flip(pair[0].to_bits()) < flip(pair[1].to_bits()));
        }
        for v in values {
            assert_eq!(unflip(flip(v.to_bits())), v.to_bits());
        }
    }

    #[test]
    fn test_edge_inputs() {
        assert_both_sort(&[]);
        assert_both_sort(&[42.0]);
        assert_both_sort(&[2.0, 1.0]);
        assert_both_sort(&[7.0; 33]);
        assert_both_sort(&[3.0, -1.0, 0.0, -0.0, 2.0, -7.5, 0.0, 1e-9]);
        assert_both_sort(&[5.0, 4.0, 3.0, 2.0, 1.0, 0.0, -1.0, -2.0]);
        assert_both_sort(&[f64::INFINITY, 1.0, f64::NEG_INFINITY, -1.0]);
    }

    #[test]
    fn test_sorted_and_reversed_runs() {
        let ascending: Vec<f64> = (0..1000_i32).map(f64::from).collect();
        let descending: Vec<f64> = ascending.iter().rev().copied().collect();
        assert_both_sort(&ascending);
        assert_both_sort(&descending);
    }

    #[test]
    fn test_random_equivalence() {
        let mut rng = rand::rng();

        for len in [3, 5, 6, 17, 100, 2047, 2048, 5000] {
            let input: Vec<f64> = (0..len)
                .map(|_| match rng.random_range(0..4) {
                    0 => 0.0,
                    1 => f64::from(rng.random_range(-10..10_i32)),
                    _ => rng.random_range(-1e6..1e6),
                })
                .collect();
            assert_both_sort(&input);
        }
    }

    #[test]
    fn test_strategy_threshold() {
        assert_eq!(SortStrategy::for_len(9_999, 10_000), SortStrategy::Quick);
        assert_eq!(SortStrategy::for_len(10_000, 10_000), SortStrategy::Radix);

        let mut workspace = SortWorkspace::new();
        let mut values: Vec<f64> = (0..3000_i32).rev().map(f64::from).collect();
        let used = sort_ascending(&mut values, MIN_QSORT_THRESHOLD, &mut workspace);

        assert_eq!(used, SortStrategy::Radix);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(workspace.capacity() >= 3000);
    }
}
