//! Path hashing for [`PathTable`](crate::PathTable) placement.

/// Multipliers for the trailing bytes that do not fill a whole word.
const TAIL_PRIMES: [u64; 8] = [2909, 3001, 3083, 3187, 3259, 3343, 3517, 3581];

const SEED: u64 = 5381;

/// Hashes a metric path.
///
/// The path is folded in as little-endian 32-bit words with `sum += (sum << 5) + word`, starting
/// from `5381`. Up to three remaining bytes are sign-extended and multiplied by a fixed prime,
/// the first remaining byte taking the highest prime index. All arithmetic wraps.
///
/// The result is stable across runs and platforms and is used both for the bucket index and as a
/// fast pre-check before comparing path bytes.
///
/// ```
/// assert_eq!(tally_metrics::path_hash(b"a"), 5381 + 97 * 2909);
/// ```
pub fn path_hash(path: &[u8]) -> u64 {
    let mut words = path.chunks_exact(4);
    let mut sum = SEED;

    for word in &mut words {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        sum = sum.wrapping_add(sum << 5).wrapping_add(u64::from(word));
    }

    let tail = words.remainder();
    for (i, &byte) in tail.iter().enumerate() {
        let prime = TAIL_PRIMES[tail.len() - 1 - i];
        let byte = i64::from(byte as i8) as u64;
        sum = sum.wrapping_add(byte.wrapping_mul(prime));
    }

    sum
}
