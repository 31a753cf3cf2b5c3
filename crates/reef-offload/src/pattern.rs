//! Unit-index bit patterns.
//!
//! The compute service addresses units through 16-bit masks: bit `i` set
//! means unit `i` takes part in the request, either as a surviving input
//! (survival pattern) or as a unit to be produced (erasure pattern).

use std::fmt;

/// Maximum number of units a pattern can address.
pub const MAX_UNITS: usize = 16;

/// A 16-bit unit mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BitPattern(u16);

impl BitPattern {
    /// The empty pattern.
    pub const EMPTY: BitPattern = BitPattern(0);

    /// Wrap a raw mask.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Build a pattern from unit indices.
    ///
    /// Indices at or beyond `num_all_units` are ignored, so the result is
    /// always masked to `num_all_units` bits. Order and duplicates do not
    /// matter.
    pub fn from_indices(indices: &[usize], num_all_units: usize) -> Self {
        let limit = num_all_units.min(MAX_UNITS);
        let bits = indices
            .iter()
            .filter(|&&i| i < limit)
            .fold(0u32, |acc, &i| acc | (1 << i));
        Self((bits & mask(limit)) as u16)
    }

    /// Raw mask value.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Number of units set.
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether unit `index` is set.
    pub const fn contains(self, index: usize) -> bool {
        index < MAX_UNITS && self.0 & (1 << index) != 0
    }

    /// Set indices below `num_all_units`, ascending.
    pub fn indices(self, num_all_units: usize) -> Vec<usize> {
        (0..num_all_units.min(MAX_UNITS))
            .filter(|&i| self.contains(i))
            .collect()
    }

    /// Split into the two wire bytes `(low, high)`.
    ///
    /// The compute protocol uses `mask % 16` and `mask / 16`, not a byte
    /// split: the low byte only carries the bottom nibble and the high byte
    /// holds everything above it. Masks of 4096 or more do not fit in the
    /// high byte and are truncated. Kept as-is for wire compatibility.
    pub const fn to_nibble_bytes(self) -> (u8, u8) {
        ((self.0 % 16) as u8, (self.0 / 16) as u8)
    }

    /// Inverse of [`to_nibble_bytes`](Self::to_nibble_bytes).
    pub const fn from_nibble_bytes(low: u8, high: u8) -> Self {
        Self((low as u16 & 0x0f) + (high as u16) * 16)
    }
}

impl fmt::Display for BitPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Mask covering the low `n` bits (`n <= 16`).
fn mask(n: usize) -> u32 {
    (1u32 << n) - 1
}

/// Convert unit indices into a bit pattern. See [`BitPattern::from_indices`].
pub fn encode_indices(indices: &[usize], num_all_units: usize) -> BitPattern {
    BitPattern::from_indices(indices, num_all_units)
}

/// Recover the ascending index set of a bit pattern.
pub fn decode_indices(pattern: BitPattern, num_all_units: usize) -> Vec<usize> {
    pattern.indices(num_all_units)
}

/// Split a pattern into its `(low, high)` wire bytes.
pub fn split_to_bytes(pattern: BitPattern) -> (u8, u8) {
    pattern.to_nibble_bytes()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_encode_contiguous() {
        assert_eq!(encode_indices(&[0, 1, 2, 3, 4], 16).bits(), 0x1f);
        assert_eq!(encode_indices(&[2, 0, 1, 4, 3], 16).bits(), 0x1f);
    }

    #[test]
    fn test_encode_alternating() {
        assert_eq!(encode_indices(&[0, 2, 4], 16).bits(), 0x15);
        assert_eq!(encode_indices(&[2, 0, 4], 16).bits(), 0x15);
        assert_eq!(encode_indices(&[1, 3], 16).bits(), 0x0a);
        assert_eq!(encode_indices(&[3, 1], 16).bits(), 0x0a);
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode_indices(&[], 16), BitPattern::EMPTY);
        assert_eq!(encode_indices(&[], 5).bits(), 0);
    }

    #[test]
    fn test_encode_ignores_out_of_range() {
        assert_eq!(encode_indices(&[0, 1, 2, 3, 4, 5, 6, 7], 5).bits(), 0x1f);
        assert_eq!(encode_indices(&[2, 3, 5, 7, 6, 4, 0, 1], 5).bits(), 0x1f);
        assert_eq!(encode_indices(&[16, 40, usize::MAX], 16).bits(), 0);
    }

    #[test]
    fn test_encode_single_bits() {
        assert_eq!(encode_indices(&[0], 5).bits(), 0x01);
        assert_eq!(encode_indices(&[1], 5).bits(), 0x02);
        assert_eq!(encode_indices(&[2], 5).bits(), 0x04);
        assert_eq!(encode_indices(&[0, 1], 5).bits(), 0x03);
        assert_eq!(encode_indices(&[2, 0], 5).bits(), 0x05);
        assert_eq!(encode_indices(&[0, 1, 3], 5).bits(), 0x0b);
    }

    #[test]
    fn test_encode_duplicates_idempotent() {
        assert_eq!(encode_indices(&[1, 1, 1, 3, 3], 5).bits(), 0x0a);
    }

    #[test]
    fn test_encode_full_width() {
        let all: Vec<usize> = (0..16).collect();
        assert_eq!(encode_indices(&all, 16).bits(), 0xffff);
        assert_eq!(encode_indices(&all, 20).bits(), 0xffff);
    }

    #[test]
    fn test_decode_recovers_filtered_set() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let n = rng.random_range(0..=16usize);
            let len = rng.random_range(0..24usize);
            let indices: Vec<usize> = (0..len).map(|_| rng.random_range(0..20)).collect();

            let pattern = encode_indices(&indices, n);
            let expected: Vec<usize> = indices
                .iter()
                .copied()
                .filter(|&i| i < n)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            assert_eq!(decode_indices(pattern, n), expected, "indices={indices:?} n={n}");
        }
    }

    #[test]
    fn test_nibble_split() {
        assert_eq!(split_to_bytes(BitPattern::from_bits(0x1f)), (0x0f, 0x01));
        assert_eq!(split_to_bytes(BitPattern::from_bits(0x07)), (0x07, 0x00));
        assert_eq!(split_to_bytes(BitPattern::from_bits(0x1c0)), (0x00, 0x1c));
        assert_eq!(split_to_bytes(BitPattern::from_bits(0x1ff)), (0x0f, 0x1f));
    }

    #[test]
    fn test_nibble_join_inverts_split_below_4096() {
        for bits in 0u16..4096 {
            let p = BitPattern::from_bits(bits);
            let (low, high) = p.to_nibble_bytes();
            assert_eq!(BitPattern::from_nibble_bytes(low, high), p);
        }
    }

    #[test]
    fn test_nibble_split_truncates_wide_masks() {
        // 0x1000 / 16 = 256 does not fit in the high byte.
        let (low, high) = BitPattern::from_bits(0x1000).to_nibble_bytes();
        assert_eq!((low, high), (0, 0));
    }

    #[test]
    fn test_count_and_contains() {
        let p = encode_indices(&[0, 3, 4], 5);
        assert_eq!(p.count(), 3);
        assert!(p.contains(3));
        assert!(!p.contains(1));
        assert!(!p.contains(99));
        assert_eq!(p.to_string(), "0x0019");
    }
}
