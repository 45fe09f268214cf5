//! Fixed-width packed index arrays.
//!
//! Stores a fixed-length sequence of small unsigned integers at a uniform
//! bit width, packed into `u64` words:
//! - Cells never span a word boundary, so every access is one shift and mask
//! - A zero-width storage is valid and reads all zeroes (single-value palettes)
//! - Bulk unpack walks words instead of dividing per cell
//!
//! # Example
//!
//! ```
//! use strata_storage::bit_storage::BitStorage;
//!
//! let mut storage = BitStorage::new(4, 4096);
//! storage.set(17, 11);
//! assert_eq!(storage.get(17), 11);
//! ```

use crate::error::{StorageError, StorageResult};

/// Widest cell a packed storage supports.
pub const MAX_BITS: u32 = 32;

/// Bit width needed to address `count` distinct values.
///
/// Zero and one value need no bits at all; everything else needs
/// `ceil(log2(count))`.
#[must_use]
pub const fn bits_for(count: usize) -> u32 {
    if count <= 1 {
        0
    } else {
        usize::BITS - (count - 1).leading_zeros()
    }
}

/// Fixed-width, fixed-length packed array of unsigned integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitStorage {
    /// Bits per cell, `0..=MAX_BITS`; zero means "all cells read 0".
    bits: u32,
    /// Mask with the low `bits` bits set.
    mask: u64,
    /// Number of cells.
    size: usize,
    /// Cells per 64-bit word; unused when `bits == 0`.
    values_per_word: usize,
    /// Backing words; empty when `bits == 0`.
    words: Vec<u64>,
}

impl BitStorage {
    /// Creates a zeroed storage for `size` cells at `bits` per cell.
    #[must_use]
    pub fn new(bits: u32, size: usize) -> Self {
        assert!(bits <= MAX_BITS, "cell width {bits} exceeds {MAX_BITS} bits");
        if bits == 0 {
            return Self {
                bits: 0,
                mask: 0,
                size,
                values_per_word: 0,
                words: Vec::new(),
            };
        }
        let values_per_word = (64 / bits) as usize;
        let words = vec![0u64; size.div_ceil(values_per_word)];
        Self {
            bits,
            mask: (1u64 << bits) - 1,
            size,
            values_per_word,
            words,
        }
    }

    /// Wraps existing words, validating their count against the geometry.
    pub fn from_raw(bits: u32, size: usize, words: Vec<u64>) -> StorageResult<Self> {
        assert!(bits <= MAX_BITS, "cell width {bits} exceeds {MAX_BITS} bits");
        let expected = Self::required_words(bits, size);
        if words.len() != expected {
            return Err(StorageError::StorageGeometry {
                expected,
                found: words.len(),
            });
        }
        if bits == 0 {
            return Ok(Self::new(0, size));
        }
        Ok(Self {
            bits,
            mask: (1u64 << bits) - 1,
            size,
            values_per_word: (64 / bits) as usize,
            words,
        })
    }

    /// Number of backing words a storage of this geometry uses.
    #[must_use]
    pub const fn required_words(bits: u32, size: usize) -> usize {
        if bits == 0 {
            0
        } else {
            size.div_ceil((64 / bits) as usize)
        }
    }

    /// Reads the cell at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        assert!(
            index < self.size,
            "index {index} out of range for {} cells",
            self.size
        );
        if self.bits == 0 {
            return 0;
        }
        let word = self.words[index / self.values_per_word];
        let shift = (index % self.values_per_word) as u32 * self.bits;
        (word >> shift) & self.mask
    }

    /// Writes the cell at `index`.
    pub fn set(&mut self, index: usize, value: u64) {
        self.get_and_set(index, value);
    }

    /// Writes the cell at `index` and returns the prior value.
    pub fn get_and_set(&mut self, index: usize, value: u64) -> u64 {
        assert!(
            index < self.size,
            "index {index} out of range for {} cells",
            self.size
        );
        if self.bits == 0 {
            assert!(value == 0, "zero-width storage only holds zero, got {value}");
            return 0;
        }
        debug_assert!(value <= self.mask, "value {value} exceeds {} bits", self.bits);
        let shift = (index % self.values_per_word) as u32 * self.bits;
        let word = &mut self.words[index / self.values_per_word];
        let prior = (*word >> shift) & self.mask;
        *word = (*word & !(self.mask << shift)) | ((value & self.mask) << shift);
        prior
    }

    /// Bits per cell.
    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of cells.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Whether the storage holds no cells.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Backing words.
    #[must_use]
    pub fn raw(&self) -> &[u64] {
        &self.words
    }

    /// Consumes the storage, returning the backing words.
    #[must_use]
    pub fn into_raw(self) -> Vec<u64> {
        self.words
    }

    /// Iterates over every cell in index order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.size).map(move |index| self.get(index))
    }

    /// Decodes every cell into `out`, which must hold exactly `len` slots.
    pub fn unpack_into(&self, out: &mut [u64]) {
        assert_eq!(
            out.len(),
            self.size,
            "output slice does not match cell count"
        );
        if self.bits == 0 {
            out.fill(0);
            return;
        }
        let mut index = 0;
        for &word in &self.words {
            let mut rest = word;
            for _ in 0..self.values_per_word {
                if index == self.size {
                    return;
                }
                out[index] = rest & self.mask;
                rest >>= self.bits;
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bits_for() {
        assert_eq!(bits_for(0), 0);
        assert_eq!(bits_for(1), 0);
        assert_eq!(bits_for(2), 1);
        assert_eq!(bits_for(16), 4);
        assert_eq!(bits_for(17), 5);
        assert_eq!(bits_for(256), 8);
        assert_eq!(bits_for(257), 9);
    }

    #[test]
    fn test_zero_width_reads_zero() {
        let mut storage = BitStorage::new(0, 64);
        assert_eq!(storage.bits(), 0);
        assert_eq!(storage.len(), 64);
        assert!(storage.raw().is_empty());
        for i in 0..64 {
            assert_eq!(storage.get(i), 0);
        }
        // Writing zero is a no-op, not an error.
        storage.set(13, 0);
        assert_eq!(storage.get(13), 0);
    }

    #[test]
    #[should_panic(expected = "zero-width storage only holds zero")]
    fn test_zero_width_rejects_nonzero() {
        let mut storage = BitStorage::new(0, 64);
        storage.set(0, 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_index_panics() {
        let storage = BitStorage::new(4, 16);
        let _ = storage.get(16);
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut storage = BitStorage::new(4, 4096);
        for i in 0..4096 {
            storage.set(i, (i % 16) as u64);
        }
        for i in 0..4096 {
            assert_eq!(storage.get(i), (i % 16) as u64);
        }
    }

    #[test]
    fn test_cells_do_not_bleed_across_word_boundary() {
        // 5 bits -> 12 cells per word; cells 11 and 12 sit in different words.
        let mut storage = BitStorage::new(5, 24);
        storage.set(11, 0b11111);
        storage.set(12, 0b10101);
        assert_eq!(storage.get(11), 0b11111);
        assert_eq!(storage.get(12), 0b10101);
        assert_eq!(storage.get(10), 0);
        assert_eq!(storage.get(13), 0);
    }

    #[test]
    fn test_get_and_set_returns_prior() {
        let mut storage = BitStorage::new(6, 10);
        assert_eq!(storage.get_and_set(3, 42), 0);
        assert_eq!(storage.get_and_set(3, 7), 42);
        assert_eq!(storage.get(3), 7);
    }

    #[test]
    fn test_from_raw_validates_word_count() {
        // 4 bits, 4096 cells -> 16 cells per word -> 256 words.
        assert!(BitStorage::from_raw(4, 4096, vec![0; 256]).is_ok());
        let err = BitStorage::from_raw(4, 4096, vec![0; 255]);
        match err {
            Err(StorageError::StorageGeometry { expected, found }) => {
                assert_eq!(expected, 256);
                assert_eq!(found, 255);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_unpack_matches_get() {
        let mut storage = BitStorage::new(3, 100);
        for i in 0..100 {
            storage.set(i, (i % 8) as u64);
        }
        let mut out = vec![0u64; 100];
        storage.unpack_into(&mut out);
        for (i, &value) in out.iter().enumerate() {
            assert_eq!(value, storage.get(i));
        }
    }

    #[test]
    fn test_iter_visits_all_cells() {
        let mut storage = BitStorage::new(8, 5);
        for (i, value) in [3u64, 1, 4, 1, 5].into_iter().enumerate() {
            storage.set(i, value);
        }
        let collected: Vec<u64> = storage.iter().collect();
        assert_eq!(collected, vec![3, 1, 4, 1, 5]);
    }

    proptest! {
        #[test]
        fn prop_roundtrip_random_cells(
            bits in 1u32..=16,
            writes in proptest::collection::vec((0usize..512, 0u64..u64::MAX), 1..64),
        ) {
            let mut storage = BitStorage::new(bits, 512);
            let mask = (1u64 << bits) - 1;
            let mut expected = vec![0u64; 512];
            for (index, value) in writes {
                let value = value & mask;
                storage.set(index, value);
                expected[index] = value;
            }
            for (index, &value) in expected.iter().enumerate() {
                prop_assert_eq!(storage.get(index), value);
            }
            let raw = storage.raw().to_vec();
            let rebuilt = BitStorage::from_raw(bits, 512, raw);
            prop_assert!(rebuilt.is_ok());
        }
    }
}
