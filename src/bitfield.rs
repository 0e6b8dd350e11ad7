//! Bit set over piece or block indices.
//!
//! Used to track per-block save progress inside a partial piece and as the
//! input/output of storage integrity checks. Bits are numbered from the
//! high bit of the first byte, matching the wire-format convention.

use bytes::Bytes;

/// A fixed-length bit set, one bit per piece or block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `len` entries.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Creates a bitfield from raw bytes. Short input is zero-extended and
    /// spare bits in the last byte are cleared.
    pub fn from_bytes(bytes: Bytes, len: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(len.div_ceil(8), 0);
        let mut bf = Self { bits, len };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield with every bit set.
    pub fn full(len: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; len.div_ceil(8)],
            len,
        };
        bf.clear_spare_bits();
        bf
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        (self.bits[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 1 << (7 - (index % 8));
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] &= !(1 << (7 - (index % 8)));
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if every bit is set.
    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Number of entries the bitfield covers, not the number of set bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Indices of all set bits.
    pub fn set_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.has(i))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.len;
        if spare > 0 && !self.bits.is_empty() {
            let mask = 0xFFu8 << spare;
            let last = self.bits.len() - 1;
            self.bits[last] &= mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_count() {
        let mut bf = Bitfield::new(10);
        assert!(bf.is_empty());
        bf.set(0);
        bf.set(9);
        assert!(bf.has(0));
        assert!(bf.has(9));
        assert!(!bf.has(5));
        assert_eq!(bf.count(), 2);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut bf = Bitfield::new(8);
        bf.set(8);
        assert!(!bf.has(8));
        assert_eq!(bf.count(), 0);
    }

    #[test]
    fn test_full_clears_spare_bits() {
        let bf = Bitfield::full(10);
        assert!(bf.is_complete());
        assert_eq!(bf.count(), 10);
        // Last byte keeps only the two leading bits.
        assert_eq!(bf.as_bytes()[1], 0b1100_0000);
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let mut bf = Bitfield::new(12);
        bf.set(1);
        bf.set(11);
        let restored = Bitfield::from_bytes(bf.to_bytes(), 12);
        assert_eq!(restored, bf);
    }

    #[test]
    fn test_set_indices() {
        let mut bf = Bitfield::new(6);
        bf.set(2);
        bf.set(4);
        assert_eq!(bf.set_indices().collect::<Vec<_>>(), vec![2, 4]);
    }
}
