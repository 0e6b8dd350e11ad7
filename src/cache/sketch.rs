//! Approximate access-frequency tracking for cache admission.
//!
//! A 4-bit count-min sketch: each key maps to four counters in a table of
//! 64-bit words (16 counters per word), and its estimated frequency is the
//! minimum of the four. Counters saturate at 15. Once the number of
//! recorded accesses reaches the sampling threshold, every counter is
//! halved, so stale entries decay instead of pinning the cache.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Seeds for deriving four independent counter indices from one hash.
/// Taken from FNV and golden-ratio mixing constants.
const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

const COUNTER_MAX: u8 = 15;

/// 4-bit count-min sketch with periodic aging.
#[derive(Debug)]
pub struct FrequencySketch {
    /// Each u64 holds sixteen 4-bit counters.
    table: Vec<u64>,
    /// Bitmask for table indexing; `table.len() - 1` (power of two).
    table_mask: usize,
    /// Accesses recorded since the last aging pass.
    size: u32,
    /// When `size` reaches this, all counters are halved.
    sample_size: u32,
}

impl FrequencySketch {
    /// Creates a sketch able to track roughly `capacity` distinct keys.
    pub fn new(capacity: u32) -> Self {
        let mut sketch = Self {
            table: Vec::new(),
            table_mask: 0,
            size: 0,
            sample_size: 0,
        };
        sketch.change_capacity(capacity);
        sketch
    }

    /// Rebuilds the table, zeroed, for a new capacity. The width is the
    /// next power of two at or above `capacity`.
    pub fn change_capacity(&mut self, capacity: u32) {
        let width = capacity.max(1).next_power_of_two() as usize;
        self.table = vec![0; width];
        self.table_mask = width - 1;
        self.sample_size = width as u32;
        self.size = 0;
    }

    /// Estimated access frequency of `key`: the minimum of its four
    /// counters.
    pub fn get_frequency<K: Hash>(&self, key: &K) -> u8 {
        let hash = hash_of(key);
        (0..4)
            .map(|i| self.counter_at(self.index_of(hash, i)))
            .min()
            .unwrap_or(0)
    }

    /// Records an access to `key`, incrementing up to four counters, then
    /// ages the sketch if the sampling threshold is reached.
    pub fn record_access<K: Hash>(&mut self, key: &K) {
        let hash = hash_of(key);
        let mut incremented = false;
        for i in 0..4 {
            incremented |= self.increment_at(self.index_of(hash, i));
        }
        if incremented {
            self.size += 1;
            if self.size >= self.sample_size {
                self.age();
            }
        }
    }

    /// Index of the i-th counter for `hash`: a (word, slot) pair packed as
    /// `word * 16 + slot`.
    fn index_of(&self, hash: u64, i: usize) -> usize {
        let mut h = hash.wrapping_add(SEEDS[i]).wrapping_mul(SEEDS[i]);
        h ^= h >> 32;
        let word = (h as usize) & self.table_mask;
        let slot = ((h >> 48) & 0xf) as usize;
        word * 16 + slot
    }

    fn counter_at(&self, index: usize) -> u8 {
        let shift = (index % 16) * 4;
        ((self.table[index / 16] >> shift) & 0xf) as u8
    }

    /// Returns false if the counter was already saturated.
    fn increment_at(&mut self, index: usize) -> bool {
        let shift = (index % 16) * 4;
        let word = &mut self.table[index / 16];
        if (*word >> shift) & 0xf < COUNTER_MAX as u64 {
            *word += 1 << shift;
            true
        } else {
            false
        }
    }

    /// Halves every counter. The high bit of each nibble is masked off
    /// before shifting so counters cannot bleed into their neighbours.
    fn age(&mut self) {
        for word in &mut self.table {
            *word = (*word >> 1) & 0x7777_7777_7777_7777;
        }
        self.size = 0;
    }
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
