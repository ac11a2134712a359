//! Cascading multi-resolution byte n-gram hashing.
//!
//! A text value is projected onto a fixed series of hash tables, grouped by
//! n-gram length: short n-grams on small tables first, then longer n-grams on
//! larger tables. Tables are laid out contiguously and every slot has a global
//! [`VarKey`] (`1 + table offset + slot`). Because the order is fixed, the
//! first `k` keys of the layout form a representation of size `k`, and smaller
//! representations are prefixes of larger ones.
//!
//! | length | table sizes                 |
//! |--------|-----------------------------|
//! | 1      | 1, 16, 32, 64, 128          |
//! | 2      | 256, 512, 1024              |
//! | 3      | 2048, 4096, 8192            |
//! | 4..=8  | 16384, 32768 (each length)  |
//!
//! Each n-gram is read as a big-endian integer of its bytes, decorrelated by a
//! fixed 64-bit permutation, then reduced modulo each table size. Between two
//! tables of the same length the permuted value is shifted by the raw n-gram
//! value, so that n-grams colliding in one table are unlikely to collide in
//! the next.

use std::ops::Range;
use std::sync::OnceLock;

use rayon::prelude::*;

use crate::common::VarKey;

/// Longest n-gram handled by the layout.
pub const MAX_NGRAM_LENGTH: usize = 8;

const TABLE_SPECS: &[(usize, u32)] = &[
    (1, 1),
    (1, 16),
    (1, 32),
    (1, 64),
    (1, 128),
    (2, 256),
    (2, 512),
    (2, 1024),
    (3, 2048),
    (3, 4096),
    (3, 8192),
    (4, 16384),
    (4, 32768),
    (5, 16384),
    (5, 32768),
    (6, 16384),
    (6, 32768),
    (7, 16384),
    (7, 32768),
    (8, 16384),
    (8, 32768),
];

// ============================================================================
// Layout
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashTable {
    pub ngram_length: usize,
    pub size: u32,
    /// Number of slots in all preceding tables.
    pub offset: u32,
}

impl HashTable {
    pub fn var_key(&self, slot: u32) -> VarKey {
        debug_assert!(slot < self.size);
        VarKey(1 + self.offset + slot)
    }
}

#[derive(Debug)]
pub struct HashTableLayout {
    tables: Vec<HashTable>,
    /// Tables of each n-gram length, indexed by length.
    by_length: Vec<Range<usize>>,
    /// Mask keeping the last `length` bytes of a rolling value.
    masks: Vec<u64>,
    max_var_key: u32,
}

static LAYOUT: OnceLock<HashTableLayout> = OnceLock::new();

/// The process-wide layout, built on first use.
pub fn layout() -> &'static HashTableLayout {
    LAYOUT.get_or_init(HashTableLayout::build)
}

impl HashTableLayout {
    fn build() -> Self {
        let mut tables = Vec::with_capacity(TABLE_SPECS.len());
        let mut by_length = vec![0..0; MAX_NGRAM_LENGTH + 1];
        let mut offset = 0u32;
        for (i, &(ngram_length, size)) in TABLE_SPECS.iter().enumerate() {
            tables.push(HashTable {
                ngram_length,
                size,
                offset,
            });
            offset += size;
            let range = &mut by_length[ngram_length];
            if range.start == range.end {
                *range = i..i + 1;
            } else {
                range.end = i + 1;
            }
        }

        let masks = (0..=MAX_NGRAM_LENGTH)
            .map(|length| match length {
                0 => 0,
                MAX_NGRAM_LENGTH => u64::MAX,
                _ => (1u64 << (8 * length)) - 1,
            })
            .collect();

        Self {
            tables,
            by_length,
            masks,
            max_var_key: offset,
        }
    }

    pub fn tables(&self) -> &[HashTable] {
        &self.tables
    }

    /// Highest valid key; keys run from 1 to this value.
    pub fn max_var_key(&self) -> u32 {
        self.max_var_key
    }

    pub fn tables_for_length(&self, length: usize) -> &[HashTable] {
        self.by_length
            .get(length)
            .map(|range| &self.tables[range.clone()])
            .unwrap_or(&[])
    }

    /// Table index and local slot of a key.
    pub fn locate(&self, key: VarKey) -> Option<(usize, u32)> {
        if key.0 == 0 || key.0 > self.max_var_key {
            return None;
        }
        let index = key.0 - 1;
        let table = self
            .tables
            .partition_point(|t| t.offset + t.size <= index);
        Some((table, index - self.tables[table].offset))
    }
}

// ============================================================================
// Permutation
// ============================================================================

/// Fixed 64-bit mixing permutation of `n`.
pub fn ith_random(n: u64) -> u64 {
    let mut v = n
        .wrapping_mul(3935559000370003845)
        .wrapping_add(2691343689449507681);
    v ^= v >> 21;
    v ^= v << 37;
    v ^= v >> 4;
    v = v.wrapping_mul(4768777513237032717);
    v ^= v << 20;
    v ^= v >> 41;
    v ^= v << 5;
    v
}

// ============================================================================
// Encoder
// ============================================================================

/// Sparse `(key, count)` pairs sorted by key, non-zero counts only.
pub type SparseCounts = Vec<(VarKey, u32)>;

/// Encodes text values restricted to a set of requested keys.
///
/// Only requested keys are ever counted; tables with no requested key, and
/// n-gram lengths with no such table, are skipped entirely.
#[derive(Debug, Clone)]
pub struct NGramEncoder {
    requested: Vec<u64>,
    /// Per table, whether any of its keys is requested.
    active_tables: Vec<bool>,
    active_lengths: Vec<usize>,
}

impl NGramEncoder {
    /// Keys outside the layout are ignored.
    pub fn new(keys: impl IntoIterator<Item = VarKey>) -> Self {
        let layout = layout();
        let mut requested = vec![0u64; layout.max_var_key() as usize / 64 + 1];
        let mut active_tables = vec![false; layout.tables().len()];
        for key in keys {
            if let Some((table, _)) = layout.locate(key) {
                requested[key.0 as usize / 64] |= 1 << (key.0 % 64);
                active_tables[table] = true;
            }
        }
        let active_lengths = (1..=MAX_NGRAM_LENGTH)
            .filter(|&length| {
                let range = &layout.by_length[length];
                active_tables[range.clone()].iter().any(|&a| a)
            })
            .collect();
        Self {
            requested,
            active_tables,
            active_lengths,
        }
    }

    /// The first `count` keys of the layout.
    pub fn first(count: u32) -> Self {
        let max = count.min(layout().max_var_key());
        Self::new((1..=max).map(VarKey))
    }

    /// Every key of the layout.
    pub fn all() -> Self {
        Self::first(u32::MAX)
    }

    #[inline]
    fn is_requested(&self, key: VarKey) -> bool {
        self.requested[key.0 as usize / 64] & (1 << (key.0 % 64)) != 0
    }

    pub fn encode(&self, text: &str) -> SparseCounts {
        let mut hits = Vec::new();
        self.collect_hits(text.as_bytes(), &mut hits);
        compact(hits)
    }

    /// Counts over all values of a list; n-grams never span two values.
    pub fn encode_list<S: AsRef<str>>(&self, texts: &[S]) -> SparseCounts {
        let mut hits = Vec::new();
        for text in texts {
            self.collect_hits(text.as_ref().as_bytes(), &mut hits);
        }
        compact(hits)
    }

    pub fn encode_batch<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Vec<SparseCounts> {
        texts.par_iter().map(|t| self.encode(t.as_ref())).collect()
    }

    fn collect_hits(&self, bytes: &[u8], hits: &mut Vec<VarKey>) {
        let layout = layout();
        for &length in &self.active_lengths {
            if bytes.len() < length {
                continue;
            }
            let mask = layout.masks[length];
            let range = layout.by_length[length].clone();
            let mut value = 0u64;
            for (i, &byte) in bytes.iter().enumerate() {
                value = ((value << 8) | u64::from(byte)) & mask;
                if i + 1 < length {
                    continue;
                }
                let mut permuted = ith_random(value);
                for t in range.clone() {
                    let table = &layout.tables[t];
                    if self.active_tables[t] {
                        let slot = ((permuted as i64).unsigned_abs() % u64::from(table.size)) as u32;
                        let key = table.var_key(slot);
                        if self.is_requested(key) {
                            hits.push(key);
                        }
                    }
                    permuted = permuted.wrapping_add(value);
                }
            }
        }
    }
}

fn compact(mut hits: Vec<VarKey>) -> SparseCounts {
    hits.sort_unstable();
    let mut counts: SparseCounts = Vec::new();
    for key in hits {
        match counts.last_mut() {
            Some((last, count)) if *last == key => *count += 1,
            _ => counts.push((key, 1)),
        }
    }
    counts
}
