//! Translation cache for the execution engine.
//!
//! Decoded instructions are cached by guest PC and reused on later fetches
//! without re-reading guest memory, which is exactly why self-modifying code
//! must call `invalidate_range` after writing to executable memory.

use std::collections::HashMap;

use super::decode::Insn;

/// Maximum number of cached translations before the cache is dropped whole.
pub const CACHE_CAPACITY: usize = 4096;

/// Cached translations keyed by PC.
pub struct TranslationCache {
    entries: HashMap<u32, Insn>,
    /// Statistics: cache hits.
    pub hits: u64,
    /// Statistics: cache misses.
    pub misses: u64,
    /// Statistics: invalidation calls.
    pub invalidations: u64,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(CACHE_CAPACITY),
            hits: 0,
            misses: 0,
            invalidations: 0,
        }
    }

    /// Look up a translation by PC.
    #[inline]
    pub fn get(&mut self, pc: u32) -> Option<Insn> {
        match self.entries.get(&pc) {
            Some(insn) => {
                self.hits += 1;
                Some(*insn)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a freshly decoded translation.
    pub fn insert(&mut self, pc: u32, insn: Insn) {
        if self.entries.len() >= CACHE_CAPACITY {
            self.entries.clear();
        }
        self.entries.insert(pc, insn);
    }

    /// Drop every translation overlapping `[base, base + size)`.
    ///
    /// Idempotent: invalidating an empty or never-translated range is a
    /// no-op beyond the counter.
    pub fn invalidate_range(&mut self, base: u32, size: u32) {
        let start = base as u64;
        let end = base as u64 + size as u64;
        self.entries
            .retain(|&pc, _| !((pc as u64) < end && pc as u64 + 4 > start));
        self.invalidations += 1;
    }

    /// Drop everything (context-wide flush).
    pub fn flush(&mut self) {
        self.entries.clear();
        self.invalidations += 1;
    }

    /// Number of live translations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}
