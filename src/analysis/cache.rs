//! Shared, synchronized analysis cache.
//!
//! Blocks are analyzed in parallel at the outer level while each block's analysis is
//! strictly single-threaded: the cache hands out one `Arc<Mutex<SymbolicAnalysis>>` per
//! block entry, so at most one thread runs `update`, `prepare`, or `reemit` on a given
//! block at a time while unrelated blocks proceed concurrently.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rayon::prelude::*;

use crate::{analysis::analyzer::SymbolicAnalysis, ir::BasicBlock, Error, Result};

/// Concurrent map of per-block symbolic analyses, keyed by block entry address.
#[derive(Debug, Default)]
pub struct AnalysisCache {
    entries: DashMap<u64, Arc<Mutex<SymbolicAnalysis>>>,
}

impl AnalysisCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        AnalysisCache::default()
    }

    /// Number of cached analyses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks if the cache holds no analyses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the analysis slot for a block entry, creating it on first use.
    #[must_use]
    pub fn entry(&self, entry_vip: u64) -> Arc<Mutex<SymbolicAnalysis>> {
        self.entries
            .entry(entry_vip)
            .or_insert_with(|| Arc::new(Mutex::new(SymbolicAnalysis::new())))
            .clone()
    }

    /// Runs `f` under the per-block lock of `entry_vip`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the slot's mutex was poisoned.
    pub fn with_analysis<R>(
        &self,
        entry_vip: u64,
        f: impl FnOnce(&mut SymbolicAnalysis) -> R,
    ) -> Result<R> {
        let slot = self.entry(entry_vip);
        let mut guard = slot.lock().map_err(|_| Error::LockError)?;
        Ok(f(&mut guard))
    }

    /// Rebuilds the analyses of many blocks in parallel.
    ///
    /// Each block is analyzed on its own slot; blocks sharing an entry address
    /// serialize on the slot mutex.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::LockError`] encountered.
    pub fn update_all(&self, blocks: &[BasicBlock]) -> Result<()> {
        blocks
            .par_iter()
            .map(|block| {
                self.with_analysis(block.entry_vip, |analysis| {
                    analysis.update(block);
                })
            })
            .collect::<Result<()>>()
    }

    /// Drops the cached analysis of one block.
    pub fn invalidate(&self, entry_vip: u64) {
        self.entries.remove(&entry_vip);
    }

    /// Drops every cached analysis.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
