//! Committed filter checkpoint cache
//!
//! `getcfcheckpt` asks for the filter header at every
//! [`CF_CHECKPT_INTERVAL`] heights up to a stop hash. Answering requires one
//! filter header lookup per interval, so the answers are cached per filter
//! type as `(block hash, filter header)` pairs.
//!
//! A reorganisation invalidates the tail of the cache. Each request scans
//! backwards for the longest prefix whose block hashes still match the
//! requested chain and only recomputes what lies beyond it.

use crate::backend::{ChainError, ChainProvider};
use crate::crypto::Hash;
use crate::network::message::{FilterType, CF_CHECKPT_INTERVAL};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Chain lookup failed: {0}")]
    Chain(#[from] ChainError),
    #[error("Missing filter header for block {0}")]
    MissingFilterHeader(Hash),
}

/// One cached checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CfHeaderEntry {
    pub block_hash: Hash,
    pub filter_header: Hash,
}

/// Length of the longest prefix of `cache` that agrees with `requested`
///
/// Scans backwards from the end of the request, so an extension of the
/// cached chain costs a single comparison.
pub fn fork_index(cache: &[CfHeaderEntry], requested: &[Hash]) -> usize {
    let mut idx = requested.len().min(cache.len());
    while idx > 0 {
        if cache[idx - 1].block_hash == requested[idx - 1] {
            break;
        }
        idx -= 1;
    }
    idx
}

/// Per filter type checkpoint cache
#[derive(Debug, Default)]
pub struct CheckpointCache {
    caches: RwLock<HashMap<FilterType, Vec<CfHeaderEntry>>>,
}

impl CheckpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached checkpoints for a filter type
    pub fn len(&self, filter_type: FilterType) -> usize {
        self.caches.read().get(&filter_type).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, filter_type: FilterType) -> bool {
        self.len(filter_type) == 0
    }

    /// Copy of the cached entries for a filter type
    pub fn entries(&self, filter_type: FilterType) -> Vec<CfHeaderEntry> {
        self.caches
            .read()
            .get(&filter_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Filter headers at every checkpoint interval up to `stop_hash`
    pub fn checkpoints(
        &self,
        chain: &dyn ChainProvider,
        filter_type: FilterType,
        stop_hash: &Hash,
    ) -> Result<Vec<Hash>, CheckpointError> {
        let block_hashes = chain.interval_block_hashes(stop_hash, CF_CHECKPT_INTERVAL)?;

        {
            let caches = self.caches.read();
            let cache = caches.get(&filter_type).map_or(&[][..], Vec::as_slice);
            if block_hashes.len() <= cache.len()
                && fork_index(cache, &block_hashes) == block_hashes.len()
            {
                log::trace!("Serving stale cache of size {}", cache.len());
                return Ok(cache[..block_hashes.len()]
                    .iter()
                    .map(|entry| entry.filter_header)
                    .collect());
            }
        }

        // Either the cache is too short or part of it is on a stale branch.
        // Another writer may have fixed either while the lock was released.
        let mut caches = self.caches.write();
        let cache = caches.entry(filter_type).or_default();
        let cached_len = cache.len();
        if block_hashes.len() > cached_len {
            log::info!(
                "Growing size of checkpoint cache from {} to {} block hashes",
                cached_len,
                block_hashes.len()
            );
            cache.resize(block_hashes.len(), CfHeaderEntry::default());
        }

        let fork_idx = fork_index(cache, &block_hashes);
        if fork_idx < cached_len.min(block_hashes.len()) {
            log::debug!(
                "Checkpoint cache for filter type {} diverges from the main chain at index {}",
                filter_type,
                fork_idx
            );
        }
        let stale = &block_hashes[fork_idx..];

        let filter_headers = chain.filter_headers_by_block_hashes(stale, filter_type)?;
        let mut fresh = Vec::with_capacity(stale.len());
        for (block_hash, header) in stale.iter().zip(filter_headers) {
            let filter_header = header.ok_or(CheckpointError::MissingFilterHeader(*block_hash))?;
            fresh.push(CfHeaderEntry {
                block_hash: *block_hash,
                filter_header,
            });
        }
        if fresh.len() != stale.len() {
            return Err(CheckpointError::MissingFilterHeader(stale[fresh.len()]));
        }

        cache[fork_idx..fork_idx + fresh.len()].copy_from_slice(&fresh);

        Ok(cache[..block_hashes.len()]
            .iter()
            .map(|entry| entry.filter_header)
            .collect())
    }
}
