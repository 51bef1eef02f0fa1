//! In-memory block index
//!
//! Keeps every known block, tracks the most-work (here: longest) chain and
//! derives a committed filter and filter header chain for each block.

use crate::backend::{BestState, ChainError, ChainProvider, Deployment};
use crate::core::transaction::write_compact_size;
use crate::core::{Block, BlockHeader};
use crate::crypto::{sha256, Hash};
use crate::network::message::{FilterType, MAX_BLOCK_HEADERS_PER_MSG};
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Timestamp of the generated genesis block
const GENESIS_TIME: u32 = 1_600_000_000;

/// Target spacing used when extending the chain
const BLOCK_SPACING: u32 = 600;

/// Number of blocks the median time is taken over
const MEDIAN_TIME_BLOCKS: usize = 11;

/// Regular filter for a block: element count followed by a short digest of
/// every non-empty output script
pub fn build_filter(block: &Block) -> Vec<u8> {
    let scripts: Vec<&[u8]> = block
        .transactions
        .iter()
        .flat_map(|tx| tx.outputs.iter())
        .map(|out| out.pk_script.as_slice())
        .filter(|script| !script.is_empty())
        .collect();

    let mut filter = Vec::with_capacity(1 + scripts.len() * 8);
    write_compact_size(&mut filter, scripts.len() as u64);
    for script in scripts {
        filter.extend_from_slice(&sha256(script)[..8]);
    }
    filter
}

#[derive(Debug, Clone)]
struct BlockNode {
    block: Block,
    height: i32,
    filter: Vec<u8>,
    filter_hash: Hash,
    filter_header: Hash,
}

#[derive(Debug)]
struct ChainState {
    nodes: HashMap<Hash, BlockNode>,
    /// Main chain hashes indexed by height
    main: Vec<Hash>,
    deployments: HashSet<Deployment>,
}

impl ChainState {
    fn tip(&self) -> &BlockNode {
        // main always holds at least the genesis block
        &self.nodes[&self.main[self.main.len() - 1]]
    }

    fn in_main_chain(&self, hash: &Hash) -> bool {
        self.nodes
            .get(hash)
            .map_or(false, |node| self.main.get(node.height as usize) == Some(hash))
    }

    fn node(&self, hash: &Hash) -> Result<&BlockNode, ChainError> {
        self.nodes.get(hash).ok_or(ChainError::NotFound(*hash))
    }

    /// Ancestor of `hash` at `height`
    fn ancestor(&self, hash: &Hash, height: i32) -> Option<Hash> {
        let mut node = self.nodes.get(hash)?;
        if height < 0 || height > node.height {
            return None;
        }
        if self.in_main_chain(hash) {
            return self.main.get(height as usize).copied();
        }
        let mut current = *hash;
        while node.height > height {
            current = node.block.header.prev_block;
            node = self.nodes.get(&current)?;
            if self.in_main_chain(&current) {
                return self.main.get(height as usize).copied();
            }
        }
        Some(current)
    }

    /// Main-chain hashes following the first locator hash on the main chain
    fn locate(&self, locator: &[Hash], hash_stop: &Hash, max_entries: usize) -> Vec<Hash> {
        if locator.is_empty() {
            return match self.nodes.get(hash_stop) {
                Some(_) => vec![*hash_stop],
                None => Vec::new(),
            };
        }

        let start = locator
            .iter()
            .find(|hash| self.in_main_chain(hash))
            .map_or(0, |hash| self.nodes[hash].height)
            + 1;
        let tip_height = self.main.len() as i32 - 1;
        if start > tip_height {
            return Vec::new();
        }

        let mut end = tip_height;
        if let Some(stop) = self.nodes.get(hash_stop) {
            if self.in_main_chain(hash_stop) && stop.height >= start {
                end = stop.height;
            }
        }
        let total = ((end - start + 1) as usize).min(max_entries);
        self.main[start as usize..start as usize + total].to_vec()
    }
}

/// In-memory chain with reorganisation support
#[derive(Debug)]
pub struct MemChain {
    state: RwLock<ChainState>,
}

impl MemChain {
    /// Create a chain from its genesis block
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.block_hash();
        let filter = build_filter(&genesis);
        let filter_hash = Hash::digest(&filter);
        let node = BlockNode {
            block: genesis,
            height: 0,
            filter_header: Hash::digest_pair(&filter_hash, &Hash::ZERO),
            filter_hash,
            filter,
        };
        Self {
            state: RwLock::new(ChainState {
                nodes: HashMap::from([(hash, node)]),
                main: vec![hash],
                deployments: HashSet::new(),
            }),
        }
    }

    /// A chain of empty blocks with its tip at `height`
    pub fn with_height(height: i32) -> Self {
        let chain = Self::new(Block::new(Hash::ZERO, GENESIS_TIME, vec![]));
        chain.extend(height.max(0) as usize);
        chain
    }

    /// Append `count` empty blocks to the best chain, returning the new tip
    pub fn extend(&self, count: usize) -> Hash {
        let mut tip = self.best_tip();
        for _ in 0..count {
            let timestamp = {
                let state = self.state.read();
                state.tip().block.header.timestamp + BLOCK_SPACING
            };
            let block = Block::new(tip, timestamp, vec![]);
            tip = block.block_hash();
            if let Err(e) = self.add_block(block) {
                log::warn!("Failed to extend chain: {}", e);
                break;
            }
        }
        tip
    }

    /// Connect a block; returns false if it was already known
    ///
    /// A block that makes its branch longer than the main chain triggers a
    /// reorganisation onto that branch.
    pub fn add_block(&self, block: Block) -> Result<bool, ChainError> {
        let hash = block.block_hash();
        let mut state = self.state.write();
        if state.nodes.contains_key(&hash) {
            return Ok(false);
        }

        let parent = state.node(&block.header.prev_block)?;
        let height = parent.height + 1;
        let filter = build_filter(&block);
        let filter_hash = Hash::digest(&filter);
        let filter_header = Hash::digest_pair(&filter_hash, &parent.filter_header);
        state.nodes.insert(
            hash,
            BlockNode {
                block,
                height,
                filter,
                filter_hash,
                filter_header,
            },
        );

        let tip_height = state.main.len() as i32 - 1;
        if height <= tip_height {
            log::debug!("Added side chain block {} at height {}", hash, height);
            return Ok(true);
        }

        // Walk back to the fork point and switch the main chain over
        let mut branch = vec![hash];
        let mut current = state.nodes[&hash].block.header.prev_block;
        while !state.in_main_chain(&current) {
            branch.push(current);
            current = state.nodes[&current].block.header.prev_block;
        }
        let fork_height = state.nodes[&current].height;
        if fork_height < tip_height {
            log::info!(
                "Reorganising chain at height {} onto {} ({} blocks)",
                fork_height,
                hash,
                branch.len()
            );
        }
        state.main.truncate(fork_height as usize + 1);
        state.main.extend(branch.into_iter().rev());
        Ok(true)
    }

    pub fn best_tip(&self) -> Hash {
        let state = self.state.read();
        state.main[state.main.len() - 1]
    }

    pub fn hash_at_height(&self, height: i32) -> Option<Hash> {
        if height < 0 {
            return None;
        }
        self.state.read().main.get(height as usize).copied()
    }

    pub fn block_height(&self, hash: &Hash) -> Option<i32> {
        self.state.read().nodes.get(hash).map(|node| node.height)
    }

    pub fn set_deployment_active(&self, deployment: Deployment) {
        self.state.write().deployments.insert(deployment);
    }
}

impl ChainProvider for MemChain {
    fn best_snapshot(&self) -> BestState {
        let state = self.state.read();
        let tip = state.tip();

        let mut times: Vec<u32> = state
            .main
            .iter()
            .rev()
            .take(MEDIAN_TIME_BLOCKS)
            .map(|hash| state.nodes[hash].block.header.timestamp)
            .collect();
        times.sort_unstable();
        let median = times[times.len() / 2];

        BestState {
            hash: tip.block.block_hash(),
            height: tip.height,
            median_time: Utc
                .timestamp_opt(median as i64, 0)
                .single()
                .unwrap_or_default(),
        }
    }

    fn block_by_hash(&self, hash: &Hash) -> Result<Block, ChainError> {
        Ok(self.state.read().node(hash)?.block.clone())
    }

    fn header_by_hash(&self, hash: &Hash) -> Result<BlockHeader, ChainError> {
        Ok(self.state.read().node(hash)?.block.header)
    }

    fn locate_blocks(&self, locator: &[Hash], hash_stop: &Hash, max_hashes: usize) -> Vec<Hash> {
        self.state.read().locate(locator, hash_stop, max_hashes)
    }

    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash) -> Vec<BlockHeader> {
        let state = self.state.read();
        state
            .locate(locator, hash_stop, MAX_BLOCK_HEADERS_PER_MSG)
            .iter()
            .map(|hash| state.nodes[hash].block.header)
            .collect()
    }

    fn is_deployment_active(&self, deployment: Deployment) -> Result<bool, ChainError> {
        Ok(self.state.read().deployments.contains(&deployment))
    }

    fn height_to_hash_range(
        &self,
        start_height: i32,
        end_hash: &Hash,
        max_results: usize,
    ) -> Result<Vec<Hash>, ChainError> {
        let state = self.state.read();
        let end_height = state.node(end_hash)?.height;
        if start_height < 0 {
            return Err(ChainError::InvalidRequest(format!(
                "start height {} is below 0",
                start_height
            )));
        }
        if start_height > end_height {
            return Err(ChainError::InvalidRequest(format!(
                "start height {} is above end height {}",
                start_height, end_height
            )));
        }
        let count = (end_height - start_height + 1) as usize;
        if count > max_results {
            return Err(ChainError::InvalidRequest(format!(
                "range of {} blocks exceeds maximum of {}",
                count, max_results
            )));
        }

        let mut hashes = Vec::with_capacity(count);
        let mut current = *end_hash;
        for _ in 0..count {
            hashes.push(current);
            current = state.nodes[&current].block.header.prev_block;
        }
        hashes.reverse();
        Ok(hashes)
    }

    fn interval_block_hashes(
        &self,
        end_hash: &Hash,
        interval: u32,
    ) -> Result<Vec<Hash>, ChainError> {
        if interval == 0 {
            return Err(ChainError::InvalidRequest("interval must be positive".into()));
        }
        let state = self.state.read();
        let end_height = state.node(end_hash)?.height;
        let count = end_height as usize / interval as usize;

        (1..=count)
            .map(|i| {
                let height = (i * interval as usize) as i32;
                state
                    .ancestor(end_hash, height)
                    .ok_or(ChainError::NotFound(*end_hash))
            })
            .collect()
    }

    fn filters_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Vec<u8>>>, ChainError> {
        check_filter_type(filter_type)?;
        let state = self.state.read();
        Ok(hashes
            .iter()
            .map(|hash| state.nodes.get(hash).map(|node| node.filter.clone()))
            .collect())
    }

    fn filter_hashes_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Hash>>, ChainError> {
        check_filter_type(filter_type)?;
        let state = self.state.read();
        Ok(hashes
            .iter()
            .map(|hash| state.nodes.get(hash).map(|node| node.filter_hash))
            .collect())
    }

    fn filter_header_by_block_hash(
        &self,
        hash: &Hash,
        filter_type: FilterType,
    ) -> Result<Option<Hash>, ChainError> {
        check_filter_type(filter_type)?;
        Ok(self
            .state
            .read()
            .nodes
            .get(hash)
            .map(|node| node.filter_header))
    }

    fn filter_headers_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: FilterType,
    ) -> Result<Vec<Option<Hash>>, ChainError> {
        check_filter_type(filter_type)?;
        let state = self.state.read();
        Ok(hashes
            .iter()
            .map(|hash| state.nodes.get(hash).map(|node| node.filter_header))
            .collect())
    }
}

fn check_filter_type(filter_type: FilterType) -> Result<(), ChainError> {
    if filter_type != FilterType::REGULAR {
        return Err(ChainError::InvalidRequest(format!(
            "unsupported filter type {}",
            filter_type
        )));
    }
    Ok(())
}
