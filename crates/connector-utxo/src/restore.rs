//! Bounded cache of block layouts used while rebuilding outputs from the daemon.

use bitcoin::{BlockHash, Txid};
use schnellru::{ByLength, LruMap};
use std::collections::HashMap;

/// What recovery needs from a block: its height and each transaction's position.
#[derive(Debug, Clone)]
pub(crate) struct RestoreBlock {
    pub height: u32,
    pub positions: HashMap<Txid, u32>,
}

impl RestoreBlock {
    pub(crate) fn new(height: u32, txids: &[Txid]) -> Self {
        Self {
            height,
            positions: txids
                .iter()
                .enumerate()
                .map(|(index, txid)| (*txid, index as u32))
                .collect(),
        }
    }
}

/// Least-recently-used block cache, bounded by entry count.
pub struct BlockRestoreCache {
    blocks: LruMap<BlockHash, RestoreBlock, ByLength>,
}

impl BlockRestoreCache {
    pub fn new(capacity: u32) -> Self {
        Self {
            blocks: LruMap::new(ByLength::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.peek(hash).is_some()
    }

    pub(crate) fn insert(&mut self, hash: BlockHash, block: RestoreBlock) {
        self.blocks.insert(hash, block);
    }

    /// Looks up a block, marking it most recently used.
    pub(crate) fn get(&mut self, hash: &BlockHash) -> Option<&RestoreBlock> {
        self.blocks.get(hash).map(|block| &*block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn block_hash(n: u32) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_le_bytes());
        BlockHash::from_byte_array(bytes)
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let mut cache = BlockRestoreCache::new(1000);
        for n in 0..1000 {
            cache.insert(block_hash(n), RestoreBlock::new(n, &[]));
        }
        assert_eq!(cache.len(), 1000);

        // Touch the oldest entry so block 1 becomes the eviction candidate.
        assert_eq!(cache.get(&block_hash(0)).map(|b| b.height), Some(0));

        cache.insert(block_hash(1000), RestoreBlock::new(1000, &[]));
        assert_eq!(cache.len(), 1000);
        assert!(cache.contains(&block_hash(0)));
        assert!(!cache.contains(&block_hash(1)));
        assert!(cache.contains(&block_hash(1000)));
    }

    #[test]
    fn test_positions_follow_block_order() {
        let txids: Vec<Txid> = (0..3u8).map(|n| Txid::from_byte_array([n; 32])).collect();
        let block = RestoreBlock::new(7, &txids);
        assert_eq!(block.positions[&txids[2]], 2);
        assert_eq!(block.height, 7);
    }
}
