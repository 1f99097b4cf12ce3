use crate::core::Block;
use data_encoding::HEXLOWER;
use log::{debug, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Most blocks held back at once waiting for a parent.
pub const MAX_ORPHAN_BLOCKS: usize = 100;

/// How long a held-back block may wait for its parent before it is dropped.
pub const ORPHAN_BLOCK_TIMEOUT: Duration = Duration::from_secs(600);

struct OrphanBlock {
    block: Block,
    received_at: Instant,
}

/// Blocks received before their parent, oldest first.
///
/// The buffer is bounded twice over: entries older than the timeout are
/// purged on every insert, and once `capacity` is reached the oldest entry
/// makes room for the new one.
pub struct OrphanBlocks {
    capacity: usize,
    timeout: Duration,
    queue: VecDeque<OrphanBlock>,
}

impl Default for OrphanBlocks {
    fn default() -> Self {
        Self::new(MAX_ORPHAN_BLOCKS, ORPHAN_BLOCK_TIMEOUT)
    }
}

impl OrphanBlocks {
    pub fn new(capacity: usize, timeout: Duration) -> OrphanBlocks {
        OrphanBlocks {
            capacity: capacity.max(1),
            timeout,
            queue: VecDeque::new(),
        }
    }

    /// Hold `block` until its parent is stored. A block already held is
    /// not added twice.
    pub fn insert(&mut self, block: Block, now: Instant) {
        self.purge_expired(now);
        if self.contains(block.get_hash()) {
            return;
        }
        while self.queue.len() >= self.capacity {
            if let Some(oldest) = self.queue.pop_front() {
                warn!(
                    "Orphan buffer full, dropping block {}",
                    oldest.block.get_hash_hex()
                );
            }
        }
        self.queue.push_back(OrphanBlock {
            block,
            received_at: now,
        });
    }

    /// Drop every block that has waited longer than the timeout. Returns
    /// how many were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.queue.len();
        let timeout = self.timeout;
        self.queue
            .retain(|orphan| now.saturating_duration_since(orphan.received_at) < timeout);
        let purged = before - self.queue.len();
        if purged > 0 {
            debug!("Purged {purged} orphan blocks whose parent never arrived");
        }
        purged
    }

    /// Remove and return the held blocks whose parent is `parent_hash`.
    pub fn take_children(&mut self, parent_hash: &[u8]) -> Vec<Block> {
        let mut children = vec![];
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for orphan in self.queue.drain(..) {
            if orphan.block.get_pre_block_hash() == parent_hash {
                debug!(
                    "Block {} found its parent {}",
                    orphan.block.get_hash_hex(),
                    HEXLOWER.encode(parent_hash)
                );
                children.push(orphan.block);
            } else {
                kept.push_back(orphan);
            }
        }
        self.queue = kept;
        children
    }

    pub fn contains(&self, block_hash: &[u8]) -> bool {
        self.queue
            .iter()
            .any(|orphan| orphan.block.get_hash() == block_hash)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;
    use crate::wallet::Wallet;

    fn block_on(parent: Vec<u8>) -> Block {
        let address = Wallet::new().unwrap().get_address();
        Block::new_block(&[Transaction::new_coinbase_tx(&address, "").unwrap()], parent).unwrap()
    }

    #[test]
    fn test_full_buffer_drops_oldest() {
        let mut orphans = OrphanBlocks::new(2, ORPHAN_BLOCK_TIMEOUT);
        let now = Instant::now();
        let first = block_on(vec![1; 32]);
        let second = block_on(vec![2; 32]);
        let third = block_on(vec![3; 32]);

        orphans.insert(first.clone(), now);
        orphans.insert(second.clone(), now);
        orphans.insert(third.clone(), now);

        assert_eq!(orphans.len(), 2);
        assert!(!orphans.contains(first.get_hash()));
        assert!(orphans.contains(second.get_hash()));
        assert!(orphans.contains(third.get_hash()));
    }

    #[test]
    fn test_stale_orphans_are_purged() {
        let mut orphans = OrphanBlocks::new(10, Duration::from_secs(30));
        let start = Instant::now();
        let stale = block_on(vec![1; 32]);
        let fresh = block_on(vec![2; 32]);

        orphans.insert(stale.clone(), start);
        orphans.insert(fresh.clone(), start + Duration::from_secs(20));
        assert_eq!(orphans.purge_expired(start + Duration::from_secs(31)), 1);
        assert!(!orphans.contains(stale.get_hash()));
        assert!(orphans.contains(fresh.get_hash()));

        // Inserting also purges.
        orphans.insert(block_on(vec![3; 32]), start + Duration::from_secs(60));
        assert_eq!(orphans.len(), 1);
    }

    #[test]
    fn test_children_are_taken_once() {
        let mut orphans = OrphanBlocks::default();
        let now = Instant::now();
        let a = block_on(vec![7; 32]);
        let b = block_on(vec![7; 32]);
        let other = block_on(vec![8; 32]);
        orphans.insert(a.clone(), now);
        orphans.insert(a.clone(), now);
        orphans.insert(b.clone(), now);
        orphans.insert(other, now);
        assert_eq!(orphans.len(), 3);

        let children = orphans.take_children(&[7; 32]);
        assert_eq!(children, vec![a, b]);
        assert!(orphans.take_children(&[7; 32]).is_empty());
        assert_eq!(orphans.len(), 1);
    }
}
