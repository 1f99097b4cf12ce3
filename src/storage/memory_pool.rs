use crate::core::Transaction;
use data_encoding::HEXLOWER;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// A poisoned lock only means another handler thread panicked mid-update;
// the maps themselves stay structurally valid, so keep serving them.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        log::error!("Recovering poisoned read lock");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        log::error!("Recovering poisoned write lock");
        poisoned.into_inner()
    })
}

/// Transactions received but not yet mined.
/// ( K -> txid_hex, V => Transaction )
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        read(&self.inner).get(txid_hex).cloned()
    }

    /// Insert `tx`; returns `false` if it was already pooled.
    pub fn add(&self, tx: Transaction) -> bool {
        write(&self.inner)
            .insert(HEXLOWER.encode(tx.get_id()), tx)
            .is_none()
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        read(&self.inner).contains_key(txid_hex)
    }

    pub fn remove(&self, txid_hex: &str) {
        write(&self.inner).remove(txid_hex);
    }

    pub fn len(&self) -> usize {
        read(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.inner).is_empty()
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        read(&self.inner).values().cloned().collect()
    }
}

/// Block hashes announced by a peer and not yet fetched, in the order they
/// will be requested.
pub struct BlockInTransit {
    inner: RwLock<Vec<Vec<u8>>>,
}

impl Default for BlockInTransit {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockInTransit {
    pub fn new() -> BlockInTransit {
        BlockInTransit {
            inner: RwLock::new(vec![]),
        }
    }

    /// Drop whatever was queued and queue `blocks` instead.
    pub fn replace(&self, blocks: &[Vec<u8>]) {
        let mut inner = write(&self.inner);
        inner.clear();
        inner.extend(blocks.iter().cloned());
    }

    pub fn pop_first(&self) -> Option<Vec<u8>> {
        let mut inner = write(&self.inner);
        if inner.is_empty() {
            None
        } else {
            Some(inner.remove(0))
        }
    }

    pub fn remove(&self, block_hash: &[u8]) {
        let mut inner = write(&self.inner);
        if let Some(idx) = inner.iter().position(|x| x.eq(block_hash)) {
            inner.remove(idx);
        }
    }

    pub fn len(&self) -> usize {
        read(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.inner).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    #[test]
    fn test_pool_deduplicates_by_id() {
        let pool = MemoryPool::new();
        let tx = Transaction::new_coinbase_tx(&Wallet::new().unwrap().get_address(), "x").unwrap();
        let id = HEXLOWER.encode(tx.get_id());

        assert!(pool.add(tx.clone()));
        assert!(!pool.add(tx));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&id));

        pool.remove(&id);
        assert!(pool.is_empty());
        assert!(pool.get(&id).is_none());
    }

    #[test]
    fn test_transit_replace_and_pop() {
        let transit = BlockInTransit::new();
        transit.replace(&[vec![1], vec![2]]);
        transit.replace(&[vec![3], vec![4], vec![5]]);
        assert_eq!(transit.len(), 3);

        assert_eq!(transit.pop_first(), Some(vec![3]));
        transit.remove(&[5]);
        assert_eq!(transit.pop_first(), Some(vec![4]));
        assert_eq!(transit.pop_first(), None);
        assert!(transit.is_empty());
    }
}
