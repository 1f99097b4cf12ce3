use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    addr: String,
}

impl Node {
    fn new(addr: String) -> Node {
        Node { addr }
    }

    pub fn get_addr(&self) -> &str {
        &self.addr
    }
}

/// Peers this node knows about, in the order they were learned.
pub struct Nodes {
    inner: RwLock<Vec<Node>>,
}

impl Default for Nodes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes {
            inner: RwLock::new(vec![]),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Node>> {
        self.inner.read().unwrap_or_else(|poisoned| {
            log::error!("Recovering poisoned read lock on known nodes");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Node>> {
        self.inner.write().unwrap_or_else(|poisoned| {
            log::error!("Recovering poisoned write lock on known nodes");
            poisoned.into_inner()
        })
    }

    /// Returns `true` if the address was not known before.
    pub fn add_node(&self, addr: &str) -> bool {
        let mut inner = self.write();
        if inner.iter().any(|x| x.get_addr() == addr) {
            return false;
        }
        inner.push(Node::new(addr.to_string()));
        true
    }

    pub fn evict_node(&self, addr: &str) {
        let mut inner = self.write();
        if let Some(idx) = inner.iter().position(|x| x.get_addr() == addr) {
            inner.remove(idx);
        }
    }

    pub fn get_addrs(&self) -> Vec<String> {
        self.read().iter().map(|n| n.addr.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn node_is_known(&self, addr: &str) -> bool {
        self.read().iter().any(|x| x.get_addr() == addr)
    }
}
