use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

// slabs grow 16, 32, ... nodes up to 8 << LARGE_PAGE_NODE_SHIFT
const LARGE_PAGE_NODE_SHIFT: usize = 9;
// chunks above this capacity are not kept around
const KEEP_CAPACITY: usize = 64 * 1024;

/// one chunk of received bytes
#[derive(Debug, Default)]
pub(crate) struct BufNode {
    pub(crate) data: Vec<u8>,
}

impl BufNode {
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<BufNode>,
    slabs: usize,
    allocated: usize,
}

/// free list of buffer nodes shared by all sockets
///
/// nodes are allocated in slabs of doubling size and recycled with their
/// chunk capacity, so steady traffic allocates nothing on the receive path.
#[derive(Debug, Default)]
pub struct NodePool {
    inner: Mutex<PoolInner>,
}

impl NodePool {
    /// a private pool
    pub fn new() -> Self {
        NodePool::default()
    }

    /// the process wide pool
    pub fn global() -> Arc<NodePool> {
        static POOL: OnceLock<Arc<NodePool>> = OnceLock::new();
        POOL.get_or_init(|| Arc::new(NodePool::new())).clone()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn alloc(&self) -> BufNode {
        let mut pool = self.lock();
        if pool.free.is_empty() {
            let n = 8 << (pool.slabs + 1).min(LARGE_PAGE_NODE_SHIFT);
            pool.slabs += 1;
            pool.allocated += n;
            pool.free.extend((0..n).map(|_| BufNode::default()));
        }
        pool.free.pop().unwrap_or_default()
    }

    pub(crate) fn free(&self, mut node: BufNode) {
        node.data.clear();
        if node.data.capacity() > KEEP_CAPACITY {
            node.data = Vec::new();
        }
        self.lock().free.push(node);
    }

    /// number of nodes sitting in the free list
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// number of nodes ever created by this pool
    pub fn allocated(&self) -> usize {
        self.lock().allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slabs_double() {
        let pool = NodePool::new();
        let first = pool.alloc();
        assert_eq!(pool.allocated(), 16);
        let rest: Vec<_> = (0..15).map(|_| pool.alloc()).collect();
        assert_eq!(pool.free_count(), 0);
        let extra = pool.alloc();
        assert_eq!(pool.allocated(), 16 + 32);

        pool.free(first);
        pool.free(extra);
        rest.into_iter().for_each(|n| pool.free(n));
        assert_eq!(pool.free_count(), pool.allocated());
    }

    #[test]
    fn capacity_is_reused() {
        let pool = NodePool::new();
        let mut node = pool.alloc();
        node.data.extend_from_slice(&[1; 100]);
        pool.free(node);
        let node = pool.alloc();
        assert!(node.data.is_empty());
        assert!(node.data.capacity() >= 100);
    }
}
