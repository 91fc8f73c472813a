use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use super::pool::{BufNode, NodePool};

// resumable separator search, reset by anything that consumes bytes
#[derive(Debug, Default)]
struct LineScan {
    sep: Vec<u8>,
    // bytes before `pos` can't start a match
    pos: usize,
    node: usize,
    off: usize,
    fresh: bool,
}

/// unread bytes of one socket, a chain of pooled nodes
///
/// `size` is the sum of the node lengths minus the read offset into the head
/// node. A node goes back to the pool as soon as its last byte is consumed.
#[derive(Debug)]
pub struct Buffer {
    pool: Arc<NodePool>,
    nodes: VecDeque<BufNode>,
    offset: usize,
    size: usize,
    scan: LineScan,
    #[cfg(test)]
    steps: usize,
}

impl Buffer {
    pub fn new(pool: Arc<NodePool>) -> Self {
        Buffer {
            pool,
            nodes: VecDeque::new(),
            offset: 0,
            size: 0,
            scan: LineScan::default(),
            #[cfg(test)]
            steps: 0,
        }
    }

    /// number of unread bytes
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// append one received chunk, returns the new size
    pub fn push(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return self.size;
        }
        let mut node = self.pool.alloc();
        node.data.extend_from_slice(data);
        self.nodes.push_back(node);
        self.size += data.len();
        self.size
    }

    fn consume(&mut self, n: usize, mut out: Option<&mut Vec<u8>>) {
        let mut left = n;
        while left > 0 {
            let head = match self.nodes.front() {
                Some(h) => h,
                None => break,
            };
            let take = (head.len() - self.offset).min(left);
            if let Some(out) = out.as_mut() {
                out.extend_from_slice(&head.data[self.offset..self.offset + take]);
            }
            self.offset += take;
            left -= take;
            if self.offset == head.len() {
                if let Some(node) = self.nodes.pop_front() {
                    self.pool.free(node);
                }
                self.offset = 0;
            }
        }
        self.size -= n - left;
        self.scan.fresh = false;
    }

    /// pop exactly `n` bytes, `None` if fewer are buffered
    pub fn pop(&mut self, n: usize) -> Option<Bytes> {
        if n > self.size {
            return None;
        }
        let mut out = Vec::with_capacity(n);
        self.consume(n, Some(&mut out));
        Some(Bytes::from(out))
    }

    /// drop `n` bytes, or everything if fewer are buffered
    pub fn discard(&mut self, n: usize) {
        self.consume(n.min(self.size), None);
    }

    /// pop every buffered byte
    pub fn read_all(&mut self) -> Bytes {
        let n = self.size;
        self.pop(n).unwrap_or_default()
    }

    /// return every node to the pool
    pub fn clear(&mut self) {
        while let Some(node) = self.nodes.pop_front() {
            self.pool.free(node);
        }
        self.offset = 0;
        self.size = 0;
        self.scan.fresh = false;
    }

    fn matches_at(&self, mut node: usize, mut off: usize, sep: &[u8]) -> bool {
        for &b in sep {
            while off == self.nodes[node].len() {
                node += 1;
                off = 0;
            }
            if self.nodes[node].data[off] != b {
                return false;
            }
            off += 1;
        }
        true
    }

    /// position of the first `sep` in the unread bytes
    ///
    /// a failed search remembers where it stopped, the next search with the
    /// same separator only looks at candidates that became complete since.
    pub fn find(&mut self, sep: &[u8]) -> Option<usize> {
        if !self.scan.fresh || self.scan.sep != sep {
            self.scan = LineScan {
                sep: sep.to_vec(),
                pos: 0,
                node: 0,
                off: self.offset,
                fresh: true,
            };
        }
        if sep.is_empty() {
            return Some(0);
        }

        let mut scan = std::mem::take(&mut self.scan);
        let mut found = None;
        while scan.pos + sep.len() <= self.size {
            #[cfg(test)]
            {
                self.steps += 1;
            }
            if self.matches_at(scan.node, scan.off, sep) {
                found = Some(scan.pos);
                break;
            }
            scan.pos += 1;
            scan.off += 1;
            if scan.off == self.nodes[scan.node].len() {
                scan.node += 1;
                scan.off = 0;
            }
        }
        self.scan = scan;
        found
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> (Arc<NodePool>, Buffer) {
        let pool = Arc::new(NodePool::new());
        let buf = Buffer::new(pool.clone());
        (pool, buf)
    }

    #[test]
    fn pop_across_chunk_boundaries() {
        let (_pool, mut buf) = buffer();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        // chunk sizes that never line up with the pop sizes
        let mut at = 0;
        for len in [1, 7, 300, 2, 190, 500] {
            buf.push(&data[at..at + len]);
            at += len;
        }
        assert_eq!(buf.len(), 1000);

        let mut out = Vec::new();
        for len in [3, 250, 1, 499, 247] {
            out.extend_from_slice(&buf.pop(len).unwrap());
        }
        assert_eq!(out, data);
        assert!(buf.is_empty());
        assert!(buf.pop(1).is_none());
    }

    #[test]
    fn drained_buffer_frees_every_node() {
        let (pool, mut buf) = buffer();
        for _ in 0..40 {
            buf.push(b"abcde");
        }
        assert_eq!(pool.free_count(), pool.allocated() - 40);
        buf.pop(12).unwrap();
        buf.discard(8);
        // the head node is partially consumed
        assert_eq!(pool.free_count(), pool.allocated() - 36);
        buf.read_all();
        assert_eq!(pool.free_count(), pool.allocated());

        buf.push(b"left over");
        drop(buf);
        assert_eq!(pool.free_count(), pool.allocated());
    }

    #[test]
    fn find_separator_across_nodes() {
        let (_pool, mut buf) = buffer();
        buf.push(b"hello\r");
        assert_eq!(buf.find(b"\r\n"), None);
        buf.push(b"\nworld");
        assert_eq!(buf.find(b"\r\n"), Some(5));
        assert_eq!(&buf.pop(5).unwrap()[..], b"hello");
        buf.discard(2);
        assert_eq!(buf.find(b"\r\n"), None);
        assert_eq!(&buf.read_all()[..], b"world");
    }

    #[test]
    fn byte_by_byte_scan_is_linear() {
        let (_pool, mut buf) = buffer();
        let msg = vec![b'x'; 2000];
        for b in &msg {
            buf.push(std::slice::from_ref(b));
            assert_eq!(buf.find(b"\r\n"), None);
        }
        buf.push(b"\r");
        assert_eq!(buf.find(b"\r\n"), None);
        buf.push(b"\n");
        assert_eq!(buf.find(b"\r\n"), Some(2000));
        // one step per candidate plus one per failed attempt
        assert!(buf.steps <= 2 * 2002, "steps = {}", buf.steps);
    }
}
