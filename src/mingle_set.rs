use std::net::SocketAddr;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::message::Fingerprint;

/// One ready-to-mingle participant as returned by [MingleSet::get].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mingler {
    pub addr: SocketAddr,
    pub fingerprint: Fingerprint,
    pub timestamp: Instant,
}

/// The set of peers that have recently advertised themselves as ready to mingle.
///
/// Entries are threaded on two orders at once: arrival order by timestamp, which
///  drives [expire](MingleSet::expire), and least-recently-returned order, which
///  lets [get](MingleSet::get) rotate fairly through the whole set instead of
///  introducing the same few peers over and over. Every operation is O(1) per entry
///  touched and takes the one lock covering all three internal structures.
pub struct MingleSet {
    inner: Mutex<Inner>,
}

const TIME: usize = 0;
const USAGE: usize = 1;

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    prev: Option<usize>,
    next: Option<usize>,
}

struct Node {
    addr: SocketAddr,
    fingerprint: Fingerprint,
    timestamp: Instant,
    links: [Links; 2],
}

/// Slab of nodes plus per-order head/tail. TIME runs oldest to newest; USAGE runs
///  most-recently-returned (head) to never-returned (tail), and `get` walks it from
///  the tail.
#[derive(Default)]
struct Inner {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: FxHashMap<SocketAddr, usize>,
    head: [Option<usize>; 2],
    tail: [Option<usize>; 2],
}

impl MingleSet {
    pub fn new() -> MingleSet {
        MingleSet {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Records that `addr` is ready to mingle, capturing the fingerprint it used. A
    ///  known address is re-timestamped and moved to the fresh end of the time order;
    ///  its position in the usage order is left alone.
    pub fn add(&self, addr: SocketAddr, fingerprint: Fingerprint) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if let Some(&idx) = inner.index.get(&addr) {
            {
                let node = inner.node_mut(idx);
                node.fingerprint = fingerprint;
                node.timestamp = now;
            }
            inner.unlink(TIME, idx);
            inner.push_tail(TIME, idx);
        } else {
            let idx = inner.alloc(Node {
                addr,
                fingerprint,
                timestamp: now,
                links: [Links::default(); 2],
            });
            inner.index.insert(addr, idx);
            inner.push_tail(TIME, idx);
            inner.push_tail(USAGE, idx);
        }
    }

    /// Returns up to `n` entries that were added strictly after `min_timestamp`
    ///  (pass `None` to accept any age), least-recently-returned first. The returned
    ///  entries are moved to the recently-returned end of the usage order so that the
    ///  next call prefers others.
    pub fn get(&self, n: usize, min_timestamp: Option<Instant>) -> Vec<Mingler> {
        let mut inner = self.inner.lock().unwrap();

        let mut out = Vec::new();
        let mut picked = Vec::new();
        let mut cursor = inner.tail[USAGE];
        while let Some(idx) = cursor {
            if out.len() >= n {
                break;
            }
            let node = inner.node(idx);
            cursor = node.links[USAGE].prev;
            if min_timestamp.map_or(true, |min| node.timestamp > min) {
                out.push(Mingler {
                    addr: node.addr,
                    fingerprint: node.fingerprint,
                    timestamp: node.timestamp,
                });
                picked.push(idx);
            }
        }

        for idx in picked {
            inner.unlink(USAGE, idx);
            inner.push_head(USAGE, idx);
        }

        out
    }

    /// Removes every entry whose timestamp is at or before `cutoff`. The time order
    ///  makes this a walk from the stale end that stops at the first fresh entry.
    pub fn expire(&self, cutoff: Instant) {
        let mut inner = self.inner.lock().unwrap();

        while let Some(idx) = inner.head[TIME] {
            if inner.node(idx).timestamp > cutoff {
                break;
            }
            let addr = inner.node(idx).addr;
            inner.unlink(TIME, idx);
            inner.unlink(USAGE, idx);
            inner.index.remove(&addr);
            inner.release(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    #[cfg(test)]
    fn order(&self, list: usize) -> Vec<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        let mut cursor = inner.head[list];
        while let Some(idx) = cursor {
            out.push(inner.node(idx).addr);
            cursor = inner.node(idx).links[list].next;
        }
        out
    }

    /// Checks that the index and both orders agree on membership, in both walking
    ///  directions.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock().unwrap();
        for list in [TIME, USAGE] {
            let mut forward = Vec::new();
            let mut cursor = inner.head[list];
            while let Some(idx) = cursor {
                forward.push(idx);
                cursor = inner.node(idx).links[list].next;
            }
            let mut backward = Vec::new();
            let mut cursor = inner.tail[list];
            while let Some(idx) = cursor {
                backward.push(idx);
                cursor = inner.node(idx).links[list].prev;
            }
            backward.reverse();
            assert_eq!(forward, backward);
            assert_eq!(forward.len(), inner.index.len());
            for idx in forward {
                let node = inner.node(idx);
                assert_eq!(inner.index.get(&node.addr), Some(&idx));
            }
        }
    }
}

impl Default for MingleSet {
    fn default() -> Self {
        MingleSet::new()
    }
}

impl Inner {
    // an index in the map or a list always points at an occupied slot
    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().unwrap()
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().unwrap()
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx] = None;
        self.free.push(idx);
    }

    fn unlink(&mut self, list: usize, idx: usize) {
        let Links { prev, next } = self.node(idx).links[list];
        match prev {
            Some(p) => self.node_mut(p).links[list].next = next,
            None => self.head[list] = next,
        }
        match next {
            Some(n) => self.node_mut(n).links[list].prev = prev,
            None => self.tail[list] = prev,
        }
        self.node_mut(idx).links[list] = Links::default();
    }

    fn push_tail(&mut self, list: usize, idx: usize) {
        let old_tail = self.tail[list];
        self.node_mut(idx).links[list] = Links {
            prev: old_tail,
            next: None,
        };
        match old_tail {
            Some(t) => self.node_mut(t).links[list].next = Some(idx),
            None => self.head[list] = Some(idx),
        }
        self.tail[list] = Some(idx);
    }

    fn push_head(&mut self, list: usize, idx: usize) {
        let old_head = self.head[list];
        self.node_mut(idx).links[list] = Links {
            prev: None,
            next: old_head,
        };
        match old_head {
            Some(h) => self.node_mut(h).links[list].prev = Some(idx),
            None => self.tail[list] = Some(idx),
        }
        self.head[list] = Some(idx);
    }
}
