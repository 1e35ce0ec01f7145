//! Intermediate representation of one collective step.
//!
//! A [`Coll`] is a set of pairwise edges on a single library plus the
//! compute items that fold staged arrivals once those edges complete. One
//! `Coll` lowers to one backend communicator.

use crate::types::{Library, Rank, ReduceOp};

/// A pairwise transfer. Offsets and counts are in elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub sendbuf: u64,
    pub sendoffset: usize,
    pub recvbuf: u64,
    pub recvoffset: usize,
    pub count: usize,
    pub sendid: Rank,
    pub recvid: Rank,
}

impl Edge {
    /// True for a self-transfer that would copy a range onto itself.
    /// Such edges are dropped before lowering.
    pub fn is_noop(&self) -> bool {
        self.sendid == self.recvid
            && self.sendbuf == self.recvbuf
            && self.sendoffset == self.recvoffset
    }
}

/// One local fold: `dst op= src` for each source, in order.
///
/// The destination already holds its first contribution when the fold runs;
/// the planner guarantees this by routing one arrival (or the local
/// partial) directly into the destination range.
#[derive(Debug, Clone)]
pub struct ReduceWork {
    pub srcs: Vec<(u64, usize)>,
    pub dstbuf: u64,
    pub dstoffset: usize,
    pub count: usize,
    pub op: ReduceOp,
    pub owner: Rank,
}

#[derive(Debug, Clone)]
pub struct Coll {
    pub lib: Library,
    pub edges: Vec<Edge>,
    pub computes: Vec<ReduceWork>,
}

impl Coll {
    pub fn new(lib: Library) -> Self {
        Self {
            lib,
            edges: Vec::new(),
            computes: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_edge(
        &mut self,
        sendbuf: u64,
        sendoffset: usize,
        recvbuf: u64,
        recvoffset: usize,
        count: usize,
        sendid: Rank,
        recvid: Rank,
    ) {
        if count == 0 {
            return;
        }
        self.edges.push(Edge {
            sendbuf,
            sendoffset,
            recvbuf,
            recvoffset,
            count,
            sendid,
            recvid,
        });
    }

    pub fn add_compute(&mut self, work: ReduceWork) {
        if work.count == 0 || work.srcs.is_empty() {
            return;
        }
        self.computes.push(work);
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty() && self.computes.is_empty()
    }

    /// Ranges this coll writes: edge receive sides and compute outputs.
    pub(crate) fn write_ranges(&self) -> Vec<(u64, usize, usize)> {
        let mut out: Vec<(u64, usize, usize)> = self
            .edges
            .iter()
            .map(|e| (e.recvbuf, e.recvoffset, e.count))
            .collect();
        out.extend(
            self.computes
                .iter()
                .map(|c| (c.dstbuf, c.dstoffset, c.count)),
        );
        out
    }

    /// Ranges this coll reads: edge send sides and compute inputs.
    pub(crate) fn read_ranges(&self) -> Vec<(u64, usize, usize)> {
        let mut out: Vec<(u64, usize, usize)> = self
            .edges
            .iter()
            .map(|e| (e.sendbuf, e.sendoffset, e.count))
            .collect();
        for c in &self.computes {
            out.extend(c.srcs.iter().map(|&(b, o)| (b, o, c.count)));
        }
        out
    }
}

pub(crate) fn ranges_overlap(a: &[(u64, usize, usize)], b: &[(u64, usize, usize)]) -> bool {
    a.iter().any(|&(buf_a, off_a, len_a)| {
        b.iter().any(|&(buf_b, off_b, len_b)| {
            buf_a == buf_b && off_a < off_b + len_b && off_b < off_a + len_a
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_edge() {
        let e = Edge {
            sendbuf: 0x100,
            sendoffset: 4,
            recvbuf: 0x100,
            recvoffset: 4,
            count: 8,
            sendid: 2,
            recvid: 2,
        };
        assert!(e.is_noop());
    }

    #[test]
    fn test_self_copy_with_distinct_range_is_not_noop() {
        let e = Edge {
            sendbuf: 0x100,
            sendoffset: 0,
            recvbuf: 0x100,
            recvoffset: 8,
            count: 8,
            sendid: 2,
            recvid: 2,
        };
        assert!(!e.is_noop());
    }

    #[test]
    fn test_zero_count_edges_elided() {
        let mut c = Coll::new(Library::Ipc);
        c.add_edge(0x100, 0, 0x200, 0, 0, 0, 1);
        assert!(c.is_empty());
    }

    #[test]
    fn test_range_overlap() {
        let w = vec![(0x100u64, 0usize, 8usize)];
        assert!(ranges_overlap(&w, &[(0x100, 4, 8)]));
        assert!(!ranges_overlap(&w, &[(0x100, 8, 8)]));
        assert!(!ranges_overlap(&w, &[(0x200, 0, 8)]));
    }
}
