//! Ahead-of-time plan construction.
//!
//! The planner rewrites user primitives through a fixed pipeline: partition
//! into batches, stripe across the node boundary, then ring or tree across
//! groups. The result accumulates as per-batch [`Coll`] lists, which the
//! implementer lowers to executable commands.

pub mod coll;
pub mod implement;
pub mod partition;
pub mod ring;
pub mod stripe;
pub mod tree;

pub use coll::{Coll, Edge, ReduceWork};
pub use implement::{Command, Compute};

use std::sync::Arc;

use crate::backend::DeviceAdapter;
use crate::config::HicollConfig;
use crate::error::{HicollError, Result};
use crate::hierarchy::Hierarchy;
use crate::types::Rank;

/// A staging allocation owned by the planner on this rank.
#[derive(Debug)]
pub(crate) struct StagingBuffer {
    pub ptr: u64,
    pub bytes: usize,
}

/// Mutable planning state threaded through the rewrite passes.
pub(crate) struct PlanCtx<'a> {
    pub hier: &'a Hierarchy,
    pub config: &'a HicollConfig,
    pub rank: Rank,
    pub elem: usize,
    pub adapter: &'a Arc<dyn DeviceAdapter>,
    pub staging: &'a mut Vec<StagingBuffer>,
    /// Elements staged on this rank, reported after init.
    pub staged_elems: &'a mut usize,
}

impl PlanCtx<'_> {
    /// Allocate a staging buffer of `count` elements on `owner`.
    ///
    /// Only the owning rank allocates; every other rank records the buffer
    /// as address 0, which is never dereferenced off-owner because a rank
    /// only touches the buffer side of edges it participates in.
    pub fn alloc_staging(&mut self, owner: Rank, count: usize) -> Result<u64> {
        if self.rank != owner || count == 0 {
            return Ok(0);
        }
        let bytes = count * self.elem;
        let ptr = unsafe { self.adapter.alloc(bytes) }.map_err(|e| {
            HicollError::StagingAlloc {
                rank: owner,
                bytes,
                reason: e.to_string(),
            }
        })?;
        self.staging.push(StagingBuffer { ptr, bytes });
        *self.staged_elems += count;
        Ok(ptr)
    }
}

/// Count of chunk `i` when `count` elements are cut into `n` pieces, with
/// the remainder spread over the leading chunks.
pub(crate) fn chunk_count(count: usize, n: usize, i: usize) -> usize {
    let base = count / n;
    let rem = count % n;
    base + usize::from(i < rem)
}

/// Element offset of chunk `i` under the same split.
pub(crate) fn chunk_offset(count: usize, n: usize, i: usize) -> usize {
    let base = count / n;
    let rem = count % n;
    base * i + i.min(rem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_cover_exactly() {
        for count in [0usize, 1, 7, 8, 1024, 1027] {
            for n in [1usize, 2, 3, 4, 8] {
                let mut covered = 0;
                for i in 0..n {
                    assert_eq!(chunk_offset(count, n, i), covered);
                    covered += chunk_count(count, n, i);
                }
                assert_eq!(covered, count);
            }
        }
    }

    #[test]
    fn test_remainder_spreads_forward() {
        // 10 into 4: 3, 3, 2, 2
        assert_eq!(chunk_count(10, 4, 0), 3);
        assert_eq!(chunk_count(10, 4, 1), 3);
        assert_eq!(chunk_count(10, 4, 2), 2);
        assert_eq!(chunk_count(10, 4, 3), 2);
    }
}
