//! User-declared collective primitives.
//!
//! Primitives are immutable once added; the planner consumes them at init
//! and never mutates the originals. Buffer fields are raw device addresses
//! that are only meaningful on the rank that owns them.

use crate::error::{HicollError, Result};
use crate::types::{Rank, ReduceOp};

/// One sender, many receivers.
///
/// After execution, `recvbuf[recvoffset..recvoffset + count)` on every rank
/// in `recvids` equals `sendbuf[sendoffset..sendoffset + count)` on
/// `sendid`.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub sendbuf: u64,
    pub sendoffset: usize,
    pub recvbuf: u64,
    pub recvoffset: usize,
    pub count: usize,
    pub sendid: Rank,
    pub recvids: Vec<Rank>,
}

impl Broadcast {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sendbuf: u64,
        sendoffset: usize,
        recvbuf: u64,
        recvoffset: usize,
        count: usize,
        sendid: Rank,
        recvids: Vec<Rank>,
    ) -> Self {
        Self {
            sendbuf,
            sendoffset,
            recvbuf,
            recvoffset,
            count,
            sendid,
            recvids,
        }
    }

    pub(crate) fn validate(&self, world: u32, index: usize) -> Result<()> {
        if self.recvids.is_empty() {
            return Err(HicollError::EmptyEndpoints {
                primitive: "broadcast",
                index,
            });
        }
        for &r in std::iter::once(&self.sendid).chain(self.recvids.iter()) {
            if r >= world {
                return Err(HicollError::InvalidRank {
                    primitive: "broadcast",
                    index,
                    rank: r,
                    world_size: world,
                });
            }
        }
        Ok(())
    }
}

/// Many senders, one receiver.
///
/// After execution, `recvbuf[recvoffset..recvoffset + count)` on `recvid`
/// holds the element-wise `op` over the senders' slices.
#[derive(Debug, Clone)]
pub struct Reduce {
    pub sendbuf: u64,
    pub sendoffset: usize,
    pub recvbuf: u64,
    pub recvoffset: usize,
    pub count: usize,
    pub sendids: Vec<Rank>,
    pub recvid: Rank,
    pub op: ReduceOp,
}

impl Reduce {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sendbuf: u64,
        sendoffset: usize,
        recvbuf: u64,
        recvoffset: usize,
        count: usize,
        sendids: Vec<Rank>,
        recvid: Rank,
        op: ReduceOp,
    ) -> Self {
        Self {
            sendbuf,
            sendoffset,
            recvbuf,
            recvoffset,
            count,
            sendids,
            recvid,
            op,
        }
    }

    pub(crate) fn validate(&self, world: u32, index: usize) -> Result<()> {
        if self.sendids.is_empty() {
            return Err(HicollError::EmptyEndpoints {
                primitive: "reduce",
                index,
            });
        }
        for &r in self.sendids.iter().chain(std::iter::once(&self.recvid)) {
            if r >= world {
                return Err(HicollError::InvalidRank {
                    primitive: "reduce",
                    index,
                    rank: r,
                    world_size: world,
                });
            }
        }
        Ok(())
    }
}

/// A fence-delimited group of primitives. Epochs serialize against each
/// other; primitives within one epoch are free to be reordered.
#[derive(Debug, Default, Clone)]
pub struct Epoch {
    pub bcasts: Vec<Broadcast>,
    pub reduces: Vec<Reduce>,
}

impl Epoch {
    pub fn is_empty(&self) -> bool {
        self.bcasts.is_empty() && self.reduces.is_empty()
    }
}
