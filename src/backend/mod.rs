//! Backend contracts the compiled plan executes against.
//!
//! The planner lowers every coll to a [`CommHandle`] opened from a
//! [`Fabric`]. The fabric also provides the bootstrap primitives (rank,
//! size, barrier, allgather) used at init boundaries. Device memory is
//! reached exclusively through a [`DeviceAdapter`].

pub mod adapter;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod loopback;

pub use adapter::{CpuAdapter, DeviceAdapter};
#[cfg(feature = "cuda")]
pub use cuda::CudaAdapter;
pub use loopback::LoopbackFabric;

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::types::{Library, Rank};

/// A lowered pairwise transfer, in bytes, with its matching key.
///
/// `send_addr`/`recv_addr` are device addresses as seen by the rank that
/// owns the respective side; a rank only dereferences the side of an edge
/// it participates in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEdge {
    pub src: Rank,
    pub dst: Rank,
    pub send_addr: u64,
    pub recv_addr: u64,
    pub bytes: usize,
    /// Pipeline batch this edge belongs to.
    pub batch: u32,
    /// Sequence number within `(batch, src, dst)`. Stable across ranks, so
    /// a matching fabric can pair sends with receives even while batches
    /// interleave.
    pub seq: u32,
}

/// One registered edge set on one transport library.
///
/// `start` is non-blocking; `wait` blocks until every registered edge this
/// rank participates in has completed. Handles are not thread-safe; each is
/// driven by its owning executor only.
pub trait CommHandle: Send {
    fn library(&self) -> Library;

    /// Register a pairwise edge. All ranks register the full edge list in
    /// identical order; the handle serves the edges local to its rank.
    fn add(&mut self, edge: WireEdge) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn wait(&mut self) -> Result<()>;

    /// Non-blocking completion probe.
    fn test(&mut self) -> Result<bool>;

    /// Legacy alias for `start`, kept for the striped path's contract.
    fn launch(&mut self) -> Result<()> {
        self.start()
    }

    fn run(&mut self) -> Result<()> {
        self.start()?;
        self.wait()
    }

    /// Number of registered edges this rank sends on.
    fn numsend(&self) -> usize;

    /// Number of registered edges this rank receives on.
    fn numrecv(&self) -> usize;

    /// Calibration loop: `warmup` untimed runs, then the mean over
    /// `numiter` timed runs. Every rank must call this collectively.
    fn measure(&mut self, warmup: u32, numiter: u32) -> Result<Duration> {
        for _ in 0..warmup {
            self.run()?;
        }
        let begin = Instant::now();
        for _ in 0..numiter {
            self.run()?;
        }
        Ok(begin.elapsed() / numiter.max(1))
    }
}

/// Communicator factory plus the bootstrap primitives used at init
/// boundaries.
pub trait Fabric: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> u32;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Collect one `u64` from every rank, indexed by rank.
    fn allgather(&self, value: u64) -> Result<Vec<u64>>;

    /// Open a fresh communicator on the given library.
    fn open(&self, lib: Library) -> Result<Box<dyn CommHandle>>;
}
