use crate::types::{Library, Rank};

pub type Result<T> = std::result::Result<T, HicollError>;

#[derive(Debug, thiserror::Error)]
pub enum HicollError {
    #[error("hierarchy level 0 is {given} but the world has {world} ranks")]
    HierarchyMismatch { given: usize, world: usize },

    #[error("hierarchy is not nested: groupsize[{level}] = {inner} does not divide groupsize[{outer_level}] = {outer}")]
    HierarchyNotNested {
        level: usize,
        inner: usize,
        outer_level: usize,
        outer: usize,
    },

    #[error("hierarchy has {levels} levels but {libs} library tags")]
    HierarchyLibraryMismatch { levels: usize, libs: usize },

    #[error("empty hierarchy")]
    EmptyHierarchy,

    #[error("{primitive} #{index}: rank {rank} out of range (world size {world_size})")]
    InvalidRank {
        primitive: &'static str,
        index: usize,
        rank: Rank,
        world_size: u32,
    },

    #[error("{primitive} #{index}: empty endpoint set")]
    EmptyEndpoints { primitive: &'static str, index: usize },

    #[error("init called with no primitives in any epoch")]
    EmptyPlan,

    #[error("numbatch must be >= 1, got {0}")]
    InvalidBatchCount(usize),

    #[error("numstripe {numstripe} exceeds node size {nodesize}")]
    InvalidStripeCount { numstripe: usize, nodesize: usize },

    #[error("numstripe {0} requires a hierarchy with at least two levels")]
    StripeNeedsHierarchy(usize),

    #[error("staging allocation of {bytes} bytes on rank {rank} failed: {reason}")]
    StagingAlloc {
        rank: Rank,
        bytes: usize,
        reason: String,
    },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("backend error on {library} transfer: {message}")]
    Backend { library: Library, message: String },

    #[error("communicator already initialized")]
    AlreadyInitialized,

    #[error("run called before init")]
    NotInitialized,

    #[error("endpoints not set (call set_endpoints before run_with)")]
    EndpointsNotSet,

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HicollError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Backend` error for the given library.
    pub fn backend(library: Library, msg: impl Into<String>) -> Self {
        Self::Backend {
            library,
            message: msg.into(),
        }
    }
}
