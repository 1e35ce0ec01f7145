//! Runtime-configurable planner parameters.
//!
//! All values have conservative defaults (no striping, no ring, no
//! pipelining). Override via environment variables (prefixed `HICOLL_`) or
//! by constructing a custom `HicollConfig`.

/// Relative order of striping and ring construction for reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOrder {
    /// Stripe inter-group reductions first, then ring the chunk reductions.
    StripeThenRing,
    /// Ring whole reductions first; striping only sees intra-group residue.
    RingThenStripe,
}

/// Static topology choice for intra-group fan-out.
///
/// There is no auto-tuner; the choice is fixed at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntraTopology {
    Tree,
    Ring,
}

/// Tuning parameters for plan construction.
#[derive(Debug, Clone)]
pub struct HicollConfig {
    /// Number of parallel stripes an inter-group primitive is split into.
    /// 1 disables striping.
    pub numstripe: usize,

    /// Enables the inter-group ring when > 1 and at least `ring_min_groups`
    /// top-level groups participate in a primitive.
    pub ringnodes: usize,

    /// Pipeline depth: number of batches a primitive is partitioned into.
    pub pipedepth: usize,

    /// Minimum participating group count for the ring path.
    pub ring_min_groups: usize,

    /// Stripe/ring ordering policy for reductions.
    pub reduce_order: ReduceOrder,

    /// Intra-group fan-out topology.
    pub intra_topology: IntraTopology,
}

impl Default for HicollConfig {
    fn default() -> Self {
        Self {
            numstripe: 1,
            ringnodes: 1,
            pipedepth: 1,
            ring_min_groups: 3,
            reduce_order: ReduceOrder::StripeThenRing,
            intra_topology: IntraTopology::Tree,
        }
    }
}

impl HicollConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `HICOLL_NUMSTRIPE`
    /// - `HICOLL_RINGNODES`
    /// - `HICOLL_PIPEDEPTH`
    /// - `HICOLL_RING_MIN_GROUPS`
    /// - `HICOLL_REDUCE_ORDER` (`stripe-ring` | `ring-stripe`)
    /// - `HICOLL_INTRA_TOPOLOGY` (`tree` | `ring`)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("HICOLL_NUMSTRIPE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.numstripe = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("HICOLL_RINGNODES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.ringnodes = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("HICOLL_PIPEDEPTH") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.pipedepth = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("HICOLL_RING_MIN_GROUPS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.ring_min_groups = n.max(2);
            }
        }
        if let Ok(v) = std::env::var("HICOLL_REDUCE_ORDER") {
            match v.as_str() {
                "stripe-ring" => cfg.reduce_order = ReduceOrder::StripeThenRing,
                "ring-stripe" => cfg.reduce_order = ReduceOrder::RingThenStripe,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("HICOLL_INTRA_TOPOLOGY") {
            match v.as_str() {
                "tree" => cfg.intra_topology = IntraTopology::Tree,
                "ring" => cfg.intra_topology = IntraTopology::Ring,
                _ => {}
            }
        }

        cfg
    }

    /// True when the ring path should be attempted for inter-group work.
    pub fn ring_enabled(&self) -> bool {
        self.ringnodes > 1
    }
}
