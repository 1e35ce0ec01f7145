//! The level hierarchy a plan is built against.
//!
//! Level 0 spans the whole world; each deeper level partitions every group
//! of the previous one. Rank `r` belongs to group `r / groupsize[l]` at
//! level `l`. Edges created while expanding level `l` run on the library
//! tagged at level `l - 1`.

use crate::error::{HicollError, Result};
use crate::types::{Library, Rank};

#[derive(Debug, Clone)]
pub struct Hierarchy {
    groupsize: Vec<usize>,
    libs: Vec<Library>,
}

impl Hierarchy {
    /// Build a hierarchy from explicit per-level group sizes.
    ///
    /// `groupsize[0]` must equal the world size (checked at init against the
    /// fabric); every deeper size must divide the one above it.
    pub fn new(groupsize: Vec<usize>, libs: Vec<Library>) -> Result<Self> {
        if groupsize.is_empty() {
            return Err(HicollError::EmptyHierarchy);
        }
        if groupsize.len() != libs.len() {
            return Err(HicollError::HierarchyLibraryMismatch {
                levels: groupsize.len(),
                libs: libs.len(),
            });
        }
        for level in 1..groupsize.len() {
            let outer = groupsize[level - 1];
            let inner = groupsize[level];
            if inner == 0 || inner > outer || outer % inner != 0 {
                return Err(HicollError::HierarchyNotNested {
                    level,
                    inner,
                    outer_level: level - 1,
                    outer,
                });
            }
        }
        Ok(Self { groupsize, libs })
    }

    /// Build a hierarchy from per-level branching factors, innermost last.
    ///
    /// `groupsize[l]` becomes the product of `factors[l..]`, so
    /// `factors = [2, 4]` yields group sizes `[8, 4]`.
    pub fn from_factors(factors: &[usize], libs: Vec<Library>) -> Result<Self> {
        if factors.is_empty() {
            return Err(HicollError::EmptyHierarchy);
        }
        let mut groupsize = vec![0usize; factors.len()];
        let mut acc = 1usize;
        for (i, &f) in factors.iter().enumerate().rev() {
            acc = acc.saturating_mul(f.max(1));
            groupsize[i] = acc;
        }
        Self::new(groupsize, libs)
    }

    /// Check that the outermost level spans the whole world.
    pub fn validate_world(&self, world: u32) -> Result<()> {
        if self.groupsize[0] != world as usize {
            return Err(HicollError::HierarchyMismatch {
                given: self.groupsize[0],
                world: world as usize,
            });
        }
        Ok(())
    }

    pub fn numlevel(&self) -> usize {
        self.groupsize.len()
    }

    pub fn groupsize(&self, level: usize) -> usize {
        self.groupsize[level]
    }

    pub fn lib(&self, level: usize) -> Library {
        self.libs[level]
    }

    pub fn libs(&self) -> &[Library] {
        &self.libs
    }

    pub fn sizes(&self) -> &[usize] {
        &self.groupsize
    }

    /// Group index of `rank` at `level`.
    pub fn group_of(&self, rank: Rank, level: usize) -> usize {
        rank as usize / self.groupsize[level]
    }

    /// Position of `rank` within its group at `level`.
    pub fn ordinal(&self, rank: Rank, level: usize) -> usize {
        rank as usize % self.groupsize[level]
    }

    pub fn same_group(&self, a: Rank, b: Rank, level: usize) -> bool {
        self.group_of(a, level) == self.group_of(b, level)
    }

    pub fn num_groups(&self, level: usize) -> usize {
        self.groupsize[0] / self.groupsize[level]
    }

    /// The rank in `group` (at `level`) holding the same in-group ordinal as
    /// `of`. Preserving the ordinal keeps parallel bridges off one link.
    pub fn bridge(&self, group: usize, level: usize, of: Rank) -> Rank {
        (group * self.groupsize[level] + self.ordinal(of, level)) as Rank
    }

    /// Members of `group` at `level`, in rank order.
    pub fn group_members(&self, group: usize, level: usize) -> impl Iterator<Item = Rank> {
        let gs = self.groupsize[level];
        (group * gs..(group + 1) * gs).map(|r| r as Rank)
    }

    /// Group size at the node boundary (level 1), the unit the striper
    /// splits against. Flat hierarchies have no node boundary.
    pub fn node_size(&self) -> Option<usize> {
        self.groupsize.get(1).copied()
    }
}
