//! Merkle proofs over cell trees.

use std::collections::HashSet;
use std::hash::BuildHasher;

use crate::cell::{HashBytes, UsageTree};

pub use self::proof::{MerkleProof, MerkleProofBuilder};
pub use self::pruned_branch::make_pruned_branch;

pub(crate) use self::pruned_branch::make_pruned_branch_ext;

mod proof;
mod pruned_branch;

#[cfg(test)]
mod tests;

/// Decides which cells keep their contents in the proof.
pub trait MerkleFilter {
    /// Returns `true` if the cell with the specified representation
    /// hash must be included as is.
    fn contains(&self, cell: &HashBytes) -> bool;
}

impl MerkleFilter for UsageTree {
    #[inline]
    fn contains(&self, cell: &HashBytes) -> bool {
        UsageTree::contains(self, cell)
    }
}

impl<S: BuildHasher> MerkleFilter for HashSet<HashBytes, S> {
    #[inline]
    fn contains(&self, cell: &HashBytes) -> bool {
        HashSet::contains(self, cell)
    }
}

impl<F> MerkleFilter for F
where
    F: Fn(&HashBytes) -> bool,
{
    #[inline]
    fn contains(&self, cell: &HashBytes) -> bool {
        self(cell)
    }
}
