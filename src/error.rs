//! Common error types.

/// Error type for cell related errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// There were not enough bits or refs in the cell slice.
    #[error("cell underflow")]
    CellUnderflow,
    /// There were not enough bits or refs capacity in the cell builder.
    #[error("cell overflow")]
    CellOverflow,
    /// Something tried to load a pruned branch cell.
    #[error("pruned branch access")]
    PrunedBranchAccess,
    /// Something tried to read an exotic cell as an ordinary one.
    #[error("unexpected exotic cell")]
    UnexpectedExoticCell,
    /// Something tried to read the contents of a cell which
    /// was not loaded from the storage.
    #[error("unloaded cell access")]
    UnloadedCell,
    /// Cell contains invalid descriptor or data.
    #[error("invalid cell")]
    InvalidCell,
    /// Tree of cells is too deep.
    #[error("cell depth overflow")]
    DepthOverflow,
    /// Merkle proof does not contain the root cell.
    #[error("empty proof")]
    EmptyProof,
    /// Two proofs disagree about the same cell.
    #[error("inconsistent merkle proofs")]
    ProofInconsistency,
}
