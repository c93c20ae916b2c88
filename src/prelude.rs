//! The `ton-cells` prelude.
//!
//! This brings into scope a number of traits and commonly used types.

pub use crate::boc::{Boc, BocMode};
pub use crate::cell::{
    Cell, CellBuilder, CellContext, CellDescriptor, CellImpl, CellSlice, CellType, DynCell,
    EmptyCellContext, HashBytes, LevelMask, UsageTree, UsageTreeMode,
};
pub use crate::db::{CellLoader, CellStorer, DynamicBagOfCellsDb, KeyValue, KeyValueReader};
pub use crate::merkle::{MerkleFilter, MerkleProof};
