use crate::cell::{Cell, CellBuilder, CellContext, CellType, DynCell, LevelMask};
use crate::error::Error;

/// Creates a pruned branch cell with the specified merkle depth.
///
/// The result has `hash(0)` and `depth(0)` of the original cell.
pub fn make_pruned_branch(
    cell: &DynCell,
    merkle_depth: u8,
    context: &mut dyn CellContext,
) -> Result<Cell, Error> {
    make_pruned_branch_ext(cell, merkle_depth, LevelMask::MAX_LEVEL, context)
}

/// Creates a pruned branch which only keeps the levels of the cell
/// below `virt_level`.
pub(crate) fn make_pruned_branch_ext(
    cell: &DynCell,
    merkle_depth: u8,
    virt_level: u8,
    context: &mut dyn CellContext,
) -> Result<Cell, Error> {
    let base_mask = cell.level_mask().apply(virt_level);
    if merkle_depth >= LevelMask::MAX_LEVEL || base_mask.max_level() > merkle_depth {
        return Err(Error::DepthOverflow);
    }
    let level_mask = base_mask | LevelMask::one_level(merkle_depth + 1);

    let mut builder = CellBuilder::new();
    builder.set_exotic(true);
    ok!(builder.store_u8(CellType::PrunedBranch.to_byte()));
    ok!(builder.store_u8(level_mask.to_byte()));
    for level in base_mask.significant_levels() {
        ok!(builder.store_u256(cell.hash(level)));
    }
    for level in base_mask.significant_levels() {
        ok!(builder.store_u16(cell.depth(level)));
    }

    builder.build_ext(context)
}
