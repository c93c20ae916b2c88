use smallvec::SmallVec;

use super::cell_context::{CellHashes, CellParts};
use super::{
    Cell, CellDescriptor, CellImpl, DynCell, HashBytes, LevelMask, EMPTY_CELL_HASH, MAX_REF_COUNT,
};

/// Cell which owns its data, references and all computed hashes.
pub struct DataCell {
    descriptor: CellDescriptor,
    bit_len: u16,
    data: Box<[u8]>,
    references: SmallVec<[Cell; MAX_REF_COUNT]>,
    hashes: CellHashes,
    virtualization: u8,
}

impl DataCell {
    /// Creates a new cell from well-formed parts and precomputed hashes.
    pub(crate) fn from_parts(parts: CellParts<'_>, hashes: CellHashes) -> Cell {
        let descriptor = parts.descriptor;
        if parts.bit_len == 0 && parts.references.is_empty() && !descriptor.is_exotic() {
            return Cell::empty_cell();
        }

        let virtualization = parts
            .references
            .iter()
            .map(|child| child.virtualization())
            .max()
            .unwrap_or_default();

        Cell::from_impl(std::sync::Arc::new(Self {
            descriptor: descriptor.with_store_hashes(false),
            bit_len: parts.bit_len,
            data: parts.data.into(),
            references: parts.references,
            hashes,
            virtualization,
        }))
    }

    #[inline]
    fn level_descr(&self, level: u8) -> Option<&(HashBytes, u16)> {
        let hash_index = self.descriptor.level_mask().hash_index(level) as usize;
        self.hashes.get(hash_index).or(self.hashes.last())
    }
}

impl CellImpl for DataCell {
    #[inline]
    fn descriptor(&self) -> CellDescriptor {
        self.descriptor
    }

    #[inline]
    fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    fn bit_len(&self) -> u16 {
        self.bit_len
    }

    fn reference(&self, index: u8) -> Option<&DynCell> {
        Some(self.references.get(index as usize)?.as_ref())
    }

    fn reference_cloned(&self, index: u8) -> Option<Cell> {
        self.references.get(index as usize).cloned()
    }

    fn virtualize(&self) -> &DynCell {
        if self.descriptor.level_mask().is_empty() {
            self
        } else {
            VirtualCellWrapper::wrap(self)
        }
    }

    fn hash(&self, level: u8) -> &HashBytes {
        match self.level_descr(level) {
            Some((hash, _)) => hash,
            None => &HashBytes::ZERO,
        }
    }

    fn depth(&self, level: u8) -> u16 {
        match self.level_descr(level) {
            Some((_, depth)) => *depth,
            None => 0,
        }
    }

    #[inline]
    fn virtualization(&self) -> u8 {
        self.virtualization
    }

    #[inline]
    fn is_loaded(&self) -> bool {
        true
    }
}

/// Ordinary cell without data and references.
pub(crate) struct EmptyOrdinaryCell;

impl CellImpl for EmptyOrdinaryCell {
    #[inline]
    fn descriptor(&self) -> CellDescriptor {
        CellDescriptor::new([0, 0])
    }

    #[inline]
    fn data(&self) -> &[u8] {
        &[]
    }

    #[inline]
    fn bit_len(&self) -> u16 {
        0
    }

    #[inline]
    fn reference(&self, _: u8) -> Option<&DynCell> {
        None
    }

    #[inline]
    fn reference_cloned(&self, _: u8) -> Option<Cell> {
        None
    }

    #[inline]
    fn virtualize(&self) -> &DynCell {
        self
    }

    #[inline]
    fn hash(&self, _: u8) -> &HashBytes {
        &EMPTY_CELL_HASH
    }

    #[inline]
    fn depth(&self, _: u8) -> u16 {
        0
    }

    #[inline]
    fn virtualization(&self) -> u8 {
        0
    }

    #[inline]
    fn is_loaded(&self) -> bool {
        true
    }
}

/// Owned virtualized view of a cell.
///
/// All higher levels collapse into level 0, so the view has the hashes
/// of the original tree for which the proof was built.
#[repr(transparent)]
pub struct VirtualCell(pub Cell);

impl CellImpl for VirtualCell {
    fn descriptor(&self) -> CellDescriptor {
        self.0.descriptor().with_level_mask(LevelMask::EMPTY)
    }

    fn data(&self) -> &[u8] {
        self.0.data()
    }

    fn bit_len(&self) -> u16 {
        self.0.bit_len()
    }

    fn reference(&self, index: u8) -> Option<&DynCell> {
        Some(self.0.reference(index)?.virtualize())
    }

    fn reference_cloned(&self, index: u8) -> Option<Cell> {
        Some(self.0.reference_cloned(index)?.virtualize())
    }

    fn virtualize(&self) -> &DynCell {
        self
    }

    fn hash(&self, _: u8) -> &HashBytes {
        self.0.hash(0)
    }

    fn depth(&self, _: u8) -> u16 {
        self.0.depth(0)
    }

    fn virtualization(&self) -> u8 {
        std::cmp::max(1, self.0.virtualization())
    }

    fn is_loaded(&self) -> bool {
        self.0.is_loaded()
    }
}

/// Borrowed virtualized view of a cell.
#[repr(transparent)]
pub struct VirtualCellWrapper<T>(T);

impl<T> VirtualCellWrapper<T> {
    /// Reinterprets a reference to the cell as its virtualized view.
    pub fn wrap(value: &T) -> &Self {
        // SAFETY: VirtualCellWrapper<T> is #[repr(transparent)]
        unsafe { &*(value as *const T as *const Self) }
    }
}

impl<T: CellImpl + Send + Sync + 'static> CellImpl for VirtualCellWrapper<T> {
    fn descriptor(&self) -> CellDescriptor {
        self.0.descriptor().with_level_mask(LevelMask::EMPTY)
    }

    fn data(&self) -> &[u8] {
        self.0.data()
    }

    fn bit_len(&self) -> u16 {
        self.0.bit_len()
    }

    fn reference(&self, index: u8) -> Option<&DynCell> {
        Some(self.0.reference(index)?.virtualize())
    }

    fn reference_cloned(&self, index: u8) -> Option<Cell> {
        Some(self.0.reference_cloned(index)?.virtualize())
    }

    fn virtualize(&self) -> &DynCell {
        self
    }

    fn hash(&self, _: u8) -> &HashBytes {
        self.0.hash(0)
    }

    fn depth(&self, _: u8) -> u16 {
        self.0.depth(0)
    }

    fn virtualization(&self) -> u8 {
        std::cmp::max(1, self.0.virtualization())
    }

    fn is_loaded(&self) -> bool {
        self.0.is_loaded()
    }
}
