use sha2::digest::Digest;
use smallvec::SmallVec;

use crate::cell::cell_impl::DataCell;
use crate::cell::{
    Cell, CellDescriptor, CellType, HashBytes, LevelMask, MAX_DEPTH, MAX_REF_COUNT,
};
use crate::error::Error;
use crate::util::unlikely;

/// Cell finalization hook.
///
/// Every new cell passes through a context, so an implementation
/// can intercept, count or deduplicate created cells.
pub trait CellContext {
    /// Builds a new cell from cell parts.
    fn finalize_cell(&mut self, cell: CellParts<'_>) -> Result<Cell, Error>;
}

impl<T: CellContext + ?Sized> CellContext for &mut T {
    #[inline]
    fn finalize_cell(&mut self, cell: CellParts<'_>) -> Result<Cell, Error> {
        T::finalize_cell(*self, cell)
    }
}

/// Context which just computes hashes and allocates cells.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCellContext;

impl CellContext for EmptyCellContext {
    fn finalize_cell(&mut self, ctx: CellParts<'_>) -> Result<Cell, Error> {
        let hashes = ok!(ctx.compute_hashes());
        Ok(DataCell::from_parts(ctx, hashes))
    }
}

/// Hashes and depths for each significant level of a cell.
pub type CellHashes = SmallVec<[(HashBytes, u16); 4]>;

/// Partially assembled cell.
pub struct CellParts<'a> {
    /// Length of this cell's data in bits.
    pub bit_len: u16,

    /// Well-formed cell descriptor.
    pub descriptor: CellDescriptor,

    /// Bitwise OR of child level masks.
    pub children_mask: LevelMask,

    /// Array of child cells.
    ///
    /// NOTE: it is guaranteed that the length of the array is consistent
    /// with the descriptor.
    pub references: SmallVec<[Cell; MAX_REF_COUNT]>,

    /// Cell data slice (with the completion tag).
    pub data: &'a [u8],
}

impl CellParts<'_> {
    /// Returns the type of the cell being assembled.
    pub fn cell_type(&self) -> Result<CellType, Error> {
        if !self.descriptor.is_exotic() {
            return Ok(CellType::Ordinary);
        }
        match self.data.first() {
            Some(tag) => CellType::from_exotic_tag(*tag).ok_or(Error::InvalidCell),
            None => Err(Error::InvalidCell),
        }
    }

    /// Validates cell and computes all hashes.
    ///
    /// Returns a hash and a depth for each hash index of the level mask.
    pub fn compute_hashes(&self) -> Result<CellHashes, Error> {
        const HASH_BITS: usize = 256;
        const DEPTH_BITS: usize = 16;

        let descriptor = self.descriptor;
        let bit_len = self.bit_len as usize;
        let level_mask = descriptor.level_mask();
        let level = level_mask.level() as usize;

        let references = self.references.as_slice();
        if unlikely(references.len() != descriptor.reference_count() as usize) {
            return Err(Error::InvalidCell);
        }

        let cell_type = ok!(self.cell_type());
        let computed_level_mask = match cell_type {
            // 8 bits type, 8 bits level mask, level x (hash, depth)
            CellType::PrunedBranch => {
                if unlikely(level == 0) {
                    return Err(Error::InvalidCell);
                }

                let expected_bit_len = 8 + 8 + level * (HASH_BITS + DEPTH_BITS);
                if unlikely(bit_len != expected_bit_len || !references.is_empty()) {
                    return Err(Error::InvalidCell);
                }

                let stored_mask = self.data.get(1).copied().unwrap_or_default();
                if unlikely(level_mask != stored_mask) {
                    return Err(Error::InvalidCell);
                }

                level_mask
            }
            // 8 bits type, hash, depth
            CellType::MerkleProof => {
                const EXPECTED_BIT_LEN: usize = 8 + HASH_BITS + DEPTH_BITS;
                if unlikely(bit_len != EXPECTED_BIT_LEN || references.len() != 1) {
                    return Err(Error::InvalidCell);
                }
                if unlikely(!self.check_merkle_child(0, 1, 33)) {
                    return Err(Error::InvalidCell);
                }

                self.children_mask.virtualize(1)
            }
            // 8 bits type, 2 x hash, 2 x depth
            CellType::MerkleUpdate => {
                const EXPECTED_BIT_LEN: usize = 8 + 2 * (HASH_BITS + DEPTH_BITS);
                if unlikely(bit_len != EXPECTED_BIT_LEN || references.len() != 2) {
                    return Err(Error::InvalidCell);
                }
                if unlikely(!self.check_merkle_child(0, 1, 65) || !self.check_merkle_child(1, 33, 67))
                {
                    return Err(Error::InvalidCell);
                }

                self.children_mask.virtualize(1)
            }
            // 8 bits type, hash
            CellType::LibraryReference => {
                const EXPECTED_BIT_LEN: usize = 8 + HASH_BITS;
                if unlikely(bit_len != EXPECTED_BIT_LEN || !references.is_empty()) {
                    return Err(Error::InvalidCell);
                }

                LevelMask::EMPTY
            }
            CellType::Ordinary => self.children_mask,
        };

        if unlikely(computed_level_mask != level_mask) {
            return Err(Error::InvalidCell);
        }

        let level_offset = cell_type.is_merkle() as u8;
        let is_pruned = cell_type.is_pruned_branch();

        let mut hashes = CellHashes::new();
        for level in level_mask.significant_levels() {
            // Pruned branches only have their own representation hash,
            // lower hashes are stored in the data.
            if is_pruned && level != LevelMask::MAX_LEVEL && level_mask.apply(level) != level_mask {
                continue;
            }

            let mut hasher = sha2::Sha256::new();

            let level_descriptor = descriptor.for_level(level, cell_type);
            hasher.update(level_descriptor.to_bytes());

            match hashes.last() {
                Some((prev_hash, _)) if !is_pruned => hasher.update(prev_hash.as_slice()),
                _ => hasher.update(self.data),
            }

            let mut depth = 0;
            for child in references {
                let child_depth = child.depth(level + level_offset);
                let next_depth = match child_depth.checked_add(1) {
                    Some(next_depth) if next_depth <= MAX_DEPTH => next_depth,
                    _ => return Err(Error::DepthOverflow),
                };
                depth = std::cmp::max(depth, next_depth);

                hasher.update(child_depth.to_be_bytes());
            }

            for child in references {
                let child_hash = child.hash(level + level_offset);
                hasher.update(child_hash.as_slice());
            }

            let hash = HashBytes(hasher.finalize().into());
            hashes.push((hash, depth));
        }

        if is_pruned {
            hashes = ok!(self.pruned_branch_hashes(hashes));
        }

        Ok(hashes)
    }

    fn check_merkle_child(&self, index: usize, hash_offset: usize, depth_offset: usize) -> bool {
        let Some(child) = self.references.get(index) else {
            return false;
        };
        let (Some(hash), Some(depth)) = (
            self.data.get(hash_offset..hash_offset + 32),
            self.data.get(depth_offset..depth_offset + 2),
        ) else {
            return false;
        };
        hash == child.hash(0).as_slice() && depth == child.depth(0).to_be_bytes()
    }

    /// Expands the representation hash of a pruned branch with the
    /// hashes and depths stored in its data.
    fn pruned_branch_hashes(&self, repr: CellHashes) -> Result<CellHashes, Error> {
        let Some(&repr) = repr.first() else {
            return Err(Error::InvalidCell);
        };

        let stored_count = self.descriptor.level_mask().level() as usize;
        let depths_offset = 2 + stored_count * 32;

        let mut hashes = CellHashes::new();
        for i in 0..stored_count {
            let hash_offset = 2 + i * 32;
            let depth_offset = depths_offset + i * 2;
            let (Some(hash), Some(depth)) = (
                self.data.get(hash_offset..hash_offset + 32),
                self.data.get(depth_offset..depth_offset + 2),
            ) else {
                return Err(Error::InvalidCell);
            };

            let depth = u16::from_be_bytes([depth[0], depth[1]]);
            if unlikely(depth > MAX_DEPTH) {
                return Err(Error::DepthOverflow);
            }

            let Some(hash) = HashBytes::try_from_slice(hash) else {
                return Err(Error::InvalidCell);
            };
            hashes.push((hash, depth));
        }
        hashes.push(repr);

        Ok(hashes)
    }
}
