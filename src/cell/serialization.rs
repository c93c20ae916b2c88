use super::{CellDescriptor, DynCell, HashBytes, MAX_REF_COUNT};
use crate::error::Error;
use crate::util::unlikely;

/// Layout of a single serialized cell.
///
/// ```text
/// [d1, d2] [hashes * 32] [depths * 2] [data] [refs * ref_size]
/// ```
///
/// Hashes and depths are present only when the descriptor
/// has the `store_hashes` flag set.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CellSerializationInfo {
    /// Cell descriptor as it was written.
    pub descriptor: CellDescriptor,
    /// Offset of the first stored depth.
    pub depths_offset: usize,
    /// Offset of the cell data.
    pub data_offset: usize,
    /// Cell data length in bytes.
    pub data_len: usize,
    /// Offset of the first reference index.
    pub refs_offset: usize,
    /// Total serialized length.
    pub end_offset: usize,
}

impl CellSerializationInfo {
    /// Offset of the first stored hash.
    pub const HASHES_OFFSET: usize = 2;

    /// Computes the layout from the descriptor alone.
    ///
    /// Absent cells and cells with more than 4 refs are rejected.
    pub fn from_descriptor(descriptor: CellDescriptor, ref_size: usize) -> Result<Self, Error> {
        let ref_count = descriptor.reference_count() as usize;
        if unlikely(ref_count > MAX_REF_COUNT) {
            return Err(Error::InvalidCell);
        }

        let hash_count = if descriptor.store_hashes() {
            descriptor.hash_count() as usize
        } else {
            0
        };

        let depths_offset = Self::HASHES_OFFSET + hash_count * 32;
        let data_offset = depths_offset + hash_count * 2;
        let data_len = descriptor.byte_len() as usize;
        let refs_offset = data_offset + data_len;
        let end_offset = refs_offset + ref_count * ref_size;

        Ok(Self {
            descriptor,
            depths_offset,
            data_offset,
            data_len,
            refs_offset,
            end_offset,
        })
    }

    /// Parses the layout of the cell at the start of `data`.
    pub fn parse(data: &[u8], ref_size: usize) -> Result<Self, Error> {
        let [d1, d2, ..] = *data else {
            return Err(Error::InvalidCell);
        };
        let info = ok!(Self::from_descriptor(CellDescriptor::new([d1, d2]), ref_size));
        if unlikely(data.len() < info.end_offset) {
            return Err(Error::InvalidCell);
        }
        Ok(info)
    }

    /// Number of hashes (and depths) stored inline.
    pub fn stored_hash_count(&self) -> usize {
        (self.depths_offset - Self::HASHES_OFFSET) / 32
    }

    /// Returns the data bytes of the serialized cell.
    pub fn data<'a>(&self, cell: &'a [u8]) -> &'a [u8] {
        &cell[self.data_offset..self.refs_offset]
    }

    /// Computes the bit length from the completion tag.
    ///
    /// Fails for an overlong encoding, i.e. when the last byte
    /// contains only the tag.
    pub fn bit_len(&self, cell: &[u8]) -> Result<u16, Error> {
        if self.descriptor.is_aligned() {
            return Ok((self.data_len * 8) as u16);
        }

        match self.data(cell).last() {
            Some(&last) if last & 0x7f != 0 => {
                Ok((self.data_len * 8) as u16 - last.trailing_zeros() as u16 - 1)
            }
            _ => Err(Error::InvalidCell),
        }
    }

    /// Returns the stored hash with the specified index.
    pub fn stored_hash(&self, cell: &[u8], index: usize) -> Option<HashBytes> {
        if index >= self.stored_hash_count() {
            return None;
        }
        let offset = Self::HASHES_OFFSET + index * 32;
        HashBytes::try_from_slice(&cell[offset..offset + 32])
    }

    /// Returns the stored depth with the specified index.
    pub fn stored_depth(&self, cell: &[u8], index: usize) -> Option<u16> {
        if index >= self.stored_hash_count() {
            return None;
        }
        let offset = self.depths_offset + index * 2;
        Some(u16::from_be_bytes([cell[offset], cell[offset + 1]]))
    }

    /// Returns the serialized size of the cell without references.
    pub fn serialized_size(cell: &DynCell, with_hashes: bool) -> usize {
        let hashes = if with_hashes {
            cell.descriptor().hash_count() as usize * (32 + 2)
        } else {
            0
        };
        2 + hashes + cell.descriptor().byte_len() as usize
    }

    /// Writes the cell descriptor, optional hashes and data.
    ///
    /// References are written by the caller since their encoding
    /// depends on the container.
    pub fn write_cell(cell: &DynCell, with_hashes: bool, target: &mut Vec<u8>) {
        let descriptor = cell.descriptor().with_store_hashes(with_hashes);
        target.extend_from_slice(&descriptor.to_bytes());

        if with_hashes {
            let levels = descriptor.level_mask().significant_levels();
            for level in levels.clone() {
                target.extend_from_slice(cell.hash(level).as_slice());
            }
            for level in levels {
                target.extend_from_slice(&cell.depth(level).to_be_bytes());
            }
        }

        target.extend_from_slice(cell.data());
    }
}
