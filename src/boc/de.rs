use smallvec::SmallVec;

use super::{BocTag, DEFAULT_MAX_ROOTS};
use crate::cell::{
    Cell, CellContext, CellDescriptor, CellParts, CellSerializationInfo, LevelMask,
    MAX_REF_COUNT,
};
use crate::util::{read_be_uint, unlikely};

/// BOC deserialization options.
#[derive(Debug, Default, Clone)]
pub struct Options {
    /// The minimum allowed root count.
    pub min_roots: Option<usize>,
    /// The maximum allowed root count.
    pub max_roots: Option<usize>,
}

impl Options {
    /// Constructs decoder options to expect exactly the specified number of roots.
    pub const fn exact(number: usize) -> Self {
        Self {
            min_roots: Some(number),
            max_roots: Some(number),
        }
    }
}

/// Parsed and validated BOC structure.
///
/// Cell slices are stored in the stream order, root indices
/// are positions in the stream.
pub struct BocHeader<'a> {
    ref_size: usize,
    cells: Vec<&'a [u8]>,
    roots: SmallVec<[u32; ROOTS_ON_STACK]>,
}

impl<'a> BocHeader<'a> {
    /// Decodes and validates the BOC layout.
    ///
    /// Cells themselves are not built here, see [`BocHeader::finalize`].
    pub fn decode(data: &'a [u8], options: &Options) -> Result<Self, Error> {
        let mut reader = BocReader::new(data);

        // 4 bytes - tag
        // 1 byte - flags
        // 1 byte - offset size
        let [t0, t1, t2, t3, flags, offset_size] = *ok!(reader.read_array::<6>());

        let has_index;
        let has_crc;
        let has_cache_bits;
        let has_roots;

        match BocTag::from_bytes([t0, t1, t2, t3]) {
            Some(BocTag::Indexed) => {
                has_index = true;
                has_crc = false;
                has_cache_bits = false;
                has_roots = false;
            }
            Some(BocTag::IndexedCrc32) => {
                has_index = true;
                has_crc = true;
                has_cache_bits = false;
                has_roots = false;
            }
            Some(BocTag::Generic) => {
                has_index = flags & 0b1000_0000 != 0;
                has_crc = flags & 0b0100_0000 != 0;
                has_cache_bits = flags & 0b0010_0000 != 0;
                has_roots = true;
            }
            None => return Err(Error::UnknownBocTag),
        }
        let ref_size = (flags & 0b0000_0111) as usize;

        if unlikely(has_cache_bits && !has_index) {
            return Err(Error::InvalidCacheBits);
        }
        if unlikely(ref_size == 0 || ref_size > 4) {
            return Err(Error::InvalidRefSize);
        }
        let offset_size = offset_size as usize;
        if unlikely(offset_size == 0 || offset_size > 8) {
            return Err(Error::InvalidOffsetSize);
        }

        // {ref_size} bytes - cell count
        // {ref_size} bytes - root count
        // {ref_size} bytes - absent cell count
        // {offset_size} bytes - total cells size
        let cell_count = ok!(reader.read_be_uint(ref_size));
        let root_count = ok!(reader.read_be_uint(ref_size));
        let absent_count = ok!(reader.read_be_uint(ref_size));
        let data_size = ok!(reader.read_be_uint(offset_size));

        if unlikely(cell_count == 0) {
            return Err(Error::InvalidHeader);
        }
        if unlikely(root_count == 0) {
            return Err(Error::RootCellNotFound);
        }
        if unlikely(!has_roots && root_count != 1) {
            return Err(Error::TooManyRootCells);
        }
        if unlikely(absent_count > cell_count) {
            return Err(Error::TooManyAbsentCells);
        }
        if let Some(min_roots) = options.min_roots {
            if unlikely(root_count < min_roots as u64) {
                return Err(Error::TooFewRootCells);
            }
        }
        let max_roots = options.max_roots.unwrap_or(DEFAULT_MAX_ROOTS);
        if unlikely(root_count > max_roots as u64 || root_count > cell_count) {
            return Err(Error::TooManyRootCells);
        }

        // NOTE: `cell_count` fits into `u32`, so all products below fit into `u64`
        if unlikely(data_size > (cell_count << 10) || data_size > (1 << 40)) {
            return Err(Error::InvalidTotalSize);
        }
        if unlikely(data_size < cell_count * (2 + ref_size as u64) - ref_size as u64) {
            return Err(Error::InvalidTotalSize);
        }

        let roots_size = if has_roots {
            root_count * ref_size as u64
        } else {
            0
        };
        let index_size = if has_index {
            cell_count * offset_size as u64
        } else {
            0
        };
        let data_offset = reader.offset as u64 + roots_size + index_size;
        let total_size = data_offset + data_size + if has_crc { 4 } else { 0 };
        if unlikely((data.len() as u64) < total_size) {
            return Err(Error::UnexpectedEof);
        }
        let total_size = total_size as usize;

        if has_crc {
            let checksum_offset = total_size - 4;
            let expected = crc32c::crc32c(&data[..checksum_offset]);
            let mut stored = [0u8; 4];
            stored.copy_from_slice(&data[checksum_offset..total_size]);
            if unlikely(u32::from_le_bytes(stored) != expected) {
                return Err(Error::InvalidChecksum);
            }
        }

        let cell_count = cell_count as usize;

        // Root cell indices
        let mut roots = SmallVec::with_capacity(root_count as usize);
        let mut should_cache = if has_cache_bits {
            vec![0u8; cell_count]
        } else {
            Vec::new()
        };
        for _ in 0..root_count {
            let index = if has_roots {
                ok!(reader.read_be_uint(ref_size)) as usize
            } else {
                0
            };
            if unlikely(index >= cell_count) {
                return Err(Error::RootOutOfBounds);
            }
            if let Some(count) = should_cache.get_mut(index) {
                *count = std::cmp::min(*count + 1, 2);
            }
            roots.push(index as u32);
        }

        let index = if has_index {
            Some(ok!(reader.read_slice(cell_count * offset_size)))
        } else {
            None
        };

        // Cells
        let mut cells_data = ok!(reader.read_slice(data_size as usize));
        let mut cells = Vec::with_capacity(cell_count);
        let mut cell_end = 0u64;
        for i in 0..cell_count {
            let [d1, d2, ..] = *cells_data else {
                return Err(Error::InvalidTotalSize);
            };
            let descriptor = CellDescriptor::new([d1, d2]);
            if unlikely(descriptor.is_absent()) {
                return Err(Error::AbsentCell);
            }
            if unlikely(descriptor.reference_count() as usize > MAX_REF_COUNT) {
                return Err(Error::InvalidRef);
            }

            let info = match CellSerializationInfo::from_descriptor(descriptor, ref_size) {
                Ok(info) if info.end_offset <= cells_data.len() => info,
                Ok(_) => return Err(Error::InvalidTotalSize),
                Err(_) => return Err(Error::InvalidCell),
            };
            let (cell, rest) = cells_data.split_at(info.end_offset);
            if unlikely(info.bit_len(cell).is_err()) {
                return Err(Error::UnnormalizedCell);
            }

            for r in 0..descriptor.reference_count() as usize {
                let offset = info.refs_offset + r * ref_size;
                let child = read_be_uint(&cell[offset..offset + ref_size]) as usize;
                if unlikely(child <= i) {
                    return Err(Error::InvalidRefOrder);
                }
                if unlikely(child >= cell_count) {
                    return Err(Error::InvalidRef);
                }
                if let Some(count) = should_cache.get_mut(child) {
                    *count = std::cmp::min(*count + 1, 2);
                }
            }

            cell_end += info.end_offset as u64;
            if let Some(index) = index {
                let entry = read_be_uint(&index[i * offset_size..(i + 1) * offset_size]);
                let (offset, cache_bit) = if has_cache_bits {
                    (entry >> 1, Some(entry & 1 != 0))
                } else {
                    (entry, None)
                };
                if unlikely(offset != cell_end) {
                    return Err(Error::InvalidIndex);
                }
                if let Some(stored) = cache_bit {
                    if unlikely(stored != (should_cache[i] > 1)) {
                        return Err(Error::InvalidCacheBits);
                    }
                }
            }

            cells.push(cell);
            cells_data = rest;
        }

        // Cells must fill the declared data size exactly
        if unlikely(!cells_data.is_empty()) {
            return Err(Error::InvalidTotalSize);
        }

        tracing::trace!(
            cell_count,
            root_count,
            ref_size,
            offset_size,
            data_size,
            has_index,
            has_crc,
            "parsed bag of cells header"
        );

        Ok(Self {
            ref_size,
            cells,
            roots,
        })
    }

    /// Builds all cells starting from the end of the stream.
    ///
    /// Stored hashes and depths are compared with the computed ones.
    pub fn finalize(&self, context: &mut dyn CellContext) -> Result<ProcessedCells, Error> {
        let ref_size = self.ref_size;
        let cell_count = self.cells.len();

        let mut res = Vec::<Cell>::new();
        if res.try_reserve_exact(cell_count).is_err() {
            return Err(Error::InvalidTotalSize);
        }

        for (i, cell) in self.cells.iter().enumerate().rev() {
            let info = match CellSerializationInfo::parse(cell, ref_size) {
                Ok(info) => info,
                Err(_) => return Err(Error::InvalidCell),
            };
            let Ok(bit_len) = info.bit_len(cell) else {
                return Err(Error::UnnormalizedCell);
            };

            let mut references = SmallVec::<[Cell; MAX_REF_COUNT]>::new();
            let mut children_mask = LevelMask::EMPTY;
            for r in 0..info.descriptor.reference_count() as usize {
                let offset = info.refs_offset + r * ref_size;
                let child = read_be_uint(&cell[offset..offset + ref_size]) as usize;
                if unlikely(child <= i || child >= cell_count) {
                    return Err(Error::InvalidRef);
                }

                // Cells are processed in reverse order
                let Some(child) = res.get(cell_count - child - 1) else {
                    return Err(Error::InvalidRefOrder);
                };
                children_mask |= child.level_mask();
                references.push(child.clone());
            }

            let built = ok!(context
                .finalize_cell(CellParts {
                    bit_len,
                    descriptor: info.descriptor.with_store_hashes(false),
                    children_mask,
                    references,
                    data: info.data(cell),
                })
                .map_err(|_| Error::InvalidCell));

            if info.descriptor.store_hashes() {
                let levels = info.descriptor.level_mask().significant_levels();
                for (hash_index, level) in levels.enumerate() {
                    let stored_hash = info.stored_hash(cell, hash_index);
                    let stored_depth = info.stored_depth(cell, hash_index);
                    if unlikely(
                        stored_hash.as_ref() != Some(built.hash(level))
                            || stored_depth != Some(built.depth(level)),
                    ) {
                        return Err(Error::InvalidHash);
                    }
                }
            }

            res.push(built);
        }

        Ok(ProcessedCells(res))
    }

    /// Cell index size in bytes. Guaranteed to be 4 at max.
    pub fn ref_size(&self) -> usize {
        self.ref_size
    }

    /// Slices of the unique cells in the stream order.
    pub fn cells(&self) -> &[&'a [u8]] {
        &self.cells
    }

    /// Root positions in the stream.
    pub fn roots(&self) -> &[u32] {
        &self.roots
    }
}

/// Array of processed cells.
pub struct ProcessedCells(Vec<Cell>);

impl ProcessedCells {
    /// Returns a processed cell by its position in the stream.
    pub fn get(&self, index: u32) -> Option<Cell> {
        let index = self.0.len().checked_sub(index as usize + 1)?;
        self.0.get(index).cloned()
    }
}

struct BocReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BocReader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = match self.offset.checked_add(len) {
            Some(end) if end <= self.data.len() => end,
            _ => return Err(Error::UnexpectedEof),
        };
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<&'a [u8; N], Error> {
        let slice = ok!(self.read_slice(N));
        match slice.try_into() {
            Ok(array) => Ok(array),
            Err(_) => Err(Error::UnexpectedEof),
        }
    }

    fn read_be_uint(&mut self, size: usize) -> Result<u64, Error> {
        let slice = ok!(self.read_slice(size));
        Ok(read_be_uint(slice))
    }
}

const ROOTS_ON_STACK: usize = 2;

/// Error type for BOC decoding related errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// EOF encountered during another operation.
    #[error("unexpected EOF")]
    UnexpectedEof,
    /// Invalid magic bytes.
    #[error("unknown BOC tag")]
    UnknownBocTag,
    /// Invalid BOC header.
    #[error("invalid header")]
    InvalidHeader,
    /// References size is not in range 1..=4.
    #[error("ref index does not fit in `u32` type")]
    InvalidRefSize,
    /// Offset size is not in range 1..=8.
    #[error("cell offset does not fit in `u64` type")]
    InvalidOffsetSize,
    /// Root cell not found.
    #[error("root cell not found")]
    RootCellNotFound,
    /// The number of roots in BOC is greater than expected.
    #[error("too many root cells")]
    TooManyRootCells,
    /// The number of roots in BOC is less than expected.
    #[error("too few root cells")]
    TooFewRootCells,
    /// Absent count is greater than the cell count.
    #[error("too many absent cells")]
    TooManyAbsentCells,
    /// Absent cells can't be built.
    #[error("absent cells are not supported")]
    AbsentCell,
    /// Total cells size mismatch.
    #[error("invalid total cells size")]
    InvalidTotalSize,
    /// Invalid root cell index.
    #[error("root index out of bounds")]
    RootOutOfBounds,
    /// Index entry doesn't match the cell end offset.
    #[error("invalid cell index")]
    InvalidIndex,
    /// Cache bit doesn't match the actual cell usage.
    #[error("invalid cache bits")]
    InvalidCacheBits,
    /// Invalid child reference.
    #[error("invalid cell reference")]
    InvalidRef,
    /// Possible graph loop detected.
    #[error("invalid children order")]
    InvalidRefOrder,
    /// Suboptimal cells are treated as error.
    #[error("unnormalized cell")]
    UnnormalizedCell,
    /// Failed to build cell.
    #[error("invalid cell")]
    InvalidCell,
    /// Stored hash or depth doesn't match the computed one.
    #[error("stored cell hash mismatch")]
    InvalidHash,
    /// Crc mismatch.
    #[error("invalid checksum")]
    InvalidChecksum,
    /// Input is not a valid base64 string.
    #[error("invalid base64")]
    InvalidBase64,
}
