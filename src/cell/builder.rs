use smallvec::SmallVec;

use super::cell_context::{CellContext, CellParts, EmptyCellContext};
use super::{
    Cell, CellDescriptor, CellSlice, CellType, DynCell, HashBytes, LevelMask,
    MAX_BIT_LEN, MAX_REF_COUNT,
};
use crate::error::Error;

/// Builder for constructing cells with densely packed data.
///
/// All store operations either write everything or leave
/// the builder untouched.
#[derive(Clone)]
pub struct CellBuilder {
    data: [u8; 128],
    bit_len: u16,
    is_exotic: bool,
    references: SmallVec<[Cell; MAX_REF_COUNT]>,
}

impl Default for CellBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CellBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellBuilder")
            .field("bit_len", &self.bit_len)
            .field("is_exotic", &self.is_exotic)
            .field("references", &self.references)
            .finish()
    }
}

impl CellBuilder {
    /// Creates an empty cell builder.
    pub fn new() -> Self {
        Self {
            data: [0; 128],
            bit_len: 0,
            is_exotic: false,
            references: SmallVec::new(),
        }
    }

    /// Creates a builder with the specified bits of data.
    ///
    /// Bits after `bit_len` (e.g. the completion tag) are ignored.
    pub fn from_raw_data(value: &[u8], bit_len: u16) -> Result<Self, Error> {
        let mut res = Self::new();
        ok!(res.store_raw(value, bit_len));
        Ok(res)
    }

    /// Creates a builder from raw cell parts.
    pub fn from_parts<I>(
        is_exotic: bool,
        data: &[u8],
        bit_len: u16,
        references: I,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Cell>,
    {
        let mut res = ok!(Self::from_raw_data(data, bit_len));
        res.is_exotic = is_exotic;
        for child in references {
            ok!(res.store_reference(child));
        }
        Ok(res)
    }

    /// Creates a builder with the same data, references and type as the cell.
    ///
    /// Rebuilding the result produces an equal cell.
    pub fn from_cell(cell: &DynCell) -> Result<Self, Error> {
        if !cell.is_loaded() {
            return Err(Error::UnloadedCell);
        }
        Self::from_parts(
            cell.is_exotic(),
            cell.data(),
            cell.bit_len(),
            cell.references().cloned(),
        )
    }

    /// Returns the data size of this cell in bits.
    #[inline]
    pub fn bit_len(&self) -> u16 {
        self.bit_len
    }

    /// Returns the number of remaining data bits.
    #[inline]
    pub fn spare_bits_capacity(&self) -> u16 {
        MAX_BIT_LEN - self.bit_len
    }

    /// Returns the number of remaining references.
    #[inline]
    pub fn spare_refs_capacity(&self) -> u8 {
        (MAX_REF_COUNT - self.references.len()) as u8
    }

    /// Returns `true` if the specified amount of bits and refs fits.
    #[inline]
    pub fn has_capacity(&self, bits: u16, refs: u8) -> bool {
        self.bit_len as usize + bits as usize <= MAX_BIT_LEN as usize
            && self.references.len() + refs as usize <= MAX_REF_COUNT
    }

    /// Returns the underlying data bytes (without the completion tag).
    #[inline]
    pub fn raw_data(&self) -> &[u8] {
        &self.data[..self.bit_len.div_ceil(8) as usize]
    }

    /// Returns a slice of the child cells stored in the builder.
    #[inline]
    pub fn references(&self) -> &[Cell] {
        self.references.as_slice()
    }

    /// Returns whether the resulting cell will be exotic.
    #[inline]
    pub fn is_exotic(&self) -> bool {
        self.is_exotic
    }

    /// Marks the resulting cell as exotic.
    #[inline]
    pub fn set_exotic(&mut self, is_exotic: bool) {
        self.is_exotic = is_exotic;
    }

    /// Computes the level mask of the resulting cell.
    pub fn compute_level_mask(&self) -> LevelMask {
        let children_mask = self.children_mask();
        if !self.is_exotic {
            return children_mask;
        }

        match self.data.first().copied().and_then(CellType::from_exotic_tag) {
            Some(CellType::PrunedBranch) => LevelMask::new(self.data[1]),
            Some(CellType::MerkleProof | CellType::MerkleUpdate) => children_mask.virtualize(1),
            Some(CellType::LibraryReference) => LevelMask::EMPTY,
            _ => children_mask,
        }
    }

    fn children_mask(&self) -> LevelMask {
        let mut children_mask = LevelMask::EMPTY;
        for child in &self.references {
            children_mask |= child.level_mask();
        }
        children_mask
    }

    /// Tries to store `bits` zero bits.
    pub fn store_zeros(&mut self, bits: u16) -> Result<(), Error> {
        if self.has_capacity(bits, 0) {
            self.bit_len += bits;
            Ok(())
        } else {
            Err(Error::CellOverflow)
        }
    }

    /// Tries to store `bits` one bits.
    pub fn store_ones(&mut self, bits: u16) -> Result<(), Error> {
        if !self.has_capacity(bits, 0) {
            return Err(Error::CellOverflow);
        }
        let ones = [0xffu8; 128];
        self.write_bits(&ones, bits);
        Ok(())
    }

    /// Tries to store one zero bit.
    #[inline]
    pub fn store_bit_zero(&mut self) -> Result<(), Error> {
        self.store_bit(false)
    }

    /// Tries to store one non-zero bit.
    #[inline]
    pub fn store_bit_one(&mut self) -> Result<(), Error> {
        self.store_bit(true)
    }

    /// Tries to store one bit.
    pub fn store_bit(&mut self, value: bool) -> Result<(), Error> {
        self.store_raw(&[(value as u8) << 7], 1)
    }

    /// Tries to store `u8` in the cell.
    #[inline]
    pub fn store_u8(&mut self, value: u8) -> Result<(), Error> {
        self.store_raw(&[value], 8)
    }

    /// Tries to store `u16` in the cell (big-endian).
    #[inline]
    pub fn store_u16(&mut self, value: u16) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 16)
    }

    /// Tries to store `u32` in the cell (big-endian).
    #[inline]
    pub fn store_u32(&mut self, value: u32) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 32)
    }

    /// Tries to store `u64` in the cell (big-endian).
    #[inline]
    pub fn store_u64(&mut self, value: u64) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 64)
    }

    /// Tries to store `u128` in the cell (big-endian).
    #[inline]
    pub fn store_u128(&mut self, value: u128) -> Result<(), Error> {
        self.store_raw(&value.to_be_bytes(), 128)
    }

    /// Tries to store 32 bytes in the cell.
    #[inline]
    pub fn store_u256(&mut self, value: &HashBytes) -> Result<(), Error> {
        self.store_raw(value.as_slice(), 256)
    }

    /// Tries to store the lowest `bits` of `value` (at most 64).
    ///
    /// Higher bits of the value are ignored.
    pub fn store_uint(&mut self, value: u64, bits: u16) -> Result<(), Error> {
        if bits > 64 {
            return Err(Error::CellOverflow);
        }
        if bits == 0 {
            return Ok(());
        }
        let bytes = (value << (64 - bits)).to_be_bytes();
        self.store_raw(&bytes, bits)
    }

    /// Tries to store all bytes of the slice.
    pub fn store_bytes(&mut self, value: &[u8]) -> Result<(), Error> {
        let bits = match u16::try_from(value.len() * 8) {
            Ok(bits) => bits,
            Err(_) => return Err(Error::CellOverflow),
        };
        self.store_raw(value, bits)
    }

    /// Tries to store the first `bits` of the value.
    ///
    /// Fails with [`Error::CellUnderflow`] if the value is shorter than `bits`.
    pub fn store_raw(&mut self, value: &[u8], bits: u16) -> Result<(), Error> {
        if bits as usize > value.len() * 8 {
            return Err(Error::CellUnderflow);
        }
        if !self.has_capacity(bits, 0) {
            return Err(Error::CellOverflow);
        }
        self.write_bits(value, bits);
        Ok(())
    }

    /// Tries to store the remaining data and references of the slice.
    pub fn store_slice(&mut self, value: &CellSlice<'_>) -> Result<(), Error> {
        let bits = value.remaining_bits();
        let refs = value.remaining_refs();
        if !self.has_capacity(bits, refs) {
            return Err(Error::CellOverflow);
        }

        let mut buffer = [0u8; 128];
        let data = ok!(value.get_raw(0, &mut buffer, bits));
        self.write_bits(data, bits);
        self.references.extend(value.references().cloned());
        Ok(())
    }

    /// Tries to store a child in the cell.
    pub fn store_reference(&mut self, cell: Cell) -> Result<(), Error> {
        if self.references.len() < MAX_REF_COUNT {
            self.references.push(cell);
            Ok(())
        } else {
            Err(Error::CellOverflow)
        }
    }

    /// Tries to store a presence bit followed by an optional child.
    pub fn store_maybe_reference(&mut self, cell: Option<Cell>) -> Result<(), Error> {
        match cell {
            Some(cell) => {
                if !self.has_capacity(1, 1) {
                    return Err(Error::CellOverflow);
                }
                ok!(self.store_bit_one());
                self.store_reference(cell)
            }
            None => self.store_bit_zero(),
        }
    }

    /// Appends bits assuming that the capacity was already checked.
    fn write_bits(&mut self, value: &[u8], bits: u16) {
        if bits == 0 {
            return;
        }

        let q = (self.bit_len / 8) as usize;
        let r = (self.bit_len % 8) as u32;
        let byte_len = bits.div_ceil(8) as usize;
        let rem = bits % 8;

        for (i, byte) in value[..byte_len].iter().enumerate() {
            let mut byte = *byte;
            if i + 1 == byte_len && rem != 0 {
                byte &= 0xffu8 << (8 - rem);
            }

            self.data[q + i] |= byte >> r;
            if r != 0 {
                if let Some(next) = self.data.get_mut(q + i + 1) {
                    *next |= byte << (8 - r);
                }
            }
        }

        self.bit_len += bits;
    }

    /// Tries to build a new cell using the default context.
    #[inline]
    pub fn build(self) -> Result<Cell, Error> {
        self.build_ext(&mut EmptyCellContext)
    }

    /// Tries to build a new cell using the specified cell context.
    pub fn build_ext(mut self, context: &mut dyn CellContext) -> Result<Cell, Error> {
        let children_mask = self.children_mask();
        let level_mask = self.compute_level_mask();

        let descriptor = CellDescriptor {
            d1: CellDescriptor::compute_d1(level_mask, self.is_exotic, self.references.len() as u8),
            d2: CellDescriptor::compute_d2(self.bit_len),
        };

        let byte_len = self.bit_len.div_ceil(8) as usize;
        let rem = self.bit_len % 8;
        if rem != 0 {
            let last_byte = &mut self.data[byte_len - 1];
            let tag_mask: u8 = 1 << (7 - rem);
            *last_byte = (*last_byte & !(tag_mask - 1)) | tag_mask;
        }

        context.finalize_cell(CellParts {
            bit_len: self.bit_len,
            descriptor,
            children_mask,
            references: self.references,
            data: &self.data[..byte_len],
        })
    }
}
