use super::{Cell, CellType, DynCell, HashBytes, RefsIter};
use crate::error::Error;

/// A read-only view for a subcell of a cell.
///
/// Load operations consume bits or references from the front of
/// the window, get operations only peek at them.
#[derive(Clone, Copy)]
pub struct CellSlice<'a> {
    cell: &'a DynCell,
    bits_window_start: u16,
    bits_window_end: u16,
    refs_window_start: u8,
    refs_window_end: u8,
}

impl std::fmt::Debug for CellSlice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellSlice")
            .field("cell", &self.cell)
            .field("bits", &(self.bits_window_start..self.bits_window_end))
            .field("refs", &(self.refs_window_start..self.refs_window_end))
            .finish()
    }
}

impl<'a> CellSlice<'a> {
    /// Constructs a new cell slice from the specified cell.
    ///
    /// Returns an error if the cell is exotic or not loaded.
    pub fn new(cell: &'a DynCell) -> Result<Self, Error> {
        if cell.is_exotic() {
            if cell.cell_type().is_pruned_branch() {
                return Err(Error::PrunedBranchAccess);
            }
            return Err(Error::UnexpectedExoticCell);
        }
        Self::new_allow_exotic(cell)
    }

    /// Constructs a new cell slice from the specified cell, allowing
    /// library references and merkle cells.
    ///
    /// Pruned branches are still rejected since they don't contain data.
    pub fn new_allow_exotic(cell: &'a DynCell) -> Result<Self, Error> {
        if !cell.is_loaded() {
            return Err(Error::UnloadedCell);
        }
        if cell.cell_type() == CellType::PrunedBranch {
            return Err(Error::PrunedBranchAccess);
        }
        Ok(Self {
            bits_window_start: 0,
            bits_window_end: cell.bit_len(),
            refs_window_start: 0,
            refs_window_end: cell.reference_count(),
            cell,
        })
    }

    /// Returns the underlying cell.
    #[inline]
    pub fn cell(&self) -> &'a DynCell {
        self.cell
    }

    /// Returns whether there are no bits of data left.
    #[inline]
    pub fn is_data_empty(&self) -> bool {
        self.bits_window_start >= self.bits_window_end
    }

    /// Returns whether there are no references left.
    #[inline]
    pub fn is_refs_empty(&self) -> bool {
        self.refs_window_start >= self.refs_window_end
    }

    /// Returns the number of remaining references in the slice.
    #[inline]
    pub fn remaining_refs(&self) -> u8 {
        self.refs_window_end.saturating_sub(self.refs_window_start)
    }

    /// Returns the number of remaining bits of data in the slice.
    #[inline]
    pub fn remaining_bits(&self) -> u16 {
        self.bits_window_end.saturating_sub(self.bits_window_start)
    }

    /// Returns the start of the data window.
    #[inline]
    pub fn offset_bits(&self) -> u16 {
        self.bits_window_start
    }

    /// Returns the start of the references window.
    #[inline]
    pub fn offset_refs(&self) -> u8 {
        self.refs_window_start
    }

    /// Returns `true` if the slice contains at least `bits` and `refs`.
    #[inline]
    pub fn has_remaining(&self, bits: u16, refs: u8) -> bool {
        bits <= self.remaining_bits() && refs <= self.remaining_refs()
    }

    /// Advances the data window by `bits`.
    pub fn skip_bits(&mut self, bits: u16) -> Result<(), Error> {
        if bits <= self.remaining_bits() {
            self.bits_window_start += bits;
            Ok(())
        } else {
            Err(Error::CellUnderflow)
        }
    }

    /// Reads a bit at the specified offset from the start of the window.
    pub fn get_bit(&self, offset: u16) -> Result<bool, Error> {
        self.get_uint(offset, 1).map(|bit| bit != 0)
    }

    /// Reads `u8` starting at the specified offset.
    #[inline]
    pub fn get_u8(&self, offset: u16) -> Result<u8, Error> {
        self.get_uint(offset, 8).map(|value| value as u8)
    }

    /// Reads `u16` starting at the specified offset.
    #[inline]
    pub fn get_u16(&self, offset: u16) -> Result<u16, Error> {
        self.get_uint(offset, 16).map(|value| value as u16)
    }

    /// Reads `u32` starting at the specified offset.
    #[inline]
    pub fn get_u32(&self, offset: u16) -> Result<u32, Error> {
        self.get_uint(offset, 32).map(|value| value as u32)
    }

    /// Reads `u64` starting at the specified offset.
    #[inline]
    pub fn get_u64(&self, offset: u16) -> Result<u64, Error> {
        self.get_uint(offset, 64)
    }

    /// Reads 32 bytes starting at the specified offset.
    pub fn get_u256(&self, offset: u16) -> Result<HashBytes, Error> {
        let mut result = HashBytes::ZERO;
        ok!(self.get_raw(offset, &mut result.0, 256));
        Ok(result)
    }

    /// Reads up to 64 bits as a big-endian unsigned integer.
    pub fn get_uint(&self, offset: u16, bits: u16) -> Result<u64, Error> {
        if bits == 0 {
            return Ok(0);
        }
        if bits > 64 || offset as usize + bits as usize > self.remaining_bits() as usize {
            return Err(Error::CellUnderflow);
        }

        let data = self.cell.data();
        let mut pos = (self.bits_window_start + offset) as usize;
        let end = pos + bits as usize;

        let mut result = 0u64;
        while pos < end {
            let r = pos % 8;
            let chunk = std::cmp::min(8 - r, end - pos);
            let Some(byte) = data.get(pos / 8) else {
                return Err(Error::CellUnderflow);
            };

            let value = (*byte >> (8 - r - chunk)) as u64 & ((1u64 << chunk) - 1);
            result = (result << chunk) | value;
            pos += chunk;
        }

        Ok(result)
    }

    /// Reads `bits` into the target buffer starting at the specified offset.
    ///
    /// Returns the filled prefix of the target.
    pub fn get_raw<'b>(
        &self,
        offset: u16,
        target: &'b mut [u8],
        bits: u16,
    ) -> Result<&'b mut [u8], Error> {
        let byte_len = bits.div_ceil(8) as usize;
        if byte_len > target.len()
            || offset as usize + bits as usize > self.remaining_bits() as usize
        {
            return Err(Error::CellUnderflow);
        }

        let target = &mut target[..byte_len];
        let mut offset = offset;
        let mut remaining = bits;
        for byte in target.iter_mut() {
            let chunk = std::cmp::min(remaining, 8);
            let value = ok!(self.get_uint(offset, chunk)) as u8;
            *byte = value << (8 - chunk);
            offset += chunk;
            remaining -= chunk;
        }

        Ok(target)
    }

    /// Reads the next bit.
    pub fn load_bit(&mut self) -> Result<bool, Error> {
        let bit = ok!(self.get_bit(0));
        self.bits_window_start += 1;
        Ok(bit)
    }

    /// Reads the next `u8`.
    pub fn load_u8(&mut self) -> Result<u8, Error> {
        self.load_uint(8).map(|value| value as u8)
    }

    /// Reads the next `u16`.
    pub fn load_u16(&mut self) -> Result<u16, Error> {
        self.load_uint(16).map(|value| value as u16)
    }

    /// Reads the next `u32`.
    pub fn load_u32(&mut self) -> Result<u32, Error> {
        self.load_uint(32).map(|value| value as u32)
    }

    /// Reads the next `u64`.
    pub fn load_u64(&mut self) -> Result<u64, Error> {
        self.load_uint(64)
    }

    /// Reads the next 32 bytes.
    pub fn load_u256(&mut self) -> Result<HashBytes, Error> {
        let value = ok!(self.get_u256(0));
        self.bits_window_start += 256;
        Ok(value)
    }

    /// Reads the next `bits` (at most 64) as an unsigned integer.
    pub fn load_uint(&mut self, bits: u16) -> Result<u64, Error> {
        let value = ok!(self.get_uint(0, bits));
        self.bits_window_start += bits;
        Ok(value)
    }

    /// Same as [`load_uint`], but returns `None` if the window
    /// is exactly at the end of data.
    ///
    /// [`load_uint`]: CellSlice::load_uint
    pub fn load_uint_eof(&mut self, bits: u16) -> Result<Option<u64>, Error> {
        if bits > 0 && self.is_data_empty() {
            return Ok(None);
        }
        self.load_uint(bits).map(Some)
    }

    /// Reads the next `bits` into the target buffer.
    pub fn load_raw<'b>(&mut self, target: &'b mut [u8], bits: u16) -> Result<&'b mut [u8], Error> {
        let data = ok!(self.get_raw(0, target, bits));
        self.bits_window_start += bits;
        Ok(data)
    }

    /// Reads the next `n` bytes.
    pub fn load_bytes(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        let bits = match n.checked_mul(8).map(u16::try_from) {
            Some(Ok(bits)) if bits <= self.remaining_bits() => bits,
            _ => return Err(Error::CellUnderflow),
        };
        let mut result = vec![0; n];
        ok!(self.load_raw(&mut result, bits));
        Ok(result)
    }

    /// Returns a reference to the Nth child cell (relative to this slice's refs window).
    pub fn reference(&self, index: u8) -> Option<&'a DynCell> {
        if index >= self.remaining_refs() {
            return None;
        }
        self.cell.reference(self.refs_window_start + index)
    }

    /// Returns the Nth child cell (relative to this slice's refs window).
    pub fn reference_cloned(&self, index: u8) -> Option<Cell> {
        if index >= self.remaining_refs() {
            return None;
        }
        self.cell.reference_cloned(self.refs_window_start + index)
    }

    /// Creates an iterator through the remaining child nodes.
    pub fn references(&self) -> RefsIter<'a> {
        RefsIter {
            cell: self.cell,
            max: self.refs_window_end,
            index: self.refs_window_start,
        }
    }

    /// Reads the next child cell.
    pub fn load_reference(&mut self) -> Result<&'a DynCell, Error> {
        match self.reference(0) {
            Some(cell) => {
                self.refs_window_start += 1;
                Ok(cell)
            }
            None => Err(Error::CellUnderflow),
        }
    }

    /// Reads the next child cell as an owned cell.
    pub fn load_reference_cloned(&mut self) -> Result<Cell, Error> {
        match self.reference_cloned(0) {
            Some(cell) => {
                self.refs_window_start += 1;
                Ok(cell)
            }
            None => Err(Error::CellUnderflow),
        }
    }

    /// Reads a presence bit and the optional child cell.
    pub fn load_maybe_reference_cloned(&mut self) -> Result<Option<Cell>, Error> {
        if !self.has_remaining(1, 0) {
            return Err(Error::CellUnderflow);
        }
        if !ok!(self.get_bit(0)) {
            self.bits_window_start += 1;
            return Ok(None);
        }
        match self.reference_cloned(0) {
            Some(cell) => {
                self.bits_window_start += 1;
                self.refs_window_start += 1;
                Ok(Some(cell))
            }
            None => Err(Error::CellUnderflow),
        }
    }
}
