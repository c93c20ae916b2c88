//! Refcounted persistent cell storage.
//!
//! Each stored cell is a record keyed by its representation hash:
//!
//! ```text
//! [refcount: i32 LE] [d1, d2] [data] ([level_mask] [hashes * 32] [depths * 2])*refs
//! ```
//!
//! Children are referenced by their hashes only, so a loaded cell has
//! [`ExtCell`] stand-ins instead of the real children.

use std::collections::BTreeMap;
use std::sync::Mutex;

use smallvec::SmallVec;

use crate::cell::{
    Cell, CellDescriptor, CellImpl, DynCell, HashBytes, LevelMask, VirtualCellWrapper,
};

pub use self::dynamic::{DynamicBagOfCellsDb, Stats};
pub use self::storage::{CellLoader, CellStorer, LoadResult};

mod dynamic;
mod storage;

#[cfg(test)]
mod tests;

/// Cell storage error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key-value backend error")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid cell record")]
    InvalidRecord,
    #[error("cell hash mismatch")]
    HashMismatch,
    #[error("cell not found")]
    CellNotFound,
    #[error("cell refcount underflow")]
    RefcountUnderflow,
    #[error("changes were not prepared for commit")]
    NotPrepared,
    #[error("invalid cell")]
    Cell(#[from] crate::error::Error),
}

/// Read access to the key-value backend.
pub trait KeyValueReader {
    /// Returns the value for the key, or `None` if it is absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;
}

/// Read-write access to the key-value backend.
pub trait KeyValue: KeyValueReader {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    fn erase(&self, key: &[u8]) -> Result<(), Error>;
}

impl<T: KeyValueReader + ?Sized> KeyValueReader for &T {
    #[inline]
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        T::get(*self, key)
    }
}

impl<T: KeyValue + ?Sized> KeyValue for &T {
    #[inline]
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        T::set(*self, key, value)
    }

    #[inline]
    fn erase(&self, key: &[u8]) -> Result<(), Error> {
        T::erase(*self, key)
    }
}

/// In-memory ordered key-value backend.
#[derive(Debug, Default)]
pub struct MemoryKeyValue {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns a copy of all stored entries.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        // Values are replaced atomically so a poisoned map is still consistent
        match self.map.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        }
    }
}

impl KeyValueReader for MemoryKeyValue {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.lock().get(key).cloned())
    }
}

impl KeyValue for MemoryKeyValue {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn erase(&self, key: &[u8]) -> Result<(), Error> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Resolves children of the loaded cells.
pub trait ExtCellCreator {
    /// Creates a cell for the child described by its level mask and
    /// the hashes and depths at all significant levels.
    fn ext_cell(
        &mut self,
        level_mask: LevelMask,
        hashes: &[HashBytes],
        depths: &[u16],
    ) -> Result<Cell, Error>;
}

impl<T: ExtCellCreator + ?Sized> ExtCellCreator for &mut T {
    #[inline]
    fn ext_cell(
        &mut self,
        level_mask: LevelMask,
        hashes: &[HashBytes],
        depths: &[u16],
    ) -> Result<Cell, Error> {
        T::ext_cell(*self, level_mask, hashes, depths)
    }
}

/// Creates a new [`ExtCell`] for each child.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtCellCreator;

impl ExtCellCreator for DefaultExtCellCreator {
    fn ext_cell(
        &mut self,
        level_mask: LevelMask,
        hashes: &[HashBytes],
        depths: &[u16],
    ) -> Result<Cell, Error> {
        let cell = ExtCell::new(level_mask, hashes, depths)?;
        Ok(Cell::from_impl(std::sync::Arc::new(cell)))
    }
}

/// Unloaded boundary cell.
///
/// Only knows the hashes and depths of the stored cell, all
/// data access fails with [`UnloadedCell`].
///
/// [`UnloadedCell`]: crate::error::Error::UnloadedCell
pub struct ExtCell {
    descriptor: CellDescriptor,
    hashes: SmallVec<[(HashBytes, u16); 4]>,
}

impl ExtCell {
    /// Creates a stand-in from the hashes and depths for each
    /// significant level of the mask.
    pub fn new(level_mask: LevelMask, hashes: &[HashBytes], depths: &[u16]) -> Result<Self, Error> {
        let hash_count = level_mask.hash_count() as usize;
        if hashes.len() != hash_count || depths.len() != hash_count {
            return Err(Error::InvalidRecord);
        }

        Ok(Self {
            descriptor: CellDescriptor {
                d1: CellDescriptor::compute_d1(level_mask, false, 0),
                d2: 0,
            },
            hashes: hashes.iter().copied().zip(depths.iter().copied()).collect(),
        })
    }

    fn level_descr(&self, level: u8) -> Option<&(HashBytes, u16)> {
        let hash_index = self.descriptor.level_mask().hash_index(level) as usize;
        self.hashes.get(hash_index).or(self.hashes.last())
    }
}

impl CellImpl for ExtCell {
    #[inline]
    fn descriptor(&self) -> CellDescriptor {
        self.descriptor
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
        0
    }

    #[inline]
    fn is_loaded(&self) -> bool {
        false
    }
}
