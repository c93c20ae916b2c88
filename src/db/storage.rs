use std::sync::Arc;

use smallvec::SmallVec;

use super::{Error, ExtCellCreator, KeyValue, KeyValueReader};
use crate::cell::{
    Cell, CellBuilder, CellSerializationInfo, DynCell, HashBytes, LevelMask, MAX_REF_COUNT,
};

/// Result of a storage lookup.
#[derive(Debug, Clone)]
pub enum LoadResult {
    NotFound,
    Ok {
        refcount: i32,
        /// Loaded cell, only present when the data was requested.
        cell: Option<Cell>,
    },
}

impl LoadResult {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Reads cell records from the key-value backend.
#[derive(Clone)]
pub struct CellLoader {
    reader: Arc<dyn KeyValueReader + Send + Sync>,
}

impl CellLoader {
    pub fn new(reader: Arc<dyn KeyValueReader + Send + Sync>) -> Self {
        Self { reader }
    }

    /// Loads the record with the specified representation hash.
    ///
    /// Children of the loaded cell are produced by the `creator`.
    pub fn load(
        &self,
        hash: &HashBytes,
        need_data: bool,
        creator: &mut dyn ExtCellCreator,
    ) -> Result<LoadResult, Error> {
        let Some(value) = self.reader.get(hash.as_slice())? else {
            return Ok(LoadResult::NotFound);
        };

        let (refcount, body) = match value.split_first_chunk::<4>() {
            Some((refcount, body)) => (i32::from_le_bytes(*refcount), body),
            None => return Err(Error::InvalidRecord),
        };

        if !need_data {
            return Ok(LoadResult::Ok {
                refcount,
                cell: None,
            });
        }

        let cell = decode_cell(body, creator)?;
        if cell.repr_hash() != hash {
            return Err(Error::HashMismatch);
        }

        Ok(LoadResult::Ok {
            refcount,
            cell: Some(cell),
        })
    }
}

impl std::fmt::Debug for CellLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellLoader").finish_non_exhaustive()
    }
}

/// Writes cell records into the key-value backend.
#[derive(Clone, Copy)]
pub struct CellStorer<'a> {
    kv: &'a dyn KeyValue,
}

impl<'a> CellStorer<'a> {
    pub fn new(kv: &'a dyn KeyValue) -> Self {
        Self { kv }
    }

    /// Writes the record for the cell, replacing the previous one.
    pub fn set(&self, refcount: i32, cell: &DynCell) -> Result<(), Error> {
        let mut record = Vec::with_capacity(128);
        encode_record(refcount, cell, &mut record)?;

        tracing::trace!(hash = %cell.repr_hash(), refcount, "store cell");
        self.kv.set(cell.repr_hash().as_slice(), &record)
    }

    pub fn erase(&self, hash: &HashBytes) -> Result<(), Error> {
        tracing::trace!(%hash, "erase cell");
        self.kv.erase(hash.as_slice())
    }
}

/// Serializes the stored record for a loaded cell.
pub fn encode_record(refcount: i32, cell: &DynCell, target: &mut Vec<u8>) -> Result<(), Error> {
    if !cell.is_loaded() {
        return Err(Error::Cell(crate::error::Error::UnloadedCell));
    }

    target.extend_from_slice(&refcount.to_le_bytes());
    CellSerializationInfo::write_cell(cell, false, target);

    for child in cell.references() {
        let level_mask = child.level_mask();
        target.push(level_mask.to_byte());

        for level in level_mask.significant_levels() {
            target.extend_from_slice(child.hash(level).as_slice());
        }
        for level in level_mask.significant_levels() {
            target.extend_from_slice(&child.depth(level).to_be_bytes());
        }
    }

    Ok(())
}

fn decode_cell(body: &[u8], creator: &mut dyn ExtCellCreator) -> Result<Cell, Error> {
    let info = match CellSerializationInfo::parse(body, 0) {
        Ok(info) => info,
        Err(_) => return Err(Error::InvalidRecord),
    };
    let bit_len = info.bit_len(body).map_err(|_| Error::InvalidRecord)?;

    let mut offset = info.end_offset;
    let mut references = SmallVec::<[Cell; MAX_REF_COUNT]>::new();
    for _ in 0..info.descriptor.reference_count() {
        let Some(&mask) = body.get(offset) else {
            return Err(Error::InvalidRecord);
        };
        if mask > 0b111 {
            return Err(Error::InvalidRecord);
        }
        let level_mask = LevelMask::new(mask);
        offset += 1;

        let count = level_mask.hash_count() as usize;
        let Some(raw) = body.get(offset..offset + count * (32 + 2)) else {
            return Err(Error::InvalidRecord);
        };
        offset += raw.len();

        let (raw_hashes, raw_depths) = raw.split_at(count * 32);
        let hashes = raw_hashes
            .chunks_exact(32)
            .filter_map(HashBytes::try_from_slice)
            .collect::<SmallVec<[HashBytes; 4]>>();
        let depths = raw_depths
            .chunks_exact(2)
            .map(|depth| u16::from_be_bytes([depth[0], depth[1]]))
            .collect::<SmallVec<[u16; 4]>>();

        references.push(creator.ext_cell(level_mask, &hashes, &depths)?);
    }

    if offset != body.len() {
        return Err(Error::InvalidRecord);
    }

    let builder = CellBuilder::from_parts(
        info.descriptor.is_exotic(),
        info.data(body),
        bit_len,
        references,
    )?;
    Ok(builder.build()?)
}
