use std::collections::hash_map;

use smallvec::SmallVec;

use super::storage::{CellLoader, CellStorer, LoadResult};
use super::{Error, ExtCell, ExtCellCreator};
use crate::cell::{Cell, CellSerializationInfo, HashBytes, LevelMask, MAX_REF_COUNT};

/// Changes of the storage size after the commit.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Stats {
    pub cells_total_count: i64,
    pub cells_total_size: i64,
}

/// Bag of cells with refcounted persistent storage.
///
/// Reference counter changes are collected with [`inc`] and [`dec`],
/// then propagated through the tree by [`prepare_commit`] and finally
/// written by [`commit`]. A stored cell which is referenced by a new
/// cell only gets its counter incremented, and a cell is removed with
/// all its unused children when its counter drops to zero.
///
/// [`inc`]: Self::inc
/// [`dec`]: Self::dec
/// [`prepare_commit`]: Self::prepare_commit
/// [`commit`]: Self::commit
#[derive(Default)]
pub struct DynamicBagOfCellsDb {
    loader: Option<CellLoader>,
    cells: CellsTable,
    visited: Vec<HashBytes>,
    to_inc: Vec<Cell>,
    to_dec: Vec<Cell>,
    prepared_inc: Vec<Cell>,
    prepared_dec: Vec<Cell>,
    stats_diff: Stats,
}

impl DynamicBagOfCellsDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the storage reader.
    ///
    /// Clears all cached cells and the stats diff. Prepared but not
    /// committed operations are queued again.
    pub fn set_loader(&mut self, loader: CellLoader) {
        self.reset_cache();
        self.requeue_prepared();
        self.loader = Some(loader);
        self.stats_diff = Stats::default();
    }

    /// Schedules a reference counter increment for the tree.
    pub fn inc(&mut self, cell: &Cell) {
        if cell.virtualization() == 0 {
            self.to_inc.push(cell.clone());
        }
    }

    /// Schedules a reference counter decrement for the tree.
    pub fn dec(&mut self, cell: &Cell) {
        if cell.virtualization() == 0 {
            self.to_dec.push(cell.clone());
        }
    }

    /// Returns `true` if there are no queued operations.
    pub fn is_prepared_for_commit(&self) -> bool {
        self.to_inc.is_empty() && self.to_dec.is_empty()
    }

    /// Returns the storage changes computed by the last [`prepare_commit`].
    ///
    /// [`prepare_commit`]: Self::prepare_commit
    pub fn get_stats_diff(&self) -> Result<Stats, Error> {
        if self.is_prepared_for_commit() {
            Ok(self.stats_diff)
        } else {
            Err(Error::NotPrepared)
        }
    }

    /// Loads a stored cell by its representation hash.
    ///
    /// Children of the loaded cell are [`ExtCell`] stand-ins unless
    /// they are already known to this bag.
    pub fn load_cell(&mut self, hash: &HashBytes) -> Result<Cell, Error> {
        if self.cells.0.contains_key(hash) {
            ok!(self.sync_with_db(hash));
            let info = ok!(self.cells.get_mut(hash));
            return if info.cell.is_loaded() {
                Ok(info.cell.clone())
            } else {
                Err(Error::CellNotFound)
            };
        }

        let Some(loader) = &self.loader else {
            return Err(Error::CellNotFound);
        };
        match ok!(loader.load(hash, true, &mut self.cells)) {
            LoadResult::Ok {
                refcount,
                cell: Some(cell),
            } => {
                self.cells.0.insert(*hash, CellInfo {
                    sync_with_db: true,
                    in_db: true,
                    db_refcnt: refcount,
                    ..CellInfo::new(cell.clone())
                });
                Ok(cell)
            }
            _ => Err(Error::CellNotFound),
        }
    }

    /// Propagates all queued operations through the cell trees and
    /// computes the stats diff.
    ///
    /// On error the cache is reset and the queued operations are kept.
    pub fn prepare_commit(&mut self) -> Result<(), Error> {
        if self.is_prepared_for_commit() {
            return Ok(());
        }

        let to_inc = std::mem::take(&mut self.to_inc);
        let to_dec = std::mem::take(&mut self.to_dec);

        if let Err(e) = self.prepare_commit_impl(&to_inc, &to_dec) {
            tracing::warn!(error = %e, "failed to prepare cells diff");
            self.reset_cache();
            self.to_inc = to_inc;
            self.to_dec = to_dec;
            self.requeue_prepared();
            return Err(e);
        }

        tracing::debug!(
            new_roots = to_inc.len(),
            old_roots = to_dec.len(),
            visited = self.visited.len(),
            count_diff = self.stats_diff.cells_total_count,
            size_diff = self.stats_diff.cells_total_size,
            "prepared cells diff"
        );

        self.prepared_inc.extend(to_inc);
        self.prepared_dec.extend(to_dec);
        Ok(())
    }

    /// Writes the prepared changes into the storage.
    ///
    /// The cache is reset afterwards. If the backend fails, all operations
    /// of this commit are queued again so that it can be retried. Records
    /// are written one by one, so a retry is only consistent when the backend
    /// discards the partially applied batch on error.
    pub fn commit(&mut self, storer: &CellStorer<'_>) -> Result<(), Error> {
        ok!(self.prepare_commit());

        let res = self.save_diff(storer);
        self.reset_cache();

        match res {
            Ok((stored, erased)) => {
                self.prepared_inc.clear();
                self.prepared_dec.clear();
                tracing::debug!(stored, erased, "committed cells diff");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to write cells diff");
                self.requeue_prepared();
                Err(e)
            }
        }
    }

    fn prepare_commit_impl(&mut self, to_inc: &[Cell], to_dec: &[Cell]) -> Result<(), Error> {
        // Find out which of the new cells are already stored
        let mut stack = Vec::<InDbFrame>::new();
        for cell in to_inc {
            if ok!(self.enter_new_in_db(cell, &mut stack)).is_some() {
                continue;
            }

            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };

                if let Some(child) = frame.children.next() {
                    if let Some(in_db) = ok!(self.enter_new_in_db(&child, &mut stack)) {
                        if let Some(frame) = stack.last_mut() {
                            frame.not_in_db |= !in_db;
                        }
                    }
                    continue;
                }

                let Some(frame) = stack.pop() else {
                    break;
                };
                let in_db = ok!(self.leave_new_in_db(frame));
                if let Some(parent) = stack.last_mut() {
                    parent.not_in_db |= !in_db;
                }
            }
        }

        // Increment new cells and their new children
        let mut stack = Vec::<ChildrenIter>::new();
        for cell in to_inc {
            if let Some(children) = ok!(self.enter_new(cell)) {
                stack.push(children.into_iter());
            }

            'outer: loop {
                let Some(iter) = stack.last_mut() else {
                    break;
                };

                for child in iter {
                    if let Some(children) = ok!(self.enter_new(&child)) {
                        stack.push(children.into_iter());
                        continue 'outer;
                    }
                }

                stack.pop();
            }
        }

        // Decrement old cells and the children of removed ones
        for cell in to_dec {
            if let Some(children) = ok!(self.enter_old(cell)) {
                stack.push(children.into_iter());
            }

            'outer: loop {
                let Some(iter) = stack.last_mut() else {
                    break;
                };

                for child in iter {
                    if let Some(children) = ok!(self.enter_old(&child)) {
                        stack.push(children.into_iter());
                        continue 'outer;
                    }
                }

                stack.pop();
            }
        }

        self.save_diff_prepare()
    }

    fn enter_new_in_db(
        &mut self,
        cell: &Cell,
        stack: &mut Vec<InDbFrame>,
    ) -> Result<Option<bool>, Error> {
        let key = self.cells.insert(cell);
        let info = ok!(self.cells.get_mut(&key));
        if info.sync_with_db {
            return Ok(Some(info.in_db));
        }
        if info.in_db {
            return Ok(Some(true));
        }

        // Unknown children of an unloaded cell are not checked
        let children = if info.cell.is_loaded() {
            info.cell.references().cloned().collect()
        } else {
            SmallVec::new()
        };

        stack.push(InDbFrame {
            key,
            children: children.into_iter(),
            not_in_db: false,
        });
        Ok(None)
    }

    fn leave_new_in_db(&mut self, frame: InDbFrame) -> Result<bool, Error> {
        if frame.not_in_db {
            // Parent of a new cell can't be stored
            let info = ok!(self.cells.get_mut(&frame.key));
            info.sync_with_db = true;
            return Ok(false);
        }
        self.is_in_db(&frame.key)
    }

    fn enter_new(&mut self, cell: &Cell) -> Result<Option<Children>, Error> {
        let key = self.cells.insert(cell);
        let info = ok!(self.cells.get_mut(&key));
        info.refcnt_diff += 1;
        if !info.was {
            info.was = true;
            self.visited.push(key);
        }

        if info.was_dfs_new_cells {
            return Ok(None);
        }
        info.was_dfs_new_cells = true;

        if ok!(self.is_in_db(&key)) {
            return Ok(None);
        }
        self.children(&key).map(Some)
    }

    fn enter_old(&mut self, cell: &Cell) -> Result<Option<Children>, Error> {
        let key = self.cells.insert(cell);
        let info = ok!(self.cells.get_mut(&key));
        info.refcnt_diff -= 1;
        if !info.was {
            info.was = true;
            self.visited.push(key);
        }

        ok!(self.sync_with_db(&key));

        let info = ok!(self.cells.get_mut(&key));
        let in_db = info.in_db;
        match info.db_refcnt + info.refcnt_diff {
            0 => self.children(&key).map(Some),
            refcount if refcount > 0 => Ok(None),
            _ if in_db => Err(Error::RefcountUnderflow),
            _ => Err(Error::CellNotFound),
        }
    }

    fn save_diff_prepare(&mut self) -> Result<(), Error> {
        self.stats_diff = Stats::default();

        for i in 0..self.visited.len() {
            let key = self.visited[i];
            if ok!(self.cells.get_mut(&key)).refcnt_diff == 0 {
                continue;
            }
            ok!(self.sync_with_db(&key));

            let info = ok!(self.cells.get_mut(&key));
            if !info.cell.is_loaded() {
                return Err(Error::CellNotFound);
            }
            let size = CellSerializationInfo::serialized_size(info.cell.as_ref(), true) as i64;

            if info.db_refcnt + info.refcnt_diff == 0 {
                self.stats_diff.cells_total_count -= 1;
                self.stats_diff.cells_total_size -= size;
            } else if !info.in_db {
                self.stats_diff.cells_total_count += 1;
                self.stats_diff.cells_total_size += size;
            }
        }

        Ok(())
    }

    fn save_diff(&mut self, storer: &CellStorer<'_>) -> Result<(usize, usize), Error> {
        let mut stored = 0;
        let mut erased = 0;

        for key in std::mem::take(&mut self.visited) {
            let info = ok!(self.cells.get_mut(&key));
            info.was = false;
            info.was_dfs_new_cells = false;

            if info.refcnt_diff == 0 {
                continue;
            }

            info.db_refcnt += info.refcnt_diff;
            info.refcnt_diff = 0;

            if info.db_refcnt == 0 {
                ok!(storer.erase(&key));
                info.in_db = false;
                erased += 1;
            } else {
                ok!(storer.set(info.db_refcnt, info.cell.as_ref()));
                info.in_db = true;
                stored += 1;
            }
        }

        Ok((stored, erased))
    }

    fn is_in_db(&mut self, key: &HashBytes) -> Result<bool, Error> {
        if ok!(self.cells.get_mut(key)).in_db {
            return Ok(true);
        }
        ok!(self.sync_with_db(key));
        Ok(ok!(self.cells.get_mut(key)).in_db)
    }

    /// Loads the stored refcount and the cell contents once.
    fn sync_with_db(&mut self, key: &HashBytes) -> Result<(), Error> {
        if ok!(self.cells.get_mut(key)).sync_with_db {
            return Ok(());
        }

        let loaded = match &self.loader {
            Some(loader) => ok!(loader.load(key, true, &mut self.cells)),
            None => LoadResult::NotFound,
        };

        let info = ok!(self.cells.get_mut(key));
        if let LoadResult::Ok {
            refcount,
            cell: Some(cell),
        } = loaded
        {
            info.cell = cell;
            info.in_db = true;
            info.db_refcnt = refcount;
        }
        info.sync_with_db = true;
        Ok(())
    }

    fn children(&mut self, key: &HashBytes) -> Result<Children, Error> {
        if !ok!(self.cells.get_mut(key)).cell.is_loaded() {
            ok!(self.sync_with_db(key));
        }

        let info = ok!(self.cells.get_mut(key));
        if !info.cell.is_loaded() {
            return Err(Error::CellNotFound);
        }
        Ok(info.cell.references().cloned().collect())
    }

    fn reset_cache(&mut self) {
        self.cells.0.clear();
        self.visited.clear();
    }

    fn requeue_prepared(&mut self) {
        let mut to_inc = std::mem::take(&mut self.prepared_inc);
        to_inc.append(&mut self.to_inc);
        self.to_inc = to_inc;

        let mut to_dec = std::mem::take(&mut self.prepared_dec);
        to_dec.append(&mut self.to_dec);
        self.to_dec = to_dec;
    }
}

impl std::fmt::Debug for DynamicBagOfCellsDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicBagOfCellsDb")
            .field("cached", &self.cells.0.len())
            .field("to_inc", &self.to_inc.len())
            .field("to_dec", &self.to_dec.len())
            .field("prepared_inc", &self.prepared_inc.len())
            .field("prepared_dec", &self.prepared_dec.len())
            .field("stats_diff", &self.stats_diff)
            .finish()
    }
}

type Children = SmallVec<[Cell; MAX_REF_COUNT]>;
type ChildrenIter = smallvec::IntoIter<[Cell; MAX_REF_COUNT]>;

struct InDbFrame {
    key: HashBytes,
    children: ChildrenIter,
    not_in_db: bool,
}

struct CellInfo {
    cell: Cell,
    sync_with_db: bool,
    in_db: bool,
    was_dfs_new_cells: bool,
    was: bool,
    db_refcnt: i32,
    refcnt_diff: i32,
}

impl CellInfo {
    fn new(cell: Cell) -> Self {
        Self {
            cell,
            sync_with_db: false,
            in_db: false,
            was_dfs_new_cells: false,
            was: false,
            db_refcnt: 0,
            refcnt_diff: 0,
        }
    }
}

#[derive(Default)]
struct CellsTable(ahash::HashMap<HashBytes, CellInfo>);

impl CellsTable {
    fn insert(&mut self, cell: &Cell) -> HashBytes {
        let key = *cell.repr_hash();
        match self.0.entry(key) {
            hash_map::Entry::Occupied(mut entry) => {
                let info = entry.get_mut();
                if !info.sync_with_db && (cell.is_loaded() || !info.cell.is_loaded()) {
                    info.cell = cell.clone();
                }
            }
            hash_map::Entry::Vacant(entry) => {
                entry.insert(CellInfo::new(cell.clone()));
            }
        }
        key
    }

    fn get_mut(&mut self, key: &HashBytes) -> Result<&mut CellInfo, Error> {
        self.0.get_mut(key).ok_or(Error::CellNotFound)
    }
}

impl ExtCellCreator for CellsTable {
    fn ext_cell(
        &mut self,
        level_mask: LevelMask,
        hashes: &[HashBytes],
        depths: &[u16],
    ) -> Result<Cell, Error> {
        let Some(key) = hashes.last() else {
            return Err(Error::InvalidRecord);
        };

        match self.0.entry(*key) {
            hash_map::Entry::Occupied(entry) => {
                let info = entry.get();
                if info.cell.level_mask() != level_mask {
                    tracing::warn!(hash = %key, "stored child level mask mismatch");
                    return Err(Error::InvalidRecord);
                }
                Ok(info.cell.clone())
            }
            hash_map::Entry::Vacant(entry) => {
                let cell = Cell::from_impl(std::sync::Arc::new(ExtCell::new(
                    level_mask, hashes, depths,
                )?));
                entry.insert(CellInfo {
                    in_db: true,
                    ..CellInfo::new(cell.clone())
                });
                Ok(cell)
            }
        }
    }
}
