use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::{Rng, SeedableRng};

use super::*;
use crate::cell::{Cell, CellBuilder, EmptyCellContext, HashBytes, UsageTree};
use crate::merkle::{make_pruned_branch, MerkleProof};

fn leaf(value: u32) -> Cell {
    let mut builder = CellBuilder::new();
    builder.store_u32(value).unwrap();
    builder.build().unwrap()
}

fn node(value: u32, children: &[Cell]) -> Cell {
    let mut builder = CellBuilder::new();
    builder.store_u32(value).unwrap();
    for child in children {
        builder.store_reference(child.clone()).unwrap();
    }
    builder.build().unwrap()
}

fn make_tree(value: u32) -> Cell {
    let shared = node(value + 1, &[leaf(value + 2), leaf(value + 3)]);
    node(value, &[shared.clone(), node(value + 4, &[shared])])
}

struct Storage {
    kv: Arc<MemoryKeyValue>,
    db: DynamicBagOfCellsDb,
}

impl Storage {
    fn new() -> Self {
        let kv = Arc::new(MemoryKeyValue::new());
        let mut db = DynamicBagOfCellsDb::new();
        db.set_loader(CellLoader::new(kv.clone()));
        Self { kv, db }
    }

    fn commit(&mut self) -> Result<(), Error> {
        let storer = CellStorer::new(self.kv.as_ref());
        self.db.commit(&storer)?;
        self.db.set_loader(CellLoader::new(self.kv.clone()));
        Ok(())
    }

    fn refcount(&self, hash: &HashBytes) -> Option<i32> {
        let loader = CellLoader::new(self.kv.clone());
        match loader.load(hash, false, &mut DefaultExtCellCreator).unwrap() {
            LoadResult::Ok { refcount, .. } => Some(refcount),
            LoadResult::NotFound => None,
        }
    }
}

#[test]
fn store_and_load() -> anyhow::Result<()> {
    let mut storage = Storage::new();
    let root = make_tree(100);
    let unique = root.compute_unique_stats(usize::MAX).unwrap();

    storage.db.inc(&root);
    assert!(matches!(storage.db.get_stats_diff(), Err(Error::NotPrepared)));

    storage.db.prepare_commit()?;
    let stats = storage.db.get_stats_diff()?;
    assert_eq!(stats.cells_total_count, unique.cell_count as i64);
    assert!(stats.cells_total_size > 0);

    storage.commit()?;
    assert_eq!(storage.kv.len() as u64, unique.cell_count);

    // Shared subtree is referenced twice
    let shared = root.reference_cloned(0).unwrap();
    assert_eq!(storage.refcount(root.repr_hash()), Some(1));
    assert_eq!(storage.refcount(shared.repr_hash()), Some(2));
    assert_eq!(storage.refcount(shared.reference(0).unwrap().repr_hash()), Some(1));

    let loaded = storage.db.load_cell(root.repr_hash())?;
    assert_eq!(loaded.as_ref(), root.as_ref());
    assert_eq!(loaded.data(), root.data());
    for child in loaded.references() {
        assert!(!child.is_loaded());
        assert!(matches!(
            child.as_slice(),
            Err(crate::error::Error::UnloadedCell)
        ));
    }

    // Children are resolved through the same bag
    let child = storage.db.load_cell(loaded.reference(1).unwrap().repr_hash())?;
    assert!(child.is_loaded());
    assert_eq!(child.repr_hash(), root.reference(1).unwrap().repr_hash());

    assert!(matches!(
        storage.db.load_cell(&HashBytes([0xaa; 32])),
        Err(Error::CellNotFound)
    ));
    Ok(())
}

#[test]
fn stored_cells_are_not_traversed() -> anyhow::Result<()> {
    let mut storage = Storage::new();

    let old = make_tree(100);
    storage.db.inc(&old);
    storage.commit()?;
    let stored = storage.kv.len();

    // New root over the stored tree
    let loaded = storage.db.load_cell(old.repr_hash())?;
    let new_root = node(2, &[loaded, leaf(3)]);

    storage.db.inc(&new_root);
    storage.db.prepare_commit()?;
    assert_eq!(storage.db.get_stats_diff()?.cells_total_count, 2);
    storage.commit()?;

    assert_eq!(storage.kv.len(), stored + 2);
    assert_eq!(storage.refcount(old.repr_hash()), Some(2));
    let shared = old.reference(0).unwrap();
    assert_eq!(storage.refcount(shared.repr_hash()), Some(2));

    // Removing the old root keeps the tree alive
    storage.db.dec(&old);
    storage.commit()?;
    assert_eq!(storage.refcount(old.repr_hash()), Some(1));
    assert_eq!(storage.kv.len(), stored + 2);

    // Removing the new root removes everything
    storage.db.dec(&new_root);
    storage.db.prepare_commit()?;
    let stats = storage.db.get_stats_diff()?;
    assert_eq!(stats.cells_total_count, -(stored as i64 + 2));
    storage.commit()?;
    assert!(storage.kv.is_empty());
    Ok(())
}

#[test]
fn same_batch_changes() -> anyhow::Result<()> {
    let mut storage = Storage::new();
    let root = make_tree(10);

    storage.db.inc(&root);
    storage.db.inc(&root);
    storage.db.dec(&root);
    storage.commit()?;
    assert_eq!(storage.refcount(root.repr_hash()), Some(1));

    // No changes at all
    storage.db.inc(&root);
    storage.db.dec(&root);
    storage.db.prepare_commit()?;
    assert_eq!(storage.db.get_stats_diff()?, Stats::default());
    let snapshot = storage.kv.snapshot();
    storage.commit()?;
    assert_eq!(storage.kv.snapshot(), snapshot);

    storage.db.dec(&root);
    storage.commit()?;
    assert!(storage.kv.is_empty());
    Ok(())
}

#[test]
fn refcount_errors() -> anyhow::Result<()> {
    let mut storage = Storage::new();

    // Unknown cell
    storage.db.dec(&leaf(1));
    assert!(matches!(storage.db.prepare_commit(), Err(Error::CellNotFound)));
    assert!(!storage.db.is_prepared_for_commit());
    assert!(matches!(storage.db.get_stats_diff(), Err(Error::NotPrepared)));
    assert!(storage.commit().is_err());
    assert!(storage.kv.is_empty());

    // Too many decrements
    let mut storage = Storage::new();
    let root = make_tree(10);
    storage.db.inc(&root);
    storage.commit()?;

    storage.db.dec(&root);
    storage.db.dec(&root);
    assert!(matches!(
        storage.db.prepare_commit(),
        Err(Error::RefcountUnderflow)
    ));

    // Nothing was written
    assert_eq!(storage.refcount(root.repr_hash()), Some(1));
    Ok(())
}

struct FailingKeyValue {
    inner: MemoryKeyValue,
    fail_writes: AtomicBool,
}

impl FailingKeyValue {
    fn check(&self) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::Relaxed) {
            Err(Error::Backend("write failed".into()))
        } else {
            Ok(())
        }
    }
}

impl KeyValueReader for FailingKeyValue {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.inner.get(key)
    }
}

impl KeyValue for FailingKeyValue {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.check()?;
        self.inner.set(key, value)
    }

    fn erase(&self, key: &[u8]) -> Result<(), Error> {
        self.check()?;
        self.inner.erase(key)
    }
}

#[test]
fn failed_commit_can_be_retried() -> anyhow::Result<()> {
    let kv = Arc::new(FailingKeyValue {
        inner: MemoryKeyValue::new(),
        fail_writes: AtomicBool::new(true),
    });
    let mut db = DynamicBagOfCellsDb::new();
    db.set_loader(CellLoader::new(kv.clone()));

    let root = make_tree(10);
    let unique = root.compute_unique_stats(usize::MAX).unwrap();

    // Prepared separately from the commit
    db.inc(&root);
    db.prepare_commit()?;
    assert!(db.is_prepared_for_commit());

    assert!(matches!(
        db.commit(&CellStorer::new(kv.as_ref())),
        Err(Error::Backend(_))
    ));
    assert!(kv.inner.is_empty());
    assert!(!db.is_prepared_for_commit());

    kv.fail_writes.store(false, Ordering::Relaxed);
    db.commit(&CellStorer::new(kv.as_ref()))?;
    assert!(db.is_prepared_for_commit());
    assert_eq!(kv.inner.len() as u64, unique.cell_count);

    // Removal is retried too
    db.set_loader(CellLoader::new(kv.clone()));
    db.dec(&root);
    kv.fail_writes.store(true, Ordering::Relaxed);
    assert!(db.commit(&CellStorer::new(kv.as_ref())).is_err());
    assert_eq!(kv.inner.len() as u64, unique.cell_count);

    kv.fail_writes.store(false, Ordering::Relaxed);
    db.commit(&CellStorer::new(kv.as_ref()))?;
    assert!(kv.inner.is_empty());
    Ok(())
}

#[test]
fn virtualized_cells_are_ignored() -> anyhow::Result<()> {
    let root = make_tree(10);
    let usage_tree = UsageTree::new(crate::cell::UsageTreeMode::OnLoad);
    let tracked = usage_tree.track(&root);
    tracked.reference(0).unwrap();

    let proof = MerkleProof::create(root.as_ref(), usage_tree).build()?;
    let virtual_root = MerkleProof::virtualize(proof.to_cell()?.as_ref())?;
    assert_eq!(virtual_root.virtualization(), 1);

    let mut storage = Storage::new();
    storage.db.inc(&virtual_root);
    assert!(storage.db.is_prepared_for_commit());
    storage.commit()?;
    assert!(storage.kv.is_empty());
    Ok(())
}

#[test]
fn record_with_ext_children() -> anyhow::Result<()> {
    let mut storage = Storage::new();

    // Level 1 child
    let pruned = make_pruned_branch(make_tree(10).as_ref(), 0, &mut EmptyCellContext)?;
    let root = node(1, &[pruned.clone(), leaf(2)]);
    assert_eq!(root.level(), 1);

    storage.db.inc(&root);
    storage.commit()?;
    let record = storage.kv.snapshot()[root.repr_hash().as_slice()].clone();

    let loaded = storage.db.load_cell(root.repr_hash())?;
    assert_eq!(loaded.level_mask(), root.level_mask());
    assert_eq!(loaded.hash(0), root.hash(0));
    assert_eq!(loaded.repr_hash(), root.repr_hash());

    let ext = loaded.reference(0).unwrap();
    assert!(!ext.is_loaded());
    assert_eq!(ext.level_mask(), pruned.level_mask());
    assert_eq!(ext.hash(0), pruned.hash(0));
    assert_eq!(ext.depth(0), pruned.depth(0));
    assert_eq!(ext.repr_hash(), pruned.repr_hash());

    // Same record from the stand-ins
    let other = MemoryKeyValue::new();
    CellStorer::new(&other).set(1, loaded.as_ref())?;
    assert_eq!(other.get(root.repr_hash().as_slice())?, Some(record));

    // Stand-ins can't be stored themselves
    assert!(matches!(
        CellStorer::new(&other).set(1, ext),
        Err(Error::Cell(crate::error::Error::UnloadedCell))
    ));
    Ok(())
}

#[test]
fn random_refcount_conservation() -> anyhow::Result<()> {
    let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(123);

    // Random DAG with a lot of shared cells
    let mut pool = Vec::<Cell>::new();
    for i in 0..64u32 {
        let child_count = if pool.len() < 4 { 0 } else { rng.gen_range(0..=4) };
        let mut children = Vec::new();
        for _ in 0..child_count {
            let index = rng.gen_range(0..pool.len());
            children.push(pool[index].clone());
        }
        pool.push(node(i % 16, &children));
    }

    let mut storage = Storage::new();
    let mut roots = vec![0u32; pool.len()];

    for step in 0..300 {
        let index = rng.gen_range(0..pool.len());
        if roots[index] > 0 && rng.gen_bool(0.5) {
            storage.db.dec(&pool[index]);
            roots[index] -= 1;
        } else {
            storage.db.inc(&pool[index]);
            roots[index] += 1;
        }

        if step % 17 == 0 {
            storage.commit()?;

            for (cell, count) in pool.iter().zip(&roots) {
                if *count > 0 {
                    let refcount = storage.refcount(cell.repr_hash()).unwrap();
                    assert!(refcount >= *count as i32);
                    let loaded = storage.db.load_cell(cell.repr_hash())?;
                    assert_eq!(loaded.repr_hash(), cell.repr_hash());
                }
            }
        }
    }

    for (cell, count) in pool.iter().zip(&roots) {
        for _ in 0..*count {
            storage.db.dec(cell);
        }
    }
    storage.commit()?;
    assert!(storage.kv.is_empty());
    Ok(())
}
