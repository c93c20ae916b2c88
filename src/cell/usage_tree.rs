use std::sync::{Arc, Mutex, OnceLock, Weak};

use super::cell_impl::VirtualCellWrapper;
use super::{Cell, CellDescriptor, CellImpl, DynCell, HashBytes, MAX_REF_COUNT};

/// Rule for including cells in the usage tree.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum UsageTreeMode {
    /// Include cell on load.
    #[default]
    OnLoad,
    /// Include cell only when accessing its data.
    OnDataAccess,
}

/// Records which cells of a tree were touched.
///
/// Tracked cells can be shared between threads, the visited set
/// lives behind a mutex.
#[derive(Clone)]
pub struct UsageTree {
    state: Arc<UsageTreeState>,
}

impl std::fmt::Debug for UsageTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTree")
            .field("mode", &self.state.mode)
            .field("len", &self.len())
            .finish()
    }
}

impl UsageTree {
    /// Creates a usage tree with the specified tracking mode.
    pub fn new(mode: UsageTreeMode) -> Self {
        Self {
            state: Arc::new(UsageTreeState {
                mode,
                visited: Default::default(),
            }),
        }
    }

    /// Wraps the specified cell in a usage cell to keep track
    /// of the data or links being accessed.
    pub fn track(&self, cell: &Cell) -> Cell {
        self.state.insert(cell, UsageTreeMode::OnLoad);
        Cell::from_impl(Arc::new(UsageCell::new(
            cell.clone(),
            Arc::downgrade(&self.state),
        )))
    }

    /// Returns `true` if the cell with the specified representation hash
    /// is present in this usage tree.
    pub fn contains(&self, repr_hash: &HashBytes) -> bool {
        let visited = self.state.lock();
        matches!(visited.get(repr_hash), Some(cell) if cell.include)
    }

    /// Returns the number of included cells.
    pub fn len(&self) -> usize {
        let visited = self.state.lock();
        visited.values().filter(|cell| cell.include).count()
    }

    /// Returns `true` if no cells were included yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type VisitedCells = ahash::HashMap<HashBytes, VisitedCell>;

struct UsageTreeState {
    mode: UsageTreeMode,
    visited: Mutex<VisitedCells>,
}

impl UsageTreeState {
    fn lock(&self) -> std::sync::MutexGuard<'_, VisitedCells> {
        // The map stays consistent even if some thread panicked while holding it
        match self.visited.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        }
    }

    fn insert(&self, cell: &Cell, ctx: UsageTreeMode) {
        let include = self.mode == ctx;
        let mut visited = self.lock();
        visited
            .entry(*cell.repr_hash())
            .and_modify(|visited| visited.include |= include)
            .or_insert_with(|| VisitedCell {
                include,
                _cell: cell.clone(),
            });
    }
}

struct VisitedCell {
    include: bool,
    _cell: Cell,
}

struct UsageCell {
    cell: Cell,
    usage_tree: Weak<UsageTreeState>,
    children: [OnceLock<Cell>; MAX_REF_COUNT],
}

impl UsageCell {
    fn new(cell: Cell, usage_tree: Weak<UsageTreeState>) -> Self {
        Self {
            cell,
            usage_tree,
            children: Default::default(),
        }
    }

    fn load_reference(&self, index: u8) -> Option<&Cell> {
        let slot = self.children.get(index as usize)?;
        if let Some(child) = slot.get() {
            return Some(child);
        }

        let child = self.cell.reference_cloned(index)?;
        if let Some(usage_tree) = self.usage_tree.upgrade() {
            usage_tree.insert(&child, UsageTreeMode::OnLoad);
        }

        Some(slot.get_or_init(|| {
            Cell::from_impl(Arc::new(UsageCell::new(child, self.usage_tree.clone())))
        }))
    }
}

impl CellImpl for UsageCell {
    fn descriptor(&self) -> CellDescriptor {
        self.cell.descriptor()
    }

    fn data(&self) -> &[u8] {
        if let Some(usage_tree) = self.usage_tree.upgrade() {
            usage_tree.insert(&self.cell, UsageTreeMode::OnDataAccess);
        }
        self.cell.data()
    }

    fn bit_len(&self) -> u16 {
        self.cell.bit_len()
    }

    fn reference(&self, index: u8) -> Option<&DynCell> {
        Some(self.load_reference(index)?.as_ref())
    }

    fn reference_cloned(&self, index: u8) -> Option<Cell> {
        self.load_reference(index).cloned()
    }

    fn virtualize(&self) -> &DynCell {
        if self.cell.level_mask().is_empty() {
            self
        } else {
            VirtualCellWrapper::wrap(self)
        }
    }

    fn hash(&self, level: u8) -> &HashBytes {
        self.cell.hash(level)
    }

    fn depth(&self, level: u8) -> u16 {
        self.cell.depth(level)
    }

    fn virtualization(&self) -> u8 {
        self.cell.virtualization()
    }

    fn is_loaded(&self) -> bool {
        self.cell.is_loaded()
    }
}
