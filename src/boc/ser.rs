use super::{BocMode, BocTag, DEFAULT_MAX_ROOTS};
use crate::cell::{CellSerializationInfo, DynCell, HashBytes, MAX_DEPTH, MAX_REF_COUNT};
use crate::util::{number_of_bytes_to_fit, write_be_uint};

/// Max total weight of a cell subtree which is serialized without stored hashes.
const MAX_CELL_WHS: u32 = 64;

/// BOC serializer.
///
/// Produces the same byte stream as the reference node implementation:
/// cells are deduplicated by their representation hash and sorted
/// so that every reference points forward.
pub struct BocSerializer<'a> {
    roots: Vec<RootInfo>,
    root_cells: Vec<&'a DynCell>,
    cells: Vec<CellInfo<'a>>,
    rev_indices: ahash::HashMap<&'a HashBytes, u32>,
    /// Cell indices in the allocation order.
    order: Vec<u32>,
    int_refs: u64,
    imported: bool,
}

impl Default for BocSerializer<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> BocSerializer<'a> {
    /// Creates an empty serializer.
    pub fn new() -> Self {
        Self {
            roots: Vec::new(),
            root_cells: Vec::new(),
            cells: Vec::new(),
            rev_indices: Default::default(),
            order: Vec::new(),
            int_refs: 0,
            imported: false,
        }
    }

    /// Adds a new root. Previously imported cells are discarded.
    pub fn add_root(&mut self, root: &'a DynCell) {
        self.root_cells.push(root);
        self.imported = false;
    }

    /// Number of added roots.
    #[inline]
    pub fn root_count(&self) -> usize {
        self.root_cells.len()
    }

    /// Number of unique imported cells.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Collects all unique cells, computes their weights and the final order.
    pub fn import_cells(&mut self) -> Result<(), Error> {
        if self.imported {
            return Ok(());
        }

        self.roots.clear();
        self.cells.clear();
        self.rev_indices.clear();
        self.order.clear();
        self.int_refs = 0;

        if self.root_cells.len() > DEFAULT_MAX_ROOTS {
            return Err(Error::TooManyRoots);
        }

        for i in 0..self.root_cells.len() {
            let root = self.root_cells[i];
            let index = ok!(self.import_cell(root));
            self.roots.push(RootInfo { index });
        }

        if self.cells.len() > u32::MAX as usize {
            return Err(Error::TooManyCells);
        }

        self.reorder_cells();
        self.imported = true;
        Ok(())
    }

    /// Computes sizes of the serialized parts for the specified mode.
    pub fn compute_sizes(&mut self, mode: BocMode) -> Result<BocSizes, Error> {
        if mode.contains(BocMode::WITH_CACHE_BITS) && !mode.contains(BocMode::WITH_INDEX) {
            return Err(Error::InvalidMode);
        }
        ok!(self.import_cells());

        let cell_count = self.cells.len() as u64;
        let ref_size = std::cmp::max(1, number_of_bytes_to_fit(cell_count)) as usize;

        let mut data_size = self.int_refs * ref_size as u64;
        for cell in &self.cells {
            data_size +=
                CellSerializationInfo::serialized_size(cell.cell, cell.with_hashes(mode)) as u64;
        }

        let max_offset = if mode.contains(BocMode::WITH_CACHE_BITS) {
            data_size * 2
        } else {
            data_size
        };
        let offset_size = std::cmp::max(1, number_of_bytes_to_fit(max_offset)) as usize;

        if ref_size > 4 || offset_size > 8 {
            return Err(Error::TooManyCells);
        }

        let index_size = if mode.contains(BocMode::WITH_INDEX) {
            cell_count * offset_size as u64
        } else {
            0
        };
        let crc_size = if mode.contains(BocMode::WITH_CRC32C) { 4 } else { 0 };
        let header_size = 4 + 2 + 3 * ref_size as u64 + offset_size as u64;
        let total_size = header_size
            + self.roots.len() as u64 * ref_size as u64
            + index_size
            + data_size
            + crc_size;

        Ok(BocSizes {
            ref_size,
            offset_size,
            data_size,
            total_size,
        })
    }

    /// Serializes all roots into a new buffer.
    ///
    /// Returns an empty buffer if there are no roots.
    pub fn serialize(&mut self, mode: BocMode) -> Result<Vec<u8>, Error> {
        let mut target = Vec::new();
        ok!(self.serialize_to(mode, &mut target));
        Ok(target)
    }

    /// Appends serialized roots to the buffer.
    pub fn serialize_to(&mut self, mode: BocMode, target: &mut Vec<u8>) -> Result<(), Error> {
        if self.root_cells.is_empty() {
            return Ok(());
        }

        let sizes = ok!(self.compute_sizes(mode));
        let BocSizes {
            ref_size,
            offset_size,
            data_size,
            total_size,
        } = sizes;

        tracing::debug!(
            cell_count = self.cells.len(),
            root_count = self.roots.len(),
            ref_size,
            offset_size,
            data_size,
            total_size,
            ?mode,
            "serializing bag of cells"
        );

        let has_index = mode.contains(BocMode::WITH_INDEX);
        let has_crc = mode.contains(BocMode::WITH_CRC32C);
        let has_cache_bits = mode.contains(BocMode::WITH_CACHE_BITS);

        let start = target.len();
        target.reserve(total_size as usize);

        let cell_count = self.cells.len() as u64;
        let position = |index: u32| cell_count - 1 - self.cells[index as usize].new_index as u64;

        // Header
        let flags = ((has_index as u8) << 7)
            | ((has_crc as u8) << 6)
            | ((has_cache_bits as u8) << 5)
            | ref_size as u8;
        target.extend_from_slice(&BocTag::Generic.to_bytes());
        target.extend_from_slice(&[flags, offset_size as u8]);
        write_be_uint(target, cell_count, ref_size);
        write_be_uint(target, self.roots.len() as u64, ref_size);
        write_be_uint(target, 0, ref_size);
        write_be_uint(target, data_size, offset_size);

        for root in &self.roots {
            write_be_uint(target, position(root.index), ref_size);
        }

        // Index
        if has_index {
            let mut offset = 0u64;
            for &index in self.order.iter().rev() {
                let cell = &self.cells[index as usize];
                offset += cell.serialized_size(mode, ref_size);

                let entry = if has_cache_bits {
                    offset * 2 + cell.should_cache as u64
                } else {
                    offset
                };
                write_be_uint(target, entry, offset_size);
            }
        }

        // Cells
        for &index in self.order.iter().rev() {
            let cell = &self.cells[index as usize];
            CellSerializationInfo::write_cell(cell.cell, cell.with_hashes(mode), target);
            for &child in &cell.refs[..cell.ref_count as usize] {
                write_be_uint(target, position(child), ref_size);
            }
        }

        if has_crc {
            let crc = crc32c::crc32c(&target[start..]);
            target.extend_from_slice(&crc.to_le_bytes());
        }

        debug_assert_eq!((target.len() - start) as u64, total_size);
        Ok(())
    }

    /// Imports the cell subtree, returns its index.
    fn import_cell(&mut self, root: &'a DynCell) -> Result<u32, Error> {
        if let Some(index) = self.find_cell(root) {
            return Ok(index);
        }

        let mut stack = Vec::new();
        stack.push(ok!(ImportFrame::new(root)));

        while let Some(frame) = stack.last_mut() {
            if frame.next_child < frame.cell.reference_count() {
                let Some(child) = frame.cell.reference(frame.next_child) else {
                    return Err(Error::UnloadedCell);
                };
                frame.next_child += 1;
                self.int_refs += 1;

                if let Some(index) = self.find_cell(child) {
                    let weight = self.cells[index as usize].weight;
                    frame.push_child(index, weight);
                    continue;
                }

                if stack.len() > MAX_DEPTH as usize {
                    return Err(Error::DepthOverflow);
                }
                stack.push(ok!(ImportFrame::new(child)));
                continue;
            }

            // All children are imported
            let Some(frame) = stack.pop() else {
                break;
            };

            let index = self.cells.len() as u32;
            let weight = std::cmp::min(frame.weight, u8::MAX as u32) as u8;
            self.rev_indices.insert(frame.cell.repr_hash(), index);
            self.cells.push(CellInfo {
                cell: frame.cell,
                refs: frame.refs,
                ref_count: frame.ref_count,
                weight,
                is_special: frame.cell.is_exotic(),
                should_cache: false,
                is_root: false,
                state: VisitState::Unvisited,
                new_index: 0,
            });

            match stack.last_mut() {
                Some(parent) => parent.push_child(index, weight),
                None => return Ok(index),
            }
        }

        // The root frame always returns from the loop
        Err(Error::DepthOverflow)
    }

    fn find_cell(&mut self, cell: &DynCell) -> Option<u32> {
        let index = *self.rev_indices.get(cell.repr_hash())?;
        self.cells[index as usize].should_cache = true;
        Some(index)
    }

    fn reorder_cells(&mut self) {
        // Limit children weights so that each cell has at most
        // `MAX_CELL_WHS` weight units in total
        for i in (0..self.cells.len()).rev() {
            let cell = &self.cells[i];
            let refs = cell.refs;
            let s = cell.ref_count as u32;

            let mut c = s;
            let mut sum = MAX_CELL_WHS - 1;
            let mut mask = 0u8;
            for j in 0..s {
                let child = &self.cells[refs[j as usize] as usize];
                let limit = (MAX_CELL_WHS - 1 + j) / s;
                if child.weight as u32 <= limit {
                    sum -= child.weight as u32;
                    c -= 1;
                    mask |= 1 << j;
                }
            }

            if c > 0 {
                for j in 0..s {
                    if mask & (1 << j) == 0 {
                        let child = &mut self.cells[refs[j as usize] as usize];
                        let limit = sum / c;
                        sum += 1;
                        if child.weight as u32 > limit {
                            child.weight = limit as u8;
                        }
                    }
                }
            }
        }

        // Cells with too heavy subtrees get zero weight and
        // are serialized with hashes in `WITH_INT_HASHES` mode
        for i in 0..self.cells.len() {
            let cell = &self.cells[i];
            let mut sum = 1u32;
            for &child in &cell.refs[..cell.ref_count as usize] {
                sum += self.cells[child as usize].weight as u32;
            }

            let cell = &mut self.cells[i];
            if sum <= cell.weight as u32 {
                cell.weight = sum as u8;
            } else {
                cell.weight = 0;
            }
        }

        for root in &self.roots {
            self.cells[root.index as usize].is_root = true;
        }

        let mut stack = Vec::new();
        for i in 0..self.roots.len() {
            let root = self.roots[i].index;
            self.revisit(&mut stack, VisitTask::Previsit(root));
            self.revisit(&mut stack, VisitTask::Visit(root));
        }
        for i in 0..self.roots.len() {
            let root = self.roots[i].index;
            self.revisit(&mut stack, VisitTask::Allocate(root));
        }

        debug_assert_eq!(self.order.len(), self.cells.len());
    }

    /// Runs the task to completion using the explicit stack.
    ///
    /// Previsit walks down until special cells are found and visits them,
    /// visit processes all children and allocate assigns the final index.
    fn revisit(&mut self, stack: &mut Vec<VisitTask>, task: VisitTask) {
        stack.push(task);
        while let Some(task) = stack.pop() {
            match task {
                VisitTask::Previsit(index) => {
                    let cell = &self.cells[index as usize];
                    if cell.state != VisitState::Unvisited {
                        continue;
                    }

                    stack.push(VisitTask::MarkPrevisited(index));
                    for &child in &cell.refs[..cell.ref_count as usize] {
                        stack.push(if self.cells[child as usize].is_special {
                            VisitTask::Visit(child)
                        } else {
                            VisitTask::Previsit(child)
                        });
                    }
                }
                VisitTask::Visit(index) => {
                    let cell = &self.cells[index as usize];
                    if matches!(cell.state, VisitState::Visited | VisitState::Allocated) {
                        continue;
                    }

                    let refs = &cell.refs[..cell.ref_count as usize];
                    stack.push(VisitTask::MarkVisited(index));
                    stack.extend(refs.iter().map(|child| VisitTask::Allocate(*child)));
                    stack.extend(refs.iter().map(|child| VisitTask::Visit(*child)));
                    if cell.is_special {
                        stack.push(VisitTask::Previsit(index));
                    }
                }
                VisitTask::Allocate(index) => {
                    let new_index = self.order.len() as u32;
                    let cell = &mut self.cells[index as usize];
                    if cell.state != VisitState::Allocated {
                        cell.state = VisitState::Allocated;
                        cell.new_index = new_index;
                        self.order.push(index);
                    }
                }
                VisitTask::MarkPrevisited(index) => {
                    self.cells[index as usize].state = VisitState::Previsited;
                }
                VisitTask::MarkVisited(index) => {
                    self.cells[index as usize].state = VisitState::Visited;
                }
            }
        }
    }
}

/// Sizes of the serialized BOC parts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BocSizes {
    /// Size of the cell index in bytes.
    pub ref_size: usize,
    /// Size of the offset in bytes.
    pub offset_size: usize,
    /// Total size of all serialized cells.
    pub data_size: u64,
    /// Total size of the BOC.
    pub total_size: u64,
}

struct RootInfo {
    index: u32,
}

struct CellInfo<'a> {
    cell: &'a DynCell,
    refs: [u32; MAX_REF_COUNT],
    ref_count: u8,
    weight: u8,
    is_special: bool,
    should_cache: bool,
    is_root: bool,
    state: VisitState,
    new_index: u32,
}

impl CellInfo<'_> {
    fn with_hashes(&self, mode: BocMode) -> bool {
        (mode.contains(BocMode::WITH_INT_HASHES) && self.weight == 0)
            || (mode.contains(BocMode::WITH_TOP_HASH) && self.is_root)
    }

    fn serialized_size(&self, mode: BocMode, ref_size: usize) -> u64 {
        (CellSerializationInfo::serialized_size(self.cell, self.with_hashes(mode))
            + self.ref_count as usize * ref_size) as u64
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum VisitState {
    Unvisited,
    Previsited,
    Visited,
    Allocated,
}

#[derive(Debug, Clone, Copy)]
enum VisitTask {
    Previsit(u32),
    Visit(u32),
    Allocate(u32),
    MarkPrevisited(u32),
    MarkVisited(u32),
}

struct ImportFrame<'a> {
    cell: &'a DynCell,
    next_child: u8,
    refs: [u32; MAX_REF_COUNT],
    ref_count: u8,
    weight: u32,
}

impl<'a> ImportFrame<'a> {
    fn new(cell: &'a DynCell) -> Result<Self, Error> {
        if cell.virtualization() != 0 {
            return Err(Error::VirtualizedCell);
        }
        if !cell.is_loaded() {
            return Err(Error::UnloadedCell);
        }
        Ok(Self {
            cell,
            next_child: 0,
            refs: [0; MAX_REF_COUNT],
            ref_count: 0,
            weight: 1,
        })
    }

    fn push_child(&mut self, index: u32, weight: u8) {
        self.refs[self.ref_count as usize] = index;
        self.ref_count += 1;
        self.weight += weight as u32;
    }
}

/// Error type for BOC encoding related errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// Too many roots for a single BOC.
    #[error("too many root cells")]
    TooManyRoots,
    /// Virtualized cells can't be serialized.
    #[error("cell has non-zero virtualization level")]
    VirtualizedCell,
    /// Storage stand-ins have no data to serialize.
    #[error("cell is not loaded")]
    UnloadedCell,
    /// Tree of cells is too deep.
    #[error("cell depth is too large")]
    DepthOverflow,
    /// Cell indices or offsets don't fit into the format limits.
    #[error("too many cells")]
    TooManyCells,
    /// Unsupported combination of mode flags.
    #[error("cache bits require index")]
    InvalidMode,
}
