use smallvec::SmallVec;

use super::{make_pruned_branch_ext, MerkleFilter};
use crate::cell::{
    Cell, CellBuilder, CellContext, CellType, DynCell, EmptyCellContext, HashBytes,
    LevelMask, RefsIter, EMPTY_CELL_HASH, MAX_REF_COUNT,
};
use crate::error::Error;

/// Parsed Merkle proof representation.
///
/// NOTE: Serialized into `MerkleProof` cell.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MerkleProof {
    /// Representation hash of the original cell.
    pub hash: HashBytes,
    /// Representation depth of the origin cell.
    pub depth: u16,
    /// Partially pruned tree with the contents of the original cell.
    pub cell: Cell,
}

impl Default for MerkleProof {
    fn default() -> Self {
        Self {
            hash: EMPTY_CELL_HASH,
            depth: 0,
            cell: Cell::empty_cell(),
        }
    }
}

impl MerkleProof {
    /// The number of data bits that the Merkle proof occupies.
    pub const BITS: u16 = 8 + 256 + 16;
    /// The number of references that the Merkle proof occupies.
    pub const REFS: u8 = 1;

    /// Starts building a Merkle proof for the specified root,
    /// using cells determined by filter.
    ///
    /// The root must be the original cell, not the one tracked by
    /// a usage tree, otherwise the proof builder itself will mark
    /// all visited cells as used.
    pub fn create<'a, F>(root: &'a DynCell, f: F) -> MerkleProofBuilder<'a, F>
    where
        F: MerkleFilter + 'a,
    {
        MerkleProofBuilder::new(root, f)
    }

    /// Create a Merkle proof for the single cell with the specified
    /// representation hash.
    ///
    /// Only ancestors of the first occurrence are included in the proof.
    ///
    /// Proof creation will fail if the specified child is not found.
    pub fn create_for_cell<'a>(
        root: &'a DynCell,
        child_hash: &'a HashBytes,
    ) -> MerkleProofBuilder<'a, impl MerkleFilter + 'a> {
        struct RootOrChild<'a> {
            cells: ahash::HashSet<&'a HashBytes>,
            child_hash: &'a HashBytes,
        }

        impl MerkleFilter for RootOrChild<'_> {
            fn contains(&self, cell: &HashBytes) -> bool {
                self.cells.contains(cell) || cell == self.child_hash
            }
        }

        let mut visited = ahash::HashSet::<&HashBytes>::default();
        let mut stack = Vec::new();
        if root.repr_hash() != child_hash {
            stack.push(root.references());
        }

        let mut found = false;
        while let Some(last_cells) = stack.last_mut() {
            match last_cells.next() {
                Some(child) if child.repr_hash() == child_hash => {
                    found = true;
                    break;
                }
                Some(child) => {
                    // Subtrees without the child are skipped on the next visit
                    if visited.insert(child.repr_hash()) {
                        stack.push(child.references());
                    }
                }
                None => {
                    stack.pop();
                }
            }
        }

        let mut cells = ahash::HashSet::default();
        if found {
            cells.reserve(stack.len());
            for item in &stack {
                cells.insert(item.cell().repr_hash());
            }
        }

        MerkleProofBuilder::new(root, RootOrChild { cells, child_hash })
    }

    /// Parses the Merkle proof from the exotic cell.
    ///
    /// Fails with [`Error::InvalidCell`] if the cell is not a level 0
    /// Merkle proof cell.
    pub fn from_cell(cell: &DynCell) -> Result<Self, Error> {
        if cell.level() != 0 || cell.cell_type() != CellType::MerkleProof {
            return Err(Error::InvalidCell);
        }

        let slice = ok!(cell.as_slice_allow_exotic());
        if !slice.has_remaining(Self::BITS, Self::REFS) {
            return Err(Error::CellUnderflow);
        }

        Ok(Self {
            hash: ok!(slice.get_u256(8)),
            depth: ok!(slice.get_u16(8 + 256)),
            cell: ok!(slice.reference_cloned(0).ok_or(Error::CellUnderflow)),
        })
    }

    /// Builds a `MerkleProof` exotic cell with the default context.
    pub fn to_cell(&self) -> Result<Cell, Error> {
        self.to_cell_ext(&mut EmptyCellContext)
    }

    /// Builds a `MerkleProof` exotic cell using the specified cell context.
    pub fn to_cell_ext(&self, context: &mut dyn CellContext) -> Result<Cell, Error> {
        let mut builder = CellBuilder::new();
        builder.set_exotic(true);
        ok!(builder.store_u8(CellType::MerkleProof.to_byte()));
        ok!(builder.store_u256(&self.hash));
        ok!(builder.store_u16(self.depth));
        ok!(builder.store_reference(self.cell.clone()));
        builder.build_ext(context)
    }

    /// Returns a virtualized view of the proven tree.
    ///
    /// The result has the same representation hash as the original root,
    /// reading the data of pruned parts fails with
    /// [`Error::PrunedBranchAccess`].
    pub fn virtualize(proof_cell: &DynCell) -> Result<Cell, Error> {
        let proof = ok!(Self::from_cell(proof_cell));
        Ok(proof.cell.virtualize())
    }

    /// Merges two proofs of the same tree into one proof cell.
    ///
    /// Every cell which is present in at least one of the proofs
    /// is present in the result.
    pub fn combine(a: &DynCell, b: &DynCell) -> Result<Cell, Error> {
        let (a, b) = ok!(Self::unpack_pair(a, b));

        let mut combiner = ProofCombiner::default();
        combiner.collect(a.cell.clone(), 0);
        combiner.collect(b.cell.clone(), 0);
        let cell = ok!(combiner.create(&a.cell, 0, 0));

        MerkleProof { cell, ..a }.to_cell()
    }

    /// Merges two proofs of the same tree, preferring the left side for
    /// subtrees which are equal or fully present in both proofs.
    ///
    /// Unlike [`MerkleProof::combine`], shared cells are not deduplicated
    /// across different branches.
    pub fn combine_fast(a: &DynCell, b: &DynCell) -> Result<Cell, Error> {
        let (a, b) = ok!(Self::unpack_pair(a, b));
        let cell = ok!(merge_fast(&a.cell, &b.cell, 0));
        MerkleProof { cell, ..a }.to_cell()
    }

    fn unpack_pair(a: &DynCell, b: &DynCell) -> Result<(Self, Self), Error> {
        let a = ok!(Self::from_cell(a));
        let b = ok!(Self::from_cell(b));
        if a.cell.hash(0) != b.cell.hash(0) {
            return Err(Error::ProofInconsistency);
        }
        Ok((a, b))
    }
}

/// Helper struct to build a Merkle proof.
pub struct MerkleProofBuilder<'a, F> {
    root: &'a DynCell,
    filter: F,
    prune_big_cells: bool,
}

impl<'a, F> MerkleProofBuilder<'a, F>
where
    F: MerkleFilter,
{
    /// Creates a new Merkle proof builder for the tree with the specified root,
    /// using cells determined by filter.
    pub fn new(root: &'a DynCell, f: F) -> Self {
        Self {
            root,
            filter: f,
            prune_big_cells: false,
        }
    }

    /// Replace skipped leaves with pruned branches too.
    ///
    /// Skipped cells without references are kept as is by default.
    pub fn prune_big_cells(mut self, prune_big_cells: bool) -> Self {
        self.prune_big_cells = prune_big_cells;
        self
    }

    /// Builds a Merkle proof using the default cell context.
    pub fn build(self) -> Result<MerkleProof, Error> {
        self.build_ext(&mut EmptyCellContext)
    }

    /// Builds a Merkle proof using the specified cell context.
    ///
    /// The root cell must have level 0.
    pub fn build_ext(self, context: &mut dyn CellContext) -> Result<MerkleProof, Error> {
        let root = self.root;
        if root.level() != 0 {
            return Err(Error::InvalidCell);
        }

        let cell = ok!(self.build_raw_ext(context));
        Ok(MerkleProof {
            hash: *root.repr_hash(),
            depth: root.repr_depth(),
            cell,
        })
    }

    /// Builds a Merkle proof child cell using the specified cell context.
    pub fn build_raw_ext(self, context: &mut dyn CellContext) -> Result<Cell, Error> {
        struct Node<'a> {
            references: RefsIter<'a>,
            merkle_depth: u8,
            children_merkle_depth: u8,
            children: SmallVec<[Cell; MAX_REF_COUNT]>,
        }

        impl<'a> Node<'a> {
            fn new(cell: &'a DynCell, merkle_depth: u8) -> Self {
                Self {
                    references: cell.references(),
                    merkle_depth,
                    children_merkle_depth: merkle_depth + cell.cell_type().is_merkle() as u8,
                    children: SmallVec::new(),
                }
            }
        }

        let root = self.root;
        if !self.filter.contains(root.repr_hash()) {
            return Err(Error::EmptyProof);
        }
        if !root.is_loaded() {
            return Err(Error::UnloadedCell);
        }

        // Processed cells for each merkle depth
        let mut cells = ahash::HashMap::<(&'a HashBytes, u8), Cell>::default();

        let mut stack = Vec::with_capacity(root.repr_depth() as usize + 1);
        stack.push(Node::new(root, root.level_mask().max_level()));

        while let Some(last) = stack.last_mut() {
            if let Some(child) = last.references.next() {
                // Process children if they are left

                let merkle_depth = last.children_merkle_depth;
                let key = (child.repr_hash(), merkle_depth);

                let child = if let Some(child) = cells.get(&key) {
                    // Reuse processed cells
                    child.clone()
                } else if self.filter.contains(child.repr_hash()) {
                    if !child.is_loaded() {
                        return Err(Error::UnloadedCell);
                    }

                    // Push child node and start processing its references
                    stack.push(Node::new(child, merkle_depth));
                    continue;
                } else {
                    let index = last.children.len() as u8;
                    let parent = last.references.cell();

                    let keep = !self.prune_big_cells
                        && child.reference_count() == 0
                        && child.is_loaded()
                        && child.virtualization() == 0;

                    let child = match parent.reference_cloned(index) {
                        Some(child) if keep => child,
                        _ => ok!(make_pruned_branch_cold(
                            child,
                            merkle_depth,
                            LevelMask::MAX_LEVEL,
                            context
                        )),
                    };
                    cells.insert(key, child.clone());
                    child
                };

                last.children.push(child);
            } else if let Some(last) = stack.pop() {
                // Build a new cell if there are no child nodes left to process

                let cell = last.references.cell();
                let builder = ok!(CellBuilder::from_parts(
                    cell.is_exotic(),
                    cell.data(),
                    cell.bit_len(),
                    last.children,
                ));
                let proof_cell = ok!(builder.build_ext(context));

                // Save this cell as processed cell
                cells.insert((cell.repr_hash(), last.merkle_depth), proof_cell.clone());

                match stack.last_mut() {
                    // Append this cell to the ancestor
                    Some(last) => last.children.push(proof_cell),
                    // Or return it as a result (for the root node)
                    None => return Ok(proof_cell),
                }
            }
        }

        // Root node is always returned from the loop
        Err(Error::EmptyProof)
    }
}

#[cold]
fn make_pruned_branch_cold(
    cell: &DynCell,
    merkle_depth: u8,
    virt_level: u8,
    context: &mut dyn CellContext,
) -> Result<Cell, Error> {
    make_pruned_branch_ext(cell, merkle_depth, virt_level, context)
}

fn merge_fast(a: &Cell, b: &Cell, merkle_depth: u8) -> Result<Cell, Error> {
    if a.repr_hash() == b.repr_hash() || a.level_mask().max_level() == merkle_depth {
        return Ok(a.clone());
    }
    if b.level_mask().max_level() == merkle_depth {
        return Ok(b.clone());
    }

    if a.cell_type().is_pruned_branch() {
        return Ok(b.clone());
    }
    if b.cell_type().is_pruned_branch() {
        return Ok(a.clone());
    }

    if a.is_exotic() != b.is_exotic()
        || a.bit_len() != b.bit_len()
        || a.reference_count() != b.reference_count()
        || a.reference_count() == 0
        || a.data() != b.data()
    {
        return Err(Error::ProofInconsistency);
    }

    let children_merkle_depth = merkle_depth + a.cell_type().is_merkle() as u8;

    let mut children = SmallVec::<[Cell; MAX_REF_COUNT]>::new();
    for (left, right) in a.references().cloned().zip(b.references().cloned()) {
        children.push(ok!(merge_fast(&left, &right, children_merkle_depth)));
    }

    let builder = ok!(CellBuilder::from_parts(
        a.is_exotic(),
        a.data(),
        a.bit_len(),
        children
    ));
    builder.build()
}

/// Cells of both proofs with the same hash at their merkle depth.
#[derive(Default)]
struct CombinedCell {
    cell: Option<Cell>,
    pruned: [Option<Cell>; LevelMask::MAX_LEVEL as usize],
}

impl CombinedCell {
    fn any_cell(&self) -> Option<&Cell> {
        match &self.cell {
            Some(cell) => Some(cell),
            None => self.pruned.iter().flatten().next(),
        }
    }
}

#[derive(Default)]
struct ProofCombiner {
    cells: ahash::HashMap<HashBytes, CombinedCell>,
    created: ahash::HashMap<(HashBytes, u8), Cell>,
    visited: ahash::HashSet<(HashBytes, u8)>,
}

impl ProofCombiner {
    fn collect(&mut self, root: Cell, merkle_depth: u8) {
        let mut stack = vec![(root, merkle_depth)];
        while let Some((cell, merkle_depth)) = stack.pop() {
            if !self.visited.insert((*cell.repr_hash(), merkle_depth)) {
                continue;
            }

            let info = self.cells.entry(*cell.hash(merkle_depth)).or_default();

            // Pruned branches of the outer proofs are kept as cells
            let level = cell.level_mask().max_level();
            if cell.cell_type().is_pruned_branch() && level > merkle_depth {
                if let Some(slot) = info.pruned.get_mut(level as usize - 1) {
                    *slot = Some(cell);
                }
                continue;
            }

            let children_merkle_depth = merkle_depth + cell.cell_type().is_merkle() as u8;
            stack.extend(
                cell.references()
                    .cloned()
                    .map(|child| (child, children_merkle_depth)),
            );
            info.cell = Some(cell);
        }
    }

    fn create(&mut self, cell: &Cell, merkle_depth: u8, a_merkle_depth: u8) -> Result<Cell, Error> {
        let merkle_depth = cell.level_mask().apply(merkle_depth).max_level();
        let key = (*cell.hash(merkle_depth), a_merkle_depth);
        if let Some(cell) = self.created.get(&key) {
            return Ok(cell.clone());
        }

        let res = ok!(self.create_uncached(cell, merkle_depth, a_merkle_depth));
        self.created.insert(key, res.clone());
        Ok(res)
    }

    fn create_uncached(
        &mut self,
        cell: &Cell,
        merkle_depth: u8,
        a_merkle_depth: u8,
    ) -> Result<Cell, Error> {
        let Some(info) = self.cells.get(cell.hash(merkle_depth)) else {
            return Err(Error::ProofInconsistency);
        };

        let full = match &info.cell {
            Some(full) => full.clone(),
            None => {
                if let Some(Some(pruned)) = info.pruned.get(a_merkle_depth as usize) {
                    return Ok(pruned.clone());
                }
                let Some(any) = info.any_cell() else {
                    return Err(Error::ProofInconsistency);
                };
                return make_pruned_branch_ext(
                    any.as_ref(),
                    a_merkle_depth,
                    merkle_depth,
                    &mut EmptyCellContext,
                );
            }
        };

        if full.reference_count() == 0 {
            return Ok(full);
        }

        let offset = full.cell_type().is_merkle() as u8;
        let mut children = SmallVec::<[Cell; MAX_REF_COUNT]>::new();
        for child in full.references().cloned() {
            children.push(ok!(self.create(
                &child,
                merkle_depth + offset,
                a_merkle_depth + offset
            )));
        }

        let builder = ok!(CellBuilder::from_parts(
            full.is_exotic(),
            full.data(),
            full.bit_len(),
            children
        ));
        builder.build()
    }
}
