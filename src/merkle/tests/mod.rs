use std::collections::HashSet;

use super::*;
use crate::boc::Boc;
use crate::cell::{
    Cell, CellBuilder, CellType, DynCell, EmptyCellContext, HashBytes, UsageTree,
    UsageTreeMode, EMPTY_CELL_HASH,
};
use crate::error::Error;

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

//        1
//   /    |     \
//  10    11     12
//  /\    / \     |
// .. .. 110 111 120
//            |
//           1110
fn make_tree() -> Cell {
    let first = node(10, &[leaf(100), leaf(101)]);
    let second = node(11, &[leaf(110), node(111, &[leaf(1110)])]);
    let third = node(12, &[leaf(120)]);
    node(1, &[first, second, third])
}

fn read_u32(cell: &DynCell) -> Result<u32, Error> {
    cell.as_slice()?.load_u32()
}

#[test]
fn correct_proof_store_load() -> anyhow::Result<()> {
    let proof = MerkleProof::default();
    let cell = proof.to_cell()?;
    assert_eq!(cell.cell_type(), CellType::MerkleProof);
    assert_eq!(cell.bit_len(), MerkleProof::BITS);

    let parsed = MerkleProof::from_cell(cell.as_ref())?;
    assert_eq!(parsed, proof);
    Ok(())
}

#[test]
fn merkle_proof_hands() -> anyhow::Result<()> {
    let data = {
        let mut builder = CellBuilder::new();
        builder.store_bytes(b"pruned data")?;
        builder.store_reference(Cell::empty_cell())?;
        builder.build()?
    };
    let pruned_data = make_pruned_branch(data.as_ref(), 0, &mut EmptyCellContext)?;
    assert_eq!(pruned_data.level(), 1);

    let node = {
        let mut builder = CellBuilder::new();
        builder.store_bytes(b"protected data")?;
        builder.store_reference(data.clone())?;
        builder.build()?
    };

    let proof_raw = {
        let mut builder = CellBuilder::new();
        builder.store_bytes(b"protected data")?;
        builder.store_reference(pruned_data.clone())?;
        builder.build()?
    };
    assert_eq!(proof_raw.level(), 1);
    assert_eq!(proof_raw.hash(0), node.repr_hash());
    assert_eq!(proof_raw.depth(0), node.repr_depth());

    let proof = MerkleProof {
        hash: *node.repr_hash(),
        depth: node.repr_depth(),
        cell: proof_raw.clone(),
    };
    let proof_cell = proof.to_cell()?;
    assert_eq!(proof_cell.level(), 0);

    // The same proof is built automatically
    let target = *node.repr_hash();
    let built = MerkleProof::create(node.as_ref(), move |hash: &HashBytes| hash == &target)
        .build()?
        .to_cell()?;
    assert_eq!(built.as_ref(), proof_cell.as_ref());

    let virtual_node = MerkleProof::virtualize(proof_cell.as_ref())?;
    assert_eq!(virtual_node.level(), 0);
    assert_eq!(virtual_node.virtualization(), 1);
    assert_eq!(virtual_node.repr_hash(), node.repr_hash());
    assert_eq!(virtual_node.repr_depth(), node.repr_depth());

    let virtual_data = virtual_node.reference(0).unwrap();
    assert_eq!(virtual_data.level(), 0);
    assert_eq!(virtual_data.repr_hash(), data.repr_hash());
    assert_eq!(
        virtual_data.as_slice().unwrap_err(),
        Error::PrunedBranchAccess
    );
    Ok(())
}

#[test]
fn proof_from_usage_tree() -> anyhow::Result<()> {
    let root = make_tree();

    let usage_tree = UsageTree::new(UsageTreeMode::OnLoad);
    {
        let tracked = usage_tree.track(&root);
        let second = tracked.reference(1).unwrap();
        assert_eq!(read_u32(second)?, 11);
        let deep = second.reference(1).unwrap();
        assert_eq!(read_u32(deep)?, 111);
    }

    let proof = MerkleProof::create(root.as_ref(), usage_tree).build()?;
    assert_eq!(&proof.hash, root.repr_hash());
    assert_eq!(proof.depth, root.repr_depth());

    let proof_cell = proof.to_cell()?;
    assert_eq!(proof_cell.level(), 0);

    // Proof survives serialization
    let decoded = Boc::decode(Boc::encode(proof_cell.as_ref())?)?;
    assert_eq!(decoded.as_ref(), proof_cell.as_ref());

    let virtual_root = MerkleProof::virtualize(decoded.as_ref())?;
    assert_eq!(virtual_root.repr_hash(), root.repr_hash());
    assert_eq!(virtual_root.repr_depth(), root.repr_depth());
    assert_eq!(read_u32(virtual_root.as_ref())?, 1);

    // Unused subtrees are pruned
    for i in [0, 2] {
        let child = virtual_root.reference(i).unwrap();
        assert_eq!(child.cell_type(), CellType::PrunedBranch);
        assert_eq!(child.repr_hash(), root.reference(i).unwrap().repr_hash());
        assert_eq!(read_u32(child).unwrap_err(), Error::PrunedBranchAccess);
    }

    // Used cells and skipped leaves are readable
    let second = virtual_root.reference(1).unwrap();
    assert_eq!(read_u32(second)?, 11);
    assert_eq!(read_u32(second.reference(0).unwrap())?, 110);
    let deep = second.reference(1).unwrap();
    assert_eq!(read_u32(deep)?, 111);
    assert_eq!(read_u32(deep.reference(0).unwrap())?, 1110);

    Ok(())
}

#[test]
fn proof_with_hash_set() -> anyhow::Result<()> {
    let root = make_tree();
    let third = root.reference(2).unwrap();

    let mut cells = HashSet::new();
    cells.insert(*root.repr_hash());
    cells.insert(*third.repr_hash());

    let proof = MerkleProof::create(root.as_ref(), cells)
        .prune_big_cells(true)
        .build()?;

    let virtual_root = proof.cell.clone().virtualize();
    let virtual_third = virtual_root.reference(2).unwrap();
    assert_eq!(read_u32(virtual_third)?, 12);

    // Leaves are pruned too
    let leaf = virtual_third.reference(0).unwrap();
    assert_eq!(leaf.cell_type(), CellType::PrunedBranch);
    assert_eq!(leaf.repr_hash(), third.reference(0).unwrap().repr_hash());
    Ok(())
}

#[test]
fn create_proof_for_cell() -> anyhow::Result<()> {
    let root = make_tree();
    let target = root.reference(1).unwrap().reference(1).unwrap();

    let proof = MerkleProof::create_for_cell(root.as_ref(), target.repr_hash()).build()?;
    let virtual_root = proof.cell.clone().virtualize();
    assert_eq!(virtual_root.repr_hash(), root.repr_hash());

    let second = virtual_root.reference(1).unwrap();
    assert_eq!(read_u32(second)?, 11);
    assert_eq!(read_u32(second.reference(1).unwrap())?, 111);
    assert_eq!(
        read_u32(virtual_root.reference(0).unwrap()).unwrap_err(),
        Error::PrunedBranchAccess
    );

    // Unknown cell
    let unknown = HashBytes([0x55; 32]);
    let res = MerkleProof::create_for_cell(root.as_ref(), &unknown).build();
    assert_eq!(res.unwrap_err(), Error::EmptyProof);
    Ok(())
}

#[test]
fn create_proof_for_deep_cell() -> anyhow::Result<()> {
    let mut cell = Cell::empty_cell();
    for i in 0..1000 {
        cell = node(i, &[cell]);
    }

    let proof = MerkleProof::create_for_cell(cell.as_ref(), &EMPTY_CELL_HASH).build()?;
    assert_eq!(proof.cell.as_ref(), cell.as_ref());

    let encoded = Boc::encode_base64(proof.to_cell()?.as_ref())?;
    let decoded = Boc::decode_base64(encoded)?;
    assert_eq!(MerkleProof::from_cell(decoded.as_ref())?, proof);
    Ok(())
}

#[test]
fn invalid_proofs() -> anyhow::Result<()> {
    let root = make_tree();

    let res = MerkleProof::create(root.as_ref(), |_: &HashBytes| false).build();
    assert_eq!(res.unwrap_err(), Error::EmptyProof);

    assert_eq!(
        MerkleProof::virtualize(root.as_ref()).unwrap_err(),
        Error::InvalidCell
    );
    assert_eq!(
        MerkleProof::from_cell(Cell::empty_cell_ref()).unwrap_err(),
        Error::InvalidCell
    );

    // Only level 0 trees can be proven
    let pruned = make_pruned_branch(root.as_ref(), 0, &mut EmptyCellContext)?;
    let with_pruned = node(0, &[pruned]);
    let res = MerkleProof::create(with_pruned.as_ref(), |_: &HashBytes| true).build();
    assert_eq!(res.unwrap_err(), Error::InvalidCell);
    Ok(())
}

#[test]
fn combine_proofs() -> anyhow::Result<()> {
    let root = make_tree();
    let first = root.reference(0).unwrap();
    let third = root.reference(2).unwrap();

    let left = MerkleProof::create_for_cell(root.as_ref(), first.repr_hash())
        .build()?
        .to_cell()?;
    let right = MerkleProof::create_for_cell(root.as_ref(), third.repr_hash())
        .build()?
        .to_cell()?;

    let combined = MerkleProof::combine(left.as_ref(), right.as_ref())?;
    let combined_fast = MerkleProof::combine_fast(left.as_ref(), right.as_ref())?;
    assert_eq!(combined.as_ref(), combined_fast.as_ref());

    let virtual_root = MerkleProof::virtualize(combined.as_ref())?;
    assert_eq!(virtual_root.repr_hash(), root.repr_hash());
    assert_eq!(read_u32(virtual_root.reference(0).unwrap())?, 10);
    assert_eq!(read_u32(virtual_root.reference(2).unwrap())?, 12);
    assert_eq!(
        read_u32(virtual_root.reference(1).unwrap()).unwrap_err(),
        Error::PrunedBranchAccess
    );

    // Combining with itself changes nothing
    let same = MerkleProof::combine(left.as_ref(), left.as_ref())?;
    assert_eq!(same.as_ref(), left.as_ref());
    let same = MerkleProof::combine_fast(combined.as_ref(), left.as_ref())?;
    assert_eq!(same.as_ref(), combined.as_ref());
    Ok(())
}

#[test]
fn combine_shared_subtrees() -> anyhow::Result<()> {
    // The same subtree is referenced twice
    let shared = node(5, &[leaf(50), node(51, &[leaf(510)])]);
    let root = node(0, &[shared.clone(), node(1, &[shared.clone()])]);

    let usage_tree = UsageTree::new(UsageTreeMode::OnLoad);
    {
        let tracked = usage_tree.track(&root);
        let inner = tracked.reference(1).unwrap();
        assert_eq!(read_u32(inner)?, 1);
    }
    let left = MerkleProof::create(root.as_ref(), usage_tree)
        .build()?
        .to_cell()?;

    let target = shared.reference(1).unwrap();
    let right = MerkleProof::create_for_cell(root.as_ref(), target.repr_hash())
        .build()?
        .to_cell()?;

    let combined = MerkleProof::combine(left.as_ref(), right.as_ref())?;
    let virtual_root = MerkleProof::virtualize(combined.as_ref())?;

    // Both occurrences of the shared subtree are expanded
    let direct = virtual_root.reference(0).unwrap();
    assert_eq!(read_u32(direct.reference(1).unwrap())?, 51);
    let inner = virtual_root.reference(1).unwrap();
    assert_eq!(read_u32(inner)?, 1);
    let nested = inner.reference(0).unwrap();
    assert_eq!(read_u32(nested.reference(1).unwrap())?, 51);
    Ok(())
}

#[test]
fn combine_different_roots() -> anyhow::Result<()> {
    let first = make_tree();
    let second = node(2, &[leaf(3)]);

    let left = MerkleProof::create_for_cell(first.as_ref(), first.repr_hash())
        .build()?
        .to_cell()?;
    let right = MerkleProof::create_for_cell(second.as_ref(), second.repr_hash())
        .build()?
        .to_cell()?;

    assert_eq!(
        MerkleProof::combine(left.as_ref(), right.as_ref()).unwrap_err(),
        Error::ProofInconsistency
    );
    assert_eq!(
        MerkleProof::combine_fast(left.as_ref(), right.as_ref()).unwrap_err(),
        Error::ProofInconsistency
    );
    assert_eq!(
        MerkleProof::combine(left.as_ref(), first.as_ref()).unwrap_err(),
        Error::InvalidCell
    );
    Ok(())
}
