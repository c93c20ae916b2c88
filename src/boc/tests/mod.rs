use std::str::FromStr;

use rand::{Rng, SeedableRng};

use super::*;
use crate::cell::{CellBuilder, HashBytes};
use crate::merkle::make_pruned_branch;

const ABCD_HASH: &str = "14b9cbb4abbfb5e8644ea87b2cfa110a3a49ecd27cada5d8842b26e58c16c034";

const INDEXED_BOC: &str = "68ff65f301010201002a042a810150018848010414b9cbb4abbfb5e8644ea87b2cfa110a3a49ecd27cada5d8842b26e58c16c0340001";
const INDEXED_CRC_BOC: &str = "acc3a72801010201002a042a810150018848010414b9cbb4abbfb5e8644ea87b2cfa110a3a49ecd27cada5d8842b26e58c16c03400011a9933bc";

fn cell_with_bytes(data: &[u8], refs: &[Cell]) -> Cell {
    let mut builder = CellBuilder::new();
    builder.store_bytes(data).unwrap();
    for child in refs {
        builder.store_reference(child.clone()).unwrap();
    }
    builder.build().unwrap()
}

fn abcd_cell() -> Cell {
    let child = cell_with_bytes(b"???", &[]);
    cell_with_bytes(b"abcd", &[child])
}

fn hands_tree() -> Cell {
    let pruned = make_pruned_branch(abcd_cell().as_ref(), 2, &mut EmptyCellContext).unwrap();

    let mut builder = CellBuilder::new();
    builder.store_uint(0b010, 3).unwrap();
    builder.store_reference(pruned).unwrap();
    builder.build().unwrap()
}

fn hands_boc_mode0() -> Vec<u8> {
    hex::decode(format!("b5ee9c7201010201002a008101500188480104{ABCD_HASH}0001")).unwrap()
}

#[test]
fn empty_cell_boc() {
    let boc = Boc::encode(Cell::empty_cell_ref()).unwrap();
    assert_eq!(hex::encode(&boc), "b5ee9c72010101010002000000");

    let decoded = Boc::decode(&boc).unwrap();
    assert!(decoded.is_empty());
    assert_eq!(decoded.repr_hash(), Cell::empty_cell_ref().repr_hash());
}

#[test]
fn single_byte_cell_boc() {
    let cell = cell_with_bytes(&[0xab], &[]);
    let boc = Boc::encode(cell.as_ref()).unwrap();
    assert_eq!(hex::encode(&boc), "b5ee9c72010101010003000002ab");

    let decoded = Boc::decode(&boc).unwrap();
    assert_eq!(
        decoded.repr_hash(),
        &HashBytes::from_str("57c2a1a13baa2762109ed68be0c396f2303ce17e3dde7917d0e74b4072b1dbc7")
            .unwrap()
    );
}

#[test]
fn hands_tree_matches_reference_encoding() {
    assert_eq!(abcd_cell().repr_hash(), &HashBytes::from_str(ABCD_HASH).unwrap());

    let tree = hands_tree();
    assert_eq!(tree.level(), 1);

    let boc = Boc::encode(tree.as_ref()).unwrap();
    assert_eq!(boc, hands_boc_mode0());
}

#[test]
fn indexed_tags_are_decoded() {
    let tree = hands_tree();

    for boc in [INDEXED_BOC, INDEXED_CRC_BOC] {
        let boc = hex::decode(boc).unwrap();
        let decoded = Boc::decode(&boc).unwrap();
        assert_eq!(decoded.repr_hash(), tree.repr_hash());
        assert_eq!(decoded.level(), 1);

        // Re-encoded always as a generic BOC
        assert_eq!(Boc::encode(decoded.as_ref()).unwrap(), hands_boc_mode0());
    }

    // Only the lowest three bits of the flags byte are the ref size
    let mut boc = hex::decode(INDEXED_BOC).unwrap();
    boc[4] |= 0b1111_1000;
    assert_eq!(Boc::decode(&boc).unwrap().repr_hash(), tree.repr_hash());

    boc[4] = 0b1111_1000;
    assert_eq!(Boc::decode(&boc), Err(de::Error::InvalidRefSize));
}

#[test]
fn every_byte_is_covered_by_crc() {
    let boc = hex::decode(INDEXED_CRC_BOC).unwrap();
    for i in 0..boc.len() {
        let mut corrupted = boc.clone();
        corrupted[i] ^= 0x01;
        assert!(Boc::decode(&corrupted).is_err(), "byte {i} is not verified");
    }

    let mut corrupted = boc;
    *corrupted.last_mut().unwrap() ^= 0xff;
    assert_eq!(Boc::decode(&corrupted), Err(de::Error::InvalidChecksum));
}

#[test]
fn crc_round_trip() {
    let tree = hands_tree();
    let with_crc = Boc::encode_ext(tree.as_ref(), BocMode::WITH_CRC32C).unwrap();
    let without_crc = Boc::encode(tree.as_ref()).unwrap();
    assert_eq!(with_crc.len(), without_crc.len() + 4);
    assert_eq!(with_crc[4], without_crc[4] | 0b0100_0000);

    let decoded = Boc::decode(&with_crc).unwrap();
    assert_eq!(decoded.as_ref(), tree.as_ref());
}

#[test]
fn shared_child_with_two_roots() {
    let shared = cell_with_bytes(b"shared", &[]);
    let a = cell_with_bytes(b"a", &[shared.clone()]);
    let b = cell_with_bytes(b"b", &[shared.clone()]);

    let boc = std_boc_serialize_multi(&[a.clone(), b.clone()], BocMode::empty()).unwrap();

    let header = de::BocHeader::decode(&boc, &de::Options::default()).unwrap();
    assert_eq!(header.cells().len(), 3);
    // Stream order is B, A, shared
    assert_eq!(header.roots(), [1, 0]);

    let cells = header.finalize(&mut EmptyCellContext).unwrap();
    assert_eq!(cells.get(0).unwrap().repr_hash(), b.repr_hash());
    assert_eq!(cells.get(1).unwrap().repr_hash(), a.repr_hash());
    assert_eq!(cells.get(2).unwrap().repr_hash(), shared.repr_hash());
    assert!(cells.get(3).is_none());

    let roots = std_boc_deserialize_multi(&boc, 2).unwrap();
    assert_eq!(roots, [a, b]);

    assert_eq!(
        Boc::decode(&boc),
        Err(de::Error::TooManyRootCells),
        "single root decoder must reject multiple roots"
    );
    assert_eq!(
        std_boc_deserialize_multi(&boc, 1),
        Err(BocError::Decode(de::Error::TooManyRootCells))
    );
    assert_eq!(
        std_boc_deserialize(&boc, false),
        Err(BocError::NotStandardBoc)
    );
}

#[test]
fn all_modes_round_trip() {
    let shared = cell_with_bytes(b"shared", &[]);
    let mut cell = cell_with_bytes(b"leaf", &[shared.clone()]);
    for i in 0..80u8 {
        cell = cell_with_bytes(&[i], &[cell, shared.clone()]);
    }
    let tree = cell_with_bytes(b"root", &[cell, hands_tree()]);

    for bits in 0..32u8 {
        let mode = BocMode::from_bits_truncate(bits);
        let encoded = Boc::encode_ext(tree.as_ref(), mode);
        if mode.contains(BocMode::WITH_CACHE_BITS) && !mode.contains(BocMode::WITH_INDEX) {
            assert_eq!(encoded, Err(ser::Error::InvalidMode));
            continue;
        }

        let encoded = encoded.unwrap();
        let decoded = Boc::decode(&encoded).unwrap();
        assert_eq!(decoded.repr_hash(), tree.repr_hash(), "mode {mode:?}");
        assert_eq!(Boc::encode_ext(decoded.as_ref(), mode).unwrap(), encoded);
    }
}

#[test]
fn random_trees_round_trip() {
    let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(123123);

    for _ in 0..20 {
        let mut cells = Vec::<Cell>::new();
        for _ in 0..rng.gen_range(1..200) {
            let mut builder = CellBuilder::new();
            let bits = rng.gen_range(0..=64u16);
            builder.store_uint(rng.gen(), bits).unwrap();

            if !cells.is_empty() {
                for _ in 0..rng.gen_range(0..=4) {
                    let child = rng.gen_range(0..cells.len());
                    builder.store_reference(cells[child].clone()).unwrap();
                }
            }
            cells.push(builder.build().unwrap());
        }

        let root = cells.last().unwrap();
        let encoded = Boc::encode(root.as_ref()).unwrap();
        assert_eq!(encoded, Boc::encode(root.as_ref()).unwrap());

        let decoded = Boc::decode(&encoded).unwrap();
        assert_eq!(decoded.repr_hash(), root.repr_hash());
        assert_eq!(decoded.repr_depth(), root.repr_depth());
        assert_eq!(Boc::encode(decoded.as_ref()).unwrap(), encoded);

        let header = de::BocHeader::decode(&encoded, &de::Options::exact(1)).unwrap();
        let unique = root.compute_unique_stats(usize::MAX).unwrap();
        assert_eq!(header.cells().len() as u64, unique.cell_count);
    }
}

#[test]
fn invalid_headers() {
    let boc = hands_boc_mode0();

    let mut data = boc.clone();
    data[0] = 0x00;
    assert_eq!(Boc::decode(&data), Err(de::Error::UnknownBocTag));

    let mut data = boc.clone();
    data[4] = 0x00;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidRefSize));

    let mut data = boc.clone();
    data[4] = 0x05;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidRefSize));

    let mut data = boc.clone();
    data[5] = 0x00;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidOffsetSize));

    let mut data = boc.clone();
    data[4] |= 0b0010_0000;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidCacheBits));

    let mut data = boc.clone();
    data[6] = 0x00;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidHeader));

    let mut data = boc.clone();
    data[7] = 0x00;
    assert_eq!(Boc::decode(&data), Err(de::Error::RootCellNotFound));

    let mut data = boc.clone();
    data[8] = 0x03;
    assert_eq!(Boc::decode(&data), Err(de::Error::TooManyAbsentCells));

    let mut data = boc.clone();
    data[10] = 0x02;
    assert_eq!(Boc::decode(&data), Err(de::Error::RootOutOfBounds));

    // Reference to itself
    let mut data = boc.clone();
    data[14] = 0x00;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidRefOrder));

    // Reference to a non-existing cell
    let mut data = boc.clone();
    data[14] = 0x02;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidRef));

    for len in 0..boc.len() {
        assert!(Boc::decode(&boc[..len]).is_err());
    }
    assert_eq!(Boc::decode(&boc[..boc.len() - 1]), Err(de::Error::UnexpectedEof));

    assert_eq!(Boc::decode(Vec::new()), Err(de::Error::UnexpectedEof));
}

#[test]
fn trailing_bytes_are_ignored() {
    let mut boc = hands_boc_mode0();
    boc.extend_from_slice(&[0xde, 0xad]);
    assert_eq!(Boc::decode(&boc).unwrap().repr_hash(), hands_tree().repr_hash());
}

#[test]
fn invalid_cells() {
    // Overlong encoding: the last byte contains only the completion tag
    let data = hex::decode("b5ee9c7201010101000300000180").unwrap();
    assert_eq!(Boc::decode(data), Err(de::Error::UnnormalizedCell));

    // Absent cell
    let data = hex::decode("b5ee9c72010101010002000700").unwrap();
    assert_eq!(Boc::decode(data), Err(de::Error::AbsentCell));

    // Declared data size is larger than the cells
    let data = hex::decode("b5ee9c72010101010004000002abff").unwrap();
    assert_eq!(Boc::decode(data), Err(de::Error::InvalidTotalSize));

    // Invalid exotic cell
    let data = hex::decode("b5ee9c7201010101000300080201").unwrap();
    assert_eq!(Boc::decode(data), Err(de::Error::InvalidCell));
}

#[test]
fn stored_hashes_are_verified() {
    let cell = cell_with_bytes(&[0xab], &[]);
    let mut boc = Boc::encode_ext(cell.as_ref(), BocMode::WITH_TOP_HASH).unwrap();
    assert_eq!(boc.len(), 14 + 32 + 2);
    assert_eq!(&boc[13..45], cell.repr_hash().as_slice());
    assert_eq!(Boc::decode(&boc).unwrap().as_ref(), cell.as_ref());

    boc[13] ^= 0x01;
    assert_eq!(Boc::decode(&boc), Err(de::Error::InvalidHash));

    boc[13] ^= 0x01;
    boc[46] ^= 0x01;
    assert_eq!(Boc::decode(&boc), Err(de::Error::InvalidHash));
}

#[test]
fn index_and_cache_bits_are_verified() {
    let shared = cell_with_bytes(b"shared", &[]);
    let tree = cell_with_bytes(b"root", &[shared.clone(), shared]);

    let mode = BocMode::WITH_INDEX | BocMode::WITH_CACHE_BITS;
    let boc = Boc::encode_ext(tree.as_ref(), mode).unwrap();
    assert_eq!(Boc::decode(&boc).unwrap().as_ref(), tree.as_ref());

    // Header is 10 bytes, the root table takes 1 more
    let index_offset = 11;

    // Only the shared cell is marked
    assert_eq!(boc[index_offset] & 1, 0);
    assert_eq!(boc[index_offset + 1] & 1, 1);

    let mut data = boc.clone();
    data[index_offset + 1] ^= 0x01;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidCacheBits));

    let mut data = boc.clone();
    data[index_offset] ^= 0x02;
    assert_eq!(Boc::decode(&data), Err(de::Error::InvalidIndex));
}

#[test]
fn unsupported_cells_are_not_serialized() {
    let pruned = make_pruned_branch(abcd_cell().as_ref(), 0, &mut EmptyCellContext).unwrap();
    let with_pruned = cell_with_bytes(b"root", &[pruned.clone()]);
    let virtual_cell = with_pruned.virtualize();
    assert_eq!(virtual_cell.virtualization(), 1);

    assert_eq!(
        Boc::encode(virtual_cell.as_ref()),
        Err(ser::Error::VirtualizedCell)
    );
    assert!(Boc::encode(pruned.as_ref()).is_ok());
}

#[test]
fn std_wrappers() {
    assert_eq!(std_boc_deserialize(&[], true), Ok(None));
    assert!(std_boc_deserialize(&[], false).is_err());
    assert_eq!(std_boc_deserialize_multi(&[], 10), Ok(Vec::new()));
    assert_eq!(std_boc_serialize_multi(&[], BocMode::all()), Ok(Vec::new()));

    let cell = abcd_cell();
    let boc = std_boc_serialize(cell.as_ref(), BocMode::WITH_CRC32C).unwrap();
    assert_eq!(std_boc_deserialize(&boc, false), Ok(Some(cell)));

    // Roots with non-zero level are rejected
    let boc = std_boc_serialize(hands_tree().as_ref(), BocMode::empty()).unwrap();
    assert_eq!(
        std_boc_deserialize(&boc, false),
        Err(BocError::NotStandardBoc)
    );
    assert_eq!(
        std_boc_deserialize_multi(&boc, 1),
        Err(BocError::NotStandardBoc)
    );
}

#[test]
fn base64_round_trip() {
    let cell = abcd_cell();
    let encoded = Boc::encode_base64(cell.as_ref()).unwrap();
    assert_eq!(Boc::decode_base64(&encoded).unwrap(), cell);
    assert_eq!(
        Boc::decode_base64("not a base64!"),
        Err(de::Error::InvalidBase64)
    );
}

#[cfg(feature = "serde")]
#[derive(::serde::Serialize, ::serde::Deserialize)]
struct SerdeWithCell {
    #[serde(with = "Boc")]
    some_cell: Cell,
    other_cell: Cell,
}

#[cfg(feature = "serde")]
#[test]
fn serde_round_trip() {
    let value = SerdeWithCell {
        some_cell: abcd_cell(),
        other_cell: Cell::empty_cell(),
    };

    let json = serde_json::to_string(&value).unwrap();
    let expected = format!(
        r#"{{"some_cell":"{}","other_cell":"{}"}}"#,
        Boc::encode_base64(abcd_cell().as_ref()).unwrap(),
        Boc::encode_base64(Cell::empty_cell_ref()).unwrap(),
    );
    assert_eq!(json, expected);

    let decoded: SerdeWithCell = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded.some_cell, value.some_cell);
    assert_eq!(decoded.other_cell, value.other_cell);

    let invalid = r#"{"some_cell":"???","other_cell":"???"}"#;
    assert!(serde_json::from_str::<SerdeWithCell>(invalid).is_err());
}

#[cfg(feature = "serde")]
#[test]
fn serde_hash_bytes() {
    let cell = abcd_cell();
    let hash = *cell.repr_hash();

    let json = serde_json::to_string(&hash).unwrap();
    assert_eq!(json, format!("\"{}\"", hex::encode(hash.as_slice())));
    assert_eq!(serde_json::from_str::<HashBytes>(&json).unwrap(), hash);

    assert!(serde_json::from_str::<HashBytes>("\"abcd\"").is_err());
}
