//! BOC (Bag Of Cells) implementation.

use crate::cell::{Cell, CellContext, DynCell, EmptyCellContext};

/// BOC decoder implementation.
pub mod de;
/// BOC encoder implementation.
pub mod ser;

#[cfg(feature = "serde")]
mod serde;

#[cfg(test)]
mod tests;

/// Default root count limit for the standard wrappers.
pub const DEFAULT_MAX_ROOTS: usize = 16384;

/// BOC file magic number.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum BocTag {
    /// Single root, cells index, no CRC32.
    Indexed,
    /// Single root, cells index, with CRC32.
    IndexedCrc32,
    /// Multiple roots, optional cells index, optional CRC32.
    #[default]
    Generic,
}

impl BocTag {
    const INDEXED: [u8; 4] = [0x68, 0xff, 0x65, 0xf3];
    const INDEXED_CRC32: [u8; 4] = [0xac, 0xc3, 0xa7, 0x28];
    const GENERIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

    /// Tries to match bytes with BOC tag.
    pub const fn from_bytes(data: [u8; 4]) -> Option<Self> {
        match data {
            Self::GENERIC => Some(Self::Generic),
            Self::INDEXED_CRC32 => Some(Self::IndexedCrc32),
            Self::INDEXED => Some(Self::Indexed),
            _ => None,
        }
    }

    /// Converts BOC tag to bytes.
    pub const fn to_bytes(self) -> [u8; 4] {
        match self {
            Self::Indexed => Self::INDEXED,
            Self::IndexedCrc32 => Self::INDEXED_CRC32,
            Self::Generic => Self::GENERIC,
        }
    }
}

bitflags::bitflags! {
    /// Optional parts of the serialized BOC.
    #[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
    pub struct BocMode: u8 {
        /// Store the cell offsets index.
        const WITH_INDEX = 1;
        /// Append CRC32C of the whole BOC.
        const WITH_CRC32C = 1 << 1;
        /// Store hashes of the root cells.
        const WITH_TOP_HASH = 1 << 2;
        /// Store hashes of the cells with big subtrees.
        const WITH_INT_HASHES = 1 << 3;
        /// Mark cells which are referenced more than once.
        /// Requires [`WITH_INDEX`].
        ///
        /// [`WITH_INDEX`]: BocMode::WITH_INDEX
        const WITH_CACHE_BITS = 1 << 4;
    }
}

/// BOC (Bag Of Cells) helper.
pub struct Boc;

impl Boc {
    /// Encodes the specified cell tree as BOC without any optional parts.
    pub fn encode<T>(cell: &T) -> Result<Vec<u8>, ser::Error>
    where
        T: AsRef<DynCell> + ?Sized,
    {
        Self::encode_ext(cell, BocMode::empty())
    }

    /// Encodes the specified cell tree as BOC with the specified mode.
    pub fn encode_ext<T>(cell: &T, mode: BocMode) -> Result<Vec<u8>, ser::Error>
    where
        T: AsRef<DynCell> + ?Sized,
    {
        let mut serializer = ser::BocSerializer::new();
        serializer.add_root(cell.as_ref());
        serializer.serialize(mode)
    }

    /// Encodes the specified cell tree as BOC and
    /// returns the `base64` encoded bytes as a string.
    #[cfg(any(feature = "base64", test))]
    pub fn encode_base64<T>(cell: &T) -> Result<String, ser::Error>
    where
        T: AsRef<DynCell> + ?Sized,
    {
        Self::encode(cell).map(crate::util::encode_base64)
    }

    /// Decodes a `base64` encoded BOC into a cell tree.
    #[cfg(any(feature = "base64", test))]
    pub fn decode_base64<T: AsRef<[u8]>>(data: T) -> Result<Cell, de::Error> {
        fn decode_base64_impl(data: &[u8]) -> Result<Cell, de::Error> {
            match crate::util::decode_base64(data) {
                Ok(data) => Boc::decode_ext(data.as_slice(), &mut EmptyCellContext),
                Err(_) => Err(de::Error::InvalidBase64),
            }
        }
        decode_base64_impl(data.as_ref())
    }

    /// Decodes a cell tree with exactly one root.
    #[inline]
    pub fn decode<T>(data: T) -> Result<Cell, de::Error>
    where
        T: AsRef<[u8]>,
    {
        Self::decode_ext(data.as_ref(), &mut EmptyCellContext)
    }

    /// Decodes a cell tree with exactly one root using the specified context.
    pub fn decode_ext(data: &[u8], context: &mut dyn CellContext) -> Result<Cell, de::Error> {
        let header = ok!(de::BocHeader::decode(data, &de::Options::exact(1)));

        let Some(&root) = header.roots().first() else {
            return Err(de::Error::RootCellNotFound);
        };

        let cells = ok!(header.finalize(context));
        match cells.get(root) {
            Some(root) => Ok(root),
            None => Err(de::Error::RootOutOfBounds),
        }
    }

    /// Decodes all roots of a BOC.
    pub fn decode_multi<T>(data: T, max_roots: usize) -> Result<Vec<Cell>, de::Error>
    where
        T: AsRef<[u8]>,
    {
        let options = de::Options {
            min_roots: None,
            max_roots: Some(max_roots),
        };
        let header = ok!(de::BocHeader::decode(data.as_ref(), &options));
        let cells = ok!(header.finalize(&mut EmptyCellContext));

        let mut roots = Vec::with_capacity(header.roots().len());
        for &root in header.roots() {
            match cells.get(root) {
                Some(cell) => roots.push(cell),
                None => return Err(de::Error::RootOutOfBounds),
            }
        }
        Ok(roots)
    }
}

/// Error type for the standard BOC wrappers.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BocError {
    /// Failed to parse the BOC.
    #[error(transparent)]
    Decode(#[from] de::Error),
    /// Failed to serialize the BOC.
    #[error(transparent)]
    Encode(#[from] ser::Error),
    /// BOC has more than one root or a root with non-zero level.
    #[error("bag of cells must have exactly one root with zero level")]
    NotStandardBoc,
}

/// Deserializes a BOC with exactly one level-0 root.
///
/// Returns `None` for empty input when `can_be_empty` is set.
pub fn std_boc_deserialize(data: &[u8], can_be_empty: bool) -> Result<Option<Cell>, BocError> {
    if data.is_empty() && can_be_empty {
        return Ok(None);
    }

    let root = match Boc::decode(data) {
        Ok(root) => root,
        Err(de::Error::TooManyRootCells) => return Err(BocError::NotStandardBoc),
        Err(e) => return Err(BocError::Decode(e)),
    };
    if root.level() != 0 {
        return Err(BocError::NotStandardBoc);
    }
    Ok(Some(root))
}

/// Deserializes a BOC with at most `max_roots` level-0 roots.
pub fn std_boc_deserialize_multi(data: &[u8], max_roots: usize) -> Result<Vec<Cell>, BocError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let roots = ok!(Boc::decode_multi(data, max_roots).map_err(BocError::Decode));
    if roots.iter().any(|root| root.level() != 0) {
        return Err(BocError::NotStandardBoc);
    }
    Ok(roots)
}

/// Serializes a single root with the specified mode.
pub fn std_boc_serialize(root: &DynCell, mode: BocMode) -> Result<Vec<u8>, BocError> {
    let mut serializer = ser::BocSerializer::new();
    serializer.add_root(root);
    serializer.serialize(mode).map_err(BocError::Encode)
}

/// Serializes all roots with the specified mode.
///
/// An empty list of roots produces an empty output.
pub fn std_boc_serialize_multi(roots: &[Cell], mode: BocMode) -> Result<Vec<u8>, BocError> {
    if roots.is_empty() {
        return Ok(Vec::new());
    }
    if roots.len() > DEFAULT_MAX_ROOTS {
        return Err(BocError::Encode(ser::Error::TooManyRoots));
    }

    let mut serializer = ser::BocSerializer::new();
    for root in roots {
        serializer.add_root(root.as_ref());
    }
    serializer.serialize(mode).map_err(BocError::Encode)
}
