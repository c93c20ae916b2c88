use super::level_mask::LevelMask;
use super::CellType;

/// Two-byte header of a serialized cell.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct CellDescriptor {
    /// References count, exotic flag, "with hashes" flag and the level mask.
    pub d1: u8,
    /// Bit length of the data in a compact form.
    pub d2: u8,
}

impl CellDescriptor {
    /// Bit mask for the references count.
    pub const REF_COUNT_MASK: u8 = 0b0000_0111;
    /// Bit mask for the exotic flag.
    pub const IS_EXOTIC_MASK: u8 = 0b0000_1000;
    /// Bit mask for the "with hashes" flag.
    pub const STORE_HASHES_MASK: u8 = 0b0001_0000;
    /// Bit offset of the level mask.
    pub const LEVEL_MASK_SHIFT: u8 = 5;

    /// References count of an absent cell.
    pub const ABSENT_REF_COUNT: u8 = 7;

    #[inline(always)]
    pub const fn new(bytes: [u8; 2]) -> Self {
        Self {
            d1: bytes[0],
            d2: bytes[1],
        }
    }

    /// Computes the first descriptor byte.
    #[inline(always)]
    pub const fn compute_d1(level_mask: LevelMask, is_exotic: bool, ref_count: u8) -> u8 {
        (level_mask.to_byte() << Self::LEVEL_MASK_SHIFT)
            | ((is_exotic as u8) << 3)
            | (ref_count & Self::REF_COUNT_MASK)
    }

    /// Computes the second descriptor byte.
    #[inline(always)]
    pub const fn compute_d2(bit_len: u16) -> u8 {
        (((bit_len >> 2) as u8) & !0b1) | ((bit_len % 8 != 0) as u8)
    }

    #[inline(always)]
    pub const fn reference_count(&self) -> u8 {
        self.d1 & Self::REF_COUNT_MASK
    }

    #[inline(always)]
    pub const fn is_exotic(&self) -> bool {
        self.d1 & Self::IS_EXOTIC_MASK != 0
    }

    #[inline(always)]
    pub const fn store_hashes(&self) -> bool {
        self.d1 & Self::STORE_HASHES_MASK != 0
    }

    /// Absent cells are only allowed in BoC and are not supported.
    #[inline(always)]
    pub const fn is_absent(&self) -> bool {
        self.reference_count() == Self::ABSENT_REF_COUNT
    }

    #[inline(always)]
    pub const fn level_mask(&self) -> LevelMask {
        LevelMask::new(self.d1 >> Self::LEVEL_MASK_SHIFT)
    }

    /// Number of hashes (and depths) which describe this cell.
    #[inline(always)]
    pub const fn hash_count(&self) -> u8 {
        self.level_mask().hash_count()
    }

    #[inline(always)]
    pub const fn is_aligned(&self) -> bool {
        self.d2 & 1 == 0
    }

    #[inline(always)]
    pub const fn byte_len(&self) -> u8 {
        (self.d2 & 1) + (self.d2 >> 1)
    }

    /// Returns a copy with the "with hashes" flag changed.
    #[inline(always)]
    pub const fn with_store_hashes(self, store_hashes: bool) -> Self {
        let d1 = if store_hashes {
            self.d1 | Self::STORE_HASHES_MASK
        } else {
            self.d1 & !Self::STORE_HASHES_MASK
        };
        Self { d1, d2: self.d2 }
    }

    /// Returns a copy with the level mask replaced.
    #[inline(always)]
    pub const fn with_level_mask(self, level_mask: LevelMask) -> Self {
        let d1 = (self.d1 & !(0b111 << Self::LEVEL_MASK_SHIFT))
            | (level_mask.to_byte() << Self::LEVEL_MASK_SHIFT);
        Self { d1, d2: self.d2 }
    }

    /// Descriptor as it is used in the hash representation of the specified level.
    #[inline(always)]
    pub const fn for_level(self, level: u8, cell_type: CellType) -> Self {
        let mask = if matches!(cell_type, CellType::PrunedBranch) {
            self.level_mask()
        } else {
            self.level_mask().apply(level)
        };
        self.with_store_hashes(false).with_level_mask(mask)
    }

    #[inline(always)]
    pub const fn to_bytes(self) -> [u8; 2] {
        [self.d1, self.d2]
    }
}
