use std::ops::{BitOr, BitOrAssign};

/// Bitmask of the significant levels of a cell.
///
/// Bit `i` is set when level `i + 1` has its own hash and depth.
#[derive(Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LevelMask(u8);

impl LevelMask {
    /// Mask of a cell without any higher levels.
    pub const EMPTY: Self = LevelMask(0);
    /// Max cell level.
    pub const MAX_LEVEL: u8 = 3;

    /// Constructs new level mask, truncating extra bits
    #[inline(always)]
    pub const fn new(mask: u8) -> Self {
        Self(mask & 0b111)
    }

    /// Returns `true` if no levels are set.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Underlying mask bits.
    #[inline(always)]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// Creates a sufficient mask for the specified level
    ///
    /// NOTE: levels > 3 has no effect (mask will always be `0b111`)
    #[inline(always)]
    pub const fn from_level(level: u8) -> Self {
        Self(match level {
            0 => 0,
            1 => 1,
            2 => 3,
            _ => 7,
        })
    }

    /// Creates a mask with only the specified level set.
    ///
    /// Level 0 has no bit, so an empty mask is returned for it.
    #[inline(always)]
    pub const fn one_level(level: u8) -> Self {
        match level {
            0 => Self::EMPTY,
            1..=3 => Self(1 << (level - 1)),
            _ => Self::EMPTY,
        }
    }

    /// Counts presented higher hashes
    pub const fn level(&self) -> u8 {
        (self.0 & 1) + ((self.0 >> 1) & 1) + ((self.0 >> 2) & 1)
    }

    /// Returns the highest significant level.
    ///
    /// Differs from [`level`] for masks with gaps, e.g. `0b100`.
    ///
    /// [`level`]: LevelMask::level
    #[inline(always)]
    pub const fn max_level(&self) -> u8 {
        (u8::BITS - self.0.leading_zeros()) as u8
    }

    /// Computes hash index for the specified level
    pub const fn hash_index(&self, level: u8) -> u8 {
        Self(self.0 & Self::from_level(level).0).level()
    }

    /// Number of hashes stored for a cell with this mask.
    #[inline(always)]
    pub const fn hash_count(&self) -> u8 {
        self.level() + 1
    }

    /// Returns whether the specified level has its own hash.
    #[inline(always)]
    pub const fn is_significant(&self, level: u8) -> bool {
        level == 0 || (level <= Self::MAX_LEVEL && (self.0 >> (level - 1)) & 1 != 0)
    }

    /// Leaves only the levels below the specified one.
    #[inline(always)]
    pub const fn apply(&self, level: u8) -> Self {
        Self(self.0 & Self::from_level(level).0)
    }

    /// Creates a new mask, shifted by the offset
    #[inline(always)]
    pub const fn virtualize(&self, offset: u8) -> Self {
        if offset >= 8 {
            Self::EMPTY
        } else {
            Self(self.0 >> offset)
        }
    }

    /// Iterates over significant levels in ascending order.
    pub fn significant_levels(self) -> impl Iterator<Item = u8> + Clone {
        (0..=Self::MAX_LEVEL).filter(move |level| self.is_significant(*level))
    }
}

impl PartialEq<u8> for LevelMask {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl BitOr for LevelMask {
    type Output = Self;

    #[inline(always)]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LevelMask {
    #[inline(always)]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<LevelMask> for u8 {
    #[inline(always)]
    fn from(m: LevelMask) -> u8 {
        m.0
    }
}

impl std::fmt::Debug for LevelMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:03b}", self.0))
    }
}
