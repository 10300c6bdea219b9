//! Small newtype identifiers: a `#[repr(transparent)]` wrapper around the
//! raw integer, `Pod`/`Zeroable` so it can sit directly inside an on-disk
//! struct, plus the handful of conversions call sites actually need.

use bytemuck::{Pod, Zeroable};
use core::fmt;

/// A 1-based inode number. Inode 0 never denotes a live inode; directory
/// engines use it as the tombstone marker for a free dirent slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// Inode 1 is the default root, absent a `root=` mount option override.
    pub const ROOT: Self = Self(1);

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for InodeNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<InodeNumber> for u64 {
    fn from(value: InodeNumber) -> Self {
        value.0
    }
}

/// A physical block number (absolute, volume-wide).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for BlockNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<BlockNumber> for u64 {
    fn from(value: BlockNumber) -> Self {
        value.0
    }
}

impl core::ops::Add<u64> for BlockNumber {
    type Output = BlockNumber;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl core::ops::Sub for BlockNumber {
    type Output = u64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

/// A block-group index (0-based).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct GroupNumber(pub u64);

impl From<u64> for GroupNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<GroupNumber> for u64 {
    fn from(value: GroupNumber) -> Self {
        value.0
    }
}
