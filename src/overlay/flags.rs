//! Path flag word
//!
//! The low bits are persisted to the store; the high bits are computed
//! during lookup and never written.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bit set describing the overlay state of a path
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PathFlags(u32);

impl PathFlags {
    /// No flags
    pub const NONE: PathFlags = PathFlags(0);
    /// The path itself was marked deleted
    pub const DELETED: PathFlags = PathFlags(0x0000_0001);
    /// The path itself was relocated
    pub const RELOCATED: PathFlags = PathFlags(0x0000_0002);
    /// The data was found in a snapshot layer
    pub const IN_SNAPSHOT: PathFlags = PathFlags(0x0000_0004);
    /// An ancestor of the path is deleted
    pub const PATH_DELETED: PathFlags = PathFlags(0x0001_0000);
    /// An ancestor of the path is relocated
    pub const PATH_RELOCATED: PathFlags = PathFlags(0x0002_0000);
    /// Some descendant is deleted or relocated
    pub const CHILDREN_DELETED: PathFlags = PathFlags(0x0004_0000);

    /// Bits written to the store
    pub const PERSISTED: PathFlags = PathFlags(0x0000_0003);
    /// Either form of deletion
    pub const ANY_DELETED: PathFlags = PathFlags(0x0001_0001);
    /// Either form of relocation
    pub const ANY_RELOCATED: PathFlags = PathFlags(0x0002_0002);

    pub const fn from_bits(bits: u32) -> Self {
        PathFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if any bit of `other` is set
    pub const fn intersects(self, other: PathFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: PathFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PathFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PathFlags) {
        self.0 &= !other.0;
    }

    /// Deleted either exactly or through an ancestor
    pub const fn is_deleted(self) -> bool {
        self.intersects(Self::ANY_DELETED)
    }

    /// Relocated either exactly or through an ancestor
    pub const fn is_relocated(self) -> bool {
        self.intersects(Self::ANY_RELOCATED)
    }

    /// Keep only the bits that are written to the store
    pub const fn persisted(self) -> PathFlags {
        PathFlags(self.0 & Self::PERSISTED.0)
    }
}

impl BitOr for PathFlags {
    type Output = PathFlags;

    fn bitor(self, rhs: PathFlags) -> PathFlags {
        PathFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PathFlags {
    fn bitor_assign(&mut self, rhs: PathFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PathFlags {
    type Output = PathFlags;

    fn bitand(self, rhs: PathFlags) -> PathFlags {
        PathFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for PathFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PathFlags, &str); 6] = [
            (PathFlags::DELETED, "DELETED"),
            (PathFlags::RELOCATED, "RELOCATED"),
            (PathFlags::IN_SNAPSHOT, "IN_SNAPSHOT"),
            (PathFlags::PATH_DELETED, "PATH_DELETED"),
            (PathFlags::PATH_RELOCATED, "PATH_RELOCATED"),
            (PathFlags::CHILDREN_DELETED, "CHILDREN_DELETED"),
        ];

        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{} ({:#x})", names.join(" | "), self.0)
    }
}

impl fmt::Display for PathFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
