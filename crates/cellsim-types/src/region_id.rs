//! Hierarchical region identifiers.
//!
//! A [`RegionId`] names a node of the binary space-partition tree by the path
//! taken from the root: one bit per level, `0` for the low child and `1` for
//! the high child along the split axis. The root is the empty path.
//!
//! The path is stored as a `u64` bit vector (step `i` at bit `i`) with an
//! explicit depth, so the tree is at most [`MAX_DEPTH`] levels deep. Bits at
//! or above `depth` are always zero.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum number of levels below the root.
pub const MAX_DEPTH: u8 = 64;

/// Which half of a split a child occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    /// The half below the split plane (path bit `0`).
    Low,
    /// The half at or above the split plane (path bit `1`).
    High,
}

impl Side {
    /// Return the other side.
    pub const fn flip(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }

    const fn bit(self) -> u64 {
        match self {
            Self::Low => 0,
            Self::High => 1,
        }
    }
}

/// Identifier of a node in the space-partition tree.
///
/// Ordering is by depth first, then by path bits, so sorting a set of ids
/// lists shallower regions before deeper ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId {
    depth: u8,
    path: u64,
}

/// Mask selecting the low `depth` bits of a path.
fn mask(depth: u8) -> u64 {
    1_u64
        .checked_shl(u32::from(depth))
        .map_or(u64::MAX, |bit| bit.wrapping_sub(1))
}

fn bit_at(level: u8) -> u64 {
    1_u64.checked_shl(u32::from(level)).unwrap_or(0)
}

impl RegionId {
    /// The root region (empty path).
    pub const ROOT: Self = Self { depth: 0, path: 0 };

    /// Return the root region.
    pub const fn root() -> Self {
        Self::ROOT
    }

    /// Build an id from an explicit path, root first.
    ///
    /// Returns `None` if the path is longer than [`MAX_DEPTH`].
    pub fn from_path(steps: &[Side]) -> Option<Self> {
        steps
            .iter()
            .try_fold(Self::ROOT, |id, &side| id.child(side))
    }

    /// Depth of the node (0 for the root).
    pub const fn depth(self) -> u8 {
        self.depth
    }

    /// Whether this is the root region.
    pub const fn is_root(self) -> bool {
        self.depth == 0
    }

    /// Derive the child on `side`, or `None` at [`MAX_DEPTH`].
    pub fn child(self, side: Side) -> Option<Self> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        let path = if side.bit() == 1 {
            self.path | bit_at(self.depth)
        } else {
            self.path
        };
        Some(Self {
            depth: self.depth.checked_add(1)?,
            path,
        })
    }

    /// Both children, low first.
    pub fn children(self) -> Option<[Self; 2]> {
        Some([self.child(Side::Low)?, self.child(Side::High)?])
    }

    /// The parent region, or `None` for the root.
    pub fn parent(self) -> Option<Self> {
        let depth = self.depth.checked_sub(1)?;
        Some(Self {
            depth,
            path: self.path & mask(depth),
        })
    }

    /// The other child of this node's parent, or `None` for the root.
    pub fn sibling(self) -> Option<Self> {
        let last = self.depth.checked_sub(1)?;
        Some(Self {
            depth: self.depth,
            path: self.path ^ bit_at(last),
        })
    }

    /// Which side of its parent this node occupies, or `None` for the root.
    pub fn side(self) -> Option<Side> {
        self.step(self.depth.checked_sub(1)?)
    }

    /// The step taken at `level` (0 = first step below the root).
    pub fn step(self, level: u8) -> Option<Side> {
        if level >= self.depth {
            return None;
        }
        if self.path & bit_at(level) == 0 {
            Some(Side::Low)
        } else {
            Some(Side::High)
        }
    }

    /// Iterate over the path from the root down.
    pub fn path(self) -> impl Iterator<Item = Side> {
        (0..self.depth).filter_map(move |level| self.step(level))
    }

    /// Truncate the path to `depth` levels.
    pub fn ancestor_at(self, depth: u8) -> Option<Self> {
        if depth > self.depth {
            return None;
        }
        Some(Self {
            depth,
            path: self.path & mask(depth),
        })
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(self, other: Self) -> bool {
        self.depth < other.depth && other.path & mask(self.depth) == self.path
    }

    /// Whether `self` is a strict descendant of `other`.
    pub fn is_descendant_of(self, other: Self) -> bool {
        other.is_ancestor_of(self)
    }

    /// The deepest region that is an ancestor-or-self of both ids.
    pub fn common_ancestor(self, other: Self) -> Self {
        let shared = self.depth.min(other.depth);
        let differing = (self.path ^ other.path) & mask(shared);
        let depth = if differing == 0 {
            shared
        } else {
            u8::try_from(differing.trailing_zeros()).unwrap_or(shared)
        };
        Self {
            depth,
            path: self.path & mask(depth),
        }
    }
}

impl Default for RegionId {
    fn default() -> Self {
        Self::ROOT
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("r")?;
        for side in self.path() {
            f.write_str(match side {
                Side::Low => "0",
                Side::High => "1",
            })?;
        }
        Ok(())
    }
}

/// Error returned when parsing a [`RegionId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid region id: {0:?}")]
pub struct ParseRegionIdError(pub String);

impl FromStr for RegionId {
    type Err = ParseRegionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('r')
            .ok_or_else(|| ParseRegionIdError(s.to_owned()))?;
        digits.chars().try_fold(Self::ROOT, |id, c| {
            let side = match c {
                '0' => Side::Low,
                '1' => Side::High,
                _ => return Err(ParseRegionIdError(s.to_owned())),
            };
            id.child(side).ok_or_else(|| ParseRegionIdError(s.to_owned()))
        })
    }
}
