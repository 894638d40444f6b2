//! This module contains the data structures that decide what is rendered:
//! the [`TerrainQuadtree`](quadtree::TerrainQuadtree), which adapts itself to the view each
//! frame, and the [`TileTreeSync`](tile_tree::TileTreeSync), which mirrors it and leases the
//! per quad data from a [`TileProducer`](tile_cache::TileProducer).
//!
//! # Explanation
//! Each terrain owns one quadtree and one tile tree per sampler.
//! Samplers that reference the same storage share a single tile cache, so that tiles
//! are only produced once.
//! Production is modelled as tasks in a [`TaskGraph`](task::TaskGraph), which the cache
//! executes cooperatively before the terrain is drawn.

use bevy::math::IVec2;
use derive_more::derive::Display;
use serde::{Deserialize, Serialize};

pub mod horizon;
pub mod quadtree;
pub mod task;
pub mod tile_cache;
pub mod tile_tree;

/// The identifier of a quad and of the tile holding its data.
///
/// Level 0 is the root with the lowest level of detail.
/// The tile position is counted in tiles from the lower left corner of the root.
#[derive(
    Copy, Clone, Default, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Display, Serialize, Deserialize,
)]
#[display("{level}_{tx}_{ty}")]
pub struct QuadCoordinate {
    pub level: u32,
    pub tx: u32,
    pub ty: u32,
}

impl QuadCoordinate {
    pub const ROOT: QuadCoordinate = QuadCoordinate {
        level: 0,
        tx: 0,
        ty: 0,
    };

    /// The deepest level whose tile positions fit into a `u32`.
    pub const MAX_LEVEL: u32 = 31;

    pub fn new(level: u32, tx: u32, ty: u32) -> Self {
        Self { level, tx, ty }
    }

    /// The number of tiles per axis at the given level, saturating beyond [`Self::MAX_LEVEL`].
    pub fn count(level: u32) -> u32 {
        1u32.checked_shl(level).unwrap_or(u32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        let count = Self::count(self.level);

        self.level <= Self::MAX_LEVEL && self.tx < count && self.ty < count
    }

    pub fn xy(&self) -> IVec2 {
        IVec2::new(self.tx as i32, self.ty as i32)
    }

    /// The parent of the root is the root itself.
    pub fn parent(self) -> Self {
        if self.level == 0 {
            return self;
        }

        Self {
            level: self.level - 1,
            tx: self.tx >> 1,
            ty: self.ty >> 1,
        }
    }

    /// The ancestor `levels` levels above this coordinate.
    pub fn ancestor(self, levels: u32) -> Self {
        let levels = levels.min(self.level);

        Self {
            level: self.level - levels,
            tx: self.tx >> levels,
            ty: self.ty >> levels,
        }
    }

    /// The child with the given index, where 0 is bottom left, 1 bottom right,
    /// 2 top left and 3 top right.
    pub fn child(self, index: usize) -> Self {
        Self {
            level: self.level + 1,
            tx: (self.tx << 1) + (index % 2) as u32,
            ty: (self.ty << 1) + (index / 2) as u32,
        }
    }

    pub fn children(self) -> impl Iterator<Item = Self> {
        (0..4).map(move |index| self.child(index))
    }

    /// The index of this coordinate among the children of its parent.
    pub fn child_index(&self) -> usize {
        (self.tx % 2 + 2 * (self.ty % 2)) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_child_relation() {
        let coordinate = QuadCoordinate::new(3, 5, 2);

        assert_eq!(coordinate.to_string(), "3_5_2");
        assert!(coordinate.is_valid());
        assert!(!QuadCoordinate::new(2, 4, 0).is_valid());

        for (index, child) in coordinate.children().enumerate() {
            assert_eq!(child.level, 4);
            assert_eq!(child.child_index(), index);
            assert_eq!(child.parent(), coordinate);
        }

        assert_eq!(coordinate.child(0), QuadCoordinate::new(4, 10, 4));
        assert_eq!(coordinate.child(3), QuadCoordinate::new(4, 11, 5));
        assert_eq!(coordinate.ancestor(2), QuadCoordinate::new(1, 1, 0));
        assert_eq!(QuadCoordinate::ROOT.parent(), QuadCoordinate::ROOT);
    }

    #[test]
    fn levels_beyond_the_deepest_are_invalid() {
        let max = QuadCoordinate::MAX_LEVEL;

        assert_eq!(QuadCoordinate::count(max), 1 << 31);
        assert!(QuadCoordinate::new(max, (1 << 31) - 1, 0).is_valid());
        assert!(!QuadCoordinate::new(max, 1 << 31, 0).is_valid());

        assert_eq!(QuadCoordinate::count(max + 1), u32::MAX);
        assert!(!QuadCoordinate::new(max + 1, 0, 0).is_valid());
        assert!(!QuadCoordinate::new(40, 7, 3).is_valid());
    }
}
