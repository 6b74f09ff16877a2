//! Integer block geometry: positions and inclusive axis-aligned boxes.
//!
//! Every comparison is inclusive of boundary coordinates and every quantity is
//! an integer, so the create path and later validation passes always agree on
//! whether two claims overlap.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A block position in world-local coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    /// East/west.
    pub x: i32,
    /// Vertical.
    pub y: i32,
    /// North/south.
    pub z: i32,
}

impl BlockPos {
    /// Creates a block position.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Reasons a box cannot be used as claim bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    /// The horizontal footprint is a single column.
    #[error("bounds have no horizontal extent")]
    Degenerate,
    /// `min` exceeds `max` on some axis (only possible for deserialized boxes).
    #[error("bounds corners are inverted")]
    Inverted,
    /// Narrower than the configured minimum width.
    #[error("claim is {width} blocks wide, minimum is {min}")]
    TooNarrow {
        /// Narrowest horizontal width of the box.
        width: u64,
        /// Configured minimum.
        min: u64,
    },
    /// Smaller than the configured minimum area.
    #[error("claim covers {area} blocks, minimum is {min}")]
    TooSmall {
        /// Horizontal area of the box.
        area: u64,
        /// Configured minimum.
        min: u64,
    },
}

/// An inclusive axis-aligned box. `min` is component-wise `<=` `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimBounds {
    min: BlockPos,
    max: BlockPos,
}

impl ClaimBounds {
    /// Builds a box from any two opposite corners.
    pub fn new(a: BlockPos, b: BlockPos) -> Self {
        Self {
            min: BlockPos::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: BlockPos::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Shorthand for `new` with raw coordinates.
    pub fn from_coords(min: (i32, i32, i32), max: (i32, i32, i32)) -> Self {
        Self::new(
            BlockPos::new(min.0, min.1, min.2),
            BlockPos::new(max.0, max.1, max.2),
        )
    }

    /// Lesser corner.
    pub fn min(&self) -> BlockPos {
        self.min
    }

    /// Greater corner.
    pub fn max(&self) -> BlockPos {
        self.max
    }

    /// Checks the structural invariants: ordered corners and a horizontal
    /// footprint wider than a single column.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z {
            return Err(GeometryError::Inverted);
        }
        if self.min.x == self.max.x && self.min.z == self.max.z {
            return Err(GeometryError::Degenerate);
        }
        Ok(())
    }

    /// Number of blocks along X.
    pub fn width_x(&self) -> u64 {
        span(self.min.x, self.max.x)
    }

    /// Number of blocks along Z.
    pub fn width_z(&self) -> u64 {
        span(self.min.z, self.max.z)
    }

    /// Number of blocks along Y.
    pub fn height(&self) -> u64 {
        span(self.min.y, self.max.y)
    }

    /// Horizontal footprint in blocks. This is what claim blocks pay for.
    pub fn area(&self) -> u64 {
        self.width_x() * self.width_z()
    }

    /// Block count of the whole box.
    pub fn volume(&self) -> u64 {
        self.area() * self.height()
    }

    /// `true` if `pos` lies inside or on the boundary.
    pub fn contains_point(&self, pos: BlockPos) -> bool {
        pos.x >= self.min.x
            && pos.x <= self.max.x
            && pos.y >= self.min.y
            && pos.y <= self.max.y
            && pos.z >= self.min.z
            && pos.z <= self.max.z
    }

    /// `true` if `other` lies entirely inside this box (boundaries may touch).
    pub fn contains(&self, other: &ClaimBounds) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// `true` if the boxes share at least one block.
    pub fn intersects(&self, other: &ClaimBounds) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
            && self.min.z <= other.max.z
            && other.min.z <= self.max.z
    }
}

impl fmt::Display for ClaimBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

fn span(min: i32, max: i32) -> u64 {
    (i64::from(max) - i64::from(min) + 1) as u64
}
