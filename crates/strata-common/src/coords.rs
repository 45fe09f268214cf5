//! Coordinate types for chunk columns, regions, and sections.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of chunk columns along one edge of a region.
pub const REGION_EDGE: i32 = 32;

/// Chunk columns held by one region file (32 × 32).
pub const CHUNKS_PER_REGION: usize = (REGION_EDGE * REGION_EDGE) as usize;

/// Chunk column coordinate in the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    /// X coordinate in chunk space
    pub x: i32,
    /// Z coordinate in chunk space
    pub z: i32,
}

impl ChunkPos {
    /// Creates a new chunk position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Region that owns this chunk column.
    #[must_use]
    pub const fn region(self) -> RegionPos {
        RegionPos {
            x: self.x >> 5,
            z: self.z >> 5,
        }
    }

    /// Linear slot index within the owning region, in `[0, 1024)`.
    #[must_use]
    pub const fn region_local_index(self) -> usize {
        ((self.x & 31) + (self.z & 31) * 32) as usize
    }

    /// Position displaced by the given chunk deltas.
    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            z: self.z + dz,
        }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Region coordinate (identifies a 32 × 32 block of chunk columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionPos {
    /// X coordinate in region space
    pub x: i32,
    /// Z coordinate in region space
    pub z: i32,
}

impl RegionPos {
    /// Creates a new region position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Lowest chunk position contained in this region.
    #[must_use]
    pub const fn min_chunk(self) -> ChunkPos {
        ChunkPos {
            x: self.x << 5,
            z: self.z << 5,
        }
    }

    /// Whether the given chunk column falls inside this region.
    #[must_use]
    pub const fn contains(self, chunk: ChunkPos) -> bool {
        chunk.x >> 5 == self.x && chunk.z >> 5 == self.z
    }
}

impl fmt::Display for RegionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Section coordinate (identifies a 16 × 16 × 16 sub-volume of a chunk column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionPos {
    /// X coordinate in chunk space
    pub x: i32,
    /// Vertical section index
    pub y: i32,
    /// Z coordinate in chunk space
    pub z: i32,
}

impl SectionPos {
    /// Creates a new section position.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Section at the given vertical index of a chunk column.
    #[must_use]
    pub const fn of(column: ChunkPos, y: i32) -> Self {
        Self {
            x: column.x,
            y,
            z: column.z,
        }
    }

    /// Chunk column this section belongs to.
    #[must_use]
    pub const fn column(self) -> ChunkPos {
        ChunkPos {
            x: self.x,
            z: self.z,
        }
    }
}

impl fmt::Display for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}
