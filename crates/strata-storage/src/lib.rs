//! # Strata Storage
//!
//! Chunk persistence for Project Strata.
//!
//! This crate handles:
//! - Paletted section containers with adaptive bit widths
//! - Sector-allocated region files with corruption recovery
//! - A single-writer io executor with write coalescing
//! - Per-chunk caching of section-keyed records

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod bit_storage;
pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod io_worker;
pub mod palette;
pub mod region;
pub mod region_storage;
pub mod registry;
pub mod section_storage;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bit_storage::*;
    pub use crate::codec::*;
    pub use crate::config::*;
    pub use crate::container::*;
    pub use crate::error::*;
    pub use crate::io_worker::*;
    pub use crate::palette::*;
    pub use crate::region::*;
    pub use crate::region_storage::*;
    pub use crate::registry::*;
    pub use crate::section_storage::*;
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_common::{ChunkPos, SectionPos};
    use tempfile::TempDir;

    #[test]
    fn test_packed_container_persists_through_region_storage() {
        let registry = Arc::new(Registry::from_values(0u32..64));
        let mut container =
            PalettedContainer::new(ContainerLayout::Blocks, Arc::clone(&registry), 0u32);
        container.set(0, 0, 0, 7);
        container.set(15, 15, 15, 23);
        container.set(8, 3, 12, 41);

        let bytes = bincode::serialize(&container.pack()).expect("serialize failed");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut storage =
            RegionFileStorage::new(dir.path().join("region"), Codec::Lz4, 4, None).unwrap();
        let pos = ChunkPos::new(12, -7);
        storage.write(pos, &bytes).unwrap();
        let restored = storage.read(pos).unwrap().expect("record missing");
        storage.close().unwrap();

        let packed: PackedContainer<u32> =
            bincode::deserialize(&restored).expect("deserialize failed");
        let unpacked = PalettedContainer::unpack(&packed, registry).unwrap();
        assert_eq!(*unpacked.get(0, 0, 0), 7);
        assert_eq!(*unpacked.get(15, 15, 15), 23);
        assert_eq!(*unpacked.get(8, 3, 12), 41);
        assert_eq!(*unpacked.get(1, 1, 1), 0);
    }

    #[test]
    fn test_section_storage_holds_packed_sections() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = StorageConfig::default();
        let registry = Arc::new(Registry::from_values(0u32..16));
        let pos = SectionPos::new(3, 2, -8);

        let mut container =
            PalettedContainer::new(ContainerLayout::Biomes, Arc::clone(&registry), 0u32);
        container.set(1, 1, 1, 5);

        let mut storage: SectionStorage<PackedContainer<u32>> =
            SectionStorage::open("sections", dir.path().join("sections"), &config).unwrap();
        storage.set(pos, container.pack()).unwrap();
        storage.close().unwrap();

        let mut reopened: SectionStorage<PackedContainer<u32>> =
            SectionStorage::open("sections", dir.path().join("sections"), &config).unwrap();
        let packed = reopened.get(pos).unwrap().expect("section missing").clone();
        reopened.close().unwrap();

        let restored = PalettedContainer::unpack(&packed, registry).unwrap();
        assert_eq!(*restored.get(1, 1, 1), 5);
        assert_eq!(*restored.get(0, 0, 0), 0);
    }
}
