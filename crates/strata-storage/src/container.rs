//! Paletted containers for fixed-size voxel volumes.
//!
//! A [`PalettedContainer`] pairs an adaptive [`Palette`] with a packed
//! [`BitStorage`] for one volume:
//! - Blocks: 16 × 16 × 16 = 4096 cells
//! - Biomes: 4 × 4 × 4 = 64 cells
//!
//! The palette strategy escalates with observed cardinality. When a write
//! introduces a value the current palette cannot accept, the container
//! rebuilds palette and storage one bit wider, migrates every cell, and
//! swaps the pair in as a whole; a failure part-way leaves the old pair
//! untouched.
//!
//! Structural mutation must be exclusive. An advisory guard panics when two
//! unsynchronized callers hit the same container, instead of corrupting it.
//! Plain reads bypass the guard.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::bit_storage::{bits_for, BitStorage, MAX_BITS};
use crate::error::{StorageError, StorageResult};
use crate::palette::Palette;
use crate::registry::Registry;

/// Geometry and strategy policy for one container family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerLayout {
    /// 16 × 16 × 16 block volumes.
    Blocks,
    /// 4 × 4 × 4 biome volumes.
    Biomes,
}

impl ContainerLayout {
    /// Bits per axis coordinate.
    #[must_use]
    pub const fn edge_bits(self) -> u32 {
        match self {
            Self::Blocks => 4,
            Self::Biomes => 2,
        }
    }

    /// Cells in one volume.
    #[must_use]
    pub const fn volume(self) -> usize {
        1 << (3 * self.edge_bits())
    }

    /// Linear cell index for local coordinates.
    #[must_use]
    pub const fn cell_index(self, x: u32, y: u32, z: u32) -> usize {
        let edge = self.edge_bits();
        let mask = (1u32 << edge) - 1;
        assert!(
            x <= mask && y <= mask && z <= mask,
            "local coordinate out of volume"
        );
        (((y << edge | z) << edge) | x) as usize
    }

    /// In-memory strategy for a requested width.
    ///
    /// Widths escalate monotonically: single, linear, hashed, global for
    /// blocks; biomes skip the hashed step. Block palettes below five bits
    /// all run linear at four.
    fn strategy(self, bits: u32) -> Strategy {
        match (self, bits) {
            (_, 0) => Strategy::Single,
            (Self::Blocks, 1..=4) => Strategy::Linear(4),
            (Self::Blocks, 5..=8) => Strategy::Hashed(bits),
            (Self::Blocks, _) => Strategy::Global,
            (Self::Biomes, 1..=3) => Strategy::Linear(bits),
            (Self::Biomes, _) => Strategy::Global,
        }
    }

    /// Width used by packed snapshots holding `len` distinct values.
    fn packed_bits(self, len: usize) -> u32 {
        let bits = bits_for(len);
        match self.strategy(bits) {
            Strategy::Single => 0,
            Strategy::Linear(b) | Strategy::Hashed(b) => b,
            // Snapshots carry an explicit value list, so large
            // cardinalities keep their literal width.
            Strategy::Global => bits,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Single,
    Linear(u32),
    Hashed(u32),
    Global,
}

impl Strategy {
    fn palette<T>(self, registry: &Arc<Registry<T>>) -> Palette<T>
    where
        T: Clone + Eq + Hash,
    {
        match self {
            Self::Single => Palette::single(),
            Self::Linear(bits) => Palette::linear(bits),
            Self::Hashed(bits) => Palette::hashed(bits),
            Self::Global => Palette::global(Arc::clone(registry)),
        }
    }

    fn storage_bits<T>(self, registry: &Registry<T>) -> u32
    where
        T: Clone + Eq + Hash,
    {
        match self {
            Self::Single => 0,
            Self::Linear(bits) | Self::Hashed(bits) => bits,
            Self::Global => {
                // Registry ids are packed directly.
                bits_for(registry.len())
            },
        }
    }
}

/// Advisory guard that turns concurrent structural access into a panic
/// instead of silent state corruption.
#[derive(Debug, Default)]
struct AccessGuard {
    held: AtomicBool,
}

impl AccessGuard {
    fn acquire(&self) {
        assert!(
            !self.held.swap(true, Ordering::Acquire),
            "paletted container accessed concurrently without synchronization"
        );
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Live palette + storage pair; replaced atomically on resize.
#[derive(Debug, Clone)]
struct Data<T> {
    palette: Palette<T>,
    storage: BitStorage,
}

/// Immutable wire form of a container: ordered distinct values plus the
/// packed index stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedContainer<T> {
    /// Volume family the snapshot was taken from.
    pub layout: ContainerLayout,
    /// Ordered distinct values; position in this list is the packed code.
    pub palette: Vec<T>,
    /// Bits per packed index.
    pub bits: u32,
    /// Packed index words.
    pub data: Vec<u64>,
}

/// Adaptive palette + packed storage for one fixed-size volume.
#[derive(Debug)]
pub struct PalettedContainer<T> {
    layout: ContainerLayout,
    registry: Arc<Registry<T>>,
    data: Data<T>,
    guard: AccessGuard,
}

impl<T> Clone for PalettedContainer<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            layout: self.layout,
            registry: Arc::clone(&self.registry),
            data: self.data.clone(),
            guard: AccessGuard::default(),
        }
    }
}

impl<T> PalettedContainer<T>
where
    T: Clone + Eq + Hash,
{
    /// Creates a container with every cell holding `fill`.
    #[must_use]
    pub fn new(layout: ContainerLayout, registry: Arc<Registry<T>>, fill: T) -> Self {
        let mut palette = Palette::single();
        let code = palette.index_of(&fill);
        debug_assert_eq!(code, Some(0));
        Self {
            layout,
            registry,
            data: Data {
                palette,
                storage: BitStorage::new(0, layout.volume()),
            },
            guard: AccessGuard::default(),
        }
    }

    /// Volume family of this container.
    #[must_use]
    pub const fn layout(&self) -> ContainerLayout {
        self.layout
    }

    /// Registry backing the global strategy.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry<T>> {
        &self.registry
    }

    /// Distinct values the palette currently maps.
    #[must_use]
    pub fn palette_len(&self) -> usize {
        self.data.palette.len()
    }

    /// Current packed width.
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.data.storage.bits()
    }

    /// Reads the value at local coordinates. Guard-free.
    #[must_use]
    pub fn get(&self, x: u32, y: u32, z: u32) -> &T {
        let code = self.data.storage.get(self.layout.cell_index(x, y, z));
        self.data.palette.value_for(code as u32)
    }

    /// Writes a value, returning the one it replaced.
    pub fn set(&mut self, x: u32, y: u32, z: u32, value: T) -> T {
        self.get_and_set(x, y, z, value)
    }

    /// Writes a value under the access guard and returns the prior value.
    pub fn get_and_set(&mut self, x: u32, y: u32, z: u32, value: T) -> T {
        self.guard.acquire();
        let index = self.layout.cell_index(x, y, z);
        let prior = self.set_cell(index, &value);
        self.guard.release();
        prior
    }

    fn set_cell(&mut self, index: usize, value: &T) -> T {
        let code = match self.data.palette.index_of(value) {
            Some(code) => code,
            None => self.grow_and_insert(value),
        };
        let prior = self.data.storage.get_and_set(index, u64::from(code));
        self.data.palette.value_for(prior as u32).clone()
    }

    /// Rebuilds palette and storage one bit wider, migrates every cell,
    /// and returns the code for `value` in the new palette.
    ///
    /// The live pair is swapped only after the new pair is fully built.
    fn grow_and_insert(&mut self, value: &T) -> u32 {
        let strategy = self.layout.strategy(self.data.palette.bits() + 1);
        let mut palette = strategy.palette(&self.registry);
        let mut storage = BitStorage::new(
            strategy.storage_bits(&self.registry),
            self.layout.volume(),
        );

        for index in 0..self.layout.volume() {
            let old_code = self.data.storage.get(index) as u32;
            let migrated = match palette.index_of(self.data.palette.value_for(old_code)) {
                Some(code) => code,
                None => panic!("palette overflowed while migrating to a wider width"),
            };
            storage.set(index, u64::from(migrated));
        }
        let code = match palette.index_of(value) {
            Some(code) => code,
            None => panic!("palette overflowed while migrating to a wider width"),
        };

        self.data = Data { palette, storage };
        code
    }

    /// Visits every distinct value the palette currently maps.
    ///
    /// Stale entries from overwritten cells may be visited too; values
    /// actually present in cells are never missed.
    pub fn get_all(&self, mut consumer: impl FnMut(&T)) {
        self.data.palette.for_each(|value| consumer(value));
    }

    /// Whether any mapped value satisfies the predicate.
    #[must_use]
    pub fn maybe_has(&self, predicate: impl FnMut(&T) -> bool) -> bool {
        self.data.palette.maybe_has(predicate)
    }

    /// Emits `(value, occurrences)` for every value present in cells.
    pub fn count(&self, mut consumer: impl FnMut(&T, usize)) {
        if let Palette::Single(Some(value)) = &self.data.palette {
            consumer(value, self.layout.volume());
            return;
        }
        let mut histogram: AHashMap<u64, usize> = AHashMap::new();
        for code in self.data.storage.iter() {
            *histogram.entry(code).or_insert(0) += 1;
        }
        for (code, occurrences) in histogram {
            consumer(self.data.palette.value_for(code as u32), occurrences);
        }
    }

    /// Packs into the normalized wire form under the access guard.
    ///
    /// The palette is re-derived from the cells actually present, so stale
    /// entries vanish and the width is minimal for the observed
    /// cardinality.
    #[must_use]
    pub fn pack(&self) -> PackedContainer<T> {
        self.guard.acquire();

        let volume = self.layout.volume();
        let mut remap: AHashMap<u64, u32> = AHashMap::new();
        let mut values: Vec<T> = Vec::new();
        let mut codes: Vec<u32> = Vec::with_capacity(volume);
        for old_code in self.data.storage.iter() {
            let code = match remap.get(&old_code) {
                Some(&code) => code,
                None => {
                    let code = values.len() as u32;
                    values.push(self.data.palette.value_for(old_code as u32).clone());
                    remap.insert(old_code, code);
                    code
                },
            };
            codes.push(code);
        }

        let bits = self.layout.packed_bits(values.len());
        let mut storage = BitStorage::new(bits, volume);
        if bits > 0 {
            for (index, code) in codes.into_iter().enumerate() {
                storage.set(index, u64::from(code));
            }
        }

        self.guard.release();
        PackedContainer {
            layout: self.layout,
            palette: values,
            bits,
            data: storage.into_raw(),
        }
    }

    /// Rebuilds a container from its wire form.
    ///
    /// The strategy is chosen for the deserialized cardinality, which may
    /// differ from the writer's; this is a normalization step, not a
    /// bit-for-bit mirror. Inconsistent snapshots surface as errors, never
    /// panics, since they come from disk rather than from caller logic.
    pub fn unpack(packed: &PackedContainer<T>, registry: Arc<Registry<T>>) -> StorageResult<Self> {
        let layout = packed.layout;
        let volume = layout.volume();
        if packed.palette.is_empty() {
            return Err(StorageError::InvalidSnapshot("empty palette".to_string()));
        }
        if packed.bits > MAX_BITS {
            return Err(StorageError::InvalidSnapshot(format!(
                "cell width {} out of range",
                packed.bits
            )));
        }
        let source = BitStorage::from_raw(packed.bits, volume, packed.data.clone())?;

        let strategy = layout.strategy(bits_for(packed.palette.len()));
        let mut palette = strategy.palette(&registry);
        let mut storage = BitStorage::new(strategy.storage_bits(&registry), volume);

        for index in 0..volume {
            let code = source.get(index) as usize;
            let value = packed.palette.get(code).ok_or_else(|| {
                StorageError::InvalidSnapshot(format!("packed index {code} out of palette range"))
            })?;
            let new_code = match &mut palette {
                Palette::Global(_) => registry.id_of(value).ok_or_else(|| {
                    StorageError::InvalidSnapshot(
                        "palette entry missing from the global registry".to_string(),
                    )
                })?,
                local => local.index_of(value).ok_or_else(|| {
                    StorageError::InvalidSnapshot(
                        "palette exceeded its strategy capacity".to_string(),
                    )
                })?,
            };
            storage.set(index, u64::from(new_code));
        }

        Ok(Self {
            layout,
            registry,
            data: Data { palette, storage },
            guard: AccessGuard::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn registry(size: u32) -> Arc<Registry<u32>> {
        Arc::new(Registry::from_values(0..size))
    }

    #[test]
    fn test_layout_geometry() {
        assert_eq!(ContainerLayout::Blocks.volume(), 4096);
        assert_eq!(ContainerLayout::Biomes.volume(), 64);
        assert_eq!(ContainerLayout::Blocks.cell_index(0, 0, 0), 0);
        assert_eq!(ContainerLayout::Blocks.cell_index(15, 15, 15), 4095);
        assert_eq!(ContainerLayout::Blocks.cell_index(1, 2, 3), 2 * 256 + 3 * 16 + 1);
        assert_eq!(ContainerLayout::Biomes.cell_index(3, 3, 3), 63);
    }

    #[test]
    fn test_new_container_is_uniform() {
        let container = PalettedContainer::new(ContainerLayout::Blocks, registry(16), 5u32);
        assert_eq!(container.bits(), 0);
        assert_eq!(container.palette_len(), 1);
        for (x, y, z) in [(0, 0, 0), (8, 8, 8), (15, 15, 15)] {
            assert_eq!(*container.get(x, y, z), 5);
        }
    }

    #[test]
    fn test_set_returns_prior_value() {
        let mut container = PalettedContainer::new(ContainerLayout::Blocks, registry(16), 0u32);
        assert_eq!(container.set(1, 2, 3, 9), 0);
        assert_eq!(container.set(1, 2, 3, 4), 9);
        assert_eq!(*container.get(1, 2, 3), 4);
        assert_eq!(container.get_and_set(1, 2, 3, 7), 4);
    }

    #[test]
    fn test_block_strategy_escalation() {
        let mut container = PalettedContainer::new(ContainerLayout::Blocks, registry(2048), 0u32);
        assert_eq!(container.bits(), 0);

        // A second distinct value promotes to a 4-bit linear palette.
        container.set(0, 0, 0, 1);
        assert_eq!(container.bits(), 4);

        // 17 distinct values exceed 4 bits and land in a 5-bit hashed palette.
        for value in 0..17u32 {
            container.set((value % 16) as u32, (value / 16) as u32, 0, value);
        }
        assert_eq!(container.bits(), 5);

        // 257 distinct values exceed 8 bits and fall through to the registry.
        for value in 0..257u32 {
            let x = value % 16;
            let z = (value / 16) % 16;
            let y = value / 256;
            container.set(x, y, z, value);
        }
        assert_eq!(container.bits(), bits_for(2048));
        assert_eq!(*container.get(0, 1, 0), 256);
    }

    #[test]
    fn test_biome_strategy_escalation() {
        let mut container = PalettedContainer::new(ContainerLayout::Biomes, registry(64), 0u32);
        container.set(0, 0, 0, 1);
        assert_eq!(container.bits(), 1);
        container.set(1, 0, 0, 2);
        assert_eq!(container.bits(), 2);
        for value in 0..9u32 {
            container.set(value % 4, (value / 4) % 4, 0, value);
        }
        // Nine distinct biome values exceed 3 bits and go global.
        assert_eq!(container.bits(), bits_for(64));
    }

    #[test]
    fn test_resize_preserves_content() {
        let mut container = PalettedContainer::new(ContainerLayout::Blocks, registry(64), 0u32);
        let mut expected = vec![0u32; 4096];
        for value in 0..17u32 {
            let x = value % 16;
            let z = value / 16;
            container.set(x, 0, z, value);
            expected[ContainerLayout::Blocks.cell_index(x, 0, z)] = value;
        }
        for x in 0..16 {
            for y in 0..16 {
                for z in 0..16 {
                    let index = ContainerLayout::Blocks.cell_index(x, y, z);
                    assert_eq!(*container.get(x, y, z), expected[index]);
                }
            }
        }
        assert!(1usize << container.bits() >= container.palette_len());
    }

    #[test]
    fn test_get_all_never_misses_present_values() {
        let mut container = PalettedContainer::new(ContainerLayout::Blocks, registry(64), 0u32);
        for value in [3u32, 7, 11] {
            container.set(value, 0, 0, value);
        }
        let mut seen = Vec::new();
        container.get_all(|value| seen.push(*value));
        for value in [0u32, 3, 7, 11] {
            assert!(seen.contains(&value), "missing {value}");
        }
    }

    #[test]
    fn test_count_histograms_cells() {
        let mut container = PalettedContainer::new(ContainerLayout::Biomes, registry(8), 0u32);
        container.set(0, 0, 0, 5);
        container.set(1, 0, 0, 5);
        container.set(2, 0, 0, 3);

        let mut counts: Vec<(u32, usize)> = Vec::new();
        container.count(|value, n| counts.push((*value, n)));
        counts.sort_unstable();
        assert_eq!(counts, vec![(0, 61), (3, 1), (5, 2)]);
    }

    #[test]
    fn test_count_trusts_single_palette() {
        let container = PalettedContainer::new(ContainerLayout::Biomes, registry(8), 2u32);
        let mut counts: Vec<(u32, usize)> = Vec::new();
        container.count(|value, n| counts.push((*value, n)));
        assert_eq!(counts, vec![(2, 64)]);
    }

    #[test]
    fn test_pack_normalizes_stale_entries() {
        let mut container = PalettedContainer::new(ContainerLayout::Blocks, registry(16), 0u32);
        container.set(0, 0, 0, 1);
        container.set(0, 0, 0, 0);

        let packed = container.pack();
        assert_eq!(packed.palette, vec![0]);
        assert_eq!(packed.bits, 0);
        assert!(packed.data.is_empty());
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let registry = registry(512);
        let mut container =
            PalettedContainer::new(ContainerLayout::Blocks, Arc::clone(&registry), 0u32);
        for index in 0..4096usize {
            let x = (index % 16) as u32;
            let z = ((index / 16) % 16) as u32;
            let y = (index / 256) as u32;
            container.set(x, y, z, (index % 23) as u32);
        }

        let packed = container.pack();
        let unpacked = PalettedContainer::unpack(&packed, Arc::clone(&registry))
            .expect("snapshot should unpack");
        for x in 0..16 {
            for y in 0..16 {
                for z in 0..16 {
                    assert_eq!(container.get(x, y, z), unpacked.get(x, y, z));
                }
            }
        }
        // A second pack of the normalized container is identical.
        assert_eq!(unpacked.pack(), packed);
    }

    #[test]
    fn test_unpack_rejects_bad_snapshots() {
        let empty = PackedContainer::<u32> {
            layout: ContainerLayout::Biomes,
            palette: Vec::new(),
            bits: 0,
            data: Vec::new(),
        };
        assert!(matches!(
            PalettedContainer::unpack(&empty, registry(8)),
            Err(StorageError::InvalidSnapshot(_))
        ));

        // Index stream pointing past the palette.
        let bad = PackedContainer {
            layout: ContainerLayout::Biomes,
            palette: vec![1u32, 2],
            bits: 1,
            data: vec![u64::MAX],
        };
        assert!(PalettedContainer::unpack(&bad, registry(8)).is_ok());
        let bad = PackedContainer {
            layout: ContainerLayout::Biomes,
            palette: vec![1u32],
            bits: 1,
            data: vec![u64::MAX],
        };
        assert!(matches!(
            PalettedContainer::unpack(&bad, registry(8)),
            Err(StorageError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_guard_releases_between_operations() {
        let mut container = PalettedContainer::new(ContainerLayout::Blocks, registry(16), 0u32);
        container.set(0, 0, 0, 1);
        let _ = container.pack();
        container.set(0, 0, 0, 2);
        assert_eq!(*container.get(0, 0, 0), 2);
    }

    proptest! {
        #[test]
        fn prop_pack_unpack_preserves_cells(
            writes in proptest::collection::vec(
                (0u32..16, 0u32..16, 0u32..16, 0u32..40),
                0..200,
            ),
        ) {
            let registry = registry(64);
            let mut container =
                PalettedContainer::new(ContainerLayout::Blocks, Arc::clone(&registry), 0u32);
            for (x, y, z, value) in writes {
                container.set(x, y, z, value);
            }

            let packed = container.pack();
            let unpacked = PalettedContainer::unpack(&packed, registry).unwrap();
            for x in 0..16 {
                for y in 0..16 {
                    for z in 0..16 {
                        prop_assert_eq!(container.get(x, y, z), unpacked.get(x, y, z));
                    }
                }
            }
        }
    }
}
