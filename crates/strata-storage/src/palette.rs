//! Adaptive palettes mapping values to packed codes.
//!
//! A palette owns the value ↔ small-integer-code mapping for one paletted
//! container, in one of four strategies chosen by observed cardinality:
//! - [`Palette::Single`] — zero or one distinct value, zero-bit storage
//! - [`Palette::Linear`] — append-only array, linear scan, small widths
//! - [`Palette::Hashed`] — bidirectional hash map, medium widths
//! - [`Palette::Global`] — codes are registry ids, no local table
//!
//! [`Palette::index_of`] returns `None` when the palette is full at its
//! current width; the owning container reacts by rebuilding palette and
//! storage one bit wider and retrying. Ids are never reused or reordered
//! while a palette lives, so `id → value` stays a bijection over `[0, len)`.

use std::hash::Hash;
use std::sync::Arc;

use ahash::AHashMap;

use crate::registry::Registry;

/// Value ↔ code mapping for a paletted container.
#[derive(Debug, Clone)]
pub enum Palette<T> {
    /// Zero or one distinct value; every cell packs to code 0.
    Single(Option<T>),
    /// Append-only entry list scanned linearly on lookup.
    Linear {
        /// Entries by code.
        entries: Vec<T>,
        /// Packed width; capacity is `1 << bits`.
        bits: u32,
    },
    /// Bidirectional map for medium cardinalities.
    Hashed {
        /// Entries by code.
        by_id: Vec<T>,
        /// Codes by entry.
        by_value: AHashMap<T, u32>,
        /// Packed width; capacity is `1 << bits`.
        bits: u32,
    },
    /// Codes are global registry ids; the palette holds no local table.
    Global(Arc<Registry<T>>),
}

impl<T> Palette<T>
where
    T: Clone + Eq + Hash,
{
    /// Creates an empty single-value palette.
    #[must_use]
    pub const fn single() -> Self {
        Self::Single(None)
    }

    /// Creates an empty linear palette at the given width.
    #[must_use]
    pub fn linear(bits: u32) -> Self {
        Self::Linear {
            entries: Vec::with_capacity(1 << bits),
            bits,
        }
    }

    /// Creates a linear palette pre-seeded with entries.
    #[must_use]
    pub fn linear_with(bits: u32, entries: Vec<T>) -> Self {
        assert!(
            entries.len() <= 1 << bits,
            "{} entries exceed {bits}-bit capacity",
            entries.len()
        );
        Self::Linear { entries, bits }
    }

    /// Creates an empty hashed palette at the given width.
    #[must_use]
    pub fn hashed(bits: u32) -> Self {
        Self::Hashed {
            by_id: Vec::with_capacity(1 << bits),
            by_value: AHashMap::new(),
            bits,
        }
    }

    /// Creates a hashed palette pre-seeded with entries.
    #[must_use]
    pub fn hashed_with(bits: u32, entries: Vec<T>) -> Self {
        assert!(
            entries.len() <= 1 << bits,
            "{} entries exceed {bits}-bit capacity",
            entries.len()
        );
        let by_value = entries
            .iter()
            .enumerate()
            .map(|(id, value)| (value.clone(), id as u32))
            .collect();
        Self::Hashed {
            by_id: entries,
            by_value,
            bits,
        }
    }

    /// Creates a global palette over the shared registry.
    #[must_use]
    pub const fn global(registry: Arc<Registry<T>>) -> Self {
        Self::Global(registry)
    }

    /// Looks up or assigns the code for `value`.
    ///
    /// `None` means the palette is full at its current width; the caller
    /// must rebuild at a wider strategy and retry.
    ///
    /// # Panics
    ///
    /// A global palette panics when `value` was never registered; that is a
    /// logic error in the caller, not a capacity condition.
    pub fn index_of(&mut self, value: &T) -> Option<u32> {
        match self {
            Self::Single(slot) => match slot {
                Some(held) if held == value => Some(0),
                Some(_) => None,
                None => {
                    *slot = Some(value.clone());
                    Some(0)
                },
            },
            Self::Linear { entries, bits } => {
                if let Some(id) = entries.iter().position(|entry| entry == value) {
                    return Some(id as u32);
                }
                if entries.len() < 1 << *bits {
                    entries.push(value.clone());
                    Some((entries.len() - 1) as u32)
                } else {
                    None
                }
            },
            Self::Hashed {
                by_id,
                by_value,
                bits,
            } => {
                if let Some(&id) = by_value.get(value) {
                    return Some(id);
                }
                if by_id.len() < 1 << *bits {
                    let id = by_id.len() as u32;
                    by_id.push(value.clone());
                    by_value.insert(value.clone(), id);
                    Some(id)
                } else {
                    None
                }
            },
            Self::Global(registry) => match registry.id_of(value) {
                Some(id) => Some(id),
                None => panic!("value not present in the global registry"),
            },
        }
    }

    /// Value for a code.
    ///
    /// # Panics
    ///
    /// Panics for codes outside `[0, len)`; a packed stream pointing at a
    /// missing entry is a violated invariant, never silently mapped.
    #[must_use]
    pub fn value_for(&self, id: u32) -> &T {
        match self {
            Self::Single(Some(held)) => {
                assert!(id == 0, "missing palette entry {id} in single-value palette");
                held
            },
            Self::Single(None) => panic!("uninitialized single-value palette"),
            Self::Linear { entries, .. } => entries
                .get(id as usize)
                .unwrap_or_else(|| panic!("missing palette entry {id}")),
            Self::Hashed { by_id, .. } => by_id
                .get(id as usize)
                .unwrap_or_else(|| panic!("missing palette entry {id}")),
            Self::Global(registry) => registry
                .get(id)
                .unwrap_or_else(|| panic!("missing registry entry {id}")),
        }
    }

    /// Tests membership without materializing values.
    ///
    /// A global palette always answers `true`; broad-phase scans use this
    /// to skip sections, so over-reporting is safe and under-reporting is
    /// not.
    #[must_use]
    pub fn maybe_has(&self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        match self {
            Self::Single(slot) => slot.as_ref().is_some_and(&mut predicate),
            Self::Linear { entries, .. } => entries.iter().any(&mut predicate),
            Self::Hashed { by_id, .. } => by_id.iter().any(&mut predicate),
            Self::Global(_) => true,
        }
    }

    /// Visits every value currently mapped, in code order.
    pub fn for_each(&self, mut consumer: impl FnMut(&T)) {
        match self {
            Self::Single(slot) => {
                if let Some(held) = slot {
                    consumer(held);
                }
            },
            Self::Linear { entries, .. } => entries.iter().for_each(consumer),
            Self::Hashed { by_id, .. } => by_id.iter().for_each(consumer),
            Self::Global(registry) => registry.iter().for_each(consumer),
        }
    }

    /// Number of mapped values.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(slot) => usize::from(slot.is_some()),
            Self::Linear { entries, .. } => entries.len(),
            Self::Hashed { by_id, .. } => by_id.len(),
            Self::Global(registry) => registry.len(),
        }
    }

    /// Whether no value is mapped yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packed width this palette encodes to.
    #[must_use]
    pub fn bits(&self) -> u32 {
        match self {
            Self::Single(_) => 0,
            Self::Linear { bits, .. } | Self::Hashed { bits, .. } => *bits,
            Self::Global(registry) => registry.bits_required(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_assigns_then_overflows() {
        let mut palette: Palette<u32> = Palette::single();
        assert!(palette.is_empty());
        assert_eq!(palette.index_of(&7), Some(0));
        assert_eq!(palette.index_of(&7), Some(0));
        assert_eq!(palette.index_of(&8), None);
        assert_eq!(palette.len(), 1);
        assert_eq!(*palette.value_for(0), 7);
    }

    #[test]
    #[should_panic(expected = "uninitialized single-value palette")]
    fn test_single_uninitialized_value_for_panics() {
        let palette: Palette<u32> = Palette::single();
        let _ = palette.value_for(0);
    }

    #[test]
    #[should_panic(expected = "missing palette entry")]
    fn test_missing_entry_panics() {
        let mut palette: Palette<u32> = Palette::linear(2);
        assert_eq!(palette.index_of(&1), Some(0));
        let _ = palette.value_for(3);
    }

    #[test]
    fn test_linear_fills_then_overflows() {
        let mut palette: Palette<u32> = Palette::linear(2);
        for value in 0..4u32 {
            assert_eq!(palette.index_of(&value), Some(value));
        }
        // Existing entries still resolve once full.
        assert_eq!(palette.index_of(&2), Some(2));
        assert_eq!(palette.index_of(&99), None);
        assert_eq!(palette.len(), 4);
    }

    #[test]
    fn test_hashed_fills_then_overflows() {
        let mut palette: Palette<u32> = Palette::hashed(3);
        for value in 0..8u32 {
            assert_eq!(palette.index_of(&(value * 10)), Some(value));
        }
        assert_eq!(palette.index_of(&30), Some(3));
        assert_eq!(palette.index_of(&1000), None);
    }

    #[test]
    fn test_global_uses_registry_ids() {
        let registry = Arc::new(Registry::from_values(0..100u32));
        let mut palette = Palette::global(Arc::clone(&registry));
        assert_eq!(palette.index_of(&42), Some(42));
        assert_eq!(*palette.value_for(42), 42);
        assert_eq!(palette.len(), 100);
        assert_eq!(palette.bits(), 7);
    }

    #[test]
    #[should_panic(expected = "not present in the global registry")]
    fn test_global_unregistered_value_panics() {
        let registry = Arc::new(Registry::from_values(0..10u32));
        let mut palette = Palette::global(registry);
        let _ = palette.index_of(&500);
    }

    #[test]
    fn test_maybe_has() {
        let mut palette: Palette<u32> = Palette::hashed(4);
        palette.index_of(&3);
        palette.index_of(&5);
        assert!(palette.maybe_has(|v| *v == 5));
        assert!(!palette.maybe_has(|v| *v == 6));

        let global: Palette<u32> = Palette::global(Arc::new(Registry::new()));
        assert!(global.maybe_has(|_| false));
    }

    #[test]
    fn test_seeded_constructors_preserve_order() {
        let linear = Palette::linear_with(2, vec![9u32, 8, 7]);
        assert_eq!(*linear.value_for(1), 8);

        let mut hashed = Palette::hashed_with(4, vec![5u32, 6]);
        assert_eq!(hashed.index_of(&6), Some(1));
        assert_eq!(hashed.index_of(&7), Some(2));
    }

    fn roundtrip(mut palette: Palette<u32>, values: &[u32]) {
        let mut ids = Vec::new();
        for value in values {
            let id = palette.index_of(value).expect("palette should have room");
            ids.push(id);
        }
        for (value, id) in values.iter().zip(ids) {
            assert_eq!(palette.value_for(id), value);
        }
    }

    proptest! {
        #[test]
        fn prop_roundtrip_all_strategies(raw in proptest::collection::hash_set(0u32..1000, 1..=16)) {
            let values: Vec<u32> = raw.into_iter().collect();

            roundtrip(Palette::linear(4), &values);
            roundtrip(Palette::hashed(4), &values);
            roundtrip(
                Palette::global(Arc::new(Registry::from_values(0..1000u32))),
                &values,
            );
            if values.len() == 1 {
                roundtrip(Palette::single(), &values);
            }
        }
    }
}
