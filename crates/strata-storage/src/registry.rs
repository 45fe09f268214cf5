//! Global id space for palette values.
//!
//! A [`Registry`] assigns each distinct value a stable small id in insertion
//! order. Global palettes use these ids directly as packed codes, so the
//! registry is shared (`Arc`) between every container of one value family.

use std::hash::Hash;

use ahash::AHashMap;

use crate::bit_storage::bits_for;

/// Insertion-ordered bidirectional value ↔ id map.
#[derive(Debug, Clone, Default)]
pub struct Registry<T> {
    /// Values by id.
    values: Vec<T>,
    /// Ids by value.
    ids: AHashMap<T, u32>,
}

impl<T> Registry<T>
where
    T: Clone + Eq + Hash,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            ids: AHashMap::new(),
        }
    }

    /// Creates a registry from values in order, skipping duplicates.
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = T>) -> Self {
        let mut registry = Self::new();
        for value in values {
            registry.register(value);
        }
        registry
    }

    /// Registers a value, returning its id; re-registering is idempotent.
    pub fn register(&mut self, value: T) -> u32 {
        if let Some(&id) = self.ids.get(&value) {
            return id;
        }
        let id = self.values.len() as u32;
        self.values.push(value.clone());
        self.ids.insert(value, id);
        id
    }

    /// Value for an id, if registered.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&T> {
        self.values.get(id as usize)
    }

    /// Id for a value, if registered.
    #[must_use]
    pub fn id_of(&self, value: &T) -> Option<u32> {
        self.ids.get(value).copied()
    }

    /// Number of registered values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bit width needed to pack any registered id.
    #[must_use]
    pub fn bits_required(&self) -> u32 {
        bits_for(self.values.len())
    }

    /// Iterates over registered values in id order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = Registry::new();
        let a = registry.register("stone");
        let b = registry.register("dirt");
        assert_eq!(registry.register("stone"), a);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lookup_both_directions() {
        let registry = Registry::from_values(["air", "stone", "water"]);
        assert_eq!(registry.get(1), Some(&"stone"));
        assert_eq!(registry.id_of(&"water"), Some(2));
        assert_eq!(registry.id_of(&"lava"), None);
        assert_eq!(registry.get(9), None);
    }

    #[test]
    fn test_bits_required_tracks_len() {
        let mut registry = Registry::new();
        assert_eq!(registry.bits_required(), 0);
        registry.register(0u32);
        assert_eq!(registry.bits_required(), 0);
        for v in 1..=16u32 {
            registry.register(v);
        }
        // 17 values need 5 bits.
        assert_eq!(registry.bits_required(), 5);
    }
}
