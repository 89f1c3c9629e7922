//! Handle-based resource registries
//!
//! Every GPU resource is addressed through an opaque typed handle backed by
//! a slot map: a strongly-typed index plus a generation counter, so a handle
//! kept past `destroy` never aliases a recycled slot. Lookups through a dead
//! handle are programmer errors and fail loudly rather than silently
//! no-opping, since continuing would corrupt registry bookkeeping.

use slotmap::{new_key_type, Key, SlotMap};

new_key_type! {
    /// Handle to a buffer owned by the buffer registry
    pub struct BufferHandle;
    /// Handle to a texture owned by the texture registry
    pub struct TextureHandle;
    /// Handle to a mesh owned by the mesh registry
    pub struct MeshHandle;
    /// Handle to a compiled shader module
    pub struct ShaderHandle;
    /// Handle to a deduplicated pipeline instance
    pub struct PipelineHandle;
    /// Handle to a uniform group (descriptor sets + uniform storage)
    pub struct UniformGroupHandle;
    /// Handle to a single uniform or push-constant range
    pub struct UniformHandle;
}

/// Generic handle→instance map with slot recycling.
///
/// O(1) insert/remove/lookup. The `name` is used in panic messages so a
/// stale handle identifies which registry it was aimed at.
pub struct Registry<K: Key, V> {
    name: &'static str,
    slots: SlotMap<K, V>,
}

impl<K: Key, V> Registry<K, V> {
    /// Create an empty registry.
    pub fn new(name: &'static str) -> Self {
        Self { name, slots: SlotMap::with_key() }
    }

    /// Insert an instance, returning its handle.
    pub fn insert(&mut self, value: V) -> K {
        self.slots.insert(value)
    }

    /// Look up an instance. Panics on a destroyed or unknown handle.
    #[track_caller]
    pub fn get(&self, handle: K) -> &V {
        self.slots
            .get(handle)
            .unwrap_or_else(|| panic!("{} registry: dead handle {:?}", self.name, handle.data()))
    }

    /// Mutable lookup. Panics on a destroyed or unknown handle.
    #[track_caller]
    pub fn get_mut(&mut self, handle: K) -> &mut V {
        let name = self.name;
        self.slots
            .get_mut(handle)
            .unwrap_or_else(|| panic!("{} registry: dead handle {:?}", name, handle.data()))
    }

    /// Remove an instance, invalidating its handle. Panics if already dead.
    #[track_caller]
    pub fn remove(&mut self, handle: K) -> V {
        let name = self.name;
        self.slots
            .remove(handle)
            .unwrap_or_else(|| panic!("{} registry: double destroy of {:?}", name, handle.data()))
    }

    /// Whether the handle still refers to a live instance.
    pub fn contains(&self, handle: K) -> bool {
        self.slots.contains_key(handle)
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry holds no live instances.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over live instances.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.slots.iter()
    }

    /// Drain every live instance, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<V> {
        let keys: Vec<K> = self.slots.keys().collect();
        keys.into_iter().filter_map(|k| self.slots.remove(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    new_key_type! {
        struct TestHandle;
    }

    #[test]
    fn insert_then_get_returns_value() {
        let mut registry: Registry<TestHandle, u32> = Registry::new("test");
        let handle = registry.insert(7);
        assert_eq!(*registry.get(handle), 7);
        assert!(registry.contains(handle));
    }

    #[test]
    fn remove_invalidates_handle() {
        let mut registry: Registry<TestHandle, u32> = Registry::new("test");
        let handle = registry.insert(1);
        assert_eq!(registry.remove(handle), 1);
        assert!(!registry.contains(handle));
    }

    #[test]
    #[should_panic(expected = "dead handle")]
    fn get_after_remove_panics() {
        let mut registry: Registry<TestHandle, u32> = Registry::new("test");
        let handle = registry.insert(1);
        registry.remove(handle);
        registry.get(handle);
    }

    #[test]
    #[should_panic(expected = "double destroy")]
    fn double_remove_panics() {
        let mut registry: Registry<TestHandle, u32> = Registry::new("test");
        let handle = registry.insert(1);
        registry.remove(handle);
        registry.remove(handle);
    }

    #[test]
    fn recycled_slot_does_not_alias_old_handle() {
        let mut registry: Registry<TestHandle, u32> = Registry::new("test");
        let old = registry.insert(1);
        registry.remove(old);
        let new = registry.insert(2);
        assert_ne!(old, new);
        assert!(!registry.contains(old));
        assert_eq!(*registry.get(new), 2);
    }

    #[test]
    fn arbitrary_removal_order_preserves_remainder() {
        let mut registry: Registry<TestHandle, usize> = Registry::new("test");
        let handles: Vec<_> = (0..32).map(|i| registry.insert(i)).collect();

        // Remove an interleaved subset in a scrambled order.
        for &i in &[3usize, 29, 0, 16, 8, 31, 12, 5] {
            registry.remove(handles[i]);
        }

        for (i, &handle) in handles.iter().enumerate() {
            let removed = matches!(i, 3 | 29 | 0 | 16 | 8 | 31 | 12 | 5);
            assert_eq!(registry.contains(handle), !removed);
            if !removed {
                assert_eq!(*registry.get(handle), i);
            }
        }
        assert_eq!(registry.len(), 32 - 8);
    }
}
