//! Descriptor construction with per-CPU caches.
//!
//! Descriptors are pure functions of layout values. Caching them by layout
//! makes equal layouts return the same `Arc`, so trace producers can compare
//! descriptors by pointer.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rjit_ir::{
    ArrayDescr, ArrayLayout, CallDescr, CallSignature, FieldDescr, FieldLayout,
    InteriorFieldDescr, SizeDescr, StructLayout,
};
use rustc_hash::FxHashMap;

struct Cache<K, V> {
    map: Mutex<FxHashMap<K, Arc<V>>>,
}

impl<K: Hash + Eq, V> Cache<K, V> {
    fn new() -> Self {
        Self {
            map: Mutex::new(FxHashMap::default()),
        }
    }

    fn get_or_insert(&self, key: K, make: impl FnOnce() -> V) -> Arc<V> {
        self.map
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    fn len(&self) -> usize {
        self.map.lock().len()
    }
}

pub(crate) struct DescrCache {
    fields: Cache<(String, FieldLayout), FieldDescr>,
    arrays: Cache<ArrayLayout, ArrayDescr>,
    interior: Cache<(ArrayLayout, String), InteriorFieldDescr>,
    sizes: Cache<StructLayout, SizeDescr>,
    calls: Cache<CallSignature, CallDescr>,
}

impl DescrCache {
    pub fn new() -> Self {
        Self {
            fields: Cache::new(),
            arrays: Cache::new(),
            interior: Cache::new(),
            sizes: Cache::new(),
            calls: Cache::new(),
        }
    }

    pub fn field(&self, layout: &StructLayout, name: &str) -> Arc<FieldDescr> {
        let field = layout
            .find_field(name)
            .unwrap_or_else(|| panic!("struct {} has no field {name}", layout.name));
        self.fields
            .get_or_insert((layout.name.clone(), field.clone()), || {
                FieldDescr::from_layout(&layout.name, field)
            })
    }

    pub fn array(&self, layout: &ArrayLayout) -> Arc<ArrayDescr> {
        self.arrays
            .get_or_insert(layout.clone(), || ArrayDescr::from_layout(layout))
    }

    pub fn interior_field(&self, layout: &ArrayLayout, name: &str) -> Arc<InteriorFieldDescr> {
        let field = layout
            .item_fields
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("items of array {} have no field {name}", layout.name));
        let array = self.array(layout);
        self.interior
            .get_or_insert((layout.clone(), name.to_owned()), || InteriorFieldDescr {
                field: Arc::new(FieldDescr::from_layout(&layout.name, field)),
                array,
            })
    }

    pub fn size(&self, layout: &StructLayout) -> Arc<SizeDescr> {
        self.sizes
            .get_or_insert(layout.clone(), || SizeDescr::from_layout(layout))
    }

    pub fn call(&self, signature: &CallSignature) -> Arc<CallDescr> {
        self.calls
            .get_or_insert(signature.clone(), || CallDescr::from_signature(signature))
    }

    /// Number of distinct descriptors built so far
    pub fn len(&self) -> usize {
        self.fields.len()
            + self.arrays.len()
            + self.interior.len()
            + self.sizes.len()
            + self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rjit_ir::{ArgKind, FieldKind};

    fn point() -> StructLayout {
        StructLayout::new("Point", 24, 7)
            .field("x", 8, 8, FieldKind::Signed)
            .field("y", 16, 8, FieldKind::Signed)
    }

    #[test]
    fn equal_layouts_share_descrs() {
        let cache = DescrCache::new();
        let a = cache.field(&point(), "x");
        let b = cache.field(&point(), "x");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &cache.field(&point(), "y")));
        assert_eq!(a.offset, 8);
        assert_eq!(a.name, "Point.x");
    }

    #[test]
    fn call_descrs_by_signature() {
        let cache = DescrCache::new();
        let sig = CallSignature::new(vec![ArgKind::LONG], ArgKind::Float);
        assert!(Arc::ptr_eq(&cache.call(&sig), &cache.call(&sig.clone())));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn interior_field_reuses_array() {
        let cache = DescrCache::new();
        let layout = ArrayLayout::new("Pairs", 16, 16, FieldKind::Signed, Some(8), 3)
            .item_field("k", 0, 8, FieldKind::Signed)
            .item_field("v", 8, 8, FieldKind::Float);
        let v = cache.interior_field(&layout, "v");
        assert!(Arc::ptr_eq(&v.array, &cache.array(&layout)));
        assert_eq!(v.field.offset, 8);
    }

    #[test]
    #[should_panic(expected = "has no field")]
    fn unknown_field_panics() {
        DescrCache::new().field(&point(), "z");
    }
}
