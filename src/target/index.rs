//! Primitive index: `(surface, field key)` to the primitive projected for it.

use std::collections::HashMap;

use crate::model::{FieldKey, FieldRecord, PlacementMap};
use crate::surface::{PrimitiveHandle, SurfaceId};

/// What was last projected for one key on one surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// The live primitive, if the field currently renders anything.
    pub handle: Option<PrimitiveHandle>,
    /// The substituted record the primitive reflects.
    pub record: FieldRecord,
    /// The persisted placement last applied to the primitive's transform.
    pub placement: Option<PlacementMap>,
}

/// Explicit `(surface id, field key) → binding` mapping.
///
/// The compositor consults it before creating anything, which is what keeps
/// each key to at most one primitive per surface.
#[derive(Debug, Default)]
pub struct PrimitiveIndex {
    bindings: HashMap<(SurfaceId, FieldKey), Binding>,
}

impl PrimitiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, surface: SurfaceId, key: &FieldKey) -> Option<&Binding> {
        self.bindings.get(&(surface, key.clone()))
    }

    pub fn get_mut(&mut self, surface: SurfaceId, key: &FieldKey) -> Option<&mut Binding> {
        self.bindings.get_mut(&(surface, key.clone()))
    }

    pub fn insert(&mut self, surface: SurfaceId, key: FieldKey, binding: Binding) -> Option<Binding> {
        self.bindings.insert((surface, key), binding)
    }

    pub fn remove(&mut self, surface: SurfaceId, key: &FieldKey) -> Option<Binding> {
        self.bindings.remove(&(surface, key.clone()))
    }

    /// Keys bound on one surface, in no particular order.
    pub fn keys_for(&self, surface: SurfaceId) -> Vec<FieldKey> {
        self.bindings
            .keys()
            .filter(|(s, _)| *s == surface)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Every bound record, across all surfaces.
    pub fn records(&self) -> impl Iterator<Item = &FieldRecord> {
        self.bindings.values().map(|b| &b.record)
    }

    /// Forget every binding of a torn-down surface.
    pub fn clear_surface(&mut self, surface: SurfaceId) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|(s, _), _| *s != surface);
        before - self.bindings.len()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
