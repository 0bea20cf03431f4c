//! # Drawing Surface
//!
//! A mutable canvas holding keyed primitives. Ordinary primitives live in
//! a stack (index 0 paints first); at most one primitive occupies the
//! background slot, which always paints underneath the stack.
//!
//! Primitive handles are never reused within a surface, so a handle held
//! by a stale index entry can never alias a newer primitive.

pub mod paint;
pub mod text;

use image::RgbaImage;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::model::{Color, FieldKey, Placement};

/// Identity of one surface, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(Uuid);

impl SurfaceId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a primitive within its surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveHandle(u64);

/// What a primitive draws.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Image {
        raster: Arc<RgbaImage>,
    },
    Text {
        text: String,
        font: String,
        font_size: f64,
        color: Color,
    },
}

/// A drawable object bound to one field key.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    pub key: FieldKey,
    pub content: Content,
    pub placement: Placement,
    /// Whether the user may move this primitive.
    pub editable: bool,
}

impl Primitive {
    /// Intrinsic size in logical units, for images. Text is measured at paint time.
    pub fn image_size(&self) -> Option<(u32, u32)> {
        match &self.content {
            Content::Image { raster } => Some(raster.dimensions()),
            Content::Text { .. } => None,
        }
    }
}

/// A mutable canvas of keyed primitives.
#[derive(Debug)]
pub struct Surface {
    id: SurfaceId,
    width: u32,
    height: u32,
    interactive: bool,
    next_handle: u64,
    primitives: HashMap<PrimitiveHandle, Primitive>,
    stack: Vec<PrimitiveHandle>,
    background: Option<PrimitiveHandle>,
    repaints: u64,
}

impl Surface {
    pub fn new(width: u32, height: u32, interactive: bool) -> Self {
        Self {
            id: SurfaceId::new(),
            width,
            height,
            interactive,
            next_handle: 0,
            primitives: HashMap::new(),
            stack: Vec::new(),
            background: None,
            repaints: 0,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn allocate(&mut self, primitive: Primitive) -> PrimitiveHandle {
        let handle = PrimitiveHandle(self.next_handle);
        self.next_handle += 1;
        self.primitives.insert(handle, primitive);
        handle
    }

    /// Add a primitive on top of the stack.
    pub fn add(&mut self, primitive: Primitive) -> PrimitiveHandle {
        let handle = self.allocate(primitive);
        self.stack.push(handle);
        self.request_repaint();
        handle
    }

    /// Put a primitive in the background slot.
    ///
    /// Returns the handle together with the primitive it evicted, if the
    /// slot was taken.
    pub fn set_background(
        &mut self,
        primitive: Primitive,
    ) -> (PrimitiveHandle, Option<(PrimitiveHandle, Primitive)>) {
        let evicted = self
            .background
            .take()
            .and_then(|old| self.primitives.remove(&old).map(|p| (old, p)));
        let handle = self.allocate(primitive);
        self.background = Some(handle);
        self.request_repaint();
        (handle, evicted)
    }

    pub fn background(&self) -> Option<(PrimitiveHandle, &Primitive)> {
        let handle = self.background?;
        self.primitives.get(&handle).map(|p| (handle, p))
    }

    pub fn get(&self, handle: PrimitiveHandle) -> Option<&Primitive> {
        self.primitives.get(&handle)
    }

    /// Mutable access for in-place updates. Callers request the repaint.
    pub fn get_mut(&mut self, handle: PrimitiveHandle) -> Option<&mut Primitive> {
        self.primitives.get_mut(&handle)
    }

    pub fn contains(&self, handle: PrimitiveHandle) -> bool {
        self.primitives.contains_key(&handle)
    }

    /// Detach and release a primitive, from the stack or the background slot.
    pub fn remove(&mut self, handle: PrimitiveHandle) -> Option<Primitive> {
        let primitive = self.primitives.remove(&handle)?;
        if self.background == Some(handle) {
            self.background = None;
        } else {
            self.stack.retain(|h| *h != handle);
        }
        self.request_repaint();
        Some(primitive)
    }

    /// Live primitives, background included.
    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// Stack primitives, bottom first.
    pub fn stacked(&self) -> impl Iterator<Item = (PrimitiveHandle, &Primitive)> {
        self.stack
            .iter()
            .filter_map(|h| self.primitives.get(h).map(|p| (*h, p)))
    }

    /// Reorder the stack so `order` paints bottom to top. Handles not in
    /// `order` keep their relative order underneath.
    pub fn restack(&mut self, order: &[PrimitiveHandle]) {
        let mut next: Vec<PrimitiveHandle> = self
            .stack
            .iter()
            .copied()
            .filter(|h| !order.contains(h))
            .collect();
        next.extend(order.iter().copied().filter(|h| self.stack.contains(h)));
        if next != self.stack {
            self.stack = next;
            self.request_repaint();
        }
    }

    /// Move an editable primitive, as a finished drag or resize would.
    pub fn set_placement(&mut self, handle: PrimitiveHandle, placement: Placement) -> bool {
        match self.primitives.get_mut(&handle) {
            Some(primitive) if primitive.editable => {
                primitive.placement = placement;
                self.request_repaint();
                true
            }
            _ => false,
        }
    }

    pub fn request_repaint(&mut self) {
        self.repaints += 1;
    }

    /// Number of repaint requests so far.
    pub fn repaint_count(&self) -> u64 {
        self.repaints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(key: &str) -> Primitive {
        Primitive {
            key: key.into(),
            content: Content::Image {
                raster: Arc::new(RgbaImage::new(2, 2)),
            },
            placement: Placement::default(),
            editable: true,
        }
    }

    #[test]
    fn test_handles_are_never_reused() {
        let mut surface = Surface::new(100, 100, false);
        let a = surface.add(image("a"));
        surface.remove(a);
        let b = surface.add(image("a"));
        assert_ne!(a, b);
        assert!(!surface.contains(a));
        assert_eq!(surface.len(), 1);
    }

    #[test]
    fn test_background_slot_evicts() {
        let mut surface = Surface::new(100, 100, false);
        let (first, evicted) = surface.set_background(image("bg-a"));
        assert!(evicted.is_none());
        let (second, evicted) = surface.set_background(image("bg-b"));
        let (old, old_primitive) = evicted.unwrap();
        assert_eq!(old, first);
        assert_eq!(old_primitive.key.as_str(), "bg-a");
        assert_eq!(surface.background().map(|(h, _)| h), Some(second));
        assert_eq!(surface.len(), 1);
        assert_eq!(surface.stacked().count(), 0);
    }

    #[test]
    fn test_restack_orders_listed_handles_on_top() {
        let mut surface = Surface::new(100, 100, false);
        let a = surface.add(image("a"));
        let b = surface.add(image("b"));
        let c = surface.add(image("c"));
        surface.restack(&[c, a]);
        let order: Vec<PrimitiveHandle> = surface.stacked().map(|(h, _)| h).collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn test_only_editable_primitives_move() {
        let mut surface = Surface::new(100, 100, true);
        let a = surface.add(image("a"));
        let b = surface.add(Primitive {
            editable: false,
            ..image("b")
        });
        let moved = Placement {
            left: 5.0,
            ..Placement::default()
        };
        assert!(surface.set_placement(a, moved));
        assert!(!surface.set_placement(b, moved));
        assert_eq!(surface.get(a).unwrap().placement.left, 5.0);
    }
}
