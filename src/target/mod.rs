//! # Render Targets
//!
//! A render target is a surface plus the zoom it is read out at and the
//! substitution context it is bound to. There are three kinds:
//!
//! - **Edit**: zoom 1, no substitution, primitives can be moved.
//! - **Thumbnail**: preview zoom, bound to one recipient.
//! - **Export**: export zoom, bound to one recipient, rendered once.
//!
//! [`RenderTargetManager`] owns the long-lived targets and the primitive
//! index shared by them; exports get a private index each.

pub mod export;
pub mod index;
pub mod manager;
pub mod queue;

pub use export::{ExportArtifact, ExportOutcome};
pub use index::{Binding, PrimitiveIndex};
pub use manager::RenderTargetManager;
pub use queue::DecodeQueue;

use image::RgbaImage;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::compositor::{ApplyReport, FieldChange};
use crate::model::{FieldKey, FieldMap};
use crate::substitute::SubstitutionContext;
use crate::surface::Surface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Edit,
    Thumbnail,
    Export,
}

/// `Uninitialized → Compositing → Ready`, back to `Compositing` on new inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Uninitialized,
    Compositing,
    Ready,
}

/// Invoked after an interactive transform is committed.
pub type CommitHook = Arc<dyn Fn(&FieldChange) + Send + Sync>;

pub struct RenderTarget {
    kind: TargetKind,
    surface: Surface,
    zoom: f64,
    substitution: Option<SubstitutionContext>,
    state: TargetState,
    pub(crate) queue: DecodeQueue,
    /// Field keys in paint order, as of the last stage.
    pub(crate) order: Vec<FieldKey>,
    /// Decoded rasters of background fields; the last in `order` fills the slot.
    pub(crate) backgrounds: HashMap<FieldKey, Arc<RgbaImage>>,
    pub(crate) pending: ApplyReport,
    /// Inputs of the last completed render.
    rendered: Option<(FieldMap, Option<SubstitutionContext>)>,
    commit_hook: Option<CommitHook>,
}

impl fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTarget")
            .field("kind", &self.kind)
            .field("surface", &self.surface.id())
            .field("zoom", &self.zoom)
            .field("state", &self.state)
            .field("primitives", &self.surface.len())
            .finish()
    }
}

impl RenderTarget {
    pub fn new(
        kind: TargetKind,
        width: u32,
        height: u32,
        zoom: f64,
        substitution: Option<SubstitutionContext>,
    ) -> Self {
        Self {
            kind,
            surface: Surface::new(width, height, kind == TargetKind::Edit),
            zoom,
            substitution,
            state: TargetState::Uninitialized,
            queue: DecodeQueue::new(),
            order: Vec::new(),
            backgrounds: HashMap::new(),
            pending: ApplyReport::default(),
            rendered: None,
            commit_hook: None,
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut Surface {
        &mut self.surface
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TargetState) {
        self.state = state;
    }

    pub fn substitution(&self) -> Option<&SubstitutionContext> {
        self.substitution.as_ref()
    }

    /// Bind a new recipient context. The next render recomposites.
    pub fn rebind(&mut self, substitution: Option<SubstitutionContext>) {
        if self.substitution != substitution {
            self.substitution = substitution;
            if self.state == TargetState::Ready {
                self.state = TargetState::Compositing;
            }
        }
    }

    /// Whether the last completed render used exactly these inputs.
    pub fn is_current(&self, fields: &FieldMap) -> bool {
        self.state == TargetState::Ready
            && self
                .rendered
                .as_ref()
                .is_some_and(|(f, s)| f == fields && *s == self.substitution)
    }

    pub(crate) fn mark_rendered(&mut self, fields: &FieldMap) {
        self.rendered = Some((fields.clone(), self.substitution.clone()));
    }

    /// Forget the last inputs so the next render recomposites.
    pub(crate) fn invalidate(&mut self) {
        self.rendered = None;
    }

    pub fn set_commit_hook(&mut self, hook: CommitHook) {
        self.commit_hook = Some(hook);
    }

    pub(crate) fn commit_hook(&self) -> Option<&CommitHook> {
        self.commit_hook.as_ref()
    }

    /// Tear the target down, keeping only its surface. Outstanding decodes are aborted.
    pub fn into_surface(self) -> Surface {
        self.surface
    }
}
