//! # Compositor
//!
//! Projects a [`FieldMap`] onto a [`RenderTarget`]'s surface.
//!
//! `apply` is `stage` followed by `settle`:
//!
//! - **stage** (synchronous) diffs the surface's bound keys against the
//!   model. Text is created or updated immediately, removed keys are
//!   detached, and image payloads are handed to the target's decode queue.
//! - **settle** (asynchronous) waits for the outstanding decodes, places
//!   each raster (discarding stale generations), then restacks the surface
//!   into model order.
//!
//! A per-field failure is recorded in [`ApplyReport::errors`] and only that
//! field is affected.

pub mod reconcile;

use image::RgbaImage;
use std::sync::Arc;

use crate::error::{DiplomaError, FieldError};
use crate::loader::{LoadPurpose, RasterLoader};
use crate::model::{FieldKey, FieldKind, FieldMap, FieldRecord, Placement};
use crate::surface::{Content, Primitive, PrimitiveHandle};
use crate::target::queue::Delivery;
use crate::target::{Binding, PrimitiveIndex, RenderTarget, TargetState};
use reconcile::{Action, classify, image_placement, removed_keys, resolve_record, text_placement};

/// Per-key outcome of one `apply`.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub created: Vec<FieldKey>,
    pub updated: Vec<FieldKey>,
    pub removed: Vec<FieldKey>,
    pub unchanged: Vec<FieldKey>,
    /// Fields that render nothing (no image, or an image that failed).
    pub empty: Vec<FieldKey>,
    /// Decode completions dropped because a newer decode superseded them.
    pub stale: usize,
    pub errors: Vec<FieldError>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether the apply changed nothing on the surface.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// An unchanged field whose primitive still changed on the surface.
    fn restaged(&mut self, key: &FieldKey) {
        if let Some(at) = self.unchanged.iter().position(|k| k == key) {
            self.unchanged.remove(at);
            self.updated.push(key.clone());
        }
    }

    fn projected(&mut self, key: &FieldKey, created: bool) {
        if created {
            self.created.push(key.clone());
        } else {
            self.updated.push(key.clone());
        }
    }
}

/// A committed interactive edit: the field's record with its new placement.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub key: FieldKey,
    pub record: FieldRecord,
}

#[derive(Debug, Clone, Default)]
pub struct Compositor {
    loader: RasterLoader,
}

impl Compositor {
    pub fn new(loader: RasterLoader) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &RasterLoader {
        &self.loader
    }

    /// Stage and settle. Resolves once every field's contribution is in place.
    #[tracing::instrument(skip_all, fields(surface = %target.surface().id(), kind = ?target.kind(), fields = fields.len()))]
    pub async fn apply(
        &self,
        target: &mut RenderTarget,
        index: &mut PrimitiveIndex,
        fields: &FieldMap,
    ) -> ApplyReport {
        self.stage(target, index, fields);
        let report = self.settle(target, index).await;
        tracing::debug!(
            created = report.created.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged.len(),
            stale = report.stale,
            errors = report.errors.len(),
            "Applied fields"
        );
        report
    }

    /// Reconcile synchronously; image decodes are only scheduled.
    pub fn stage(&self, target: &mut RenderTarget, index: &mut PrimitiveIndex, fields: &FieldMap) {
        target.set_state(TargetState::Compositing);
        let sid = target.surface().id();

        let bound = index.keys_for(sid);
        for key in removed_keys(bound.iter(), fields) {
            self.detach(target, index, &key);
            target.pending.removed.push(key);
        }
        for key in target.queue.inflight_keys() {
            if !fields.contains_key(key.as_str()) {
                target.queue.cancel(&key);
            }
        }

        target.order = fields.keys().cloned().collect();
        let context = target.substitution().cloned();
        for (key, record) in fields.iter() {
            let resolved = resolve_record(record, context.as_ref());
            match classify(index.get(sid, key), target.queue.pending(key), &resolved) {
                Action::Unchanged => target.pending.unchanged.push(key.clone()),
                Action::Pending => {}
                Action::Create | Action::Update => self.project(target, index, key, resolved),
            }
        }
    }

    /// Wait for outstanding decodes, place their rasters and restack.
    pub async fn settle(&self, target: &mut RenderTarget, index: &mut PrimitiveIndex) -> ApplyReport {
        while let Some(delivery) = target.queue.next().await {
            match delivery {
                Delivery::Stale { key, generation } => {
                    tracing::debug!(key = %key, generation, "Discarding stale decode");
                    target.pending.stale += 1;
                }
                Delivery::Current {
                    key,
                    record,
                    result: Ok(raster),
                } => self.place_image(target, index, key, record, raster),
                Delivery::Current {
                    key,
                    record,
                    result: Err(error),
                } => {
                    tracing::warn!(key = %key, error = %error, "Field image failed to decode");
                    self.release(target, index, &key);
                    bind(target, index, &key, None, record);
                    target.pending.empty.push(key.clone());
                    target.pending.errors.push(FieldError::new(key, error));
                }
            }
        }

        self.place_background(target, index);
        let sid = target.surface().id();
        let stack: Vec<PrimitiveHandle> = target
            .order
            .iter()
            .filter_map(|key| index.get(sid, key).and_then(|b| b.handle))
            .collect();
        target.surface_mut().restack(&stack);
        target.set_state(TargetState::Ready);
        std::mem::take(&mut target.pending)
    }

    fn project(
        &self,
        target: &mut RenderTarget,
        index: &mut PrimitiveIndex,
        key: &FieldKey,
        resolved: FieldRecord,
    ) {
        if let FieldRecord::TextField(text) = &resolved {
            let content = Content::Text {
                text: text.text.clone(),
                font: text.font.clone(),
                font_size: text.font_size,
                color: text.color,
            };
            let (w, h) = (target.surface().width(), target.surface().height());
            let placement = text_placement(&resolved, w, h);
            let created = self.upsert(target, index, key, &resolved, content, placement);
            target.pending.projected(key, created);
            return;
        }

        let Some(payload) = resolved.image().cloned() else {
            // No image: whatever was shown goes away
            target.queue.cancel(key);
            let had_primitive = self.release(target, index, key);
            bind(target, index, key, None, resolved);
            if had_primitive {
                target.pending.updated.push(key.clone());
            }
            target.pending.empty.push(key.clone());
            return;
        };

        let purpose = match resolved.kind() {
            FieldKind::BackgroundImage => LoadPurpose::Background,
            _ => LoadPurpose::Image,
        };
        if let Err(error) = target
            .queue
            .schedule(&self.loader, key.clone(), resolved, payload, purpose)
        {
            target.pending.errors.push(FieldError::new(key.clone(), error));
        }
    }

    fn place_image(
        &self,
        target: &mut RenderTarget,
        index: &mut PrimitiveIndex,
        key: FieldKey,
        record: FieldRecord,
        raster: Arc<RgbaImage>,
    ) {
        if record.kind() != FieldKind::BackgroundImage {
            let placement = image_placement(&record, raster.width(), target.surface().width());
            let created = self.upsert(target, index, &key, &record, Content::Image { raster }, placement);
            target.pending.projected(&key, created);
            return;
        }

        // Backgrounds only collect their raster; settle picks the one that shows
        let handle = live_handle(target, index, &key);
        let created = target.backgrounds.insert(key.clone(), raster).is_none();
        bind(target, index, &key, handle, record);
        target.pending.projected(&key, created);
    }

    /// Fill the background slot from the last background field in model order
    /// that has a raster. Other background fields are bound without a primitive.
    fn place_background(&self, target: &mut RenderTarget, index: &mut PrimitiveIndex) {
        let sid = target.surface().id();
        let winner = target
            .order
            .iter()
            .rev()
            .find_map(|key| target.backgrounds.get(key).map(|raster| (key.clone(), raster.clone())));
        let current = target
            .surface()
            .background()
            .map(|(handle, p)| (handle, p.key.clone(), p.content.clone()));

        let Some((key, raster)) = winner else {
            if let Some((handle, shown, _)) = current {
                target.surface_mut().remove(handle);
                if let Some(binding) = index.get_mut(sid, &shown) {
                    binding.handle = None;
                }
                target.pending.restaged(&shown);
            }
            return;
        };
        if let Some((_, shown, Content::Image { raster: showing })) = &current
            && *shown == key
            && Arc::ptr_eq(showing, &raster)
        {
            return;
        }

        let (handle, evicted) = target.surface_mut().set_background(Primitive {
            key: key.clone(),
            content: Content::Image { raster },
            placement: Placement::default(),
            editable: false,
        });
        if let Some((_, other)) = evicted
            && other.key != key
            && let Some(binding) = index.get_mut(sid, &other.key)
        {
            binding.handle = None;
            target.pending.restaged(&other.key);
        }
        if let Some(binding) = index.get_mut(sid, &key) {
            binding.handle = Some(handle);
        }
        target.pending.restaged(&key);
    }

    /// Update the bound primitive in place, or create one. Returns whether it was created.
    ///
    /// An existing primitive keeps its transform unless the persisted
    /// placement changed since it was last projected.
    fn upsert(
        &self,
        target: &mut RenderTarget,
        index: &mut PrimitiveIndex,
        key: &FieldKey,
        record: &FieldRecord,
        content: Content,
        placement: Placement,
    ) -> bool {
        let sid = target.surface().id();
        let last_placement = index.get(sid, key).and_then(|b| b.placement.clone());
        let (handle, created) = match live_handle(target, index, key) {
            Some(handle) => {
                let surface = target.surface_mut();
                if let Some(primitive) = surface.get_mut(handle) {
                    primitive.content = content;
                    if last_placement.as_ref() != record.placement() {
                        primitive.placement = placement;
                    }
                }
                surface.request_repaint();
                (handle, false)
            }
            None => {
                let editable = target.surface().is_interactive() && record.kind().is_editable();
                let handle = target.surface_mut().add(Primitive {
                    key: key.clone(),
                    content,
                    placement,
                    editable,
                });
                (handle, true)
            }
        };
        bind(target, index, key, Some(handle), record.clone());
        created
    }

    /// Release the key's primitive (and background raster) but keep its
    /// binding. Returns whether anything was released.
    fn release(&self, target: &mut RenderTarget, index: &mut PrimitiveIndex, key: &FieldKey) -> bool {
        let sid = target.surface().id();
        let had_raster = target.backgrounds.remove(key).is_some();
        let Some(handle) = index.get_mut(sid, key).and_then(|b| b.handle.take()) else {
            return had_raster;
        };
        target.surface_mut().remove(handle).is_some() || had_raster
    }

    /// Detach a key from the target entirely: primitive, binding and in-flight decode.
    pub fn detach(&self, target: &mut RenderTarget, index: &mut PrimitiveIndex, key: &FieldKey) -> bool {
        target.queue.cancel(key);
        let released = self.release(target, index, key);
        index.remove(target.surface().id(), key);
        if released {
            target.invalidate();
        }
        released
    }

    /// Fold an interactive transform of `key` back into its record.
    ///
    /// `record` is the field as the template has it now, which may be ahead
    /// of what the surface shows. Only editable primitives on the interactive target can be committed.
    /// The target's commit hook runs before the change is returned.
    pub fn commit(
        &self,
        target: &mut RenderTarget,
        index: &mut PrimitiveIndex,
        key: &FieldKey,
        record: &FieldRecord,
    ) -> Result<FieldChange, DiplomaError> {
        if !target.surface().is_interactive() || !record.kind().is_editable() {
            return Err(DiplomaError::Configuration(format!(
                "{} cannot be moved on a {:?} target",
                key,
                target.kind()
            )));
        }
        let sid = target.surface().id();
        let no_primitive = || DiplomaError::Configuration(format!("{} has no primitive", key));
        let binding = index.get(sid, key).ok_or_else(no_primitive)?;
        let handle = binding.handle.ok_or_else(no_primitive)?;
        let shown = binding.record.clone();
        let primitive = target.surface().get(handle).ok_or_else(no_primitive)?;

        let persisted = primitive.placement.merge_into(record.placement());
        // The primitive still shows `shown`; only its placement is now current.
        // A content edit not yet rendered is picked up by the next apply.
        bind(target, index, key, Some(handle), shown.with_placement(persisted.clone()));
        let updated = record.clone().with_placement(persisted);

        let change = FieldChange {
            key: key.clone(),
            record: updated,
        };
        if let Some(hook) = target.commit_hook() {
            hook(&change);
        }
        tracing::debug!(key = %key, "Committed transform");
        Ok(change)
    }
}

/// Handle of the key's primitive, if it is still on the surface.
fn live_handle(target: &RenderTarget, index: &PrimitiveIndex, key: &FieldKey) -> Option<PrimitiveHandle> {
    index
        .get(target.surface().id(), key)
        .and_then(|b| b.handle)
        .filter(|h| target.surface().contains(*h))
}

/// Record what is now projected for `key`.
fn bind(
    target: &RenderTarget,
    index: &mut PrimitiveIndex,
    key: &FieldKey,
    handle: Option<PrimitiveHandle>,
    record: FieldRecord,
) {
    let placement = record.placement().cloned();
    index.insert(
        target.surface().id(),
        key.clone(),
        Binding {
            handle,
            record,
            placement,
        },
    );
}
