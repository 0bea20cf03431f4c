//! Per-key reconciliation decisions and projection helpers.

use crate::loader::RasterPayload;
use crate::model::{BackgroundImage, FieldKey, FieldMap, FieldRecord, ImageField, Placement, TextField};
use crate::substitute::{self, SubstitutionContext};
use crate::target::Binding;

/// Share of the surface width a newly created image is scaled to.
pub const IMAGE_WIDTH_SHARE: f64 = 0.7;

/// What the compositor does for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing bound yet: build a primitive.
    Create,
    /// Bound but different: change it in place.
    Update,
    /// Bound record equals the projected one.
    Unchanged,
    /// A decode for exactly this record is already under way.
    Pending,
}

/// Decide what to do for one key given its binding and any outstanding decode.
pub fn classify(
    binding: Option<&Binding>,
    pending: Option<&FieldRecord>,
    resolved: &FieldRecord,
) -> Action {
    if pending == Some(resolved) {
        return Action::Pending;
    }
    match binding {
        // An outstanding decode for another record must be superseded
        Some(b) if b.record == *resolved && pending.is_none() => Action::Unchanged,
        Some(b) if b.handle.is_some() => Action::Update,
        _ => Action::Create,
    }
}

/// Bound keys that are no longer in the model.
pub fn removed_keys<'a>(
    bound: impl IntoIterator<Item = &'a FieldKey>,
    fields: &FieldMap,
) -> Vec<FieldKey> {
    bound
        .into_iter()
        .filter(|key| !fields.contains_key(key.as_str()))
        .cloned()
        .collect()
}

/// The record as this target sees it: tokens in text and image payloads expanded.
pub fn resolve_record(record: &FieldRecord, context: Option<&SubstitutionContext>) -> FieldRecord {
    match record {
        FieldRecord::TextField(text) => FieldRecord::TextField(TextField {
            text: substitute::resolve(&text.text, context).into_owned(),
            ..text.clone()
        }),
        FieldRecord::ImageField(image) => FieldRecord::ImageField(ImageField {
            image: resolve_payload(image.image.as_ref(), context),
            placement: image.placement.clone(),
        }),
        FieldRecord::BackgroundImage(bg) => FieldRecord::BackgroundImage(BackgroundImage {
            image: resolve_payload(bg.image.as_ref(), context),
        }),
    }
}

fn resolve_payload(
    payload: Option<&RasterPayload>,
    context: Option<&SubstitutionContext>,
) -> Option<RasterPayload> {
    let payload = payload?;
    if context.is_none() || !substitute::has_tokens(payload.as_str()) {
        return Some(payload.clone());
    }
    let resolved = substitute::resolve(payload.as_str(), context);
    if resolved.trim().is_empty() {
        None
    } else {
        Some(RasterPayload::new(resolved.into_owned()))
    }
}

/// Transform of an image primitive: defaults, then the persisted placement.
///
/// Without a persisted scale the image is scaled to a fixed share of the
/// surface width.
pub fn image_placement(record: &FieldRecord, image_width: u32, surface_width: u32) -> Placement {
    let persisted = record.placement();
    let mut base = Placement::image_default();
    if !Placement::has_explicit_scale(persisted) && image_width > 0 {
        let scale = IMAGE_WIDTH_SHARE * f64::from(surface_width) / f64::from(image_width);
        base.scale_x = scale;
        base.scale_y = scale;
    }
    base.overlaid(persisted)
}

/// Transform of a text primitive: centered defaults, then the persisted placement.
pub fn text_placement(record: &FieldRecord, surface_width: u32, surface_height: u32) -> Placement {
    Placement::text_default(surface_width, surface_height).overlaid(record.placement())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldKind, registry};
    use crate::surface::Surface;
    use serde_json::json;

    fn text(s: &str) -> FieldRecord {
        registry::materialize(&json!({"type": "TextField", "text": s})).unwrap()
    }

    #[test]
    fn test_classify() {
        let record = text("a");
        let mut surface = Surface::new(10, 10, false);
        let handle = surface.add(crate::surface::Primitive {
            key: "TextField-0".into(),
            content: crate::surface::Content::Text {
                text: "a".into(),
                font: "Sans".into(),
                font_size: 10.0,
                color: crate::model::Color::BLACK,
            },
            placement: Placement::default(),
            editable: false,
        });
        let bound = Binding {
            handle: Some(handle),
            record: record.clone(),
            placement: None,
        };

        assert_eq!(classify(None, None, &record), Action::Create);
        assert_eq!(classify(Some(&bound), None, &record), Action::Unchanged);
        assert_eq!(classify(Some(&bound), None, &text("b")), Action::Update);
        assert_eq!(classify(Some(&bound), Some(&text("b")), &text("b")), Action::Pending);
        assert_eq!(classify(Some(&bound), Some(&text("b")), &record), Action::Update);

        let empty = Binding { handle: None, ..bound };
        assert_eq!(classify(Some(&empty), None, &text("b")), Action::Create);
    }

    #[test]
    fn test_resolve_record_expands_text_and_payload_tokens() {
        let ctx = SubstitutionContext::new(
            json!({}),
            json!({"name": "Ada", "photo": "data:image/png;base64,AAAA"}),
        );
        let resolved = resolve_record(&text("Hi ${player.name}"), Some(&ctx));
        let FieldRecord::TextField(t) = resolved else { panic!() };
        assert_eq!(t.text, "Hi Ada");

        let image = registry::materialize(&json!({"type": "ImageField", "image": "${player.photo}"})).unwrap();
        assert_eq!(
            resolve_record(&image, Some(&ctx)).image().map(RasterPayload::as_str),
            Some("data:image/png;base64,AAAA")
        );
        // Unresolvable payload tokens mean no image
        let missing = registry::materialize(&json!({"type": "ImageField", "image": "${player.nope}"})).unwrap();
        assert!(resolve_record(&missing, Some(&ctx)).image().is_none());
        // Without context nothing changes
        assert_eq!(resolve_record(&image, None), image);
    }

    #[test]
    fn test_image_placement_scales_only_without_persisted_scale() {
        let fresh = registry::new_record(FieldKind::ImageField).unwrap();
        let p = image_placement(&fresh, 200, 800);
        assert_eq!((p.left, p.top), (10.0, 10.0));
        assert!((p.scale_x - 2.8).abs() < 1e-12);

        let moved = fresh.with_placement(json!({"left": 50, "scaleX": 1.5}).as_object().cloned().unwrap());
        let p = image_placement(&moved, 200, 800);
        assert_eq!(p.left, 50.0);
        assert_eq!(p.scale_x, 1.5);
        assert_eq!(p.scale_y, 1.0);
    }

    #[test]
    fn test_text_placement_centers() {
        let p = text_placement(&text("x"), 842, 595);
        assert_eq!(p.left, 421.0);
        assert!((p.top - 595.0 * 0.39).abs() < 1e-9);
        assert_eq!(p.origin_x, crate::model::OriginX::Center);
    }
}
