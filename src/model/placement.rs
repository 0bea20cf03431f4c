//! # Placement
//!
//! A field's transform on the surface, in logical surface coordinates.
//!
//! The persisted form is an opaque JSON object ([`PlacementMap`]) so that
//! keys this engine does not interpret survive a load/save cycle. The keys
//! it does interpret follow the canvas-library names they were saved with:
//! `left`, `top`, `scaleX`, `scaleY`, `angle` (degrees), `opacity`,
//! `originX`, `originY`, `flipX`, `flipY`.

use kurbo::Affine;
use serde::{Deserialize, Serialize};

/// Opaque persisted placement data.
pub type PlacementMap = serde_json::Map<String, serde_json::Value>;

/// Horizontal anchor of the `left` coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginX {
    #[default]
    Left,
    Center,
    Right,
}

/// Vertical anchor of the `top` coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginY {
    #[default]
    Top,
    Center,
    Bottom,
}

impl OriginX {
    fn factor(self) -> f64 {
        match self {
            OriginX::Left => 0.0,
            OriginX::Center => 0.5,
            OriginX::Right => 1.0,
        }
    }
}

impl OriginY {
    fn factor(self) -> f64 {
        match self {
            OriginY::Top => 0.0,
            OriginY::Center => 0.5,
            OriginY::Bottom => 1.0,
        }
    }
}

/// Resolved placement of one primitive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Placement {
    pub left: f64,
    pub top: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    pub angle: f64,
    pub opacity: f64,
    pub origin_x: OriginX,
    pub origin_y: OriginY,
    pub flip_x: bool,
    pub flip_y: bool,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            angle: 0.0,
            opacity: 1.0,
            origin_x: OriginX::Left,
            origin_y: OriginY::Top,
            flip_x: false,
            flip_y: false,
        }
    }
}

/// Keys of [`PlacementMap`] that [`Placement`] interprets.
pub const INTERPRETED_KEYS: [&str; 10] = [
    "left", "top", "scaleX", "scaleY", "angle", "opacity", "originX", "originY", "flipX", "flipY",
];

impl Placement {
    /// Creation default for image fields: near the top-left corner.
    pub fn image_default() -> Self {
        Self {
            left: 10.0,
            top: 10.0,
            ..Default::default()
        }
    }

    /// Creation default for text fields: horizontally centered, a bit above middle.
    pub fn text_default(surface_width: u32, surface_height: u32) -> Self {
        Self {
            left: f64::from(surface_width) / 2.0,
            top: f64::from(surface_height) * 0.39,
            origin_x: OriginX::Center,
            ..Default::default()
        }
    }

    /// Overlay the interpreted keys of a persisted map on top of `self`.
    ///
    /// Null and ill-typed values are ignored key by key, so one bad value
    /// does not discard the rest of the placement.
    pub fn overlaid(self, persisted: Option<&PlacementMap>) -> Self {
        let Some(persisted) = persisted else {
            return self;
        };
        let mut placement = self;
        for (key, value) in persisted {
            if value.is_null() {
                continue;
            }
            let applied = match key.as_str() {
                "left" => value.as_f64().map(|v| placement.left = v),
                "top" => value.as_f64().map(|v| placement.top = v),
                "scaleX" => value.as_f64().map(|v| placement.scale_x = v),
                "scaleY" => value.as_f64().map(|v| placement.scale_y = v),
                "angle" => value.as_f64().map(|v| placement.angle = v),
                "opacity" => value.as_f64().map(|v| placement.opacity = v.clamp(0.0, 1.0)),
                "originX" => serde_json::from_value(value.clone())
                    .ok()
                    .map(|v| placement.origin_x = v),
                "originY" => serde_json::from_value(value.clone())
                    .ok()
                    .map(|v| placement.origin_y = v),
                "flipX" => value.as_bool().map(|v| placement.flip_x = v),
                "flipY" => value.as_bool().map(|v| placement.flip_y = v),
                _ => Some(()),
            };
            if applied.is_none() {
                tracing::debug!(key = %key, value = %value, "Ignoring ill-typed placement value");
            }
        }
        placement
    }

    /// Whether the persisted map carries an explicit scale.
    pub fn has_explicit_scale(persisted: Option<&PlacementMap>) -> bool {
        persisted.is_some_and(|p| {
            ["scaleX", "scaleY"]
                .iter()
                .any(|k| p.get(*k).is_some_and(|v| !v.is_null()))
        })
    }

    /// Write the interpreted keys into `base`, keeping everything else it holds.
    pub fn merge_into(&self, base: Option<&PlacementMap>) -> PlacementMap {
        let mut out = base.cloned().unwrap_or_default();
        if let Ok(serde_json::Value::Object(own)) = serde_json::to_value(self) {
            for (key, value) in own {
                out.insert(key, value);
            }
        }
        out
    }

    /// Object-to-surface transform for a primitive of intrinsic size `width × height`.
    ///
    /// Flips mirror the primitive inside its own box, then the origin point
    /// is moved onto (`left`, `top`) after scaling and rotation about it.
    pub fn affine(&self, width: f64, height: f64) -> Affine {
        let origin = (self.origin_x.factor() * width, self.origin_y.factor() * height);
        let flip = Affine::translate((width / 2.0, height / 2.0))
            * Affine::scale_non_uniform(
                if self.flip_x { -1.0 } else { 1.0 },
                if self.flip_y { -1.0 } else { 1.0 },
            )
            * Affine::translate((-width / 2.0, -height / 2.0));

        Affine::translate((self.left, self.top))
            * Affine::rotate(self.angle.to_radians())
            * Affine::scale_non_uniform(self.scale_x, self.scale_y)
            * Affine::translate((-origin.0, -origin.1))
            * flip
    }
}
