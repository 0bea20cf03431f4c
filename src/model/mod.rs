//! # Field Model
//!
//! The declarative side of a diploma: a [`Template`] is a name plus an
//! ordered [`FieldMap`] of [`FieldRecord`]s addressed by [`FieldKey`].
//!
//! Field order is paint order (later fields paint on top), except that a
//! [`FieldRecord::BackgroundImage`] always paints to the surface's
//! dedicated background slot underneath everything else.
//!
//! ```
//! use diploma::model::{FieldKind, registry};
//!
//! let template = registry::default_template();
//! let kinds: Vec<FieldKind> = template.fields.iter().map(|(_, f)| f.kind()).collect();
//! assert_eq!(kinds, vec![FieldKind::BackgroundImage, FieldKind::TextField]);
//! ```

pub mod color;
pub mod placement;
pub mod registry;

pub use color::Color;
pub use placement::{OriginX, OriginY, Placement, PlacementMap};

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::{DiplomaError, FieldError};
use crate::loader::RasterPayload;

// ============================================================================
// FIELD KIND & KEY
// ============================================================================

/// The closed set of field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    BackgroundImage,
    ImageField,
    TextField,
}

impl FieldKind {
    pub const ALL: [FieldKind; 3] = [
        FieldKind::BackgroundImage,
        FieldKind::ImageField,
        FieldKind::TextField,
    ];

    /// The persisted type tag, which is also the key prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::BackgroundImage => "BackgroundImage",
            FieldKind::ImageField => "ImageField",
            FieldKind::TextField => "TextField",
        }
    }

    /// Human-readable display label.
    pub fn label(self) -> &'static str {
        match self {
            FieldKind::BackgroundImage => "Background Image",
            FieldKind::ImageField => "Image",
            FieldKind::TextField => "Text",
        }
    }

    /// Whether primitives of this kind can be moved on the edit surface.
    pub fn is_editable(self) -> bool {
        !matches!(self, FieldKind::BackgroundImage)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKind {
    type Err = DiplomaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DiplomaError::Configuration(format!("Unknown field type '{}'", s)))
    }
}

/// Stable identity of a field within a template, e.g. `TextField-0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldKey(String);

impl FieldKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a `${type}-${ordinal}` key. Keys of other shapes return `None`.
    pub fn ordinal(&self) -> Option<(FieldKind, u32)> {
        let (prefix, n) = self.0.rsplit_once('-')?;
        Some((prefix.parse().ok()?, n.parse().ok()?))
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FieldKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for FieldKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// FIELD RECORDS
// ============================================================================

/// One visual element of a diploma.
///
/// Records are always fully populated: anything read from storage goes
/// through [`registry::materialize`] first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FieldRecord {
    BackgroundImage(BackgroundImage),
    ImageField(ImageField),
    TextField(TextField),
}

/// Full-width artwork painted into the surface's background slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackgroundImage {
    pub image: Option<RasterPayload>,
}

/// A free-floating picture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageField {
    pub image: Option<RasterPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementMap>,
}

/// A line (or lines) of text, possibly containing `${...}` tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextField {
    pub text: String,
    pub font: String,
    #[serde(deserialize_with = "deserialize_lenient_number")]
    pub font_size: f64,
    pub color: Color,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementMap>,
}

/// Font sizes were stored straight from form inputs, so `"32"` is as valid as `32`.
fn deserialize_lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberValue {
        Number(f64),
        Text(String),
    }

    match NumberValue::deserialize(deserializer)? {
        NumberValue::Number(n) => Ok(n),
        NumberValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("expected a number, got '{}'", s))),
    }
}

impl FieldRecord {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldRecord::BackgroundImage(_) => FieldKind::BackgroundImage,
            FieldRecord::ImageField(_) => FieldKind::ImageField,
            FieldRecord::TextField(_) => FieldKind::TextField,
        }
    }

    /// The raster payload, for image-bearing kinds.
    pub fn image(&self) -> Option<&RasterPayload> {
        match self {
            FieldRecord::BackgroundImage(f) => f.image.as_ref(),
            FieldRecord::ImageField(f) => f.image.as_ref(),
            FieldRecord::TextField(_) => None,
        }
    }

    /// The persisted transform, if the field has ever been committed.
    pub fn placement(&self) -> Option<&PlacementMap> {
        match self {
            FieldRecord::BackgroundImage(_) => None,
            FieldRecord::ImageField(f) => f.placement.as_ref(),
            FieldRecord::TextField(f) => f.placement.as_ref(),
        }
    }

    /// Replace the persisted transform. Backgrounds have none and are returned as-is.
    pub fn with_placement(mut self, placement: PlacementMap) -> Self {
        match &mut self {
            FieldRecord::BackgroundImage(_) => {}
            FieldRecord::ImageField(f) => f.placement = Some(placement),
            FieldRecord::TextField(f) => f.placement = Some(placement),
        }
        self
    }

    /// Serialize to the persisted JSON object form.
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

// ============================================================================
// FIELD MAP
// ============================================================================

/// Ordered mapping from field key to record. Iteration order is paint order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    entries: Vec<(FieldKey, FieldRecord)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FieldRecord> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, record)| record)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace. A replaced field keeps its position in paint order.
    pub fn insert(&mut self, key: FieldKey, record: FieldRecord) -> Option<FieldRecord> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, record)),
            None => {
                self.entries.push((key, record));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldRecord> {
        let pos = self.entries.iter().position(|(k, _)| k.as_str() == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldKey, &FieldRecord)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &FieldKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    /// Persisted form: a JSON object in paint order with an explicit `order` per field.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (position, (key, record)) in self.entries.iter().enumerate() {
            let mut obj = record.to_json();
            obj.insert("order".to_string(), serde_json::Value::from(position as u64));
            out.insert(key.to_string(), serde_json::Value::Object(obj));
        }
        serde_json::Value::Object(out)
    }
}

impl FromIterator<(FieldKey, FieldRecord)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (FieldKey, FieldRecord)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (key, record) in iter {
            map.insert(key, record);
        }
        map
    }
}

impl Serialize for FieldMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let serde_json::Value::Object(obj) = self.to_json() else {
            return Err(serde::ser::Error::custom("field map did not serialize to an object"));
        };
        let mut map = serializer.serialize_map(Some(obj.len()))?;
        for (key, value) in &obj {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

// ============================================================================
// TEMPLATE
// ============================================================================

/// A named, ordered set of fields. Treated as a value: edits build a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub fields: FieldMap,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: FieldMap::new(),
        }
    }

    /// Build from persisted `{ name, fields }`. Bad fields are skipped and reported.
    pub fn from_parts(name: Option<String>, fields: &serde_json::Value) -> (Self, Vec<FieldError>) {
        let (fields, errors) = registry::parse_fields(fields);
        let template = Template {
            name: name.unwrap_or_default(),
            fields,
        };
        (template, errors)
    }

    /// Copy with one field inserted or replaced.
    pub fn with_field(&self, key: FieldKey, record: FieldRecord) -> Self {
        let mut next = self.clone();
        next.fields.insert(key, record);
        next
    }

    /// Copy with one field removed.
    pub fn without_field(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.fields.remove(key);
        next
    }
}
