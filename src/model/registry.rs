//! Field type defaults, materialization and key allocation.

use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::{FieldKey, FieldKind, FieldMap, FieldRecord, Template};
use crate::error::{DiplomaError, FieldError};

/// Attribute defaults seeded into every new or loaded field of `kind`.
pub fn defaults_for(kind: FieldKind) -> Map<String, Value> {
    let value = match kind {
        FieldKind::BackgroundImage => json!({ "image": null }),
        FieldKind::ImageField => json!({ "image": null }),
        FieldKind::TextField => json!({
            "text": "Example Text",
            "font": "Sans",
            "font_size": 24,
            "color": "#000",
        }),
    };
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// A freshly created field of `kind`, carrying only its defaults.
pub fn new_record(kind: FieldKind) -> Result<FieldRecord, DiplomaError> {
    materialize(&json!({ "type": kind.as_str() }))
}

/// Overlay the raw record's non-null attributes onto its type defaults.
///
/// Older records spell some attributes differently (`fontSize`,
/// `fabric_props`); those are folded into the canonical names first.
pub fn materialize(raw: &Value) -> Result<FieldRecord, DiplomaError> {
    let obj = raw.as_object().ok_or_else(|| {
        DiplomaError::Configuration(format!("Field record must be an object, got {}", raw))
    })?;

    let kind: FieldKind = match obj.get("type") {
        Some(Value::String(tag)) => tag.parse()?,
        Some(other) => {
            return Err(DiplomaError::Configuration(format!(
                "Field type must be a string, got {}",
                other
            )));
        }
        None => {
            return Err(DiplomaError::Configuration(
                "Field record has no 'type'".to_string(),
            ));
        }
    };

    let mut merged = defaults_for(kind);
    for (key, value) in canonical_attributes(obj) {
        if !value.is_null() {
            merged.insert(key, value);
        }
    }
    merged.insert("type".to_string(), Value::String(kind.as_str().to_string()));
    merged.remove("order");

    serde_json::from_value(Value::Object(merged))
        .map_err(|e| DiplomaError::Configuration(format!("Malformed {} field: {}", kind, e)))
}

fn canonical_attributes(obj: &Map<String, Value>) -> Vec<(String, Value)> {
    let alias = |canonical: &str, legacy: &str| -> Option<Value> {
        obj.get(canonical)
            .filter(|v| !v.is_null())
            .or_else(|| obj.get(legacy))
            .cloned()
    };

    let mut out: Vec<(String, Value)> = obj
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "fontSize" | "font_size" | "fabric_props" | "placement"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(size) = alias("font_size", "fontSize") {
        out.push(("font_size".to_string(), size));
    }
    if let Some(placement) = alias("placement", "fabric_props") {
        out.push(("placement".to_string(), placement));
    }
    out
}

/// Materialize a whole persisted `fields` object.
///
/// Fields that fail are left out and reported. The result is sorted by
/// each field's `order`; fields without one follow in their original order.
pub fn parse_fields(raw: &Value) -> (FieldMap, Vec<FieldError>) {
    let Some(obj) = raw.as_object() else {
        let error = DiplomaError::Configuration(format!("Fields must be an object, got {}", raw));
        return (FieldMap::new(), vec![FieldError::new("fields".into(), error)]);
    };

    let mut errors = Vec::new();
    let mut parsed: Vec<(Option<i64>, usize, FieldKey, FieldRecord)> = Vec::new();
    for (position, (key, value)) in obj.iter().enumerate() {
        let key = FieldKey::from(key.as_str());
        match materialize(value) {
            Ok(record) => {
                let order = value.get("order").and_then(Value::as_i64);
                parsed.push((order, position, key, record));
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Skipping field");
                errors.push(FieldError::new(key, e));
            }
        }
    }

    parsed.sort_by(|a, b| match (a.0, b.0) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.1.cmp(&b.1)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.1.cmp(&b.1),
    });

    let fields = parsed
        .into_iter()
        .map(|(_, _, key, record)| (key, record))
        .collect();
    (fields, errors)
}

/// Hands out `${type}-${ordinal}` keys, never repeating an ordinal.
#[derive(Debug, Clone, Default)]
pub struct KeyAllocator {
    next: HashMap<FieldKind, u32>,
}

impl KeyAllocator {
    /// Start past every ordinal already present in `fields`.
    pub fn seeded(fields: &FieldMap) -> Self {
        let mut next = HashMap::new();
        for (kind, n) in fields.keys().filter_map(FieldKey::ordinal) {
            let slot = next.entry(kind).or_insert(0);
            *slot = (*slot).max(n.saturating_add(1));
        }
        Self { next }
    }

    pub fn allocate(&mut self, kind: FieldKind, fields: &FieldMap) -> FieldKey {
        let ordinal = self.next.entry(kind).or_insert(0);
        loop {
            let key = FieldKey::new(format!("{}-{}", kind, ordinal));
            *ordinal = ordinal.saturating_add(1);
            // Hand-written keys may collide with the counter
            if !fields.contains_key(key.as_str()) {
                return key;
            }
        }
    }
}

/// The built-in template used when nothing can be loaded.
pub fn default_template() -> Template {
    let mut fields = FieldMap::new();
    for kind in [FieldKind::BackgroundImage, FieldKind::TextField] {
        if let Ok(record) = new_record(kind) {
            fields.insert(FieldKey::new(format!("{}-0", kind)), record);
        }
    }
    Template {
        name: "Diploma".to_string(),
        fields,
    }
}
