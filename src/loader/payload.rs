//! Raster payloads: images embedded in templates as `data:` URIs.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::DiplomaError;

/// An encoded image or PDF as stored in a field record.
///
/// Cloning is cheap; payloads are shared between every target that
/// renders the field.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RasterPayload(Arc<str>);

/// Bytes carried by a data URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBytes {
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

impl RasterPayload {
    pub fn new(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    /// Wrap encoded bytes as a base64 data URI.
    pub fn from_bytes(mime: &str, bytes: &[u8]) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self::new(format!("data:{};base64,{}", mime, encoded))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the data URI into raw bytes.
    pub fn decode(&self) -> Result<PayloadBytes, DiplomaError> {
        let raw = self.0.trim();
        let rest = raw
            .get(..5)
            .filter(|scheme| scheme.eq_ignore_ascii_case("data:"))
            .map(|_| &raw[5..])
            .ok_or_else(|| DiplomaError::Decode("payload is not a data: URI".to_string()))?;
        let (header, data) = rest
            .split_once(',')
            .ok_or_else(|| DiplomaError::Decode("data URI has no ',' separator".to_string()))?;

        let mut is_base64 = false;
        let mut mime = None;
        for (idx, segment) in header.split(';').enumerate() {
            let seg = segment.trim();
            if seg.eq_ignore_ascii_case("base64") {
                is_base64 = true;
            } else if idx == 0 && seg.contains('/') {
                mime = Some(seg.to_ascii_lowercase());
            }
        }

        let bytes = if is_base64 {
            // Line breaks sneak into pasted payloads
            let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| DiplomaError::Decode(format!("invalid base64 payload: {}", e)))?
        } else {
            percent_decode(data)?
        };
        Ok(PayloadBytes { mime, bytes })
    }
}

impl PartialEq for RasterPayload {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for RasterPayload {}

impl Hash for RasterPayload {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for RasterPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Payloads run to megabytes; show the head only
        let head: String = self.0.chars().take(48).collect();
        if head.len() < self.0.len() {
            write!(f, "RasterPayload({:?}.. {} bytes)", head, self.0.len())
        } else {
            write!(f, "RasterPayload({:?})", head)
        }
    }
}

fn percent_decode(input: &str) -> Result<Vec<u8>, DiplomaError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    DiplomaError::Decode(format!("bad percent escape at offset {}", i))
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}
