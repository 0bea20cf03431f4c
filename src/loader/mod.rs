//! # Asynchronous Raster Loader
//!
//! Decodes field payloads into RGBA rasters on the blocking pool.
//!
//! Background payloads are tried as PDF first (first page only, see
//! [`pdf`]), then as an ordinary image. Successful decodes are cached per
//! `(payload, purpose)`, and concurrent requests for the same entry wait
//! on a single decode. Entries stay until [`RasterLoader::retain`] drops
//! the payloads nothing renders anymore.

pub mod payload;
pub mod pdf;

pub use payload::{PayloadBytes, RasterPayload};

use image::RgbaImage;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OnceCell, RwLock};

use crate::error::DiplomaError;

/// What a payload is decoded for. PDF input is only accepted for backgrounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadPurpose {
    Background,
    Image,
}

/// Largest raster a single decode may produce (RGBA, so 4 bytes each).
pub const DEFAULT_MAX_PIXELS: u64 = 64_000_000;

type CacheKey = (RasterPayload, LoadPurpose);
type CacheSlot = Arc<OnceCell<Arc<RgbaImage>>>;

/// Shared, cloneable decoder with a decode cache.
#[derive(Debug, Clone)]
pub struct RasterLoader {
    cache: Arc<RwLock<HashMap<CacheKey, CacheSlot>>>,
    pdf_scale: f64,
    max_pixels: u64,
    decodes: Arc<AtomicU64>,
}

impl RasterLoader {
    pub fn new(pdf_scale: f64) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            pdf_scale,
            max_pixels: DEFAULT_MAX_PIXELS,
            decodes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cap the pixel count of every decoded raster.
    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = max_pixels;
        self
    }

    /// Decode `payload`, reusing an earlier decode when there is one.
    pub async fn load(
        &self,
        payload: RasterPayload,
        purpose: LoadPurpose,
    ) -> Result<Arc<RgbaImage>, DiplomaError> {
        let key = (payload.clone(), purpose);
        let slot = {
            let cache = self.cache.read().await;
            cache.get(&key).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut cache = self.cache.write().await;
                cache.entry(key).or_default().clone()
            }
        };

        let raster = slot
            .get_or_try_init(|| async move {
                self.decodes.fetch_add(1, Ordering::Relaxed);
                let (pdf_scale, max_pixels) = (self.pdf_scale, self.max_pixels);
                tokio::task::spawn_blocking(move || {
                    decode_payload(&payload, purpose, pdf_scale, max_pixels)
                })
                    .await
                    .map_err(|e| DiplomaError::Image(format!("Decode task failed: {}", e)))?
                    .map(Arc::new)
            })
            .await?;
        Ok(raster.clone())
    }

    /// Number of decodes actually performed (cache misses).
    pub fn decode_count(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    /// Number of cached entries.
    pub async fn cached(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Drop cached rasters whose payload is not in `live`. Returns how many went.
    ///
    /// A decode still running for a dropped entry completes for its callers
    /// but is not cached.
    pub async fn retain(&self, live: &HashSet<RasterPayload>) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|(payload, _), _| live.contains(payload));
        before - cache.len()
    }

    /// Drop every cached raster.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}

impl Default for RasterLoader {
    fn default() -> Self {
        Self::new(2.0)
    }
}

/// Decode a payload synchronously.
///
/// Rasters over `max_pixels` are a [`DiplomaError::Decode`]; nothing that
/// large is allocated.
pub fn decode_payload(
    payload: &RasterPayload,
    purpose: LoadPurpose,
    pdf_scale: f64,
    max_pixels: u64,
) -> Result<RgbaImage, DiplomaError> {
    let PayloadBytes { mime, bytes } = payload.decode()?;

    let mut pdf_error = None;
    if purpose == LoadPurpose::Background {
        match pdf::rasterize_first_page(&bytes, pdf_scale, max_pixels) {
            Ok(raster) => return Ok(raster),
            Err(e) if pdf::is_pdf(&bytes) || mime.as_deref() == Some("application/pdf") => {
                tracing::debug!(error = %e, "PDF background did not rasterize, trying as image");
                pdf_error = Some(e);
            }
            Err(_) => {}
        }
    }

    let mut reader = image::ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|e| DiplomaError::Decode(format!("unreadable payload: {}", e)))?;
    let mut limits = image::Limits::default();
    limits.max_alloc = Some(max_pixels.saturating_mul(4));
    reader.limits(limits);

    reader.decode().map(|img| img.to_rgba8()).map_err(|e| match pdf_error {
        Some(pdf) => pdf,
        None => DiplomaError::Decode(format!("payload is neither an image nor a PDF: {}", e)),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgba;

    /// A solid-color PNG as a data URI payload.
    pub(crate) fn png_payload(w: u32, h: u32, color: [u8; 4]) -> RasterPayload {
        let img = RgbaImage::from_pixel(w, h, Rgba(color));
        let bytes = crate::surface::paint::encode_png(&img).unwrap();
        RasterPayload::from_bytes("image/png", &bytes)
    }

    #[tokio::test]
    async fn test_decodes_png() {
        let loader = RasterLoader::default();
        let raster = loader
            .load(png_payload(3, 2, [1, 2, 3, 255]), LoadPurpose::Image)
            .await
            .unwrap();
        assert_eq!(raster.dimensions(), (3, 2));
        assert_eq!(raster.get_pixel(0, 0).0, [1, 2, 3, 255]);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_decode() {
        let loader = RasterLoader::default();
        let payload = png_payload(8, 8, [0, 0, 0, 255]);
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let loader = loader.clone();
                let payload = payload.clone();
                tokio::spawn(async move { loader.load(payload, LoadPurpose::Image).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(loader.decode_count(), 1);

        // A different purpose is a different entry
        loader.load(payload, LoadPurpose::Background).await.unwrap();
        assert_eq!(loader.decode_count(), 2);
    }

    #[tokio::test]
    async fn test_garbage_is_decode_error_and_not_cached() {
        let loader = RasterLoader::default();
        let garbage = RasterPayload::from_bytes("image/png", b"definitely not an image");
        for _ in 0..2 {
            assert!(matches!(
                loader.load(garbage.clone(), LoadPurpose::Background).await,
                Err(DiplomaError::Decode(_))
            ));
        }
        assert_eq!(loader.decode_count(), 2);
    }

    #[test]
    fn test_pdf_background_uses_first_page() {
        let pdf = pdf::tests::pdf_with_image([0.0, 0.0, 50.0, 40.0], "50 0 0 40 0 0", lopdf::Dictionary::new());
        let payload = RasterPayload::from_bytes("application/pdf", &pdf);
        let raster = decode_payload(&payload, LoadPurpose::Background, 2.0, DEFAULT_MAX_PIXELS).unwrap();
        assert_eq!(raster.dimensions(), (100, 80));

        // PDFs are not images
        assert!(matches!(
            decode_payload(&payload, LoadPurpose::Image, 2.0, DEFAULT_MAX_PIXELS),
            Err(DiplomaError::Decode(_))
        ));
    }

    #[test]
    fn test_oversized_pdf_background_is_a_field_error() {
        let pdf = pdf::tests::pdf_with_image(
            [0.0, 0.0, 200_000.0, 200_000.0],
            "1 0 0 1 0 0",
            lopdf::Dictionary::new(),
        );
        let payload = RasterPayload::from_bytes("application/pdf", &pdf);
        let result = decode_payload(&payload, LoadPurpose::Background, 2.0, DEFAULT_MAX_PIXELS);
        assert!(matches!(result, Err(DiplomaError::Decode(msg)) if msg.contains("pixel limit")));
    }

    #[test]
    fn test_image_over_pixel_limit_is_rejected() {
        let payload = png_payload(64, 64, [0, 0, 0, 255]);
        assert!(matches!(
            decode_payload(&payload, LoadPurpose::Image, 2.0, 1_000),
            Err(DiplomaError::Decode(_))
        ));
        assert!(decode_payload(&payload, LoadPurpose::Image, 2.0, 1_000_000).is_ok());
    }

    #[tokio::test]
    async fn test_retain_drops_unreferenced_payloads() {
        let loader = RasterLoader::default();
        let payloads: Vec<_> = (0..40u8).map(|i| png_payload(20, 20, [i, 0, 0, 255])).collect();
        for payload in &payloads {
            loader.load(payload.clone(), LoadPurpose::Image).await.unwrap();
        }
        assert_eq!(loader.cached().await, 40);

        let live: HashSet<_> = payloads[39..].iter().cloned().collect();
        assert_eq!(loader.retain(&live).await, 39);
        assert_eq!(loader.cached().await, 1);

        // The survivor is still served from cache
        loader.load(payloads[39].clone(), LoadPurpose::Image).await.unwrap();
        assert_eq!(loader.decode_count(), 40);
    }
}
