//! Font lookup and text rasterization.
//!
//! Fonts are resolved by family name through fontdb (system fonts plus
//! configured directories) with a sans-serif fallback, then rendered to an
//! anti-aliased RGBA bitmap with ab_glyph.

use ab_glyph::{Font, FontArc, FontVec, GlyphId, ScaleFont};
use image::{Rgba, RgbaImage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use crate::model::Color;

/// Line box height as a multiple of the font size.
pub const LINE_HEIGHT: f64 = 1.16;

/// Largest text raster; bigger text is rasterized at a lower resolution.
pub const MAX_TEXT_PIXELS: u64 = 16_777_216;

/// Font database plus a cache of parsed faces.
pub struct FontBook {
    db: fontdb::Database,
    loaded: Mutex<HashMap<fontdb::ID, FontArc>>,
}

impl std::fmt::Debug for FontBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontBook")
            .field("faces", &self.db.len())
            .finish()
    }
}

static SYSTEM_FONTS: OnceLock<Arc<FontBook>> = OnceLock::new();

impl FontBook {
    /// A font book with system fonts and the given extra directories.
    ///
    /// Without extra directories the process-wide system book is shared,
    /// so the system scan happens once.
    pub fn shared(font_dirs: &[PathBuf]) -> Arc<FontBook> {
        if font_dirs.is_empty() {
            return SYSTEM_FONTS
                .get_or_init(|| Arc::new(FontBook::scan(&[])))
                .clone();
        }
        Arc::new(FontBook::scan(font_dirs))
    }

    fn scan(font_dirs: &[PathBuf]) -> FontBook {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        for dir in font_dirs {
            db.load_fonts_dir(dir);
        }
        tracing::debug!(faces = db.len(), "Font database loaded");
        FontBook {
            db,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a family name, falling back to any sans-serif face.
    pub fn resolve(&self, family: &str) -> Option<FontArc> {
        let generic = match family.trim().to_ascii_lowercase().as_str() {
            "sans" | "sans-serif" => Some(fontdb::Family::SansSerif),
            "serif" => Some(fontdb::Family::Serif),
            "mono" | "monospace" => Some(fontdb::Family::Monospace),
            "cursive" => Some(fontdb::Family::Cursive),
            _ => None,
        };
        let named = [generic.unwrap_or(fontdb::Family::Name(family)), fontdb::Family::SansSerif];
        let id = self
            .db
            .query(&fontdb::Query {
                families: &named,
                weight: fontdb::Weight::NORMAL,
                stretch: fontdb::Stretch::Normal,
                style: fontdb::Style::Normal,
            })
            // Last resort: whatever face exists
            .or_else(|| self.db.faces().next().map(|face| face.id))?;

        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(font) = loaded.get(&id) {
            return Some(font.clone());
        }
        let font = self
            .db
            .with_face_data(id, |data, index| {
                FontVec::try_from_vec_and_index(data.to_vec(), index).ok()
            })
            .flatten()
            .map(FontArc::new)?;
        loaded.insert(id, font.clone());
        Some(font)
    }
}

/// Text rendered at some resolution, plus its size in logical units.
#[derive(Debug, Clone)]
pub struct TextRaster {
    pub image: RgbaImage,
    pub logical_width: f64,
    pub logical_height: f64,
    /// Device pixels per logical unit the image was drawn at.
    pub resolution: f64,
}

/// Rasterize multi-line, left-aligned text.
///
/// `resolution` is device pixels per logical unit. Without a font the
/// raster is blank but still sized from an average glyph width, so
/// placement stays meaningful. Text that would exceed [`MAX_TEXT_PIXELS`]
/// is rasterized once more at a resolution that fits; if even that is too
/// large the raster stays blank.
pub fn rasterize(
    text: &str,
    font: Option<&FontArc>,
    font_size: f64,
    color: Color,
    resolution: f64,
) -> TextRaster {
    rasterize_within(text, font, font_size, color, resolution, true)
}

fn rasterize_within(
    text: &str,
    font: Option<&FontArc>,
    font_size: f64,
    color: Color,
    resolution: f64,
    may_shrink: bool,
) -> TextRaster {
    let lines: Vec<&str> = text.split('\n').collect();
    let px = (font_size * resolution).max(1.0) as f32;
    if !px.is_finite() || !resolution.is_finite() || resolution <= 0.0 {
        return blank(1, 1, 0.0, 0.0, 1.0);
    }
    let line_px = px * LINE_HEIGHT as f32;
    let height_px = line_px * lines.len() as f32;

    let Some(font) = font else {
        let longest = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
        let width_px = 0.5 * px * longest as f32;
        let (w, h) = ((width_px.ceil() as u32).max(1), (height_px.ceil() as u32).max(1));
        // Blank either way; only allocate what the cap allows
        let (w, h) = if u64::from(w) * u64::from(h) > MAX_TEXT_PIXELS { (1, 1) } else { (w, h) };
        return blank(
            w,
            h,
            f64::from(width_px) / resolution,
            f64::from(height_px) / resolution,
            resolution,
        );
    };

    let scaled = font.as_scaled(px);
    let ascent = scaled.ascent();
    let descent = scaled.descent();
    // Center the glyph box vertically in each line box
    let leading = (line_px - (ascent - descent)) / 2.0;

    let mut placed: Vec<(GlyphId, f32, f32)> = Vec::new();
    let mut widest = 0.0f32;
    for (row, line) in lines.iter().enumerate() {
        let baseline = row as f32 * line_px + leading + ascent;
        let mut caret = 0.0f32;
        let mut previous: Option<GlyphId> = None;
        for ch in line.chars() {
            let id = scaled.glyph_id(ch);
            if let Some(prev) = previous {
                caret += scaled.kern(prev, id);
            }
            placed.push((id, caret, baseline));
            caret += scaled.h_advance(id);
            previous = Some(id);
        }
        widest = widest.max(caret);
    }

    let width = (widest.ceil() as u32).max(1);
    let height = (height_px.ceil() as u32).max(1);
    let area = u64::from(width) * u64::from(height);
    if area > MAX_TEXT_PIXELS {
        let logical_width = f64::from(widest) / resolution;
        let logical_height = f64::from(height_px) / resolution;
        if !may_shrink {
            tracing::warn!(width, height, "Text too large to rasterize");
            return blank(1, 1, logical_width, logical_height, resolution);
        }
        let shrink = (MAX_TEXT_PIXELS as f64 / area as f64).sqrt() * 0.95;
        return rasterize_within(text, Some(font), font_size, color, resolution * shrink, false);
    }
    let mut coverage = vec![0.0f32; width as usize * height as usize];

    for (id, x, baseline) in placed {
        let glyph = id.with_scale_and_position(px, ab_glyph::point(x, baseline));
        if let Some(outlined) = font.outline_glyph(glyph) {
            let bounds = outlined.px_bounds();
            outlined.draw(|gx, gy, c| {
                let x = gx as i64 + bounds.min.x as i64;
                let y = gy as i64 + bounds.min.y as i64;
                if x >= 0 && y >= 0 && x < i64::from(width) && y < i64::from(height) {
                    let idx = y as usize * width as usize + x as usize;
                    coverage[idx] = (coverage[idx] + c).min(1.0);
                }
            });
        }
    }

    let alpha = f32::from(color.a);
    let image = RgbaImage::from_fn(width, height, |x, y| {
        let c = coverage[y as usize * width as usize + x as usize];
        Rgba([color.r, color.g, color.b, (c * alpha).round() as u8])
    });

    TextRaster {
        image,
        logical_width: f64::from(widest) / resolution,
        logical_height: f64::from(height_px) / resolution,
        resolution,
    }
}

fn blank(width: u32, height: u32, logical_width: f64, logical_height: f64, resolution: f64) -> TextRaster {
    TextRaster {
        image: RgbaImage::new(width, height),
        logical_width,
        logical_height,
        resolution,
    }
}
