//! First-page PDF rasterization for background artwork.
//!
//! Diploma backgrounds exported from design tools are usually a PDF page
//! wrapping one or more embedded images. The page is reproduced by
//! painting its image XObjects (including those nested inside form
//! XObjects) with the content stream's transform onto white paper.
//! Vector paths and text operators are not drawn.

use image::{Rgba, RgbaImage};
use kurbo::Affine;
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use crate::error::DiplomaError;
use crate::surface::paint::draw_image;

/// Form XObjects may nest; deeper nesting is ignored.
const MAX_FORM_DEPTH: usize = 8;

/// Whether the bytes look like a PDF file.
pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .is_some_and(|start| bytes[start..].starts_with(b"%PDF-"))
}

/// Page size of the first page in points, after `/Rotate`.
pub fn first_page_size(bytes: &[u8]) -> Result<(f64, f64), DiplomaError> {
    let doc = load(bytes)?;
    let page_id = first_page(&doc)?;
    let view = Viewport::of(&doc, page_id)?;
    Ok(view.display_size())
}

/// Rasterize the first page at `scale` device pixels per point.
///
/// The raster is `floor(width × scale) × floor(height × scale)` of the
/// page viewport (CropBox, else MediaBox). Pages that would need more than
/// `max_pixels` pixels are rejected before anything is allocated.
pub fn rasterize_first_page(bytes: &[u8], scale: f64, max_pixels: u64) -> Result<RgbaImage, DiplomaError> {
    let doc = load(bytes)?;
    let page_id = first_page(&doc)?;
    let view = Viewport::of(&doc, page_id)?;

    let (w, h) = view.display_size();
    let px_w = (w * scale).floor();
    let px_h = (h * scale).floor();
    if px_w < 1.0 || px_h < 1.0 {
        return Err(DiplomaError::Decode(format!(
            "PDF page is too small to rasterize ({}x{} pt)",
            w, h
        )));
    }
    if px_w * px_h > max_pixels as f64 {
        return Err(DiplomaError::Decode(format!(
            "PDF page needs {}x{} pixels, over the {} pixel limit",
            px_w, px_h, max_pixels
        )));
    }
    let mut canvas = RgbaImage::from_pixel(px_w as u32, px_h as u32, Rgba([255, 255, 255, 255]));

    let content = doc
        .get_page_content(page_id)
        .map_err(|e| DiplomaError::Decode(format!("unreadable page content: {}", e)))?;
    let resources = inherited(&doc, page_id, b"Resources").and_then(|o| as_dict(&doc, o));

    let mut painter = Painter {
        doc: &doc,
        canvas: &mut canvas,
        images: 0,
    };
    painter.run(&content, resources, view.device_transform(scale), 0);
    tracing::debug!(
        width = px_w,
        height = px_h,
        images = painter.images,
        "Rasterized PDF first page"
    );
    Ok(canvas)
}

fn load(bytes: &[u8]) -> Result<Document, DiplomaError> {
    Document::load_mem(bytes).map_err(|e| DiplomaError::Decode(format!("not a PDF: {}", e)))
}

fn first_page(doc: &Document) -> Result<ObjectId, DiplomaError> {
    doc.get_pages()
        .into_values()
        .next()
        .ok_or_else(|| DiplomaError::Decode("PDF has no pages".to_string()))
}

// ============================================================================
// PAGE GEOMETRY
// ============================================================================

struct Viewport {
    x0: f64,
    y0: f64,
    width: f64,
    height: f64,
    rotate: i64,
}

impl Viewport {
    fn of(doc: &Document, page_id: ObjectId) -> Result<Self, DiplomaError> {
        let rect = [b"CropBox".as_slice(), b"MediaBox".as_slice()]
            .into_iter()
            .find_map(|key| inherited(doc, page_id, key).and_then(|o| rectangle(doc, o)))
            .ok_or_else(|| DiplomaError::Decode("PDF page has no MediaBox".to_string()))?;
        let rotate = inherited(doc, page_id, b"Rotate")
            .and_then(|o| number(doc, o))
            .map(|r| (r as i64).rem_euclid(360))
            .unwrap_or(0);

        Ok(Self {
            x0: rect[0].min(rect[2]),
            y0: rect[1].min(rect[3]),
            width: (rect[2] - rect[0]).abs(),
            height: (rect[3] - rect[1]).abs(),
            // Only quarter turns are meaningful
            rotate: rotate - rotate % 90,
        })
    }

    fn display_size(&self) -> (f64, f64) {
        if self.rotate == 90 || self.rotate == 270 {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    /// Map PDF user space (y up) to device pixels (y down).
    fn device_transform(&self, scale: f64) -> Affine {
        let (w, h) = (self.width, self.height);
        // Clockwise page rotation, in y-up display space
        let rotation = match self.rotate {
            90 => Affine::new([0.0, -1.0, 1.0, 0.0, 0.0, w]),
            180 => Affine::new([-1.0, 0.0, 0.0, -1.0, w, h]),
            270 => Affine::new([0.0, 1.0, -1.0, 0.0, h, 0.0]),
            _ => Affine::IDENTITY,
        };
        let (_, display_h) = self.display_size();
        let flip = Affine::new([scale, 0.0, 0.0, -scale, 0.0, display_h * scale]);
        flip * rotation * Affine::translate((-self.x0, -self.y0))
    }
}

fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    // Page tree depth is bounded in practice; guard against cycles anyway
    for _ in 0..32 {
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
        let parent = node.get(b"Parent").ok()?;
        node = as_dict(doc, parent)?;
    }
    None
}

// ============================================================================
// OBJECT HELPERS
// ============================================================================

fn deref<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn as_dict<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match deref(doc, object)? {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

fn number(doc: &Document, object: &Object) -> Option<f64> {
    match deref(doc, object)? {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(f64::from(*r)),
        _ => None,
    }
}

fn name<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a [u8]> {
    match deref(doc, object)? {
        Object::Name(n) => Some(n.as_slice()),
        _ => None,
    }
}

fn rectangle(doc: &Document, object: &Object) -> Option<[f64; 4]> {
    let Object::Array(items) = deref(doc, object)? else {
        return None;
    };
    if items.len() != 4 {
        return None;
    }
    let mut out = [0.0; 4];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = number(doc, item)?;
    }
    Some(out)
}

fn matrix(doc: &Document, operands: &[Object]) -> Option<Affine> {
    if operands.len() != 6 {
        return None;
    }
    let mut m = [0.0; 6];
    for (slot, item) in m.iter_mut().zip(operands) {
        *slot = number(doc, item)?;
    }
    Some(Affine::new(m))
}

// ============================================================================
// CONTENT PAINTING
// ============================================================================

struct Painter<'a> {
    doc: &'a Document,
    canvas: &'a mut RgbaImage,
    images: usize,
}

impl Painter<'_> {
    fn run(&mut self, content: &[u8], resources: Option<&Dictionary>, base: Affine, depth: usize) {
        let content = match Content::decode(content) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping undecodable content stream");
                return;
            }
        };

        let mut ctm = Affine::IDENTITY;
        let mut saved: Vec<Affine> = Vec::new();
        for op in &content.operations {
            match op.operator.as_str() {
                "q" => saved.push(ctm),
                "Q" => ctm = saved.pop().unwrap_or(Affine::IDENTITY),
                "cm" => {
                    if let Some(m) = matrix(self.doc, &op.operands) {
                        ctm = ctm * m;
                    }
                }
                "Do" => {
                    let Some(xobject_name) = op.operands.first().and_then(|o| name(self.doc, o))
                    else {
                        continue;
                    };
                    let doc = self.doc;
                    let Some(stream) = resources.and_then(|r| xobject(doc, r, xobject_name))
                    else {
                        continue;
                    };
                    self.draw_xobject(stream, resources, base * ctm, depth);
                }
                _ => {}
            }
        }
    }

    fn draw_xobject(
        &mut self,
        stream: &Stream,
        parent_resources: Option<&Dictionary>,
        transform: Affine,
        depth: usize,
    ) {
        let subtype = stream.dict.get(b"Subtype").ok().and_then(|o| name(self.doc, o));
        match subtype {
            Some(b"Image") => match decode_image(self.doc, stream) {
                Some(image) => {
                    let (w, h) = image.dimensions();
                    // Images fill the unit square, first row at the top
                    let unit = Affine::new([
                        1.0 / f64::from(w),
                        0.0,
                        0.0,
                        -1.0 / f64::from(h),
                        0.0,
                        1.0,
                    ]);
                    draw_image(self.canvas, &image, transform * unit, 1.0);
                    self.images += 1;
                }
                None => tracing::debug!("Skipping unsupported image XObject"),
            },
            Some(b"Form") if depth < MAX_FORM_DEPTH => {
                let form_matrix = stream
                    .dict
                    .get(b"Matrix")
                    .ok()
                    .and_then(|o| match deref(self.doc, o) {
                        Some(Object::Array(items)) => matrix(self.doc, items),
                        _ => None,
                    })
                    .unwrap_or(Affine::IDENTITY);
                let resources = stream
                    .dict
                    .get(b"Resources")
                    .ok()
                    .and_then(|o| as_dict(self.doc, o))
                    .or(parent_resources);
                let content = stream
                    .decompressed_content()
                    .unwrap_or_else(|_| stream.content.clone());
                self.run(&content, resources, transform * form_matrix, depth + 1);
            }
            _ => {}
        }
    }
}

fn xobject<'a>(doc: &'a Document, resources: &'a Dictionary, xobject_name: &[u8]) -> Option<&'a Stream> {
    let xobjects = as_dict(doc, resources.get(b"XObject").ok()?)?;
    match deref(doc, xobjects.get(xobject_name).ok()?)? {
        Object::Stream(stream) => Some(stream),
        _ => None,
    }
}

fn filters<'a>(doc: &'a Document, stream: &'a Stream) -> Vec<&'a [u8]> {
    match stream.dict.get(b"Filter").ok().and_then(|o| deref(doc, o)) {
        Some(Object::Name(n)) => vec![n.as_slice()],
        Some(Object::Array(items)) => items.iter().filter_map(|o| name(doc, o)).collect(),
        _ => Vec::new(),
    }
}

fn decode_image(doc: &Document, stream: &Stream) -> Option<RgbaImage> {
    let filters = filters(doc, stream);
    match filters.last().copied() {
        Some(b"DCTDecode") if filters.len() == 1 => {
            return image::load_from_memory_with_format(&stream.content, image::ImageFormat::Jpeg)
                .ok()
                .map(|img| img.to_rgba8());
        }
        Some(b"JPXDecode") | Some(b"CCITTFaxDecode") | Some(b"JBIG2Decode") => return None,
        _ => {}
    }

    let dict = &stream.dict;
    let width = dict.get(b"Width").ok().and_then(|o| number(doc, o))? as u32;
    let height = dict.get(b"Height").ok().and_then(|o| number(doc, o))? as u32;
    let bits = dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(|o| number(doc, o))
        .unwrap_or(8.0) as u32;
    if width == 0 || height == 0 || bits != 8 {
        return None;
    }

    let data = if filters.is_empty() {
        stream.content.clone()
    } else {
        stream.decompressed_content().ok()?
    };
    let pixels = width as usize * height as usize;
    let components = data.len() / pixels;
    if data.len() < pixels || !matches!(components, 1 | 3 | 4) {
        return None;
    }

    Some(RgbaImage::from_fn(width, height, |x, y| {
        let i = (y as usize * width as usize + x as usize) * components;
        match components {
            1 => Rgba([data[i], data[i], data[i], 255]),
            3 => Rgba([data[i], data[i + 1], data[i + 2], 255]),
            _ => {
                // DeviceCMYK
                let k = 255 - u16::from(data[i + 3]);
                let channel = |c: u8| ((255 - u16::from(c)) * k / 255) as u8;
                Rgba([channel(data[i]), channel(data[i + 1]), channel(data[i + 2]), 255])
            }
        }
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::dictionary;

    const LIMIT: u64 = 10_000_000;

    /// One-page PDF with a 2×2 RGB image placed by `placement` (a `cm` operand string).
    pub(crate) fn pdf_with_image(media_box: [f64; 4], placement: &str, extra: Dictionary) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        // Top row red/green, bottom row blue/white
        let pixels: Vec<u8> = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 2,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            pixels,
        ));
        let content = format!("q {} cm /Im0 Do Q", placement);
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.into_bytes()));

        let mut page = dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => media_box.iter().map(|v| Object::Real(*v as f32)).collect::<Vec<_>>(),
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        };
        for (key, value) in extra.iter() {
            page.set(key.clone(), value.clone());
        }
        let page_id = doc.add_object(page);

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_detects_pdf_header() {
        assert!(is_pdf(b"%PDF-1.7\n..."));
        assert!(is_pdf(b"\n %PDF-1.4"));
        assert!(!is_pdf(b"\x89PNG\r\n"));
    }

    #[test]
    fn test_raster_size_is_viewport_times_scale_floored() {
        let pdf = pdf_with_image([0.0, 0.0, 100.7, 50.3], "1 0 0 1 0 0", Dictionary::new());
        let img = rasterize_first_page(&pdf, 2.0, LIMIT).unwrap();
        assert_eq!(img.dimensions(), (201, 100));
    }

    #[test]
    fn test_crop_box_wins_and_rotate_swaps() {
        let pdf = pdf_with_image(
            [0.0, 0.0, 200.0, 100.0],
            "1 0 0 1 0 0",
            dictionary! {
                "CropBox" => vec![10.into(), 10.into(), 110.into(), 60.into()],
                "Rotate" => 90,
            },
        );
        assert_eq!(first_page_size(&pdf).unwrap(), (50.0, 100.0));
        let img = rasterize_first_page(&pdf, 2.0, LIMIT).unwrap();
        assert_eq!(img.dimensions(), (100, 200));
    }

    #[test]
    fn test_image_xobject_is_placed_with_ctm() {
        // Page 200×100 pt; image drawn at x 10..110, y 20..70 (y up)
        let pdf = pdf_with_image([0.0, 0.0, 200.0, 100.0], "100 0 0 50 10 20", Dictionary::new());
        let img = rasterize_first_page(&pdf, 2.0, LIMIT).unwrap();
        assert_eq!(img.dimensions(), (400, 200));

        // Device rect: x 20..220, y 60..160; each source pixel is 100×50
        assert_eq!(*img.get_pixel(40, 70), Rgba([255, 0, 0, 255]));
        assert_eq!(*img.get_pixel(200, 70), Rgba([0, 255, 0, 255]));
        assert_eq!(*img.get_pixel(40, 150), Rgba([0, 0, 255, 255]));
        assert_eq!(*img.get_pixel(5, 5), Rgba([255, 255, 255, 255]));
        assert_eq!(*img.get_pixel(300, 100), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(matches!(
            rasterize_first_page(b"%PDF-1.4 not really", 2.0, LIMIT),
            Err(DiplomaError::Decode(_))
        ));
    }

    #[test]
    fn test_oversized_page_is_rejected_before_allocating() {
        let pdf = pdf_with_image([0.0, 0.0, 200_000.0, 200_000.0], "1 0 0 1 0 0", Dictionary::new());
        assert!(matches!(
            rasterize_first_page(&pdf, 2.0, LIMIT),
            Err(DiplomaError::Decode(msg)) if msg.contains("pixel limit")
        ));
    }
}
