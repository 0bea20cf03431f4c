//! Paint pass: surface to RGBA raster at a given zoom, and PNG encoding.
//!
//! Every primitive is drawn by inverse-mapping destination pixels through
//! its affine transform and sampling the source bilinearly. Rows are
//! painted in parallel.

use image::{ImageEncoder, RgbaImage};
use kurbo::{Affine, Point, Rect};
use rayon::prelude::*;

use super::text::{self, FontBook};
use super::{Content, Primitive, Surface};
use crate::error::DiplomaError;
use crate::loader::RasterPayload;

/// Upper bound on text supersampling relative to the device scale.
const MAX_TEXT_RESOLUTION: f64 = 16.0;

/// Output size of a surface painted at `zoom`.
pub fn output_size(surface: &Surface, zoom: f64) -> (u32, u32) {
    let w = (f64::from(surface.width()) * zoom).round().max(1.0) as u32;
    let h = (f64::from(surface.height()) * zoom).round().max(1.0) as u32;
    (w, h)
}

/// Paint the whole surface on white paper.
pub fn render(surface: &Surface, zoom: f64, fonts: &FontBook) -> RgbaImage {
    let (w, h) = output_size(surface, zoom);
    let mut canvas = RgbaImage::from_pixel(w, h, image::Rgba([255, 255, 255, 255]));
    let device = Affine::scale(zoom);

    if let Some((_, background)) = surface.background()
        && let Content::Image { raster } = &background.content
        && raster.width() > 0
    {
        // Fill the surface width; height follows the aspect ratio
        let fit = f64::from(surface.width()) / f64::from(raster.width());
        draw_image(&mut canvas, raster, device * Affine::scale(fit), 1.0);
    }

    for (_, primitive) in surface.stacked() {
        draw_primitive(&mut canvas, primitive, zoom, fonts);
    }
    canvas
}

fn draw_primitive(canvas: &mut RgbaImage, primitive: &Primitive, zoom: f64, fonts: &FontBook) {
    let device = Affine::scale(zoom);
    let placement = &primitive.placement;
    match &primitive.content {
        Content::Image { raster } => {
            let (w, h) = raster.dimensions();
            let transform = device * placement.affine(f64::from(w), f64::from(h));
            draw_image(canvas, raster, transform, placement.opacity);
        }
        Content::Text {
            text,
            font,
            font_size,
            color,
        } => {
            let magnification = placement.scale_x.abs().max(placement.scale_y.abs());
            let resolution = (zoom * magnification).clamp(0.05, MAX_TEXT_RESOLUTION * zoom.max(1.0));
            let face = fonts.resolve(font);
            let raster = text::rasterize(text, face.as_ref(), *font_size, *color, resolution);
            let transform = device
                * placement.affine(raster.logical_width, raster.logical_height)
                * Affine::scale(1.0 / raster.resolution);
            draw_image(canvas, &raster.image, transform, placement.opacity);
        }
    }
}

/// Composite `src` onto `canvas` through `transform` (source pixels to canvas pixels).
pub fn draw_image(canvas: &mut RgbaImage, src: &RgbaImage, transform: Affine, opacity: f64) {
    let (sw, sh) = src.dimensions();
    let (cw, ch) = canvas.dimensions();
    if sw == 0 || sh == 0 || cw == 0 || ch == 0 || opacity <= 0.0 {
        return;
    }
    if transform.determinant().abs() < 1e-12 {
        return;
    }
    let inverse = transform.inverse();

    let bounds = transform.transform_rect_bbox(Rect::new(0.0, 0.0, f64::from(sw), f64::from(sh)));
    let x0 = bounds.x0.floor().max(0.0) as u32;
    let y0 = bounds.y0.floor().max(0.0) as u32;
    let x1 = (bounds.x1.ceil().min(f64::from(cw))).max(0.0) as u32;
    let y1 = (bounds.y1.ceil().min(f64::from(ch))).max(0.0) as u32;
    if x0 >= x1 || y0 >= y1 {
        return;
    }

    let opacity = opacity.min(1.0) as f32;
    let stride = cw as usize * 4;
    let buffer: &mut [u8] = canvas;
    buffer
        .par_chunks_mut(stride)
        .enumerate()
        .skip(y0 as usize)
        .take((y1 - y0) as usize)
        .for_each(|(y, row)| {
            for x in x0..x1 {
                let p = inverse * Point::new(f64::from(x) + 0.5, y as f64 + 0.5);
                if p.x < 0.0 || p.y < 0.0 || p.x >= f64::from(sw) || p.y >= f64::from(sh) {
                    continue;
                }
                let [r, g, b, a] = sample_bilinear(src, p.x - 0.5, p.y - 0.5);
                let alpha = a / 255.0 * opacity;
                if alpha <= 0.0 {
                    continue;
                }
                let px = &mut row[x as usize * 4..x as usize * 4 + 4];
                blend_over(px, [r, g, b], alpha);
            }
        });
}

fn sample_bilinear(src: &RgbaImage, x: f64, y: f64) -> [f32; 4] {
    let max_x = src.width() - 1;
    let max_y = src.height() - 1;
    let x = x.clamp(0.0, f64::from(max_x));
    let y = y.clamp(0.0, f64::from(max_y));
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);
    let fx = (x - f64::from(x0)) as f32;
    let fy = (y - f64::from(y0)) as f32;

    let p00 = src.get_pixel(x0, y0).0;
    let p10 = src.get_pixel(x1, y0).0;
    let p01 = src.get_pixel(x0, y1).0;
    let p11 = src.get_pixel(x1, y1).0;

    // Interpolate premultiplied so transparent texels do not bleed color
    let mut out = [0.0f32; 4];
    let weights = [
        (p00, (1.0 - fx) * (1.0 - fy)),
        (p10, fx * (1.0 - fy)),
        (p01, (1.0 - fx) * fy),
        (p11, fx * fy),
    ];
    for (p, w) in weights {
        let a = f32::from(p[3]) / 255.0;
        out[0] += f32::from(p[0]) * a * w;
        out[1] += f32::from(p[1]) * a * w;
        out[2] += f32::from(p[2]) * a * w;
        out[3] += f32::from(p[3]) * w;
    }
    let a = out[3] / 255.0;
    if a > 0.0 {
        out[0] /= a;
        out[1] /= a;
        out[2] /= a;
    }
    out
}

fn blend_over(dst: &mut [u8], rgb: [f32; 3], alpha: f32) {
    let da = f32::from(dst[3]) / 255.0;
    let out_a = alpha + da * (1.0 - alpha);
    if out_a <= 0.0 {
        return;
    }
    for i in 0..3 {
        let blended = (rgb[i] * alpha + f32::from(dst[i]) * da * (1.0 - alpha)) / out_a;
        dst[i] = blended.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
}

/// Encode an RGBA raster as PNG bytes.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, DiplomaError> {
    let mut png_bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(png_bytes)
}

/// Encode an RGBA raster as a `data:image/png;base64,...` payload.
pub fn png_data_uri(image: &RgbaImage) -> Result<RasterPayload, DiplomaError> {
    Ok(RasterPayload::from_bytes("image/png", &encode_png(image)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Placement;
    use crate::surface::Primitive;
    use image::Rgba;
    use std::sync::Arc;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    fn solid(w: u32, h: u32, color: Rgba<u8>) -> Arc<RgbaImage> {
        Arc::new(RgbaImage::from_pixel(w, h, color))
    }

    #[test]
    fn test_output_size_follows_zoom() {
        let surface = Surface::new(842, 595, false);
        assert_eq!(output_size(&surface, 1.0), (842, 595));
        assert_eq!(output_size(&surface, 4.0), (3368, 2380));
        assert_eq!(output_size(&surface, 0.2), (168, 119));
    }

    #[test]
    fn test_empty_surface_is_white() {
        let surface = Surface::new(10, 10, false);
        let img = render(&surface, 1.0, &FontBook::shared(&[]));
        assert!(img.pixels().all(|p| *p == Rgba([255, 255, 255, 255])));
    }

    #[test]
    fn test_image_primitive_lands_at_placement() {
        let mut surface = Surface::new(100, 100, false);
        surface.add(Primitive {
            key: "ImageField-0".into(),
            content: Content::Image {
                raster: solid(10, 10, RED),
            },
            placement: Placement::image_default(),
            editable: true,
        });
        let img = render(&surface, 2.0, &FontBook::shared(&[]));
        assert_eq!(img.dimensions(), (200, 200));
        // Logical 10..20 becomes device 20..40
        assert_eq!(*img.get_pixel(30, 30), RED);
        assert_eq!(*img.get_pixel(19, 30), Rgba([255, 255, 255, 255]));
        assert_eq!(*img.get_pixel(41, 30), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_background_fills_width_under_stack() {
        let mut surface = Surface::new(100, 50, false);
        let blue = Rgba([0, 0, 255, 255]);
        surface.add(Primitive {
            key: "ImageField-0".into(),
            content: Content::Image {
                raster: solid(10, 10, RED),
            },
            placement: Placement::default(),
            editable: true,
        });
        surface.set_background(Primitive {
            key: "BackgroundImage-0".into(),
            content: Content::Image {
                raster: solid(20, 10, blue),
            },
            placement: Placement::default(),
            editable: false,
        });
        let img = render(&surface, 1.0, &FontBook::shared(&[]));
        assert_eq!(*img.get_pixel(5, 5), RED);
        assert_eq!(*img.get_pixel(95, 45), blue);
    }

    #[test]
    fn test_opacity_blends_with_paper() {
        let mut canvas = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        draw_image(&mut canvas, &RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255])), Affine::IDENTITY, 0.5);
        let p = canvas.get_pixel(1, 1).0;
        assert!((i32::from(p[0]) - 128).abs() <= 1);
        assert_eq!(p[3], 255);
    }

    #[test]
    fn test_png_encoding_round_trips_dimensions() {
        let img = RgbaImage::from_pixel(7, 3, RED);
        let png = encode_png(&img).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (7, 3));
        assert!(png_data_uri(&img).unwrap().as_str().starts_with("data:image/png;base64,"));
    }
}
