//! Pure raster geometry: normalized-box cropping with rotation
//! correction. Deterministic for fixed inputs, no network, no state —
//! everything remote (detection, fill, restoration) happens elsewhere.

use crate::error::StageError;
use crate::pipeline::types::{BoundingRegion, NORMALIZED_SPAN};
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::debug;

/// Result of cropping one region out of a source scan.
#[derive(Debug, Clone)]
pub struct CropOutput {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    /// Contour mapped into output-pixel space, present only when the
    /// region is flagged for synthetic fill. The crop's corners outside
    /// the polygon are left untouched; filling them belongs to the
    /// outpaint stage.
    pub contour_px: Option<Vec<(u32, u32)>>,
}

/// Crop `region` out of `source`, expanding the box symmetrically by
/// `padding_fraction` of its own size (clamped to the source bounds)
/// and rotating the result back to upright.
///
/// The rotation hint records the photo's existing clockwise deviation,
/// so the applied correction is `(360 - hint) % 360` clockwise; 90 and
/// 270 degree corrections swap the output width and height.
pub fn crop(
    source: &DynamicImage,
    region: &BoundingRegion,
    padding_fraction: f64,
) -> Result<CropOutput, StageError> {
    region
        .validate()
        .map_err(|reason| StageError::Raster(format!("invalid region: {reason}")))?;

    let (src_w, src_h) = source.dimensions();
    let sx = src_w as f64 / NORMALIZED_SPAN as f64;
    let sy = src_h as f64 / NORMALIZED_SPAN as f64;

    let bx = region.x as f64 * sx;
    let by = region.y as f64 * sy;
    let bw = region.width as f64 * sx;
    let bh = region.height as f64 * sy;

    // Half the padding on each side, so the box grows by the fraction
    // of its own width/height in total.
    let pad_x = bw * padding_fraction / 2.0;
    let pad_y = bh * padding_fraction / 2.0;

    let x = ((bx - pad_x).max(0.0).round() as u32).min(src_w.saturating_sub(1));
    let y = ((by - pad_y).max(0.0).round() as u32).min(src_h.saturating_sub(1));
    let w = ((bw + 2.0 * pad_x).round() as u32).clamp(1, src_w - x);
    let h = ((bh + 2.0 * pad_y).round() as u32).clamp(1, src_h - y);

    let cropped = source.crop_imm(x, y, w, h);

    let correction = region.correction_deg();
    let image = match correction {
        90 => cropped.rotate90(),
        180 => cropped.rotate180(),
        270 => cropped.rotate270(),
        _ => cropped,
    };
    let (out_w, out_h) = image.dimensions();

    let contour_px = match (&region.contour, region.needs_fill) {
        (Some(points), true) => Some(map_contour(points, sx, sy, x, y, w, h, correction)),
        _ => None,
    };

    Ok(CropOutput {
        image,
        width: out_w,
        height: out_h,
        contour_px,
    })
}

/// Map normalized contour points into the corrected crop's pixel
/// space: scale to source pixels, offset by the crop origin, then
/// apply the same clockwise correction the crop received.
#[allow(clippy::too_many_arguments)]
fn map_contour(
    points: &[crate::pipeline::types::ContourPoint],
    sx: f64,
    sy: f64,
    crop_x: u32,
    crop_y: u32,
    crop_w: u32,
    crop_h: u32,
    correction: u32,
) -> Vec<(u32, u32)> {
    let (w, h) = (crop_w as f64, crop_h as f64);
    points
        .iter()
        .map(|p| {
            let px = (p.x as f64 * sx - crop_x as f64).clamp(0.0, w);
            let py = (p.y as f64 * sy - crop_y as f64).clamp(0.0, h);
            let (rx, ry) = match correction {
                90 => (h - py, px),
                180 => (w - px, h - py),
                270 => (py, w - px),
                _ => (px, py),
            };
            (rx.round() as u32, ry.round() as u32)
        })
        .collect()
}

/// Shrink pairwise-overlapping regions along their smaller overlap
/// axis so neighbouring photos never share pixels. Detectors sometimes
/// return boxes that bleed into each other on tightly packed sheets.
pub fn resolve_overlaps(mut regions: Vec<BoundingRegion>) -> Vec<BoundingRegion> {
    for i in 0..regions.len() {
        for j in (i + 1)..regions.len() {
            let (a, b) = (&regions[i], &regions[j]);
            let h_overlap = ((a.x + a.width).min(b.x + b.width) as i64
                - a.x.max(b.x) as i64)
                .max(0);
            let v_overlap = ((a.y + a.height).min(b.y + b.height) as i64
                - a.y.max(b.y) as i64)
                .max(0);
            if h_overlap == 0 || v_overlap == 0 {
                continue;
            }
            let shrink = (h_overlap.min(v_overlap) / 2 + 1) as u32;
            if h_overlap <= v_overlap {
                let (left, right) = if regions[i].x <= regions[j].x { (i, j) } else { (j, i) };
                regions[left].width = regions[left].width.saturating_sub(shrink).max(1);
                regions[right].x += shrink;
                regions[right].width = regions[right].width.saturating_sub(shrink).max(1);
            } else {
                let (top, bottom) = if regions[i].y <= regions[j].y { (i, j) } else { (j, i) };
                regions[top].height = regions[top].height.saturating_sub(shrink).max(1);
                regions[bottom].y += shrink;
                regions[bottom].height = regions[bottom].height.saturating_sub(shrink).max(1);
            }
        }
    }
    regions
}

/// Trim near-black scanner-bed margins left around a crop, up to a
/// small fraction of each dimension. Rows and columns count as
/// background when most of their pixels fall under the brightness
/// threshold.
pub fn auto_trim_dark_edges(img: &DynamicImage) -> DynamicImage {
    const BRIGHTNESS_THRESHOLD: u16 = 60;
    const MIN_DARK_FRACTION: f64 = 0.55;
    const MAX_TRIM_FRACTION: f64 = 0.08;

    let (w, h) = img.dimensions();
    if w < 20 || h < 20 {
        return img.clone();
    }

    let max_trim_x = (w as f64 * MAX_TRIM_FRACTION) as u32;
    let max_trim_y = (h as f64 * MAX_TRIM_FRACTION) as u32;

    let is_dark = |x: u32, y: u32| -> bool {
        let p = img.get_pixel(x, y);
        (p[0] as u16 + p[1] as u16 + p[2] as u16) / 3 < BRIGHTNESS_THRESHOLD
    };
    let dark_column = |x: u32| (0..h).filter(|&y| is_dark(x, y)).count() as f64 / h as f64;
    let dark_row = |y: u32| (0..w).filter(|&x| is_dark(x, y)).count() as f64 / w as f64;

    let mut left = 0u32;
    for x in 0..max_trim_x {
        if dark_column(x) >= MIN_DARK_FRACTION {
            left = x + 1;
        } else {
            break;
        }
    }
    let mut right = w;
    for x in (w.saturating_sub(max_trim_x)..w).rev() {
        if dark_column(x) >= MIN_DARK_FRACTION {
            right = x;
        } else {
            break;
        }
    }
    let mut top = 0u32;
    for y in 0..max_trim_y {
        if dark_row(y) >= MIN_DARK_FRACTION {
            top = y + 1;
        } else {
            break;
        }
    }
    let mut bottom = h;
    for y in (h.saturating_sub(max_trim_y)..h).rev() {
        if dark_row(y) >= MIN_DARK_FRACTION {
            bottom = y;
        } else {
            break;
        }
    }

    let new_w = right.saturating_sub(left).max(1);
    let new_h = bottom.saturating_sub(top).max(1);
    if new_w < w || new_h < h {
        debug!(
            "auto-trim {}x{} -> {}x{} (left {} right {} top {} bottom {})",
            w,
            h,
            new_w,
            new_h,
            left,
            w - right,
            top,
            h - bottom
        );
        img.crop_imm(left, top, new_w, new_h)
    } else {
        img.clone()
    }
}

/// Decode a scan raster, normalizing EXIF orientation so the detector's
/// normalized coordinates and our pixel coordinates agree.
pub fn decode_scan(bytes: &[u8]) -> Result<DynamicImage, StageError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| StageError::Raster(format!("image decode: {e}")))?;
    Ok(apply_exif_orientation(bytes, img))
}

fn apply_exif_orientation(bytes: &[u8], img: DynamicImage) -> DynamicImage {
    let mut cursor = std::io::Cursor::new(bytes);
    let orientation = exif::Reader::new()
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|data| {
            data.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|f| f.value.get_uint(0))
        })
        .unwrap_or(1);

    match orientation {
        3 => img.rotate180(),
        6 => img.rotate90(),
        8 => img.rotate270(),
        2 => img.fliph(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        7 => img.rotate270().fliph(),
        _ => img,
    }
}

/// Encode a raster in the item's MIME type. JPEG has no alpha channel,
/// so RGBA data is flattened first.
pub fn encode_raster(img: &DynamicImage, mime: &str) -> Result<Vec<u8>, StageError> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let result = match mime {
        "image/png" => img.write_to(&mut buf, ImageFormat::Png),
        "image/webp" => img.write_to(&mut buf, ImageFormat::WebP),
        _ => DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut buf, ImageFormat::Jpeg),
    };
    result.map_err(|e| StageError::Raster(format!("image encode: {e}")))?;
    Ok(buf.into_inner())
}
