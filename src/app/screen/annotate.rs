use std::fs;
use std::path::Path;

use image::{ImageFormat, Rgba, RgbaImage};

use crate::app::models::BoundingBox;

const MARKER_RADIUS: i64 = 15;
const MARKER_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// Pixel position of the box center; normalized boxes are scaled by the image size.
pub fn marker_position(bbox: &BoundingBox, width: u32, height: u32) -> (i64, i64) {
    let (cx, cy) = bbox.center();
    let (x, y) = if bbox.is_normalized() {
        (cx * f64::from(width), cy * f64::from(height))
    } else {
        (cx, cy)
    };
    let max_x = i64::from(width.saturating_sub(1));
    let max_y = i64::from(height.saturating_sub(1));
    ((x.round() as i64).clamp(0, max_x), (y.round() as i64).clamp(0, max_y))
}

fn draw_filled_circle(img: &mut RgbaImage, (cx, cy): (i64, i64), radius: i64) {
    let (width, height) = (i64::from(img.width()), i64::from(img.height()));
    for y in (cy - radius).max(0)..=(cy + radius).min(height - 1) {
        for x in (cx - radius).max(0)..=(cx + radius).min(width - 1) {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy <= radius * radius {
                img.put_pixel(x as u32, y as u32, MARKER_COLOR);
            }
        }
    }
}

/// Writes a copy of the screenshot with a red dot at the suggested target.
pub fn annotate_screenshot(png_bytes: &[u8], bbox: &BoundingBox, output: &Path) -> Result<(i64, i64), String> {
    let mut img = image::load_from_memory_with_format(png_bytes, ImageFormat::Png)
        .map_err(|err| format!("Failed to decode screenshot: {err}"))?
        .to_rgba8();
    let center = marker_position(bbox, img.width(), img.height());
    draw_filled_circle(&mut img, center, MARKER_RADIUS);

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
    }
    img.save_with_format(output, ImageFormat::Png)
        .map_err(|err| format!("Failed to write {}: {err}", output.display()))?;
    Ok(center)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::screen::hashing::png_fixture;

    fn bbox(top_left: (f64, f64), bottom_right: (f64, f64)) -> BoundingBox {
        BoundingBox { top_left, bottom_right }
    }

    #[test]
    fn scales_normalized_boxes() {
        assert_eq!(marker_position(&bbox((0.0, 0.0), (1.0, 1.0)), 200, 100), (100, 50));
        assert_eq!(marker_position(&bbox((10.0, 20.0), (30.0, 40.0)), 200, 100), (20, 30));
        assert_eq!(marker_position(&bbox((500.0, 500.0), (900.0, 700.0)), 200, 100), (199, 99));
    }

    #[test]
    fn draws_marker_at_center() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("annotated").join("a.png");
        let png = png_fixture(100, 100, |_, _| [255, 255, 255]);

        let center = annotate_screenshot(&png, &bbox((0.2, 0.2), (0.4, 0.4)), &out).expect("annotate");

        assert_eq!(center, (30, 30));
        let img = image::open(&out).expect("open").to_rgba8();
        assert_eq!(*img.get_pixel(30, 30), MARKER_COLOR);
        assert_eq!(*img.get_pixel(30, 44), MARKER_COLOR);
        assert_eq!(*img.get_pixel(90, 90), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn rejects_non_png_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = annotate_screenshot(b"nope", &bbox((0.0, 0.0), (1.0, 1.0)), &dir.path().join("x.png"))
            .expect_err("bad input");
        assert!(err.contains("decode"));
    }
}
