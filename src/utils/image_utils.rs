use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;

use crate::detection::PolygonMask;

const OUTLINE_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const FOREGROUND_TINT: [u8; 3] = [255, 0, 0];

/// Masked frame with foreground pixels tinted red and the polygon outlined.
pub fn render_overlay(masked: &RgbImage, foreground: &GrayImage, mask: &PolygonMask) -> RgbImage {
    let mut overlay = masked.clone();

    for (x, y, pixel) in overlay.enumerate_pixels_mut() {
        if x < foreground.width() && y < foreground.height() && foreground.get_pixel(x, y)[0] != 0
        {
            for (channel, tint) in pixel.0.iter_mut().zip(FOREGROUND_TINT) {
                *channel = ((*channel as u16 + tint as u16) / 2) as u8;
            }
        }
    }

    // Polygon vertices are in frame coordinates; the overlay is the cropped box.
    let origin = mask.origin();
    let polygon = mask.polygon();
    for (i, start) in polygon.iter().enumerate() {
        let end = polygon[(i + 1) % polygon.len()];
        draw_line_segment_mut(
            &mut overlay,
            (
                start.x as f32 - origin.x as f32,
                start.y as f32 - origin.y as f32,
            ),
            (end.x as f32 - origin.x as f32, end.y as f32 - origin.y as f32),
            OUTLINE_COLOR,
        );
    }

    overlay
}

/// Encode an RGB image as PNG bytes.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    image.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// Best-effort content type for stored image bytes.
pub fn content_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type(),
        Err(_) => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Point;
    use image::Luma;

    #[test]
    fn test_overlay_tints_foreground() {
        let mask = PolygonMask::from_points(
            "hive-1",
            vec![
                Point::new(0, 0),
                Point::new(20, 0),
                Point::new(20, 20),
                Point::new(0, 20),
            ],
        )
        .unwrap();
        let masked = RgbImage::from_pixel(20, 20, Rgb([0, 100, 200]));
        let mut foreground = GrayImage::new(20, 20);
        foreground.put_pixel(10, 10, Luma([255]));

        let overlay = render_overlay(&masked, &foreground, &mask);
        assert_eq!(*overlay.get_pixel(10, 10), Rgb([127, 50, 100]));
        assert_eq!(*overlay.get_pixel(5, 5), Rgb([0, 100, 200]));
        assert_eq!(*overlay.get_pixel(0, 0), OUTLINE_COLOR);
    }

    #[test]
    fn test_content_type_guess() {
        let png = encode_png(&RgbImage::new(2, 2)).unwrap();
        assert_eq!(content_type(&png), "image/png");
        assert_eq!(content_type(b"nope"), "application/octet-stream");
    }
}
