use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::HivewatchError;

/// Largest bounding-box side a mask may span, in pixels.
pub const MAX_MASK_DIMENSION: u32 = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// On-disk mask definition, as written by the polygon selection tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskDefinition {
    pub points: Vec<Point>,
}

/// Region of interest for one hive. Immutable after construction.
///
/// The raster covers the polygon's bounding box; a pixel is inside when its
/// centre is inside the polygon (even-odd rule).
#[derive(Debug, Clone)]
pub struct PolygonMask {
    hive_id: String,
    polygon: Vec<Point>,
    origin: Point,
    raster: GrayImage,
    area: u64,
}

impl PolygonMask {
    /// Load `<dir>/<hive_id>.json`. Any failure is a configuration error for that hive.
    pub fn load(dir: impl AsRef<Path>, hive_id: &str) -> Result<Self, HivewatchError> {
        if hive_id.is_empty()
            || hive_id.contains(|c: char| c == '/' || c == '\\')
            || hive_id.starts_with('.')
        {
            return Err(HivewatchError::Configuration(format!(
                "invalid hive id for mask lookup: {:?}",
                hive_id
            )));
        }

        let path = dir.as_ref().join(format!("{}.json", hive_id));
        let contents = std::fs::read_to_string(&path).map_err(|err| {
            HivewatchError::Configuration(format!(
                "no mask for hive {} at {}: {}",
                hive_id,
                path.display(),
                err
            ))
        })?;
        let definition: MaskDefinition = serde_json::from_str(&contents).map_err(|err| {
            HivewatchError::Configuration(format!(
                "mask file {} is not valid: {}",
                path.display(),
                err
            ))
        })?;

        let mask = Self::from_points(hive_id, definition.points)?;
        debug!(
            target: "hive",
            hive_id,
            area = mask.area,
            width = mask.width(),
            height = mask.height(),
            "Loaded polygon mask"
        );
        Ok(mask)
    }

    pub fn from_points(hive_id: &str, mut points: Vec<Point>) -> Result<Self, HivewatchError> {
        let invalid = |reason: &str| {
            HivewatchError::Configuration(format!("mask for hive {}: {}", hive_id, reason))
        };

        if points.len() > 3 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 {
            return Err(invalid("a polygon needs at least 3 points"));
        }
        if points
            .iter()
            .any(|p| p.x > MAX_MASK_DIMENSION || p.y > MAX_MASK_DIMENSION)
        {
            let reason = format!("points must lie within {0}x{0}", MAX_MASK_DIMENSION);
            return Err(invalid(reason.as_str()));
        }
        if points
            .iter()
            .enumerate()
            .any(|(i, p)| *p == points[(i + 1) % points.len()])
        {
            return Err(invalid("consecutive points must be distinct"));
        }
        if doubled_area(&points) == 0 {
            return Err(invalid("polygon encloses no area"));
        }
        if is_self_intersecting(&points) {
            return Err(invalid("polygon edges intersect"));
        }

        let min_x = points.iter().map(|p| p.x).min().unwrap_or(0);
        let min_y = points.iter().map(|p| p.y).min().unwrap_or(0);
        let max_x = points.iter().map(|p| p.x).max().unwrap_or(0);
        let max_y = points.iter().map(|p| p.y).max().unwrap_or(0);

        let mut raster = GrayImage::new(max_x - min_x, max_y - min_y);
        let mut area = 0u64;
        for (x, y, pixel) in raster.enumerate_pixels_mut() {
            let cx = (min_x + x) as f64 + 0.5;
            let cy = (min_y + y) as f64 + 0.5;
            if point_in_polygon(&points, cx, cy) {
                *pixel = Luma([255]);
                area += 1;
            }
        }
        if area == 0 {
            return Err(invalid("polygon does not contain any pixel centre"));
        }

        Ok(Self {
            hive_id: hive_id.to_string(),
            polygon: points,
            origin: Point::new(min_x, min_y),
            raster,
            area,
        })
    }

    pub fn hive_id(&self) -> &str {
        &self.hive_id
    }

    pub fn polygon(&self) -> &[Point] {
        &self.polygon
    }

    /// Top-left corner of the bounding box in frame coordinates.
    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }

    /// Interior pixel count.
    pub fn area(&self) -> u64 {
        self.area
    }

    pub fn raster(&self) -> &GrayImage {
        &self.raster
    }

    /// Whether a pixel of the cropped raster lies inside the polygon.
    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.raster.get_pixel(x, y)[0] != 0
    }

    /// Crop the frame to the bounding box and zero everything outside the polygon.
    pub fn apply(&self, frame: &RgbImage) -> Result<RgbImage, HivewatchError> {
        let right = self.origin.x + self.width();
        let bottom = self.origin.y + self.height();
        if frame.width() < right || frame.height() < bottom {
            return Err(HivewatchError::PermanentInput(format!(
                "frame {}x{} does not cover the mask region ending at {}x{}",
                frame.width(),
                frame.height(),
                right,
                bottom
            )));
        }

        let mut masked = RgbImage::new(self.width(), self.height());
        for (x, y, pixel) in masked.enumerate_pixels_mut() {
            if self.contains(x, y) {
                *pixel = *frame.get_pixel(self.origin.x + x, self.origin.y + y);
            }
        }
        Ok(masked)
    }
}

/// Twice the signed shoelace area, as an absolute value.
fn doubled_area(points: &[Point]) -> i64 {
    let n = points.len();
    let sum: i64 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
        })
        .sum();
    sum.abs()
}

fn point_in_polygon(polygon: &[Point], px: f64, py: f64) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;

    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].x as f64, polygon[i].y as f64);
        let (xj, yj) = (polygon[j].x as f64, polygon[j].y as f64);

        if ((yi > py) != (yj > py)) && (px < (xj - xi) * (py - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }

    inside
}

fn orientation(o: Point, a: Point, b: Point) -> i64 {
    let cross = (a.x as i64 - o.x as i64) * (b.y as i64 - o.y as i64)
        - (a.y as i64 - o.y as i64) * (b.x as i64 - o.x as i64);
    cross.signum()
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if d1 != d2 && d3 != d4 && d1 != 0 && d2 != 0 && d3 != 0 && d4 != 0 {
        return true;
    }

    (d1 == 0 && on_segment(p1, q1, q2))
        || (d2 == 0 && on_segment(p2, q1, q2))
        || (d3 == 0 && on_segment(q1, p1, p2))
        || (d4 == 0 && on_segment(q2, p1, p2))
}

fn is_self_intersecting(points: &[Point]) -> bool {
    let n = points.len();
    for i in 0..n {
        let (a1, a2) = (points[i], points[(i + 1) % n]);
        for j in (i + 1)..n {
            // Adjacent edges share a vertex by construction.
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            let (b1, b2) = (points[j], points[(j + 1) % n]);
            if segments_intersect(a1, a2, b1, b2) {
                return true;
            }
        }
    }
    false
}
