use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{dilate, erode};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::borrow::Cow;
use std::collections::HashMap;

use super::background::BackgroundSnapshot;
use super::mask::PolygonMask;
use crate::config::{self, Threshold};
use crate::error::HivewatchError;
use crate::store::Coverage;

/// Outcome of comparing one masked frame against the background.
#[derive(Debug, Clone)]
pub struct Detection {
    pub coverage: Coverage,
    pub foreground_pixels: u64,
    pub mask_area: u64,
    pub blob_count: Option<u32>,
    /// Binary foreground map after opening, 255 for foreground.
    pub foreground: GrayImage,
}

#[derive(Debug, Clone)]
pub struct Detector {
    threshold: Threshold,
    opening_kernel: u32,
    count_blobs: bool,
    blur_sigma: f32,
    min_blob_area: u32,
    max_blob_area: Option<u32>,
}

impl Detector {
    pub fn new(threshold: Threshold, opening_kernel: u32, count_blobs: bool) -> Self {
        Self {
            threshold,
            opening_kernel: opening_kernel.max(1),
            count_blobs,
            blur_sigma: 0.0,
            min_blob_area: 0,
            max_blob_area: None,
        }
    }

    pub fn from_config(config: &config::Detection) -> Self {
        Self::new(config.threshold, config.opening_kernel, config.count_blobs)
            .with_blur(config.blur_sigma)
            .with_blob_area(config.min_blob_area, config.max_blob_area)
    }

    /// Blur frame and background with this sigma before differencing.
    pub fn with_blur(mut self, sigma: f32) -> Self {
        self.blur_sigma = sigma;
        self
    }

    /// Only blobs within `min..=max` pixels are counted.
    pub fn with_blob_area(mut self, min: u32, max: Option<u32>) -> Self {
        self.min_blob_area = min;
        self.max_blob_area = max;
        self
    }

    /// Coverage of an already masked frame. Pure; never retries.
    pub fn detect(
        &self,
        masked: &RgbImage,
        mask: &PolygonMask,
        background: &BackgroundSnapshot,
    ) -> Result<Detection, HivewatchError> {
        if mask.area() == 0 {
            return Err(HivewatchError::Configuration(format!(
                "mask for hive {} has zero area",
                mask.hive_id()
            )));
        }
        let dims = (mask.width(), mask.height());
        if masked.dimensions() != dims || background.image.dimensions() != dims {
            return Err(HivewatchError::Configuration(format!(
                "frame {:?} and background {:?} do not match mask {:?}",
                masked.dimensions(),
                background.image.dimensions(),
                dims
            )));
        }

        let (frame, reference) = if self.blur_sigma > 0.0 {
            (
                Cow::Owned(gaussian_blur_f32(masked, self.blur_sigma)),
                Cow::Owned(gaussian_blur_f32(&background.image, self.blur_sigma)),
            )
        } else {
            (Cow::Borrowed(masked), Cow::Borrowed(&background.image))
        };

        let raster = mask.raster();
        let mut map = GrayImage::new(dims.0, dims.1);
        for (out, (inside, (frame_px, (bg_px, dev_px)))) in map.pixels_mut().zip(
            raster
                .pixels()
                .zip(frame.pixels().zip(reference.pixels().zip(background.deviation.pixels()))),
        ) {
            if inside[0] == 0 {
                continue;
            }
            let difference = frame_px
                .0
                .iter()
                .zip(bg_px.0.iter())
                .map(|(a, b)| a.abs_diff(*b))
                .max()
                .unwrap_or(0);
            if difference as f32 > self.threshold_for(dev_px[0]) {
                *out = Luma([255]);
            }
        }

        if self.opening_kernel > 1 {
            let radius = u8::try_from(self.opening_kernel / 2).unwrap_or(u8::MAX);
            map = open(&map, raster, radius);
        }

        let foreground_pixels = map.pixels().filter(|p| p[0] != 0).count() as u64;
        let blob_count = self.count_blobs.then(|| self.count_components(&map));

        Ok(Detection {
            coverage: Coverage::from_pixels(foreground_pixels, mask.area()),
            foreground_pixels,
            mask_area: mask.area(),
            blob_count,
            foreground: map,
        })
    }

    fn threshold_for(&self, deviation: u8) -> f32 {
        match self.threshold {
            Threshold::Fixed { level } => level as f32,
            Threshold::Adaptive { floor, deviations } => {
                (floor as f32).max(deviations * deviation as f32)
            }
        }
    }

    fn count_components(&self, foreground: &GrayImage) -> u32 {
        let labels = connected_components(foreground, Connectivity::Eight, Luma([0u8]));
        let mut areas: HashMap<u32, u32> = HashMap::new();
        for label in labels.pixels().map(|p| p[0]).filter(|&label| label != 0) {
            *areas.entry(label).or_default() += 1;
        }
        areas
            .values()
            .filter(|&&area| {
                area >= self.min_blob_area && self.max_blob_area.map_or(true, |max| area <= max)
            })
            .count() as u32
    }
}

/// Erode then dilate with a square kernel of `2 * radius + 1`.
///
/// Pixels outside the mask count as foreground while eroding and are cleared
/// before dilating, so the mask border neither eats into nor feeds interior regions.
fn open(foreground: &GrayImage, mask: &GrayImage, radius: u8) -> GrayImage {
    let mut erodable = foreground.clone();
    for (px, inside) in erodable.pixels_mut().zip(mask.pixels()) {
        if inside[0] == 0 {
            *px = Luma([255]);
        }
    }
    let mut eroded = erode(&erodable, Norm::LInf, radius);
    clip_to_mask(&mut eroded, mask);

    let mut opened = dilate(&eroded, Norm::LInf, radius);
    clip_to_mask(&mut opened, mask);
    opened
}

fn clip_to_mask(image: &mut GrayImage, mask: &GrayImage) {
    for (px, inside) in image.pixels_mut().zip(mask.pixels()) {
        if inside[0] == 0 {
            *px = Luma([0]);
        }
    }
}
