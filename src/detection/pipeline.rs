use image::RgbImage;
use std::sync::Arc;

use super::background::{BackgroundModel, BackgroundSnapshot};
use super::detector::{Detection, Detector};
use super::mask::PolygonMask;
use crate::config::Config;
use crate::error::HivewatchError;

/// Result of running a frame through the pipeline, before anything is committed.
#[derive(Debug)]
pub enum Analysis {
    /// Not enough history for a reference yet.
    Warming { masked: RgbImage },
    Detected {
        detection: Detection,
        masked: RgbImage,
        background: Arc<BackgroundSnapshot>,
    },
}

impl Analysis {
    pub fn into_masked(self) -> RgbImage {
        match self {
            Analysis::Warming { masked } | Analysis::Detected { masked, .. } => masked,
        }
    }
}

/// Mask, background and detector for a single hive.
///
/// `analyze` does not mutate; the caller decides when the masked frame enters
/// the background history through `commit`.
pub struct HivePipeline {
    mask: Arc<PolygonMask>,
    background: BackgroundModel,
    detector: Detector,
}

impl HivePipeline {
    pub fn new(mask: Arc<PolygonMask>, background: BackgroundModel, detector: Detector) -> Self {
        Self {
            mask,
            background,
            detector,
        }
    }

    pub fn from_config(mask: Arc<PolygonMask>, config: &Config) -> Self {
        Self::new(
            mask,
            BackgroundModel::from_config(&config.background),
            Detector::from_config(&config.detection),
        )
    }

    pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, HivewatchError> {
        if bytes.is_empty() {
            return Err(HivewatchError::PermanentInput("empty image".to_string()));
        }
        Ok(image::load_from_memory(bytes)?.to_rgb8())
    }

    pub fn mask(&self) -> &Arc<PolygonMask> {
        &self.mask
    }

    pub fn history_len(&self) -> usize {
        self.background.history_len()
    }

    pub fn analyze(&self, frame: &RgbImage) -> Result<Analysis, HivewatchError> {
        let masked = self.mask.apply(frame)?;
        match self.background.snapshot() {
            None => Ok(Analysis::Warming { masked }),
            Some(background) => {
                let detection = self.detector.detect(&masked, &self.mask, &background)?;
                Ok(Analysis::Detected {
                    detection,
                    masked,
                    background,
                })
            }
        }
    }

    pub fn commit(&mut self, masked: RgbImage) -> Result<(), HivewatchError> {
        self.background.push(masked)
    }
}
