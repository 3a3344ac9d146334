use actix::prelude::*;
use image::{GrayImage, RgbImage};
use std::path::PathBuf;
use std::sync::Arc;

use crate::detection::{BackgroundSnapshot, PolygonMask};
use crate::error::HivewatchError;

/// Intermediate images for one stored frame.
#[derive(Message)]
#[rtype(result = "Result<Vec<PathBuf>, HivewatchError>")]
pub struct WriteArtifacts {
    pub hive_id: String,
    pub filename: String,
    pub mask: Arc<PolygonMask>,
    pub masked: RgbImage,
    pub background: Arc<BackgroundSnapshot>,
    pub foreground: GrayImage,
}
