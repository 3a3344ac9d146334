use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::transport::Delivery;
use crate::error::HivewatchError;

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"];

/// A frame ready for the hive worker. Identity key is (hive_id, filename).
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMessage {
    pub hive_id: String,
    pub filename: String,
    pub image: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Inline(Vec<u8>),
    Path(PathBuf),
}

/// Parsed message before the image bytes are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub hive_id: String,
    pub filename: String,
    pub captured_at: DateTime<Utc>,
    pub source: ImageSource,
}

#[derive(Deserialize)]
struct JsonEnvelope {
    hive_id: Option<String>,
    filename: Option<String>,
    image: Option<String>,
    image_path: Option<String>,
    captured_at: Option<String>,
}

fn missing(field: &str) -> HivewatchError {
    HivewatchError::PermanentInput(format!("message is missing required field '{}'", field))
}

fn required(value: Option<String>, field: &str) -> Result<String, HivewatchError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing(field))
}

fn parse_timestamp(value: Option<&str>) -> Result<DateTime<Utc>, HivewatchError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("captured_at"))?;
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| {
            HivewatchError::PermanentInput(format!("invalid captured_at {:?}: {}", value, err))
        })
}

impl Envelope {
    /// JSON body when the payload is an object, otherwise a raw image body described by headers.
    pub fn parse(delivery: &Delivery) -> Result<Self, HivewatchError> {
        let is_json = delivery
            .payload
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|&b| b == b'{');

        if is_json {
            Self::from_json(&delivery.payload)
        } else {
            Self::from_headers(delivery)
        }
    }

    fn from_json(payload: &[u8]) -> Result<Self, HivewatchError> {
        let body: JsonEnvelope = serde_json::from_slice(payload)
            .map_err(|err| HivewatchError::PermanentInput(format!("invalid JSON envelope: {}", err)))?;

        let hive_id = required(body.hive_id, "hive_id")?;
        let filename = sanitize_filename(&required(body.filename, "filename")?)?;
        let captured_at = parse_timestamp(body.captured_at.as_deref())?;

        let source = match (body.image, body.image_path) {
            (Some(image), _) if !image.trim().is_empty() => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(image.trim())
                    .map_err(|err| {
                        HivewatchError::PermanentInput(format!("image is not valid base64: {}", err))
                    })?;
                ImageSource::Inline(bytes)
            }
            (_, Some(path)) if !path.trim().is_empty() => ImageSource::Path(PathBuf::from(path.trim())),
            _ => return Err(missing("image")),
        };

        Ok(Self {
            hive_id,
            filename,
            captured_at,
            source,
        })
    }

    fn from_headers(delivery: &Delivery) -> Result<Self, HivewatchError> {
        let header = |name: &str| delivery.header(name).map(str::to_string);

        let hive_id = required(header("hive_id"), "hive_id")?;
        let filename = sanitize_filename(&required(header("filename"), "filename")?)?;
        let captured_at = parse_timestamp(delivery.header("captured_at"))?;
        if delivery.payload.is_empty() {
            return Err(missing("image"));
        }

        Ok(Self {
            hive_id,
            filename,
            captured_at,
            source: ImageSource::Inline(delivery.payload.clone()),
        })
    }

    /// Load referenced image bytes, bounded by `timeout`.
    pub async fn resolve(self, timeout: Duration) -> Result<FrameMessage, HivewatchError> {
        let image = match self.source {
            ImageSource::Inline(bytes) => bytes,
            ImageSource::Path(path) => tokio::time::timeout(timeout, tokio::fs::read(&path))
                .await
                .map_err(|_| HivewatchError::timeout("frame read"))??,
        };

        Ok(FrameMessage {
            hive_id: self.hive_id,
            filename: self.filename,
            image,
            captured_at: self.captured_at,
        })
    }
}

/// Replace anything outside `[A-Za-z0-9_.-]` with `_` and make sure the name
/// ends in an image extension.
pub fn sanitize_filename(name: &str) -> Result<String, HivewatchError> {
    let mut clean: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if clean.trim_matches(|c| c == '.' || c == '_').is_empty() {
        return Err(HivewatchError::PermanentInput(format!(
            "filename {:?} has no usable characters",
            name
        )));
    }

    let has_image_extension = clean
        .rsplit_once('.')
        .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if !has_image_extension {
        clean.push_str(".jpg");
    }
    Ok(clean)
}
