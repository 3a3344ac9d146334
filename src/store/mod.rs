use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::HivewatchError;

pub mod sqlite;

pub use sqlite::SqliteResultStore;

/// Coverage percentage with three fixed decimals, kept as thousandths of a percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coverage(u32);

impl Coverage {
    pub const ZERO: Coverage = Coverage(0);
    pub const FULL: Coverage = Coverage(100_000);

    pub fn from_pixels(foreground: u64, area: u64) -> Self {
        if area == 0 {
            return Self::ZERO;
        }
        Self::from_percent(100.0 * foreground as f64 / area as f64)
    }

    /// Clamps to [0, 100] and rounds to three decimals. NaN maps to zero.
    pub fn from_percent(percent: f64) -> Self {
        if percent.is_nan() {
            return Self::ZERO;
        }
        Coverage((percent.clamp(0.0, 100.0) * 1000.0).round() as u32)
    }

    pub fn from_thousandths(thousandths: u32) -> Self {
        Coverage(thousandths.min(Self::FULL.0))
    }

    pub fn thousandths(self) -> u32 {
        self.0
    }

    pub fn percent(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.percent())
    }
}

impl Serialize for Coverage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.percent())
    }
}

impl<'de> Deserialize<'de> for Coverage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Coverage::from_percent)
    }
}

/// One measurement, created once per successfully processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub hive_id: String,
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub coverage: Coverage,
    pub blob_count: Option<u32>,
}

/// A persisted detection result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub hive_id: String,
    pub filename: String,
    pub timestamp: DateTime<Utc>,
    pub coverage: Coverage,
    pub blob_count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { id: i64 },
    /// The (hive_id, filename) pair was already stored; nothing was written.
    Duplicate { id: i64 },
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted { id } | UpsertOutcome::Duplicate { id } => *id,
        }
    }
}

/// Inclusive timestamp range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, HivewatchError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), HivewatchError> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start > end => Err(HivewatchError::PermanentInput(
                format!("date range starts ({}) after it ends ({})", start, end),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionQuery {
    pub hive_id: Option<String>,
    pub range: Option<DateRange>,
}

impl DetectionQuery {
    pub fn for_hive(hive_id: impl Into<String>) -> Self {
        Self {
            hive_id: Some(hive_id.into()),
            range: None,
        }
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Durable, idempotent storage of detection results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a result keyed by (hive_id, filename). A repeat is a no-op.
    async fn upsert(
        &self,
        result: DetectionResult,
        image: Option<Vec<u8>>,
    ) -> Result<UpsertOutcome, HivewatchError>;

    /// Records ordered by timestamp, then id.
    async fn list(&self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>, HivewatchError>;

    async fn get_image(&self, detection_id: i64) -> Result<Option<Vec<u8>>, HivewatchError>;
}
