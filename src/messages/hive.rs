use actix::prelude::*;
use serde::Serialize;

use crate::consumer::envelope::FrameMessage;
use crate::error::HivewatchError;
use crate::store::Coverage;

/// Run one frame through a hive's pipeline and persist the result.
#[derive(Message)]
#[rtype(result = "Result<FrameOutcome, HivewatchError>")]
pub struct ProcessFrame {
    pub frame: FrameMessage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    Stored { id: i64, coverage: Coverage },
    /// Already stored under the same (hive_id, filename); history untouched.
    Duplicate { id: i64 },
    /// Collected into the background history; no reference yet.
    Warming { history: usize },
}

#[derive(Message)]
#[rtype(result = "HiveStats")]
pub struct GetHiveStats;

#[derive(Debug, Clone, Default, PartialEq, Serialize, MessageResponse)]
#[serde(rename_all = "camelCase")]
pub struct HiveStats {
    pub hive_id: String,
    pub processed: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub warming: u64,
    pub failures: u64,
    pub history: usize,
    pub last_coverage: Option<Coverage>,
}
