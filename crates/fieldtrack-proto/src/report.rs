use serde::{Deserialize, Serialize};
use time::Date;

use crate::sample::Position;

/// Read-only view of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub is_tracking: bool,
    pub current_position: Option<Position>,
    pub history_count: usize,
    pub active_geofence_count: usize,
}

/// Aggregates over the samples of one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: Date,
    pub sample_count: usize,
    pub first_sample: Option<Position>,
    pub last_sample: Option<Position>,
    pub total_distance_m: f64,
    /// Mean over samples that report an accuracy; 0 when none do.
    pub average_accuracy_m: f64,
}

impl DailySummary {
    pub fn empty(date: Date) -> Self {
        Self {
            date,
            sample_count: 0,
            first_sample: None,
            last_sample: None,
            total_distance_m: 0.0,
            average_accuracy_m: 0.0,
        }
    }
}
