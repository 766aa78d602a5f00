use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One observed location fix.
///
/// Everything except latitude, longitude and timestamp is device-dependent
/// and may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy, meters.
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub altitude_accuracy: Option<f64>,
    /// Degrees clockwise from true north.
    pub heading: Option<f64>,
    /// Ground speed, m/s.
    pub speed: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, timestamp: OffsetDateTime) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            altitude: None,
            altitude_accuracy: None,
            heading: None,
            speed: None,
            timestamp,
        }
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy = Some(accuracy_m);
        self
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed = Some(speed_mps);
        self
    }
}

/// Emitted when a geofence's inside/outside status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub fence_id: String,
    pub fence_name: String,
    pub is_inside: bool,
    pub sample: Position,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
