use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Radius applied when a circular fence is created without one.
pub const DEFAULT_RADIUS_M: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceKind {
    #[default]
    #[serde(alias = "circular")]
    Circle,
    Polygon,
}

/// Caller-supplied description of a fence, before defaults and validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeofenceSpec {
    pub id: Option<String>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<FenceKind>,
    pub coordinates: Option<Vec<Point>>,
}

impl GeofenceSpec {
    pub fn circle(name: impl Into<String>, latitude: f64, longitude: f64, radius_m: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
            radius: Some(radius_m),
            ..Default::default()
        }
    }

    pub fn polygon(name: impl Into<String>, coordinates: Vec<Point>) -> Self {
        // Center is only informational for polygons; use the vertex mean.
        let n = coordinates.len().max(1) as f64;
        let latitude = coordinates.iter().map(|p| p.latitude).sum::<f64>() / n;
        let longitude = coordinates.iter().map(|p| p.longitude).sum::<f64>() / n;
        Self {
            name: name.into(),
            latitude,
            longitude,
            kind: Some(FenceKind::Polygon),
            coordinates: Some(coordinates),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A stored, normalized fence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub id: String,
    pub name: String,
    pub center: Point,
    pub radius_m: f64,
    pub kind: FenceKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinates: Vec<Point>,
    pub active: bool,
    /// Whether the last evaluated sample was inside. `None` until first checked.
    pub last_status: Option<bool>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
