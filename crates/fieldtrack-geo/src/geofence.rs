use fieldtrack_proto::{
    FenceKind, Geofence, GeofenceSpec, Point, Position, TransitionEvent, DEFAULT_RADIUS_M,
};
use time::OffsetDateTime;
use tracing::info;

use crate::error::{Result, TrackerError};
use crate::geo::{haversine_m, point_in_polygon, valid_coordinates};

/// Registered fences, in insertion order.
#[derive(Debug, Default, Clone)]
pub struct GeofenceSet {
    fences: Vec<Geofence>,
}

impl GeofenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `spec`, applies defaults and stores it. Existing history is not
    /// evaluated against the new fence.
    pub fn add(&mut self, spec: GeofenceSpec, now: OffsetDateTime) -> Result<Geofence> {
        let fence = normalize(spec, now)?;
        let id = match fence.id.as_str() {
            "" => self.generate_id(now),
            id if self.get(id).is_some() => {
                return Err(TrackerError::Validation(format!("duplicate id '{}'", id)))
            }
            id => id.to_string(),
        };
        let fence = Geofence { id, ..fence };
        info!(id = %fence.id, name = %fence.name, kind = ?fence.kind, "geofence added");
        self.fences.push(fence.clone());
        Ok(fence)
    }

    pub fn remove(&mut self, id: &str) -> Option<Geofence> {
        let idx = self.fences.iter().position(|f| f.id == id)?;
        Some(self.fences.remove(idx))
    }

    /// Returns false when no fence has this id.
    pub fn set_active(&mut self, id: &str, active: bool) -> bool {
        match self.fences.iter_mut().find(|f| f.id == id) {
            Some(f) => {
                f.active = active;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Geofence> {
        self.fences.iter().find(|f| f.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Geofence> {
        self.fences.iter()
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.fences.iter().filter(|f| f.active).count()
    }

    /// Checks `sample` against every active fence, records the new status on
    /// each, and returns one event per fence whose status changed.
    ///
    /// A fence that has never been checked counts as "outside": a first sample
    /// inside it reports an entry, a first sample outside it is silent.
    pub fn evaluate(&mut self, sample: &Position, now: OffsetDateTime) -> Vec<TransitionEvent> {
        let mut events = Vec::new();
        for fence in self.fences.iter_mut().filter(|f| f.active) {
            let inside = contains(fence, sample);
            if fence.last_status.unwrap_or(false) != inside {
                info!(id = %fence.id, inside, "geofence transition");
                events.push(TransitionEvent {
                    fence_id: fence.id.clone(),
                    fence_name: fence.name.clone(),
                    is_inside: inside,
                    sample: sample.clone(),
                    timestamp: now,
                });
            }
            fence.last_status = Some(inside);
            fence.last_checked = Some(now);
        }
        events
    }

    fn generate_id(&self, now: OffsetDateTime) -> String {
        let base = format!("fence-{}", now.unix_timestamp_nanos() / 1_000_000);
        if self.get(&base).is_none() {
            return base;
        }
        let mut n = 1;
        loop {
            let id = format!("{}-{}", base, n);
            if self.get(&id).is_none() {
                return id;
            }
            n += 1;
        }
    }
}

pub fn contains(fence: &Geofence, sample: &Position) -> bool {
    match fence.kind {
        FenceKind::Circle => {
            haversine_m(fence.center.latitude, fence.center.longitude, sample.latitude, sample.longitude)
                <= fence.radius_m
        }
        FenceKind::Polygon => point_in_polygon(&fence.coordinates, sample.latitude, sample.longitude),
    }
}

/// Validation and defaults. The returned fence has an empty id when the spec
/// carried none.
pub fn normalize(spec: GeofenceSpec, now: OffsetDateTime) -> Result<Geofence> {
    let invalid = |msg: &str| Err(TrackerError::Validation(msg.to_string()));

    let name = spec.name.trim().to_string();
    if name.is_empty() {
        return invalid("name is required");
    }
    let id = spec.id.map(|s| s.trim().to_string()).unwrap_or_default();
    if !valid_coordinates(spec.latitude, spec.longitude) {
        return invalid("center coordinates out of range");
    }
    let kind = spec.kind.unwrap_or_default();
    let radius_m = spec.radius.unwrap_or(DEFAULT_RADIUS_M);
    let coordinates: Vec<Point> = spec.coordinates.unwrap_or_default();

    match kind {
        FenceKind::Circle => {
            if !radius_m.is_finite() || radius_m <= 0.0 {
                return invalid("radius must be a positive number of meters");
            }
        }
        FenceKind::Polygon => {
            if coordinates.len() < 3 {
                return invalid("polygon needs at least 3 coordinates");
            }
            if coordinates.iter().any(|p| !valid_coordinates(p.latitude, p.longitude)) {
                return invalid("polygon vertex out of range");
            }
        }
    }

    Ok(Geofence {
        id,
        name,
        center: Point { latitude: spec.latitude, longitude: spec.longitude },
        radius_m,
        kind,
        coordinates,
        active: true,
        last_status: None,
        last_checked: None,
        created_at: now,
    })
}
