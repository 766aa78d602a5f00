//! Data types shared between the tracker core, its consumers and the export
//! formats.

pub mod fence;
pub mod report;
pub mod sample;
pub mod snapshot;

pub use fence::{FenceKind, Geofence, GeofenceSpec, Point, DEFAULT_RADIUS_M};
pub use report::{DailySummary, TrackingStatus};
pub use sample::{Position, TransitionEvent};
pub use snapshot::{ExportFormat, Snapshot};
