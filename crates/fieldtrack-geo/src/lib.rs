//! Location tracking core: continuous sampling from a position source,
//! geofence transitions, bounded history and daily aggregates.

pub mod doctor;
pub mod error;
pub mod geo;
pub mod geofence;
pub mod gnss;
pub mod history;
pub mod manual;
pub mod source;
pub mod summary;
pub mod tracker;

pub use error::{AcquisitionError, TrackerError};
pub use geo::haversine_m;
pub use gnss::{NmeaOrigin, NmeaSource};
pub use manual::ManualSource;
pub use source::{PositionSource, SourceEvent, Subscription, WatchOptions};
pub use tracker::{ListenerId, LocationTracker, TrackerConfig, TrackerEvent};
