use std::time::Duration;

/// Failure reported by a position source for one acquisition attempt.
///
/// Never fatal to a subscription; retry policy belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("no fix within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("no location capability available")]
    CapabilityUnavailable,
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error("invalid geofence: {0}")]
    Validation(String),
    #[error("export failed: {0}")]
    Export(#[from] serde_json::Error),
    #[error("tracking requires a running tokio runtime")]
    NoRuntime,
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;
