use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use fieldtrack_proto::GeofenceSpec;
use time::OffsetDateTime;

use crate::geofence::normalize;
use crate::source::WatchOptions;
use crate::tracker::TrackerConfig;

pub fn check_watch_options(opts: &WatchOptions) -> Result<()> {
    anyhow::ensure!(opts.timeout >= Duration::from_millis(100), "watch.timeout_ms too low (min 100)");
    anyhow::ensure!(opts.timeout <= Duration::from_secs(120), "watch.timeout_ms too high (max 120000)");
    anyhow::ensure!(opts.maximum_age <= Duration::from_secs(3600), "watch.maximum_age_ms should be <= 1h");
    Ok(())
}

pub fn check_tracker(cfg: &TrackerConfig) -> Result<()> {
    anyhow::ensure!(cfg.history_capacity >= 1, "tracker.history_capacity must be >= 1");
    anyhow::ensure!(cfg.transition_channel_capacity >= 1, "tracker.transition_channel_capacity must be >= 1");
    Ok(())
}

/// Runs every spec through the same validation `add_geofence` applies and
/// rejects duplicate explicit ids.
pub fn check_geofences(specs: &[GeofenceSpec]) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    let mut ids = HashSet::new();
    for (i, spec) in specs.iter().enumerate() {
        let fence = normalize(spec.clone(), now)
            .map_err(|e| anyhow::anyhow!("geofence[{}] '{}': {}", i, spec.name, e))?;
        if !fence.id.is_empty() {
            anyhow::ensure!(ids.insert(fence.id.clone()), "geofence[{}]: duplicate id '{}'", i, fence.id);
        }
    }
    Ok(())
}
