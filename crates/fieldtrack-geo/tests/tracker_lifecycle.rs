//! End-to-end behaviour of `LocationTracker` driven by a `ManualSource`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldtrack_geo::{
    AcquisitionError, LocationTracker, ManualSource, PositionSource, SourceEvent, Subscription,
    TrackerConfig, TrackerError, WatchOptions,
};
use fieldtrack_proto::{ExportFormat, GeofenceSpec, Position, Snapshot};
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn fix(lat: f64, lon: f64, s: i64) -> Position {
    Position::new(lat, lon, datetime!(2024-09-02 08:00:00 UTC) + time::Duration::seconds(s)).with_accuracy(5.0)
}

fn setup() -> (LocationTracker, ManualSource) {
    let source = ManualSource::new();
    let tracker = LocationTracker::new(source.clone(), TrackerConfig::default());
    (tracker, source)
}

/// Starts tracking with a listener that forwards samples and errors.
fn start_forwarding(
    tracker: &LocationTracker,
) -> (mpsc::UnboundedReceiver<Position>, mpsc::UnboundedReceiver<AcquisitionError>) {
    let (stx, srx) = mpsc::unbounded_channel();
    let (etx, erx) = mpsc::unbounded_channel();
    tracker
        .start(
            move |ev| {
                if let Some(p) = ev.sample() {
                    let _ = stx.send(p.clone());
                }
                if let Some(e) = ev.error() {
                    let _ = etx.send(e.clone());
                }
            },
            &WatchOptions::default(),
        )
        .unwrap();
    (srx, erx)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn samples_reach_listener_and_history() {
    let (tracker, source) = setup();
    let (mut samples, _errors) = start_forwarding(&tracker);
    assert!(tracker.is_tracking());

    source.push(fix(1.0, 1.0, 0));
    let got = timeout(WAIT, samples.recv()).await.unwrap().unwrap();
    assert_eq!(got, fix(1.0, 1.0, 0));

    let status = tracker.status();
    assert!(status.is_tracking);
    assert_eq!(status.history_count, 1);
    assert_eq!(status.current_position, Some(fix(1.0, 1.0, 0)));
    assert_eq!(status.active_geofence_count, 0);
}

#[tokio::test]
async fn errors_are_reported_and_tracking_continues() {
    let (tracker, source) = setup();
    let (mut samples, mut errors) = start_forwarding(&tracker);

    source.push_error(AcquisitionError::Timeout(Duration::from_secs(5)));
    let err = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(err, AcquisitionError::Timeout(Duration::from_secs(5)));

    source.push(fix(2.0, 2.0, 1));
    assert!(timeout(WAIT, samples.recv()).await.unwrap().is_some());
    assert!(tracker.is_tracking());
    assert_eq!(tracker.history().len(), 1);
}

#[tokio::test]
async fn missing_capability_fails_synchronously() {
    let tracker = LocationTracker::new(ManualSource::unavailable(), TrackerConfig::default());
    let err = tracker.start(|_| {}, &WatchOptions::default()).unwrap_err();
    assert!(matches!(err, TrackerError::CapabilityUnavailable));
    assert!(!tracker.is_tracking());

    let err = tracker.get_current_position().await.unwrap_err();
    assert!(matches!(err, TrackerError::CapabilityUnavailable));
}

#[tokio::test]
async fn boundary_crossings_fire_once_each() {
    let (tracker, source) = setup();
    tracker.add_geofence(GeofenceSpec::circle("Depot", 10.0, 10.0, 100.0).with_id("depot")).unwrap();
    let mut transitions = tracker.subscribe_transitions();
    let (mut samples, _errors) = start_forwarding(&tracker);

    // outside, inside, inside, outside
    for (i, lat) in [10.01, 10.0, 10.0003, 10.01].into_iter().enumerate() {
        source.push(fix(lat, 10.0, i as i64));
    }
    for _ in 0..4 {
        timeout(WAIT, samples.recv()).await.unwrap().unwrap();
    }

    let mut events = Vec::new();
    while let Ok(ev) = transitions.try_recv() {
        events.push(ev);
    }
    assert_eq!(events.len(), 2);
    assert!(events[0].is_inside);
    assert!(!events[1].is_inside);
    assert_eq!(events[0].fence_name, "Depot");
    assert_eq!(events[1].sample, fix(10.01, 10.0, 3));

    let fence = &tracker.geofences()[0];
    assert_eq!(fence.last_status, Some(false));
    assert!(fence.last_checked.is_some());
}

#[tokio::test]
async fn evaluate_geofences_returns_and_publishes_transitions() {
    let (tracker, _source) = setup();
    tracker.add_geofence(GeofenceSpec::circle("Depot", 10.0, 10.0, 100.0).with_id("depot")).unwrap();
    let mut transitions = tracker.subscribe_transitions();

    let inside = fix(10.0, 10.0, 0);
    let events = tracker.evaluate_geofences(&inside);
    assert_eq!(events.len(), 1);
    assert!(events[0].is_inside);
    assert_eq!(events[0].fence_id, "depot");
    assert_eq!(transitions.try_recv().unwrap(), events[0]);

    // No boundary change, nothing returned or published.
    assert!(tracker.evaluate_geofences(&fix(10.0003, 10.0, 1)).is_empty());
    assert!(transitions.try_recv().is_err());

    let left = tracker.evaluate_geofences(&fix(10.01, 10.0, 2));
    assert_eq!(left.len(), 1);
    assert!(!left[0].is_inside);
    assert_eq!(transitions.try_recv().unwrap(), left[0]);

    // Evaluation alone does not record samples.
    assert_eq!(tracker.history().len(), 0);
    assert_eq!(tracker.geofences()[0].last_status, Some(false));
}

#[tokio::test]
async fn panicking_listener_does_not_end_session() {
    let (tracker, source) = setup();
    tracker.start(|_| panic!("listener failure"), &WatchOptions::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    tracker.add_listener(move |ev| {
        if let Some(p) = ev.sample() {
            let _ = tx.send(p.clone());
        }
    });

    source.push(fix(1.0, 1.0, 0));
    source.push(fix(1.0, 1.0, 1));
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(fix(1.0, 1.0, 0)));
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(fix(1.0, 1.0, 1)));

    let status = tracker.status();
    assert!(status.is_tracking);
    assert_eq!(status.history_count, 2);
    assert_eq!(source.watcher_count(), 1);
}

/// Delivers a single fix per watch and then closes the stream.
struct OneFix(Position);

#[async_trait]
impl PositionSource for OneFix {
    fn is_available(&self) -> bool {
        true
    }

    fn watch(&self, _options: &WatchOptions) -> fieldtrack_geo::error::Result<Subscription> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Ok(self.0.clone()));
        Ok(Subscription::new(rx))
    }

    async fn current_position(&self, _options: &WatchOptions) -> SourceEvent {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn ended_subscription_leaves_tracker_idle() {
    let tracker = LocationTracker::new(OneFix(fix(1.0, 1.0, 0)), TrackerConfig::default());
    let (mut samples, _errors) = start_forwarding(&tracker);
    timeout(WAIT, samples.recv()).await.unwrap().unwrap();
    settle().await;

    let status = tracker.status();
    assert!(!status.is_tracking);
    assert_eq!(status.history_count, 1);
    assert_eq!(tracker.listener_count(), 0);

    // A fresh start opens a new session.
    let (mut samples, _errors) = start_forwarding(&tracker);
    assert!(tracker.is_tracking());
    timeout(WAIT, samples.recv()).await.unwrap().unwrap();
    assert_eq!(tracker.history().len(), 2);
}

#[tokio::test]
async fn stop_then_start_does_not_duplicate_notifications() {
    let (tracker, source) = setup();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let c = first.clone();
    tracker.start(move |_| { c.fetch_add(1, Ordering::SeqCst); }, &WatchOptions::default()).unwrap();
    tracker.stop();
    assert!(!tracker.is_tracking());
    assert_eq!(tracker.listener_count(), 0);

    let c = second.clone();
    tracker.start(move |_| { c.fetch_add(1, Ordering::SeqCst); }, &WatchOptions::default()).unwrap();
    assert!(tracker.is_tracking());

    source.push(fix(1.0, 1.0, 0));
    settle().await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.history().len(), 1);
    assert_eq!(source.watcher_count(), 1);
}

#[tokio::test]
async fn restart_while_tracking_replaces_session() {
    let (tracker, source) = setup();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let c = first.clone();
    tracker.start(move |_| { c.fetch_add(1, Ordering::SeqCst); }, &WatchOptions::default()).unwrap();
    let c = second.clone();
    tracker.start(move |_| { c.fetch_add(1, Ordering::SeqCst); }, &WatchOptions::default()).unwrap();
    assert_eq!(tracker.listener_count(), 1);

    settle().await;
    source.push(fix(1.0, 1.0, 0));
    settle().await;
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.history().len(), 1);
    assert_eq!(source.watcher_count(), 1);
}

#[tokio::test]
async fn no_notifications_after_stop() {
    let (tracker, source) = setup();
    let (mut samples, _errors) = start_forwarding(&tracker);
    source.push(fix(1.0, 1.0, 0));
    timeout(WAIT, samples.recv()).await.unwrap().unwrap();

    tracker.stop();
    tracker.stop();
    source.push(fix(1.0, 1.0, 1));
    settle().await;
    assert!(samples.try_recv().is_err());
    assert_eq!(tracker.history().len(), 1);
    assert_eq!(source.watcher_count(), 0);
}

#[tokio::test]
async fn listener_may_stop_the_tracker() {
    let source = ManualSource::new();
    let tracker = Arc::new(LocationTracker::new(source.clone(), TrackerConfig::default()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tracker.clone();
    tracker
        .start(
            move |_| {
                handle.stop();
                let _ = tx.send(());
            },
            &WatchOptions::default(),
        )
        .unwrap();

    source.push(fix(1.0, 1.0, 0));
    timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(!tracker.is_tracking());

    source.push(fix(1.0, 1.0, 1));
    settle().await;
    assert_eq!(tracker.history().len(), 1);
}

#[tokio::test]
async fn single_shot_leaves_state_alone() {
    let (tracker, source) = setup();
    tracker.add_geofence(GeofenceSpec::circle("Depot", 1.0, 1.0, 100.0)).unwrap();
    let feeder = source.clone();
    let now = OffsetDateTime::now_utc();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        feeder.push(Position::new(1.0, 1.0, now));
    });

    let p = tracker.get_current_position().await.unwrap();
    assert_eq!(p.timestamp, now);
    let status = tracker.status();
    assert_eq!(status.history_count, 0);
    assert_eq!(status.current_position, None);
    assert!(!status.is_tracking);
    assert_eq!(tracker.geofences()[0].last_status, None);
}

#[tokio::test]
async fn single_shot_timeout_is_an_acquisition_error() {
    let (tracker, _source) = setup();
    let opts = WatchOptions { timeout: Duration::from_millis(20), ..WatchOptions::single_shot() };
    let err = tracker.get_current_position_with(&opts).await.unwrap_err();
    assert!(matches!(err, TrackerError::Acquisition(AcquisitionError::Timeout(_))));
}

#[tokio::test]
async fn json_export_round_trips() {
    let (tracker, source) = setup();
    tracker.add_geofence(GeofenceSpec::circle("Depot", 10.0, 10.0, 100.0).with_id("depot")).unwrap();
    let (mut samples, _errors) = start_forwarding(&tracker);
    for (i, lat) in [10.0, 10.001, 10.002].into_iter().enumerate() {
        source.push(fix(lat, 10.0, i as i64));
        timeout(WAIT, samples.recv()).await.unwrap().unwrap();
    }

    let json = tracker.export_snapshot("json").unwrap();
    let parsed = Snapshot::from_json(&json).unwrap();
    assert_eq!(parsed.history, tracker.history());
    assert_eq!(parsed.geofences, tracker.geofences());
    assert_eq!(parsed.current_position, tracker.status().current_position);

    // Unknown formats fall back to the document.
    let fallback = tracker.export_snapshot("xlsx").unwrap();
    assert_eq!(Snapshot::from_json(&fallback).unwrap().history.len(), 3);

    let csv = tracker.export_snapshot(ExportFormat::Csv.extension()).unwrap();
    assert_eq!(csv.lines().count(), 4);
}

#[tokio::test]
async fn clear_history_keeps_fences_and_position() {
    let (tracker, source) = setup();
    tracker.add_geofence(GeofenceSpec::circle("Depot", 1.0, 1.0, 100.0)).unwrap();
    let (mut samples, _errors) = start_forwarding(&tracker);
    source.push(fix(1.0, 1.0, 0));
    timeout(WAIT, samples.recv()).await.unwrap().unwrap();

    tracker.clear_history();
    let status = tracker.status();
    assert_eq!(status.history_count, 0);
    assert!(status.current_position.is_some());
    assert_eq!(status.active_geofence_count, 1);
    assert_eq!(tracker.geofences()[0].last_status, Some(true));
}

#[tokio::test]
async fn history_is_bounded_through_the_tracker() {
    let (tracker, source) = setup();
    let (mut samples, _errors) = start_forwarding(&tracker);
    for i in 0..101 {
        source.push(fix(0.0, 0.0001 * i as f64, i));
    }
    for _ in 0..101 {
        timeout(WAIT, samples.recv()).await.unwrap().unwrap();
    }
    let history = tracker.history();
    assert_eq!(history.len(), 100);
    assert_eq!(history.first(), Some(&fix(0.0, 0.0001 * 1.0, 1)));
    assert_eq!(history.last(), Some(&fix(0.0, 0.0001 * 100.0, 100)));

    let window = tracker.history_between(fix(0.0, 0.0, 10).timestamp, fix(0.0, 0.0, 19).timestamp);
    assert_eq!(window.len(), 10);
}

#[tokio::test]
async fn daily_summary_over_tracked_day() {
    let (tracker, source) = setup();
    let (mut samples, _errors) = start_forwarding(&tracker);
    for i in 0..3 {
        source.push(fix(45.0 + 0.001 * i as f64, 7.0, i * 60));
        timeout(WAIT, samples.recv()).await.unwrap().unwrap();
    }
    let s = tracker.daily_summary(time::macros::date!(2024 - 09 - 02), time::UtcOffset::UTC);
    assert_eq!(s.sample_count, 3);
    assert!((s.total_distance_m - 222.39).abs() < 0.1, "{}", s.total_distance_m);
    assert_eq!(s.average_accuracy_m, 5.0);

    let other = tracker.daily_summary(time::macros::date!(2024 - 09 - 03), time::UtcOffset::UTC);
    assert_eq!(other.sample_count, 0);
    assert!(other.first_sample.is_none());
}
