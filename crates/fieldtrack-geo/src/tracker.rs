use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use fieldtrack_proto::{
    DailySummary, ExportFormat, Geofence, GeofenceSpec, Position, Snapshot, TrackingStatus,
    TransitionEvent,
};
use serde::Deserialize;
use time::{Date, OffsetDateTime, UtcOffset};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AcquisitionError, Result, TrackerError};
use crate::geofence::GeofenceSet;
use crate::history::{History, DEFAULT_HISTORY_CAPACITY};
use crate::source::{PositionSource, SourceEvent, Subscription, WatchOptions};
use crate::summary::{daily_summary, local_offset};

/// What a listener receives: exactly one of a sample or an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerEvent<'a> {
    Sample(&'a Position),
    Error(&'a AcquisitionError),
}

impl<'a> TrackerEvent<'a> {
    pub fn sample(&self) -> Option<&'a Position> {
        match *self {
            Self::Sample(p) => Some(p),
            Self::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&'a AcquisitionError> {
        match *self {
            Self::Sample(_) => None,
            Self::Error(e) => Some(e),
        }
    }
}

pub type Listener = Arc<dyn Fn(TrackerEvent<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub history_capacity: usize,
    /// Buffer of the transition broadcast channel; slow receivers lag past it.
    pub transition_channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            transition_channel_capacity: 64,
        }
    }
}

struct State {
    history: History,
    fences: GeofenceSet,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    current: Option<Position>,
    tracking: bool,
    /// Bumped on every start/stop; pumps from older sessions go inert.
    session: u64,
    pump: Option<JoinHandle<()>>,
    dispatch_thread: Option<ThreadId>,
}

impl State {
    fn register(&mut self, listener: Listener) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, listener));
        id
    }

    fn accept(&mut self, sample: &Position, now: OffsetDateTime) -> Vec<TransitionEvent> {
        if let Some(prev) = self.history.latest() {
            if sample.timestamp < prev.timestamp {
                warn!(prev = %prev.timestamp, got = %sample.timestamp, "sample timestamp went backwards");
            }
        }
        self.history.push(sample.clone());
        self.current = Some(sample.clone());
        self.fences.evaluate(sample, now)
    }
}

struct Shared {
    state: Mutex<State>,
    /// Held for the whole of one sample's processing and listener fan-out.
    dispatch: Mutex<()>,
    transitions: broadcast::Sender<TransitionEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn publish(&self, events: &[TransitionEvent]) {
        for ev in events {
            // No receivers is fine.
            let _ = self.transitions.send(ev.clone());
        }
    }

    /// Processes one event from the source. Returns false once the session is over.
    fn dispatch_one(&self, session: u64, ev: SourceEvent) -> bool {
        let _turn = lock(&self.dispatch);

        let listeners: Vec<Listener> = {
            let mut st = self.state();
            if st.session != session || !st.tracking {
                return false;
            }
            match &ev {
                Ok(sample) => {
                    debug!(lat = sample.latitude, lon = sample.longitude, acc = ?sample.accuracy, "sample");
                    let events = st.accept(sample, OffsetDateTime::now_utc());
                    self.publish(&events);
                }
                Err(e) => warn!("acquisition failed: {}", e),
            }
            st.dispatch_thread = Some(thread::current().id());
            st.listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        let event = match &ev {
            Ok(sample) => TrackerEvent::Sample(sample),
            Err(e) => TrackerEvent::Error(e),
        };
        for listener in listeners {
            // A listener may have stopped tracking.
            if self.state().session != session {
                break;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(session, "listener panicked");
            }
        }

        let mut st = self.state();
        st.dispatch_thread = None;
        st.session == session
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ends the session if its pump stops while the session is still current,
/// so a drained subscription leaves the tracker idle.
struct PumpGuard {
    shared: Arc<Shared>,
    session: u64,
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        let mut st = self.shared.state();
        if st.session != self.session || !st.tracking {
            return;
        }
        st.tracking = false;
        st.session += 1;
        st.listeners.clear();
        st.pump = None;
        st.dispatch_thread = None;
        warn!(session = self.session, "subscription ended, tracking stopped");
    }
}

async fn pump(shared: Arc<Shared>, mut sub: Subscription, session: u64) {
    let _guard = PumpGuard { shared: shared.clone(), session };
    while let Some(ev) = sub.next().await {
        if !shared.dispatch_one(session, ev) {
            break;
        }
    }
    debug!(session, "subscription drained");
}

/// Continuous location tracking with geofences and bounded history.
///
/// Create one per tracked device and hand it to the consumers that need it;
/// dropping it stops tracking.
///
/// Listeners run on the runtime's worker threads while the tracker is
/// processing the sample they receive. They may call any tracker method,
/// including `stop` and `start`.
pub struct LocationTracker {
    source: Arc<dyn PositionSource>,
    shared: Arc<Shared>,
}

impl LocationTracker {
    pub fn new<S: PositionSource>(source: S, config: TrackerConfig) -> Self {
        Self::with_source(Arc::new(source), config)
    }

    pub fn with_source(source: Arc<dyn PositionSource>, config: TrackerConfig) -> Self {
        let (transitions, _) = broadcast::channel(config.transition_channel_capacity.max(1));
        let state = State {
            history: History::with_capacity(config.history_capacity),
            fences: GeofenceSet::new(),
            listeners: Vec::new(),
            next_listener: 0,
            current: None,
            tracking: false,
            session: 0,
            pump: None,
            dispatch_thread: None,
        };
        Self {
            source,
            shared: Arc::new(Shared { state: Mutex::new(state), dispatch: Mutex::new(()), transitions }),
        }
    }

    /// Registers `listener` and starts continuous sampling.
    ///
    /// Calling this while already tracking replaces the running session: the
    /// previous subscription is cancelled and its listeners dropped, exactly
    /// as `stop` would, before the new one is installed.
    pub fn start<F>(&self, listener: F, options: &WatchOptions) -> Result<ListenerId>
    where
        F: Fn(TrackerEvent<'_>) + Send + Sync + 'static,
    {
        if !self.source.is_available() {
            return Err(TrackerError::CapabilityUnavailable);
        }
        let rt = tokio::runtime::Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;

        self.stop();
        let sub = self.source.watch(options)?;

        let mut st = self.shared.state();
        st.session += 1;
        st.tracking = true;
        let session = st.session;
        let id = st.register(Arc::new(listener));
        let handle = rt.spawn(pump(self.shared.clone(), sub, session));
        let stale = st.pump.replace(handle);
        drop(st);
        if let Some(stale) = stale {
            stale.abort();
        }
        info!(session, high_accuracy = options.high_accuracy, timeout = ?options.timeout, "tracking started");
        Ok(id)
    }

    /// Cancels the subscription and clears all listeners. No listener is
    /// invoked after this returns. No-op when idle.
    pub fn stop(&self) {
        let (pump, reentrant) = {
            let mut st = self.shared.state();
            if !st.tracking {
                return;
            }
            st.tracking = false;
            st.session += 1;
            st.listeners.clear();
            (st.pump.take(), st.dispatch_thread == Some(thread::current().id()))
        };
        if let Some(h) = pump {
            h.abort();
        }
        // Wait out a dispatch in progress on another thread.
        if !reentrant {
            drop(lock(&self.shared.dispatch));
        }
        info!("tracking stopped");
    }

    pub fn is_tracking(&self) -> bool {
        self.shared.state().tracking
    }

    /// Adds a listener without touching the subscription. Listeners added while
    /// idle are notified once tracking starts.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(TrackerEvent<'_>) + Send + Sync + 'static,
    {
        self.shared.state().register(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut st = self.shared.state();
        let before = st.listeners.len();
        st.listeners.retain(|(lid, _)| *lid != id);
        st.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.shared.state().listeners.len()
    }

    /// Receives every transition produced from now on.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<TransitionEvent> {
        self.shared.transitions.subscribe()
    }

    /// One fix with the single-shot options. Leaves history and fences alone.
    pub async fn get_current_position(&self) -> Result<Position> {
        self.get_current_position_with(&WatchOptions::single_shot()).await
    }

    pub async fn get_current_position_with(&self, options: &WatchOptions) -> Result<Position> {
        if !self.source.is_available() {
            return Err(TrackerError::CapabilityUnavailable);
        }
        Ok(self.source.current_position(options).await?)
    }

    pub fn add_geofence(&self, spec: GeofenceSpec) -> Result<Geofence> {
        self.shared.state().fences.add(spec, OffsetDateTime::now_utc())
    }

    pub fn remove_geofence(&self, id: &str) -> Option<Geofence> {
        self.shared.state().fences.remove(id)
    }

    pub fn set_geofence_active(&self, id: &str, active: bool) -> bool {
        self.shared.state().fences.set_active(id, active)
    }

    pub fn geofences(&self) -> Vec<Geofence> {
        self.shared.state().fences.iter().cloned().collect()
    }

    /// Evaluates `sample` against the active fences, updating their stored
    /// status. Transitions are also published to transition subscribers.
    pub fn evaluate_geofences(&self, sample: &Position) -> Vec<TransitionEvent> {
        let events = self.shared.state().fences.evaluate(sample, OffsetDateTime::now_utc());
        self.shared.publish(&events);
        events
    }

    pub fn history(&self) -> Vec<Position> {
        self.shared.state().history.to_vec()
    }

    pub fn history_between(&self, start: OffsetDateTime, end: OffsetDateTime) -> Vec<Position> {
        self.shared.state().history.between(start, end)
    }

    pub fn clear_history(&self) {
        self.shared.state().history.clear();
    }

    /// Summary of today in the host's local time zone.
    pub fn daily_summary_today(&self) -> DailySummary {
        let offset = local_offset();
        self.daily_summary(OffsetDateTime::now_utc().to_offset(offset).date(), offset)
    }

    pub fn daily_summary(&self, date: Date, offset: UtcOffset) -> DailySummary {
        daily_summary(&self.shared.state().history, date, offset)
    }

    pub fn snapshot(&self) -> Snapshot {
        let st = self.shared.state();
        Snapshot {
            current_position: st.current.clone(),
            history: st.history.to_vec(),
            geofences: st.fences.iter().cloned().collect(),
            exported_at: OffsetDateTime::now_utc(),
        }
    }

    /// Serializes the snapshot. Unrecognized format names produce JSON.
    pub fn export_snapshot(&self, format: &str) -> Result<String> {
        let format = ExportFormat::from_name(format);
        Ok(self.snapshot().render(format)?)
    }

    pub fn status(&self) -> TrackingStatus {
        let st = self.shared.state();
        TrackingStatus {
            is_tracking: st.tracking,
            current_position: st.current.clone(),
            history_count: st.history.len(),
            active_geofence_count: st.fences.active_count(),
        }
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
