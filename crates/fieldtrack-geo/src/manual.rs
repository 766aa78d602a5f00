use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fieldtrack_proto::Position;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::{AcquisitionError, Result};
use crate::source::{PositionSource, SourceEvent, Subscription, WatchOptions};

const WATCH_BUFFER: usize = 256;

/// A source fed by the host application, e.g. with fixes relayed from a
/// browser or a mobile OS. Clones share the same feed.
#[derive(Debug, Clone)]
pub struct ManualSource {
    inner: Arc<Mutex<Feed>>,
}

#[derive(Debug)]
struct Feed {
    available: bool,
    watchers: Vec<mpsc::Sender<SourceEvent>>,
    waiting: Vec<oneshot::Sender<SourceEvent>>,
    last_fix: Option<Position>,
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualSource {
    pub fn new() -> Self {
        Self::with_availability(true)
    }

    /// A source standing in for a platform with no location capability.
    pub fn unavailable() -> Self {
        Self::with_availability(false)
    }

    fn with_availability(available: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Feed {
                available,
                watchers: Vec::new(),
                waiting: Vec::new(),
                last_fix: None,
            })),
        }
    }

    fn feed(&self) -> MutexGuard<'_, Feed> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delivers a fix to every open watch and pending single-shot request.
    pub fn push(&self, fix: Position) {
        let mut feed = self.feed();
        feed.last_fix = Some(fix.clone());
        feed.deliver(Ok(fix));
    }

    pub fn push_error(&self, err: AcquisitionError) {
        self.feed().deliver(Err(err));
    }

    /// Number of watches that have not been cancelled.
    pub fn watcher_count(&self) -> usize {
        let mut feed = self.feed();
        feed.watchers.retain(|tx| !tx.is_closed());
        feed.watchers.len()
    }
}

impl Feed {
    fn deliver(&mut self, ev: SourceEvent) {
        self.watchers.retain(|tx| !tx.is_closed());
        for tx in &self.watchers {
            if tx.try_send(ev.clone()).is_err() {
                warn!("manual source: watcher lagging, event dropped");
            }
        }
        for tx in self.waiting.drain(..) {
            let _ = tx.send(ev.clone());
        }
    }
}

#[async_trait]
impl PositionSource for ManualSource {
    fn is_available(&self) -> bool {
        self.feed().available
    }

    fn watch(&self, _options: &WatchOptions) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.feed().watchers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn current_position(&self, options: &WatchOptions) -> SourceEvent {
        let rx = {
            let mut feed = self.feed();
            if !feed.available {
                return Err(AcquisitionError::PositionUnavailable("no location capability".into()));
            }
            if let Some(fix) = feed.last_fix.as_ref().filter(|f| fresh_enough(f, options)) {
                return Ok(fix.clone());
            }
            // Requests that timed out earlier are still parked here.
            feed.waiting.retain(|tx| !tx.is_closed());
            let (tx, rx) = oneshot::channel();
            feed.waiting.push(tx);
            rx
        };
        match tokio::time::timeout(options.timeout, rx).await {
            Ok(Ok(ev)) => ev,
            Ok(Err(_)) => Err(AcquisitionError::PositionUnavailable("source dropped".into())),
            Err(_) => Err(AcquisitionError::Timeout(options.timeout)),
        }
    }
}

fn fresh_enough(fix: &Position, options: &WatchOptions) -> bool {
    if options.maximum_age.is_zero() {
        return false;
    }
    let age = OffsetDateTime::now_utc() - fix.timestamp;
    age <= options.maximum_age
}
