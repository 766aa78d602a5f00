use std::time::Duration;

use async_trait::async_trait;
use fieldtrack_proto::Position;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AcquisitionError, Result};

/// One delivery from a position source.
pub type SourceEvent = std::result::Result<Position, AcquisitionError>;

/// Acquisition settings passed to a source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    #[serde(rename = "timeout_ms", deserialize_with = "millis::deserialize")]
    pub timeout: Duration,
    /// How old a cached fix may be and still be returned. Zero disables reuse.
    #[serde(rename = "maximum_age_ms", deserialize_with = "millis::deserialize")]
    pub maximum_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(5),
            maximum_age: Duration::ZERO,
        }
    }
}

impl WatchOptions {
    /// Settings for one-off fixes: longer timeout, no cache reuse.
    pub fn single_shot() -> Self {
        Self { timeout: Duration::from_secs(10), ..Self::default() }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Handle on a continuous watch. Dropping it cancels the watch.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<SourceEvent>,
    producer: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<SourceEvent>) -> Self {
        Self { rx, producer: None }
    }

    /// Ties a producer task to the subscription; it is aborted on cancel.
    pub fn with_producer(rx: mpsc::Receiver<SourceEvent>, producer: JoinHandle<()>) -> Self {
        Self { rx, producer: Some(producer) }
    }

    pub async fn next(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }

    pub fn cancel(&mut self) {
        self.rx.close();
        if let Some(h) = self.producer.take() {
            h.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Platform capability delivering location fixes.
#[async_trait]
pub trait PositionSource: Send + Sync + 'static {
    /// Whether the capability exists at all. Checked before every request.
    fn is_available(&self) -> bool;

    /// Starts continuous delivery. Must be called from within a tokio runtime.
    fn watch(&self, options: &WatchOptions) -> Result<Subscription>;

    /// One fix, honoring `options.timeout` and `options.maximum_age`.
    async fn current_position(&self, options: &WatchOptions) -> SourceEvent;
}
