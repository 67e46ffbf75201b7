//! Outbound event publication
//!
//! Detectors and the alert manager hand events to an [`EventPublisher`];
//! a background task drains the bounded channel into an [`EventSink`] so
//! detection latency never waits on publication.

use crate::monitoring::Alert;
use crate::anomaly::OutlierEvent;
use crate::drift::DriftEvent;
use crate::error::{DeployError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything the engine publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    Drift(DriftEvent),
    Outlier(OutlierEvent),
    Alert(Alert),
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Drift(_) => "drift",
            EngineEvent::Outlier(_) => "outlier",
            EngineEvent::Alert(_) => "alert",
        }
    }
}

/// Destination for published events (message bus, log, test buffer)
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &EngineEvent) -> Result<()>;
}

/// Writes each event as a JSON line through tracing
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &EngineEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        info!(kind = event.kind(), event = %json, "Published event");
        Ok(())
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, event: &EngineEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Event publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Bounded channel capacity; events beyond it are dropped.
    /// Overridden by `KOLOSAL_EVENT_CHANNEL_CAPACITY` through `EngineConfig::from_env`.
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl EventConfig {
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

#[derive(Debug, Default)]
struct PublisherCounters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Counts for the publisher pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStats {
    pub accepted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Cloneable, non-blocking handle onto the publication channel
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<EngineEvent>,
    counters: Arc<PublisherCounters>,
}

impl EventPublisher {
    /// Queue an event. Returns false if it was dropped because the channel
    /// is full or the background task has stopped.
    pub fn publish(&self, event: EngineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = event.kind(), "Event channel full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = event.kind(), "Event channel closed, dropping event");
                false
            }
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the background task that drains published events into `sink`.
///
/// Must be called from within a tokio runtime. The task ends once every
/// [`EventPublisher`] clone has been dropped and the queue is drained.
pub fn spawn_event_publisher(
    config: &EventConfig,
    sink: Arc<dyn EventSink>,
) -> Result<(EventPublisher, JoinHandle<()>)> {
    if config.channel_capacity == 0 {
        return Err(DeployError::invalid_parameter(
            "events.channel_capacity",
            config.channel_capacity,
            "must be positive",
        ));
    }

    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let counters = Arc::new(PublisherCounters::default());
    let handle = tokio::spawn(publish_loop(rx, sink, Arc::clone(&counters)));

    info!(capacity = config.channel_capacity, "Event publisher started");
    Ok((EventPublisher { tx, counters }, handle))
}

async fn publish_loop(
    mut rx: mpsc::Receiver<EngineEvent>,
    sink: Arc<dyn EventSink>,
    counters: Arc<PublisherCounters>,
) {
    while let Some(event) = rx.recv().await {
        match sink.publish(&event) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(kind = event.kind(), error = %e, "Event sink failed");
            }
        }
    }
    debug!("Event publisher stopped");
}
