//! Publishing crossing events and occupancy snapshots
//!
//! Doorway pipelines never touch the store directly. They hand documents to a
//! [`Publisher`], which turns them into store writes and enqueues them on a
//! bounded [`PublishQueue`]. A single [`PublishWorker`] drains the queue,
//! retrying transient failures with backoff.
//!
//! Store layout per room:
//! - `rooms/{room}` - live counter {count, lastEvent, lastUpdate}
//! - `sessions/{room}/{session}` - session metadata
//! - `sessions/{room}/{session}/events/{key}` - crossing log (push)
//! - `sessions/{room}/{session}/data/{YYYYmmddHHMMSS}` - snapshot history
//! - `live_data/{room}` - latest snapshot

use crate::domain::types::{iso_timestamp, CrossingEvent, CrowdLevel, OccupancySnapshot};
use crate::infra::config::Backpressure;
use crate::infra::metrics::Metrics;
use crate::io::dataset::{DatasetRow, DatasetWriter};
use crate::io::store::{DocumentStore, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish queue full after waiting {waited_ms} ms")]
    QueueFull { waited_ms: u64 },

    #[error("publish queue closed")]
    Closed,

    #[error("write to {path} failed after {attempts} attempt(s): {source}")]
    Store {
        path: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// Session identifier derived from the pipeline start time
pub fn session_id(started_at_ms: u64) -> String {
    format_utc(started_at_ms, "session_%Y%m%d_%H%M%S")
}

/// Key of a snapshot inside the session history
pub fn snapshot_key(timestamp_ms: u64) -> String {
    format_utc(timestamp_ms, "%Y%m%d%H%M%S")
}

fn format_utc(ms: u64, fmt: &str) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default().format(fmt).to_string()
}

/// Round to a fixed number of decimals for publishing
#[inline]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Snapshot as written to the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotDocument {
    pub doorway_id: String,
    pub motion_rate: f64,
    pub avg_sound: f64,
    pub avg_co2: f64,
    pub crowdiness_index: f64,
    pub level: CrowdLevel,
    pub timestamp: String,
}

impl SnapshotDocument {
    pub fn new(doorway_id: &str, snapshot: &OccupancySnapshot) -> Self {
        Self {
            doorway_id: doorway_id.to_string(),
            motion_rate: round_to(snapshot.motion_rate, 3),
            avg_sound: round_to(snapshot.avg_sound, 1),
            avg_co2: round_to(snapshot.avg_co2, 1),
            crowdiness_index: round_to(snapshot.crowdiness_index, 3),
            level: snapshot.level,
            timestamp: iso_timestamp(snapshot.timestamp_ms),
        }
    }
}

/// A single store operation
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Set { path: String, value: Value },
    Update { path: String, value: Value },
    Push { path: String, value: Value },
}

impl StoreWrite {
    pub fn path(&self) -> &str {
        match self {
            StoreWrite::Set { path, .. }
            | StoreWrite::Update { path, .. }
            | StoreWrite::Push { path, .. } => path,
        }
    }

    async fn apply(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        match self {
            StoreWrite::Set { path, value } => store.set(path, value).await,
            StoreWrite::Update { path, value } => store.update(path, value).await,
            StoreWrite::Push { path, value } => store.push(path, value).await.map(|_| ()),
        }
    }
}

/// Unit of work for the publish worker
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub doorway_id: String,
    pub kind: &'static str,
    pub writes: Vec<StoreWrite>,
    pub dataset_row: Option<DatasetRow>,
    pub enqueued_at: Instant,
}

struct QueueState {
    jobs: VecDeque<PublishJob>,
    closed: bool,
}

/// Bounded multi-producer queue with a configurable overflow policy
pub struct PublishQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: Backpressure,
    items: Notify,
    space: Notify,
    metrics: Arc<Metrics>,
}

impl PublishQueue {
    pub fn new(capacity: usize, policy: Backpressure, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            items: Notify::new(),
            space: Notify::new(),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a job, applying the backpressure policy when full
    pub async fn push(&self, job: PublishJob) -> Result<(), PublishError> {
        match self.policy {
            Backpressure::DropOldest => self.push_drop_oldest(job),
            Backpressure::Block { timeout } => self.push_blocking(job, timeout).await,
        }
    }

    fn push_drop_oldest(&self, job: PublishJob) -> Result<(), PublishError> {
        let (evicted, depth) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PublishError::Closed);
            }
            let evicted =
                if state.jobs.len() >= self.capacity { state.jobs.pop_front() } else { None };
            state.jobs.push_back(job);
            (evicted, state.jobs.len())
        };
        self.metrics.set_publish_queue_depth(depth as u64);
        self.items.notify_one();

        if let Some(old) = evicted {
            self.metrics.record_publish_dropped();
            warn!(
                doorway = %old.doorway_id,
                kind = %old.kind,
                age_ms = %old.enqueued_at.elapsed().as_millis(),
                "publish_dropped_oldest"
            );
        }
        Ok(())
    }

    async fn push_blocking(&self, job: PublishJob, timeout: Duration) -> Result<(), PublishError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let started = Instant::now();

        loop {
            // Register interest before checking so a pop in between is not missed
            let mut notified = pin!(self.space.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PublishError::Closed);
                }
                if state.jobs.len() < self.capacity {
                    state.jobs.push_back(job);
                    let depth = state.jobs.len();
                    drop(state);
                    self.metrics.set_publish_queue_depth(depth as u64);
                    self.items.notify_one();
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.metrics.record_publish_dropped();
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(doorway = %job.doorway_id, kind = %job.kind, waited_ms = %waited_ms, "publish_queue_full");
                return Err(PublishError::QueueFull { waited_ms });
            }
        }
    }

    /// Next job, waiting if empty; `None` once closed and drained
    pub async fn pop(&self) -> Option<PublishJob> {
        loop {
            let mut notified = pin!(self.items.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(job) = state.jobs.pop_front() {
                    let depth = state.jobs.len();
                    drop(state);
                    self.metrics.set_publish_queue_depth(depth as u64);
                    self.space.notify_one();
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting jobs; queued jobs are still handed out
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }
}

/// Per-doorway handle that turns pipeline outputs into store writes
#[derive(Clone)]
pub struct Publisher {
    queue: Arc<PublishQueue>,
    doorway_id: String,
    room_id: String,
    session_id: String,
    record_dataset: bool,
}

impl Publisher {
    pub fn new(
        queue: Arc<PublishQueue>,
        doorway_id: &str,
        room_id: &str,
        session_id: String,
        record_dataset: bool,
    ) -> Self {
        Self {
            queue,
            doorway_id: doorway_id.to_string(),
            room_id: room_id.to_string(),
            session_id,
            record_dataset,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn room_path(&self) -> String {
        format!("rooms/{}", self.room_id)
    }

    fn session_path(&self) -> String {
        format!("sessions/{}/{}", self.room_id, self.session_id)
    }

    fn job(&self, kind: &'static str, writes: Vec<StoreWrite>) -> PublishJob {
        PublishJob {
            doorway_id: self.doorway_id.clone(),
            kind,
            writes,
            dataset_row: None,
            enqueued_at: Instant::now(),
        }
    }

    async fn enqueue(&self, job: PublishJob) {
        let kind = job.kind;
        if let Err(e) = self.queue.push(job).await {
            debug!(doorway = %self.doorway_id, kind = %kind, error = %e, "publish_enqueue_failed");
        }
    }

    /// Reset the live counter and record session metadata
    pub async fn start_session(&self, started_at_ms: u64) {
        let started_at = iso_timestamp(started_at_ms);
        let writes = vec![
            StoreWrite::Set {
                path: self.room_path(),
                value: json!({ "count": 0, "lastEvent": "INIT", "lastUpdate": started_at }),
            },
            StoreWrite::Update {
                path: self.session_path(),
                value: json!({
                    "room_id": self.room_id,
                    "doorway_id": self.doorway_id,
                    "started_at": started_at,
                }),
            },
        ];
        info!(doorway = %self.doorway_id, room = %self.room_id, session = %self.session_id, "session_started");
        self.enqueue(self.job("session_start", writes)).await;
    }

    pub async fn end_session(&self, ended_at_ms: u64) {
        let writes = vec![StoreWrite::Update {
            path: self.session_path(),
            value: json!({ "ended_at": iso_timestamp(ended_at_ms) }),
        }];
        info!(doorway = %self.doorway_id, session = %self.session_id, "session_ended");
        self.enqueue(self.job("session_end", writes)).await;
    }

    pub async fn publish_event(&self, event: &CrossingEvent) {
        let timestamp = iso_timestamp(event.timestamp_ms);
        let writes = vec![
            StoreWrite::Update {
                path: self.room_path(),
                value: json!({
                    "count": event.resulting_count,
                    "lastEvent": event.kind.as_str(),
                    "lastUpdate": timestamp,
                }),
            },
            StoreWrite::Push {
                path: format!("{}/events", self.session_path()),
                value: json!({
                    "type": event.kind.as_str(),
                    "count": event.resulting_count,
                    "doorway_id": self.doorway_id,
                    "timestamp": timestamp,
                }),
            },
        ];
        self.enqueue(self.job("crossing", writes)).await;
    }

    pub async fn publish_snapshot(&self, snapshot: &OccupancySnapshot) {
        let document = SnapshotDocument::new(&self.doorway_id, snapshot);
        let value = match serde_json::to_value(&document) {
            Ok(value) => value,
            Err(e) => {
                warn!(doorway = %self.doorway_id, error = %e, "snapshot_encode_failed");
                return;
            }
        };
        let writes = vec![
            StoreWrite::Set {
                path: format!("{}/data/{}", self.session_path(), snapshot_key(snapshot.timestamp_ms)),
                value: value.clone(),
            },
            StoreWrite::Set { path: format!("live_data/{}", self.room_id), value },
        ];
        let mut job = self.job("snapshot", writes);
        if self.record_dataset {
            job.dataset_row = Some(DatasetRow::from_snapshot(&self.doorway_id, snapshot));
        }
        self.enqueue(job).await;
    }
}

/// Drains the publish queue into the document store
pub struct PublishWorker {
    queue: Arc<PublishQueue>,
    store: Arc<dyn DocumentStore>,
    dataset: Option<DatasetWriter>,
    metrics: Arc<Metrics>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PublishWorker {
    pub fn new(
        queue: Arc<PublishQueue>,
        store: Arc<dyn DocumentStore>,
        dataset: Option<DatasetWriter>,
        metrics: Arc<Metrics>,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self { queue, store, dataset, metrics, max_retries, retry_backoff }
    }

    /// Run until the queue is closed and drained
    pub async fn run(self) {
        info!(
            store = %self.store.name(),
            capacity = %self.queue.capacity(),
            max_retries = %self.max_retries,
            dataset = ?self.dataset.as_ref().map(|d| d.path().display().to_string()),
            "publish_worker_started"
        );

        while let Some(job) = self.queue.pop().await {
            self.process(job).await;
        }

        info!("publish_worker_stopped");
    }

    async fn process(&self, job: PublishJob) {
        if let (Some(dataset), Some(row)) = (&self.dataset, &job.dataset_row) {
            match dataset.append(row) {
                Ok(()) => self.metrics.record_dataset_row(),
                Err(e) => warn!(error = %e, doorway = %job.doorway_id, "dataset_write_failed"),
            }
        }

        for write in &job.writes {
            match self.apply_with_retry(write).await {
                Ok(latency_ms) => {
                    self.metrics.record_publish_ok(latency_ms);
                    debug!(
                        doorway = %job.doorway_id,
                        kind = %job.kind,
                        path = %write.path(),
                        latency_ms = %latency_ms,
                        "publish_ok"
                    );
                }
                Err(e) => {
                    self.metrics.record_publish_failed();
                    warn!(doorway = %job.doorway_id, kind = %job.kind, error = %e, "publish_failed");
                }
            }
        }

        if job.kind == "snapshot" {
            debug!(
                doorway = %job.doorway_id,
                queued_ms = %job.enqueued_at.elapsed().as_millis(),
                "snapshot_published"
            );
        }
    }

    /// Apply one write, retrying transient failures with exponential backoff
    async fn apply_with_retry(&self, write: &StoreWrite) -> Result<u64, PublishError> {
        let mut attempt: u32 = 0;
        loop {
            let start = Instant::now();
            match write.apply(self.store.as_ref()).await {
                Ok(()) => return Ok(start.elapsed().as_millis() as u64),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    self.metrics.record_publish_retry();
                    let delay = self.retry_backoff.saturating_mul(1 << (attempt - 1).min(6));
                    debug!(path = %write.path(), attempt = %attempt, delay_ms = %delay.as_millis(), error = %e, "publish_retry");
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(PublishError::Store {
                        path: write.path().to_string(),
                        attempts: attempt + 1,
                        source,
                    });
                }
            }
        }
    }
}
