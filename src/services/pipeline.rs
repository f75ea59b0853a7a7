//! Per-doorway processing loop
//!
//! One [`DoorwayPipeline`] owns the crossing state and the feature window of
//! a single doorway. Lines are handled strictly in arrival order; the
//! aggregation tick is evaluated after every line and on a one-second timer
//! in the same task, so no state is shared with other doorways or threads.
//!
//! [`DoorwayRunner`] supervises a pipeline: it opens the source, starts a
//! publishing session, and for serial sources reopens the port after errors
//! with freshly reset state.

use crate::domain::reading::{parse_line, ParseError};
use crate::domain::types::{
    epoch_ms, CrossingEvent, CrossingKind, OccupancySnapshot, Reading, SensorMode,
};
use crate::infra::config::DoorwayConfig;
use crate::infra::metrics::Metrics;
use crate::io::publisher::{session_id, PublishQueue, Publisher};
use crate::io::source::{reconnect_delay, LineSource};
use crate::services::aggregator::{AggregationParams, RollingAggregator};
use crate::services::crossing::{CrossingDetector, CrossingParams};
use crate::services::scorer::CrowdinessEstimator;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// What one line (or tick) produced
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PipelineOutput {
    pub event: Option<CrossingEvent>,
    pub snapshot: Option<OccupancySnapshot>,
}

/// Why a pipeline run ended
#[derive(Debug)]
pub enum RunOutcome {
    Shutdown,
    SourceEnded,
    SourceFailed(io::Error),
}

pub struct DoorwayPipeline {
    doorway_id: String,
    mode: SensorMode,
    detector: CrossingDetector,
    aggregator: RollingAggregator,
    crossing_params: CrossingParams,
    aggregation_params: AggregationParams,
    scorer: Arc<CrowdinessEstimator>,
    metrics: Arc<Metrics>,
}

impl DoorwayPipeline {
    pub fn new(
        doorway_id: &str,
        mode: SensorMode,
        crossing_params: CrossingParams,
        aggregation_params: AggregationParams,
        scorer: Arc<CrowdinessEstimator>,
        metrics: Arc<Metrics>,
        started_at_ms: u64,
    ) -> Self {
        Self {
            doorway_id: doorway_id.to_string(),
            mode,
            detector: CrossingDetector::new(crossing_params),
            aggregator: RollingAggregator::new(aggregation_params, started_at_ms),
            crossing_params,
            aggregation_params,
            scorer,
            metrics,
        }
    }

    pub fn doorway_id(&self) -> &str {
        &self.doorway_id
    }

    pub fn occupancy(&self) -> u32 {
        self.detector.occupancy()
    }

    pub fn detector(&self) -> &CrossingDetector {
        &self.detector
    }

    pub fn aggregator(&self) -> &RollingAggregator {
        &self.aggregator
    }

    /// Drop all crossing and window state, as on a fresh start
    pub fn reset(&mut self, now_ms: u64) {
        self.detector = CrossingDetector::new(self.crossing_params);
        self.aggregator = RollingAggregator::new(self.aggregation_params, now_ms);
        self.metrics.reset_doorway(&self.doorway_id);
        debug!(doorway = %self.doorway_id, "pipeline_reset");
    }

    /// Process one raw line received at `now_ms`
    pub fn handle_line(&mut self, line: &str, now_ms: u64) -> PipelineOutput {
        self.metrics.record_line();

        let event = match parse_line(line, now_ms) {
            Ok(reading) => self.route(reading),
            Err(ParseError::Empty) => {
                trace!(doorway = %self.doorway_id, "line_empty");
                None
            }
            Err(e) => {
                self.metrics.record_parse_error();
                debug!(doorway = %self.doorway_id, line = %line, error = %e, "line_parse_failed");
                None
            }
        };

        PipelineOutput { event, snapshot: self.tick(now_ms) }
    }

    fn route(&mut self, reading: Reading) -> Option<CrossingEvent> {
        if !self.mode.accepts(&reading) {
            self.metrics.record_line_filtered();
            debug!(
                doorway = %self.doorway_id,
                mode = %self.mode.as_str(),
                kind = %reading.kind_str(),
                "line_filtered_by_mode"
            );
            return None;
        }

        match reading {
            Reading::Sensor(sample) => {
                let event = self.detector.update(&sample)?;
                let debounce_secs = self.detector.debounce_secs();
                self.metrics.record_crossing(
                    &self.doorway_id,
                    event.kind == CrossingKind::Enter,
                    event.resulting_count,
                    debounce_secs,
                );
                info!(
                    doorway = %self.doorway_id,
                    kind = %event.kind.as_str(),
                    count = %event.resulting_count,
                    debounce_secs = format!("{:.2}", debounce_secs),
                    "crossing_detected"
                );
                Some(event)
            }
            Reading::Environment(sample) => {
                self.aggregator.push(&sample);
                trace!(doorway = %self.doorway_id, buffered = self.aggregator.len(), "environment_sample");
                None
            }
        }
    }

    /// Evaluate the aggregation cadence
    pub fn tick(&mut self, now_ms: u64) -> Option<OccupancySnapshot> {
        let features = self.aggregator.tick(now_ms)?;
        let index = self.scorer.score(&features);
        let snapshot = OccupancySnapshot::new(&features, index);
        self.metrics.record_snapshot(&self.doorway_id, index);
        info!(
            doorway = %self.doorway_id,
            crowdiness = format!("{:.3}", snapshot.crowdiness_index),
            level = %snapshot.level.as_str(),
            motion_rate = format!("{:.3}", snapshot.motion_rate),
            avg_sound = format!("{:.1}", snapshot.avg_sound),
            avg_co2 = format!("{:.1}", snapshot.avg_co2),
            samples = self.aggregator.len(),
            "snapshot_computed"
        );
        Some(snapshot)
    }

    async fn publish(&self, output: PipelineOutput, publisher: &Publisher) {
        if let Some(event) = output.event {
            publisher.publish_event(&event).await;
        }
        if let Some(snapshot) = output.snapshot {
            publisher.publish_snapshot(&snapshot).await;
        }
    }

    /// Consume lines until the source ends, fails, or shutdown is signalled
    pub async fn run(
        &mut self,
        source: &mut LineSource,
        publisher: &Publisher,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RunOutcome {
        let mut tick_interval = interval(Duration::from_secs(1));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender also means stop
                    if changed.is_err() || *shutdown.borrow() {
                        return RunOutcome::Shutdown;
                    }
                }
                line = source.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let output = self.handle_line(&line, epoch_ms());
                            self.publish(output, publisher).await;
                        }
                        Ok(None) => return RunOutcome::SourceEnded,
                        Err(e) => return RunOutcome::SourceFailed(e),
                    }
                }
                _ = tick_interval.tick() => {
                    if let Some(snapshot) = self.tick(epoch_ms()) {
                        publisher.publish_snapshot(&snapshot).await;
                    }
                }
            }
        }
    }
}

/// Supervises one doorway for the lifetime of the process
pub struct DoorwayRunner {
    doorway: DoorwayConfig,
    crossing_params: CrossingParams,
    aggregation_params: AggregationParams,
    scorer: Arc<CrowdinessEstimator>,
    metrics: Arc<Metrics>,
    queue: Arc<PublishQueue>,
    record_dataset: bool,
}

impl DoorwayRunner {
    pub fn new(
        doorway: DoorwayConfig,
        crossing_params: CrossingParams,
        aggregation_params: AggregationParams,
        scorer: Arc<CrowdinessEstimator>,
        metrics: Arc<Metrics>,
        queue: Arc<PublishQueue>,
        record_dataset: bool,
    ) -> Self {
        metrics.register_doorway(&doorway.id, &doorway.room_id);
        Self {
            doorway,
            crossing_params,
            aggregation_params,
            scorer,
            metrics,
            queue,
            record_dataset,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let id = self.doorway.id.clone();
        info!(
            doorway = %id,
            room = %self.doorway.room_id,
            mode = %self.doorway.mode.as_str(),
            "doorway_started"
        );

        let mut pipeline = DoorwayPipeline::new(
            &id,
            self.doorway.mode,
            self.crossing_params,
            self.aggregation_params,
            self.scorer.clone(),
            self.metrics.clone(),
            epoch_ms(),
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Every (re)start begins from initial state
            let started_at = epoch_ms();
            pipeline.reset(started_at);

            match LineSource::open(&self.doorway.source) {
                Ok(mut source) => {
                    let publisher = Publisher::new(
                        self.queue.clone(),
                        &id,
                        &self.doorway.room_id,
                        session_id(started_at),
                        self.record_dataset,
                    );
                    publisher.start_session(started_at).await;

                    let outcome = pipeline.run(&mut source, &publisher, &mut shutdown).await;
                    publisher.end_session(epoch_ms()).await;

                    match outcome {
                        RunOutcome::Shutdown => break,
                        RunOutcome::SourceEnded => {
                            info!(doorway = %id, source = %source.label(), "source_ended");
                        }
                        RunOutcome::SourceFailed(e) => {
                            warn!(doorway = %id, source = %source.label(), error = %e, "source_failed");
                        }
                    }
                }
                Err(e) => {
                    error!(doorway = %id, error = %e, "source_open_failed");
                }
            }

            let Some(delay) = reconnect_delay(&self.doorway.source) else {
                break;
            };
            self.metrics.record_source_reconnect();
            info!(doorway = %id, delay_ms = %delay.as_millis(), "source_reconnect_scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(doorway = %id, occupancy = ?self.metrics.doorway(&id).map(|g| g.occupancy), "doorway_stopped");
    }
}
