//! Decides, per pipeline, when to record.
//!
//! Each inference batch yields a hit count per pipeline (monitored objects
//! whose box center lies in one of the sensor's regions of interest). The
//! count is debounced into start/stop edges that drive the ROI input of a
//! [`RecordingLatch`]; operator requests drive the other input. Whenever the
//! latch output changes a control message goes out. A periodic tick opens,
//! rotates and closes the actual recording files.

mod latch;
mod session;

pub use latch::{Debouncer, RecordingLatch, Trigger, TriggerSource};
pub use session::RecordingSession;

use chrono::{DateTime, Local};
use dashmap::DashMap;
use edgeguard_common::{utils::format_duration, InferenceBatch, InferenceResults, RecordingControl, SegmentEvent};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, error, info};

use crate::{error::Result, messaging::ControlPublisher, twin::ConfigurationTwin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Recording is desired but no file is open yet.
    Armed,
    Recording,
}

#[derive(Debug, Default)]
struct PipelineTrigger {
    debouncer: Debouncer,
    latch: RecordingLatch,
    session: Option<RecordingSession>,
}

impl PipelineTrigger {
    fn state(&self) -> SessionState {
        match (&self.session, self.latch.output()) {
            (Some(_), _) => SessionState::Recording,
            (None, true) => SessionState::Armed,
            (None, false) => SessionState::Idle,
        }
    }

    fn close(&mut self, config_id: &str) -> Option<SegmentEvent> {
        self.session.take().map(|session| SegmentEvent::Closed {
            config_id: config_id.to_string(),
            file_name: session.file_base_name,
        })
    }
}

/// Everything one step of the engine wants to publish.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TriggerOutput {
    pub controls: Vec<RecordingControl>,
    pub segments: Vec<SegmentEvent>,
}

impl TriggerOutput {
    pub fn is_empty(&self) -> bool {
        self.controls.is_empty() && self.segments.is_empty()
    }

    fn latch_changed(&mut self, config_id: &str, output: bool, trigger: &mut PipelineTrigger) {
        self.controls.push(RecordingControl::single(config_id, output));
        if !output {
            self.segments.extend(trigger.close(config_id));
        }
    }
}

pub struct RecordingTriggerEngine {
    twin: Arc<ConfigurationTwin>,
    monitored: HashSet<String>,
    pipelines: DashMap<String, PipelineTrigger>,
    publisher: Arc<dyn ControlPublisher>,
}

impl RecordingTriggerEngine {
    pub fn new(twin: Arc<ConfigurationTwin>, monitored_classes: &[String], publisher: Arc<dyn ControlPublisher>) -> Self {
        Self {
            twin,
            monitored: monitored_classes.iter().map(|c| c.to_lowercase()).collect(),
            pipelines: DashMap::new(),
            publisher,
        }
    }

    /// Monitored objects inside regions of interest, per pipeline id present
    /// in the batch (in order of first appearance).
    pub fn count_hits(&self, batch: &InferenceBatch) -> Vec<(String, usize)> {
        let snapshot = self.twin.snapshot();
        let mut counts: Vec<(String, usize)> = batch.pipeline_ids().into_iter().map(|id| (id, 0)).collect();

        for inference in &batch.inferences {
            let InferenceResults::Detection(detections) = &inference.results else {
                continue;
            };
            let Some(sensor) = snapshot.sensor(&inference.source_info.id) else {
                debug!("Ignoring inference from untracked sensor {}", inference.source_info.id);
                continue;
            };

            let hits: usize = sensor
                .regions_of_interest
                .iter()
                .map(|roi| {
                    detections
                        .iter()
                        .filter(|d| self.monitored.contains(&d.label.to_lowercase()))
                        .filter(|d| roi.contains(d.center()))
                        .count()
                })
                .sum();

            if let Some(entry) = counts.iter_mut().find(|(id, _)| *id == inference.id) {
                entry.1 += hits;
            }
        }

        counts
    }

    pub async fn ingest(&self, batch: &InferenceBatch) -> TriggerOutput {
        let mut output = TriggerOutput::default();
        let snapshot = self.twin.snapshot();

        for (config_id, count) in self.count_hits(batch) {
            if !snapshot.pipelines.contains_key(&config_id) {
                debug!("Ignoring inference for unknown pipeline {}", config_id);
                continue;
            }
            let mut trigger = self.pipelines.entry(config_id.clone()).or_default();
            let Some(edge) = trigger.debouncer.observe(count) else {
                continue;
            };

            debug!("Pipeline {}: {} monitored objects in ROIs, {:?}", config_id, count, edge);
            if let Some(changed) = trigger.latch.set(TriggerSource::Roi, edge == Trigger::Start) {
                output.latch_changed(&config_id, changed, &mut trigger);
            }
        }

        self.publish(&output).await;
        output
    }

    /// Operator request. Fails for pipelines the twin does not know.
    pub async fn request_recording(&self, config_id: &str, requested: bool) -> Result<TriggerOutput> {
        self.twin.set_recording_requested(config_id, requested)?;

        let mut output = TriggerOutput::default();
        {
            let mut trigger = self.pipelines.entry(config_id.to_string()).or_default();
            if let Some(changed) = trigger.latch.set(TriggerSource::Manual, requested) {
                output.latch_changed(config_id, changed, &mut trigger);
            }
        }

        info!("Manual recording request for {}: {}", config_id, requested);
        self.publish(&output).await;
        Ok(output)
    }

    /// Re-arms the operator requests the twin still holds. Used after the
    /// trigger state was discarded while the configuration stayed in place.
    pub async fn restore_manual_requests(&self) -> TriggerOutput {
        let mut output = TriggerOutput::default();

        for config_id in self.twin.requested_recordings() {
            let mut trigger = self.pipelines.entry(config_id.clone()).or_default();
            if let Some(changed) = trigger.latch.set(TriggerSource::Manual, true) {
                output.latch_changed(&config_id, changed, &mut trigger);
            }
        }

        if !output.is_empty() {
            info!("Restored {} manual recording requests", output.controls.len());
        }
        self.publish(&output).await;
        output
    }

    /// Opens files for armed pipelines and rotates files that reached the
    /// maximum segment length. Rotation sends no control message.
    pub async fn tick(&self, now: DateTime<Local>) -> Vec<SegmentEvent> {
        let max_segment_seconds = self.twin.max_segment_seconds();
        let max_segment = std::time::Duration::from_secs(max_segment_seconds);
        let mut events = Vec::new();

        for mut entry in self.pipelines.iter_mut() {
            let (config_id, trigger) = entry.pair_mut();

            let due = trigger
                .session
                .as_ref()
                .map(|session| session.is_due_for_rotation(now, max_segment));

            match (trigger.latch.output(), due) {
                (true, None) => {
                    let session = RecordingSession::open(config_id, now);
                    info!("Pipeline {} started recording to {}", config_id, session.file_base_name);
                    events.push(SegmentEvent::Opened {
                        config_id: config_id.clone(),
                        file_name: session.file_base_name.clone(),
                    });
                    trigger.session = Some(session);
                }
                (true, Some(true)) => {
                    debug!(
                        "Pipeline {}: rotating after {}",
                        config_id,
                        format_duration(max_segment)
                    );
                    events.extend(trigger.close(config_id));
                    let session = RecordingSession::open(config_id, now);
                    events.push(SegmentEvent::Opened {
                        config_id: config_id.clone(),
                        file_name: session.file_base_name.clone(),
                    });
                    trigger.session = Some(session);
                }
                (false, Some(_)) => events.extend(trigger.close(config_id)),
                _ => {}
            }
        }

        self.publish(&TriggerOutput {
            controls: Vec::new(),
            segments: events.clone(),
        })
        .await;
        events
    }

    /// Regions of interest changed: previous counts no longer mean anything,
    /// so every ROI input drops. Operator requests stay.
    pub async fn reset_rois(&self) -> TriggerOutput {
        let mut output = TriggerOutput::default();

        for mut entry in self.pipelines.iter_mut() {
            let (config_id, trigger) = entry.pair_mut();
            trigger.debouncer.reset();
            if let Some(changed) = trigger.latch.set(TriggerSource::Roi, false) {
                output.latch_changed(config_id, changed, trigger);
            }
        }

        self.publish(&output).await;
        output
    }

    /// The configuration was replaced: close every file and forget all state.
    pub async fn reset_all(&self) -> TriggerOutput {
        let mut output = TriggerOutput::default();

        for mut entry in self.pipelines.iter_mut() {
            let (config_id, trigger) = entry.pair_mut();
            if trigger.latch.output() {
                output.controls.push(RecordingControl::single(config_id.as_str(), false));
            }
            output.segments.extend(trigger.close(config_id));
        }
        self.pipelines.clear();

        self.publish(&output).await;
        output
    }

    pub fn state(&self, config_id: &str) -> SessionState {
        self.pipelines
            .get(config_id)
            .map(|trigger| trigger.state())
            .unwrap_or(SessionState::Idle)
    }

    pub fn session_file(&self, config_id: &str) -> Option<String> {
        self.pipelines
            .get(config_id)
            .and_then(|trigger| trigger.session.as_ref().map(|s| s.file_base_name.clone()))
    }

    async fn publish(&self, output: &TriggerOutput) {
        for control in &output.controls {
            if let Err(e) = self.publisher.publish_recording_control(control).await {
                error!("Failed to publish recording control: {}", e);
            }
        }
        for event in &output.segments {
            if let Err(e) = self.publisher.publish_segment_event(event).await {
                error!("Failed to publish segment event: {}", e);
            }
        }
    }
}
