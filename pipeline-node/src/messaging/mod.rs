pub mod zmq_bus;

use async_trait::async_trait;
use edgeguard_common::{RecordingControl, SegmentEvent};
use serde::Deserialize;
use serde_json::Value;
#[cfg(test)]
use std::sync::Mutex;
use tracing::info;

use crate::error::{NodeError, Result};

pub const TOPIC_CONFIGURATION: &str = "configuration";
pub const TOPIC_REGIONS_OF_INTEREST: &str = "regionsOfInterest";
pub const TOPIC_INFERENCE: &str = "inference";
pub const TOPIC_RECORDING_INPUT: &str = "recordingInput";
pub const TOPIC_TWIN_PATCH: &str = "twinPatch";

pub const TOPIC_RECORDING_OUTPUT: &str = "recordingOutput";
pub const TOPIC_RECORDING_SEGMENTS: &str = "recordingSegments";

/// Partial update of node properties.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TwinPatch {
    #[serde(default)]
    pub output_video_length: Option<u64>,
    #[serde(default)]
    pub start_recording: Option<Vec<edgeguard_common::RecordingState>>,
}

/// A decoded inbound message. Payloads that are only read by one component
/// are kept as raw JSON and decoded there.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Configuration(Value),
    RegionsOfInterest(Value),
    Inference(Value),
    RecordingInput(RecordingControl),
    TwinPatch(TwinPatch),
}

impl InboundMessage {
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self> {
        let payload = payload.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(payload);

        let message = match topic {
            TOPIC_CONFIGURATION => Self::Configuration(serde_json::from_slice(payload)?),
            TOPIC_REGIONS_OF_INTEREST => Self::RegionsOfInterest(serde_json::from_slice(payload)?),
            TOPIC_INFERENCE => Self::Inference(serde_json::from_slice(payload)?),
            TOPIC_RECORDING_INPUT => Self::RecordingInput(serde_json::from_slice(payload)?),
            TOPIC_TWIN_PATCH => Self::TwinPatch(serde_json::from_slice(payload)?),
            other => {
                return Err(NodeError::MessagingError(format!("unknown topic '{}'", other)));
            }
        };

        Ok(message)
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Self::Configuration(_) => TOPIC_CONFIGURATION,
            Self::RegionsOfInterest(_) => TOPIC_REGIONS_OF_INTEREST,
            Self::Inference(_) => TOPIC_INFERENCE,
            Self::RecordingInput(_) => TOPIC_RECORDING_INPUT,
            Self::TwinPatch(_) => TOPIC_TWIN_PATCH,
        }
    }
}

/// Where recording decisions go.
#[async_trait]
pub trait ControlPublisher: Send + Sync {
    async fn publish_recording_control(&self, control: &RecordingControl) -> Result<()>;
    async fn publish_segment_event(&self, event: &SegmentEvent) -> Result<()>;
}

/// Used when the bus is disabled: decisions only reach the log.
pub struct LoggingPublisher;

#[async_trait]
impl ControlPublisher for LoggingPublisher {
    async fn publish_recording_control(&self, control: &RecordingControl) -> Result<()> {
        info!("{}: {}", TOPIC_RECORDING_OUTPUT, serde_json::to_string(control)?);
        Ok(())
    }

    async fn publish_segment_event(&self, event: &SegmentEvent) -> Result<()> {
        info!("{}: {}", TOPIC_RECORDING_SEGMENTS, serde_json::to_string(event)?);
        Ok(())
    }
}

/// Keeps everything it is asked to publish.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingPublisher {
    controls: Mutex<Vec<RecordingControl>>,
    segments: Mutex<Vec<SegmentEvent>>,
}

#[cfg(test)]
impl RecordingPublisher {
    pub fn controls(&self) -> Vec<RecordingControl> {
        self.controls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn segments(&self) -> Vec<SegmentEvent> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ControlPublisher for RecordingPublisher {
    async fn publish_recording_control(&self, control: &RecordingControl) -> Result<()> {
        self.controls.lock().unwrap_or_else(|e| e.into_inner()).push(control.clone());
        Ok(())
    }

    async fn publish_segment_event(&self, event: &SegmentEvent) -> Result<()> {
        self.segments.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
        Ok(())
    }
}
