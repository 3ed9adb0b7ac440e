use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::{bbox_center, Point};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed inference batch: {0}")]
    MalformedBatch(String),

    #[error("Malformed inference #{index}: {message}")]
    MalformedInference { index: usize, message: String },
}

/// Where a frame came from. `id` is the name of the sensor that produced it.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub frame_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDetection {
    pub class_id: i64,
    pub confidence: f64,
    pub label: String,
    /// `[x, y, w, h]`, normalized to the frame size.
    pub rect: [f64; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_info: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<i64>,
}

impl ObjectDetection {
    pub fn center(&self) -> Point {
        bbox_center(self.rect)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label.eq_ignore_ascii_case(label)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub class_id: i64,
    pub confidence: f64,
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Segmentation {
    pub n_classes: u32,
    pub height: u32,
    pub width: u32,
    pub class_map: Vec<i64>,
    pub labels: Vec<String>,
}

/// Payload of one inference, tagged by its declared `type`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "detections", rename_all = "lowercase")]
pub enum InferenceResults {
    Detection(Vec<ObjectDetection>),
    Classification(Vec<Classification>),
    Segmentation(Vec<Segmentation>),
    Custom(Vec<serde_json::Value>),
}

impl InferenceResults {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Detection(_) => "detection",
            Self::Classification(_) => "classification",
            Self::Segmentation(_) => "segmentation",
            Self::Custom(_) => "custom",
        }
    }
}

/// One frame's worth of results from one pipeline.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Inference {
    pub source_info: SourceInfo,
    /// Id of the pipeline that produced this inference.
    pub id: String,
    #[serde(flatten)]
    pub results: InferenceResults,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct InferenceBatch {
    pub inferences: Vec<Inference>,
}

impl InferenceBatch {
    /// Decodes a batch, keeping every well-formed inference. Malformed entries
    /// are returned alongside so the caller can report them without losing
    /// the rest of the batch.
    pub fn decode(raw: &serde_json::Value) -> Result<(Self, Vec<DecodeError>), DecodeError> {
        let entries = raw
            .get("inferences")
            .and_then(|v| v.as_array())
            .ok_or_else(|| DecodeError::MalformedBatch("missing 'inferences' array".to_string()))?;

        let mut inferences = Vec::with_capacity(entries.len());
        let mut errors = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            match serde_json::from_value::<Inference>(entry.clone()) {
                Ok(inference) => inferences.push(inference),
                Err(e) => errors.push(DecodeError::MalformedInference {
                    index,
                    message: e.to_string(),
                }),
            }
        }

        Ok((Self { inferences }, errors))
    }

    /// Distinct pipeline ids in order of first appearance.
    pub fn pipeline_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for inference in &self.inferences {
            if !ids.contains(&inference.id) {
                ids.push(inference.id.clone());
            }
        }
        ids
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingState {
    pub config_id: String,
    pub state: bool,
}

/// `{"startRecording": [{"configId": ..., "state": ...}]}`
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingControl {
    pub start_recording: Vec<RecordingState>,
}

impl RecordingControl {
    pub fn single(config_id: impl Into<String>, state: bool) -> Self {
        Self {
            start_recording: vec![RecordingState {
                config_id: config_id.into(),
                state,
            }],
        }
    }
}

/// File boundaries of an active recording, reported to the media engine.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SegmentEvent {
    #[serde(rename_all = "camelCase")]
    Opened { config_id: String, file_name: String },
    #[serde(rename_all = "camelCase")]
    Closed { config_id: String, file_name: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_detection_inference() {
        let raw = json!({
            "inferences": [{
                "sourceInfo": {"id": "cam1", "timestamp": "2023-01-01T00:00:00", "width": 1280, "height": 720, "frameId": 7},
                "type": "detection",
                "id": "P1",
                "detections": [
                    {"classId": 0, "confidence": 0.9, "label": "Person", "rect": [0.1, 0.1, 0.2, 0.2]}
                ]
            }]
        });

        let (batch, errors) = InferenceBatch::decode(&raw).unwrap();
        assert!(errors.is_empty());
        assert_eq!(batch.inferences.len(), 1);

        let inference = &batch.inferences[0];
        assert_eq!(inference.id, "P1");
        assert_eq!(inference.source_info.frame_id, 7);
        match &inference.results {
            InferenceResults::Detection(detections) => {
                assert!(detections[0].has_label("person"));
                let center = detections[0].center();
                assert!((center.x - 0.2).abs() < 1e-9);
            }
            other => panic!("unexpected variant {}", other.kind()),
        }
    }

    #[test]
    fn test_decode_keeps_good_entries_when_one_is_malformed() {
        let raw = json!({
            "inferences": [
                {"sourceInfo": {"id": "cam1"}, "type": "classification", "id": "P1",
                 "detections": [{"classId": 3, "confidence": 0.5, "label": "cat"}]},
                {"sourceInfo": {"id": "cam1"}, "type": "hologram", "id": "P1", "detections": []},
                {"sourceInfo": {"id": "cam2"}, "type": "custom", "id": "P2", "detections": [{"anything": 1}]}
            ]
        });

        let (batch, errors) = InferenceBatch::decode(&raw).unwrap();
        assert_eq!(batch.inferences.len(), 2);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], DecodeError::MalformedInference { index: 1, .. }));
        assert_eq!(batch.pipeline_ids(), vec!["P1".to_string(), "P2".to_string()]);
    }

    #[test]
    fn test_decode_rejects_missing_inferences() {
        assert!(InferenceBatch::decode(&json!({"foo": []})).is_err());
    }

    #[test]
    fn test_recording_control_wire_format() {
        let control = RecordingControl::single("P1", true);
        assert_eq!(
            serde_json::to_value(&control).unwrap(),
            json!({"startRecording": [{"configId": "P1", "state": true}]})
        );
    }

    #[test]
    fn test_segment_event_wire_format() {
        let event = SegmentEvent::Opened {
            config_id: "P1".to_string(),
            file_name: "p1-2023-01-01-00:00:00".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "opened", "configId": "P1", "fileName": "p1-2023-01-01-00:00:00"})
        );
    }
}
