//! Types shared between the edgeguard node and the tools that talk to it:
//! ROI geometry and the JSON messages exchanged with the media engine.

pub mod geometry;
pub mod types;
pub mod utils;

pub use geometry::{Point, Polygon};
pub use types::{
    Classification, DecodeError, Inference, InferenceBatch, InferenceResults, ObjectDetection,
    RecordingControl, RecordingState, SegmentEvent, Segmentation, SourceInfo,
};
