use chrono::{DateTime, Local};
use edgeguard_common::utils::segment_file_name;
use std::time::Duration;

/// The file a recording pipeline is currently writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSession {
    pub file_base_name: String,
    pub segment_start: DateTime<Local>,
    pub is_recording: bool,
}

impl RecordingSession {
    pub fn open(config_id: &str, now: DateTime<Local>) -> Self {
        Self {
            file_base_name: segment_file_name(config_id, &now),
            segment_start: now,
            is_recording: true,
        }
    }

    /// A clock that went backwards never makes a segment due.
    pub fn is_due_for_rotation(&self, now: DateTime<Local>, max_segment: Duration) -> bool {
        now.signed_duration_since(self.segment_start)
            .to_std()
            .map(|elapsed| elapsed >= max_segment)
            .unwrap_or(false)
    }
}
