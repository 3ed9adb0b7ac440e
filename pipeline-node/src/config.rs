use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use validator::Validate;

/// Longest recording segment accepted from settings or a twin patch.
pub const MAX_SEGMENT_SECONDS_LIMIT: u64 = 86_400;

/// Node settings. Loaded from a file plus `EDGEGUARD_*` environment overrides;
/// distinct from the remote pipeline configuration held by the twin.
#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct NodeConfig {
    #[validate(length(min = 1))]
    pub node_id: String,
    #[validate]
    pub provisioning: ProvisioningConfig,
    #[validate]
    pub recording: RecordingConfig,
    #[validate]
    pub messaging: MessagingConfig,
    #[validate]
    pub launcher: LauncherConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Installation root; every bundle lands in `<models_dir>/<bundle folder>`.
    pub models_dir: PathBuf,
    /// Scratch file the bundle archive is downloaded to.
    pub download_path: PathBuf,
    /// Name of the scratch extraction directory under `models_dir`.
    #[validate(length(min = 1))]
    pub extract_dir_name: String,
    #[validate(range(min = 1))]
    pub download_timeout_sec: u64,
    #[validate(range(min = 1))]
    pub extract_timeout_sec: u64,
    /// Skip TLS verification when fetching from `unsecureZipUrl`.
    pub accept_invalid_certs: bool,
    pub unzip_program: String,
    /// Built-in tracker config used when a pipeline asks for "light-tracker".
    pub light_tracker_config_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct RecordingConfig {
    #[validate(range(min = 1, max = 86400))]
    pub max_segment_seconds: u64,
    #[validate(range(min = 10))]
    pub tick_interval_ms: u64,
    #[validate(length(min = 1))]
    pub monitored_classes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct MessagingConfig {
    pub enabled: bool,
    #[validate(length(min = 1))]
    pub sub_endpoint: String,
    #[validate(length(min = 1))]
    pub pub_endpoint: String,
    pub high_water_mark: i32,
    pub send_timeout_ms: i32,
    #[validate(range(min = 10))]
    pub receive_poll_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
#[serde(default)]
pub struct LauncherConfig {
    /// Program started once per valid pipeline.
    #[validate(length(min = 1))]
    pub program: String,
    pub args: Vec<String>,
    /// Program used for pipelines carrying a raw graph description.
    #[validate(length(min = 1))]
    pub passthrough_program: String,
    /// Environment variable the JSON launch spec is handed over in.
    #[validate(length(min = 1))]
    pub spec_env_var: String,
    #[validate(range(min = 1))]
    pub stop_timeout_sec: u64,
}

impl ProvisioningConfig {
    pub fn extract_dir(&self) -> PathBuf {
        self.models_dir.join(&self.extract_dir_name)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_sec)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_sec)
    }
}

impl RecordingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "edgeguard-node-1".to_string(),
            provisioning: ProvisioningConfig::default(),
            recording: RecordingConfig::default(),
            messaging: MessagingConfig::default(),
            launcher: LauncherConfig::default(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("/root/models"),
            download_path: PathBuf::from("/root/model.zip"),
            extract_dir_name: "downloaded".to_string(),
            download_timeout_sec: 600,
            extract_timeout_sec: 300,
            accept_invalid_certs: true,
            unzip_program: "unzip".to_string(),
            light_tracker_config_path: PathBuf::from("/opt/edgeguard/config/LightTrack.txt"),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_segment_seconds: 30,
            tick_interval_ms: 1000,
            monitored_classes: vec!["person".to_string(), "defect".to_string()],
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sub_endpoint: "tcp://127.0.0.1:5556".to_string(),
            pub_endpoint: "tcp://*:5557".to_string(),
            high_water_mark: 1000,
            send_timeout_ms: 1000,
            receive_poll_ms: 200,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: "edgeguard-ds-pipeline".to_string(),
            args: vec![],
            passthrough_program: "gst-launch-1.0".to_string(),
            spec_env_var: "EDGEGUARD_LAUNCH_SPEC".to_string(),
            stop_timeout_sec: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recording.max_segment_seconds, 30);
        assert_eq!(config.provisioning.extract_dir(), PathBuf::from("/root/models/downloaded"));
    }

    #[test]
    fn test_zero_segment_length_rejected() {
        let mut config = NodeConfig::default();
        config.recording.max_segment_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_segment_length_above_a_day_rejected() {
        let mut config = NodeConfig::default();
        config.recording.max_segment_seconds = MAX_SEGMENT_SECONDS_LIMIT;
        assert!(config.validate().is_ok());
        config.recording.max_segment_seconds = MAX_SEGMENT_SECONDS_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_monitored_classes_rejected() {
        let mut config = NodeConfig::default();
        config.recording.monitored_classes.clear();
        assert!(config.validate().is_err());
    }
}
