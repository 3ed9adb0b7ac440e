use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};
use tracing::{error, warn};

use super::model::{PipelineConfig, Sensor, Stream, TrackerConfig};

fn require_file(path: &Path, what: &str, pipeline_id: &str) -> bool {
    if path.exists() {
        true
    } else {
        error!("Pipeline {}: {} '{}' doesn't exist", pipeline_id, what, path.display());
        false
    }
}

/// File-level checks for a pipeline that was not provisioned in this cycle.
/// Secondary models and trackers need a primary model in front of them.
pub fn check_pipeline_files(config: &PipelineConfig) -> bool {
    let id = config.id.as_str();
    let mut is_ok = true;

    match &config.primary_model {
        Some(primary) => {
            is_ok &= require_file(&primary.config_file, "primary model config file", id);
            if let Some(py_file) = &primary.py_file {
                is_ok &= require_file(py_file, "primary model parser file", id);
            }

            for secondary in &config.secondary_models {
                is_ok &= require_file(&secondary.config_file, "secondary model config file", id);
                if let Some(py_file) = &secondary.py_file {
                    is_ok &= require_file(py_file, "secondary model parser file", id);
                }
            }

            if let Some(TrackerConfig::File(path)) = &config.tracker {
                is_ok &= require_file(path, "tracker config file", id);
            }
        }
        None => {
            if !config.secondary_models.is_empty() {
                error!("Pipeline {}: secondary model configured before a primary one", id);
                is_ok = false;
            }
            if config.tracker.is_some() {
                error!("Pipeline {}: tracker configured before a primary model", id);
                is_ok = false;
            }
        }
    }

    if let Some(dewarp) = &config.dewarp_config {
        is_ok &= require_file(dewarp, "dewarp config file", id);
    }

    is_ok
}

/// Number of streams feeding `pipeline_id` that also have a sensor.
pub fn linked_stream_count(
    pipeline_id: &str,
    streams: &BTreeMap<String, Stream>,
    sensors: &BTreeMap<String, Sensor>,
) -> usize {
    streams
        .values()
        .filter(|stream| stream.config_id == pipeline_id)
        .filter(|stream| {
            let linked = sensors.contains_key(&stream.name);
            if !linked {
                error!("Stream {} doesn't have a sensor config", stream.name);
            }
            linked
        })
        .count()
}

/// Sets `is_valid` on every pipeline. Pipelines listed in `provisioned` keep
/// their provisioning verdict in place of the file checks.
pub fn check_all(
    pipelines: &mut BTreeMap<String, PipelineConfig>,
    streams: &BTreeMap<String, Stream>,
    sensors: &BTreeMap<String, Sensor>,
    provisioned: &HashMap<String, bool>,
) {
    for (id, pipeline) in pipelines.iter_mut() {
        let linked = linked_stream_count(id, streams, sensors);
        if linked == 0 {
            error!("There are no input sources for pipeline: {}", id);
        }

        let files_ok = match provisioned.get(id) {
            Some(verdict) => *verdict,
            None => check_pipeline_files(pipeline),
        };

        pipeline.is_valid = linked > 0 && files_ok;
    }

    for (name, stream) in streams {
        if !pipelines.contains_key(&stream.config_id) {
            warn!(
                "Stream {} references pipeline {}, which is not configured",
                name, stream.config_id
            );
            if !sensors.contains_key(name) {
                warn!("Stream {} doesn't have a sensor config either", name);
            }
        }
    }
}
