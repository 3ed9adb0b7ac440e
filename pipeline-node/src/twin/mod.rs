//! The node's copy of its remote configuration.
//!
//! Readers take an `Arc<TwinSnapshot>` and never wait on an update. Updates
//! are serialized; each one builds a complete new snapshot (provisioning
//! bundles along the way) and publishes it with a single swap.

mod model;
mod validity;

pub use model::{ParseContext, PipelineConfig, Sensor, Stream, TrackerConfig};
#[cfg(test)]
pub(crate) use model::ModelConfig;

use model::{parse_each, parse_sensor, parse_stream};
use validity::check_all;

use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    error::{NodeError, Result},
    provisioning::ModelProvisioner,
};

#[derive(Debug, Default)]
pub struct TwinSnapshot {
    pub pipelines_enabled: bool,
    pub pipelines: BTreeMap<String, PipelineConfig>,
    pub streams: BTreeMap<String, Stream>,
    pub sensors: BTreeMap<String, Sensor>,
}

impl TwinSnapshot {
    pub fn valid_pipelines(&self) -> impl Iterator<Item = &PipelineConfig> {
        self.pipelines.values().filter(|p| p.is_valid)
    }

    pub fn sensor(&self, name: &str) -> Option<&Sensor> {
        self.sensors.get(name)
    }
}

/// Outcome of one full configuration update.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub pipelines_enabled: bool,
    pub pipelines: usize,
    pub valid_pipelines: usize,
    pub parse_errors: usize,
    pub provisioning_failures: usize,
}

pub struct ConfigurationTwin {
    snapshot: RwLock<Arc<TwinSnapshot>>,
    update_lock: Mutex<()>,
    max_segment_seconds: AtomicU64,
    provisioner: ModelProvisioner,
    parse_context: ParseContext,
}

fn array_field<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    match value.get(key) {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Null) | None => &[],
        Some(other) => {
            warn!("'{}' should be an array, got {}", key, other);
            &[]
        }
    }
}

fn into_map<T>(items: Vec<T>, what: &str, key: impl Fn(&T) -> String) -> BTreeMap<String, T> {
    let mut map = BTreeMap::new();
    for item in items {
        let name = key(&item);
        if map.insert(name.clone(), item).is_some() {
            warn!("Duplicate {} '{}', keeping the last one", what, name);
        }
    }
    map
}

/// The `deepStream` section of a configuration document. A document without
/// one is rejected as a whole.
pub fn deep_stream_section(raw: &Value) -> Result<&Value> {
    raw.get("deepStream")
        .ok_or_else(|| NodeError::ParseError("configuration has no 'deepStream' section".to_string()))
}

/// Puts `username[:password]@` into the endpoint's authority. Endpoints that
/// are not URLs with a host (e.g. `/dev/video0`) are passed through.
pub fn inject_credentials(endpoint: &str, username: &str, password: &str) -> String {
    if username.is_empty() {
        return endpoint.to_string();
    }

    let mut url = match Url::parse(endpoint) {
        Ok(url) => url,
        Err(e) => {
            warn!("Cannot add credentials to endpoint {}: {}", endpoint, e);
            return endpoint.to_string();
        }
    };

    let password = (!password.is_empty()).then_some(password);
    if url.set_username(username).is_err() || url.set_password(password).is_err() {
        warn!("Endpoint {} cannot carry credentials", endpoint);
        return endpoint.to_string();
    }

    url.to_string()
}

impl ConfigurationTwin {
    pub fn new(provisioner: ModelProvisioner, parse_context: ParseContext, max_segment_seconds: u64) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(TwinSnapshot::default())),
            update_lock: Mutex::new(()),
            max_segment_seconds: AtomicU64::new(max_segment_seconds),
            provisioner,
            parse_context,
        }
    }

    pub fn snapshot(&self) -> Arc<TwinSnapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn publish(&self, snapshot: TwinSnapshot) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }

    pub fn max_segment_seconds(&self) -> u64 {
        self.max_segment_seconds.load(Ordering::SeqCst)
    }

    pub fn set_max_segment_seconds(&self, seconds: u64) {
        info!("Maximum recording segment length set to {}s", seconds);
        self.max_segment_seconds.store(seconds, Ordering::SeqCst);
    }

    pub async fn apply_configuration(&self, raw: &Value) -> Result<ApplyReport> {
        let _update = self.update_lock.lock().await;

        let deep_stream = deep_stream_section(raw)?;

        let enabled = deep_stream.get("enable").and_then(Value::as_bool).unwrap_or(false);
        if !enabled {
            info!("Pipelines are disabled by configuration");
            self.publish(TwinSnapshot::default());
            return Ok(ApplyReport::default());
        }

        let ctx = &self.parse_context;
        let (pipelines, pipeline_errors) = parse_each(array_field(deep_stream, "pipelineConfigs"), "pipeline config", |v| {
            PipelineConfig::from_json(v, ctx)
        });
        let (streams, stream_errors) = parse_each(array_field(deep_stream, "streams"), "stream", parse_stream);
        let (sensors, sensor_errors) = parse_each(array_field(raw, "sensors"), "sensor", parse_sensor);

        let mut pipelines = into_map(pipelines, "pipeline", |p| p.id.clone());
        let streams = into_map(streams, "stream", |s| s.name.clone());
        let sensors = into_map(sensors, "sensor", |s| s.name.clone());

        let mut provisioned: HashMap<String, bool> = HashMap::new();
        for pipeline in pipelines.values_mut().filter(|p| p.needs_download()) {
            match self.provisioner.provision(pipeline).await {
                Ok(resolved) => {
                    *pipeline = resolved;
                    provisioned.insert(pipeline.id.clone(), true);
                }
                Err(e) => {
                    error!("Provisioning pipeline {} failed: {}", pipeline.id, e);
                    provisioned.insert(pipeline.id.clone(), false);
                }
            }
        }

        let provisioning_failures = provisioned.values().filter(|ok| !**ok).count();

        // Engine sniffing and file checks touch the disk.
        let (pipelines, streams, sensors) = tokio::task::spawn_blocking(move || {
            for pipeline in pipelines.values_mut() {
                if provisioned.get(&pipeline.id) != Some(&false) {
                    pipeline.derive_engine_kinds();
                }
            }
            check_all(&mut pipelines, &streams, &sensors, &provisioned);
            (pipelines, streams, sensors)
        })
        .await
        .map_err(|e| NodeError::ConfigError(format!("validity check panicked: {}", e)))?;

        let report = ApplyReport {
            pipelines_enabled: true,
            pipelines: pipelines.len(),
            valid_pipelines: pipelines.values().filter(|p| p.is_valid).count(),
            parse_errors: pipeline_errors.len() + stream_errors.len() + sensor_errors.len(),
            provisioning_failures,
        };

        self.publish(TwinSnapshot {
            pipelines_enabled: true,
            pipelines,
            streams,
            sensors,
        });

        info!(
            "Configuration applied: {}/{} pipelines valid, {} parse errors, {} provisioning failures",
            report.valid_pipelines, report.pipelines, report.parse_errors, report.provisioning_failures
        );
        Ok(report)
    }

    /// Replaces the regions of interest of known sensors. Sensor names,
    /// endpoints, pipelines and streams are left as they are.
    pub async fn update_sensors(&self, raw: &Value) -> Result<usize> {
        let _update = self.update_lock.lock().await;

        let (updates, _errors) = parse_each(array_field(raw, "sensors"), "sensor", parse_sensor);
        let current = self.snapshot();

        let mut sensors = current.sensors.clone();
        let mut updated = 0;
        for update in updates {
            match sensors.get_mut(&update.name) {
                Some(sensor) => {
                    debug!(
                        "Sensor {} now has {} regions of interest",
                        update.name,
                        update.regions_of_interest.len()
                    );
                    sensor.regions_of_interest = update.regions_of_interest;
                    updated += 1;
                }
                None => warn!("Regions of interest for unknown sensor {}", update.name),
            }
        }

        self.publish(TwinSnapshot {
            pipelines_enabled: current.pipelines_enabled,
            pipelines: current.pipelines.clone(),
            streams: current.streams.clone(),
            sensors,
        });

        Ok(updated)
    }

    /// Source URIs (with credentials) and sensors feeding `pipeline_id`.
    pub fn get_sources(&self, pipeline_id: &str) -> (Vec<String>, Vec<Sensor>) {
        let snapshot = self.snapshot();
        let mut uris = Vec::new();
        let mut sensors = Vec::new();

        for stream in snapshot.streams.values().filter(|s| s.config_id == pipeline_id) {
            let Some(sensor) = snapshot.sensor(&stream.name) else {
                error!("Stream {} doesn't have a sensor config", stream.name);
                continue;
            };

            uris.push(inject_credentials(&sensor.endpoint, &stream.username, &stream.password));
            sensors.push(sensor.clone());
        }

        (uris, sensors)
    }

    pub fn set_recording_requested(&self, pipeline_id: &str, requested: bool) -> Result<()> {
        let snapshot = self.snapshot();
        let pipeline = snapshot
            .pipelines
            .get(pipeline_id)
            .ok_or_else(|| NodeError::LinkageError(format!("unknown pipeline {}", pipeline_id)))?;

        pipeline.recording_requested.set(requested);
        Ok(())
    }

    /// Pipelines an operator currently wants recorded.
    pub fn requested_recordings(&self) -> Vec<String> {
        self.snapshot()
            .pipelines
            .values()
            .filter(|p| p.recording_requested.is_set())
            .map(|p| p.id.clone())
            .collect()
    }
}
