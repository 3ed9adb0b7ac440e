use edgeguard_common::{Point, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

use crate::error::{NodeError, Result};

/// What a pipeline writes in `trackerConfigPath` to get the built-in tracker.
pub const LIGHT_TRACKER: &str = "light-tracker";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SensorKind {
    #[serde(rename = "type")]
    pub sensor_type: String,
    #[serde(default)]
    pub subtype: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegionOfInterest {
    pub label: String,
    #[serde(default)]
    pub color: String,
    #[serde(alias = "polygon")]
    pub coordinates: Polygon,
}

impl RegionOfInterest {
    pub fn contains(&self, point: Point) -> bool {
        self.coordinates.contains(point)
    }
}

/// A video source.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub name: String,
    pub kind: SensorKind,
    pub endpoint: String,
    #[serde(default)]
    pub regions_of_interest: Vec<RegionOfInterest>,
}

/// Pairs a sensor (by name) with a pipeline configuration (by id).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Stream {
    pub name: String,
    #[serde(rename = "uname", alias = "username", default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "configId")]
    pub config_id: String,
}

impl Stream {
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Inference element a model config is meant for.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineKind {
    /// INI-style config consumed by `nvinfer`.
    #[default]
    Tao,
    /// Protobuf-text config consumed by `nvinferserver`.
    Triton,
}

impl EngineKind {
    pub fn element_name(&self) -> &'static str {
        match self {
            EngineKind::Tao => "nvinfer",
            EngineKind::Triton => "nvinferserver",
        }
    }

    /// Sniffs `config_file`: an INI file with at least one section is a TAO
    /// config; no section header (or nothing readable) means Triton. A
    /// duplicated section still reads as INI.
    pub fn detect(config_file: &Path) -> Self {
        let text = match std::fs::read_to_string(config_file) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                debug!("{} is not UTF-8, defaulting to TAO", config_file.display());
                return EngineKind::Tao;
            }
            Err(e) => {
                debug!("Could not read {}: {}, treating as Triton", config_file.display(), e);
                return EngineKind::Triton;
            }
        };

        let mut sections = HashSet::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            match trimmed.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                Some(section) => {
                    if !sections.insert(section.trim().to_string()) {
                        debug!("Duplicate section in {}, defaulting to TAO", config_file.display());
                        return EngineKind::Tao;
                    }
                }
                None if sections.is_empty() => {
                    debug!("Missing section header in {}, treating as Triton", config_file.display());
                    return EngineKind::Triton;
                }
                None => {}
            }
        }

        if sections.is_empty() {
            EngineKind::Triton
        } else {
            EngineKind::Tao
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub config_file: PathBuf,
    pub py_file: Option<PathBuf>,
    pub parser: Option<String>,
    pub engine_kind: EngineKind,
}

impl ModelConfig {
    pub fn new(config_file: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            py_file: None,
            parser: None,
            engine_kind: EngineKind::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", content = "path", rename_all = "camelCase")]
pub enum TrackerConfig {
    /// Built-in tracker shipped with the node; never part of a bundle.
    LightTracker(PathBuf),
    File(PathBuf),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x0: i64,
    pub x1: i64,
    pub y0: i64,
    pub y1: i64,
}

/// Level-triggered "please record" flag for one pipeline. Clones share the
/// same flag.
#[derive(Debug, Clone, Default)]
pub struct RecordingSignal(Arc<AtomicBool>);

impl RecordingSignal {
    pub fn set(&self, requested: bool) {
        self.0.store(requested, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub id: String,
    pub unsecure_zip_url: String,
    pub primary_model: Option<ModelConfig>,
    pub secondary_models: Vec<ModelConfig>,
    pub tracker: Option<TrackerConfig>,
    pub passthrough_graph_description: Option<String>,
    pub dewarp_config: Option<PathBuf>,
    pub crop_region: Option<CropRegion>,
    pub osd_enabled: bool,
    pub is_valid: bool,
    #[serde(skip)]
    pub recording_requested: RecordingSignal,
}

impl PipelineConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unsecure_zip_url: String::new(),
            primary_model: None,
            secondary_models: Vec::new(),
            tracker: None,
            passthrough_graph_description: None,
            dewarp_config: None,
            crop_region: None,
            osd_enabled: false,
            is_valid: true,
            recording_requested: RecordingSignal::default(),
        }
    }

    pub fn needs_download(&self) -> bool {
        !self.unsecure_zip_url.is_empty()
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelConfig> {
        self.primary_model.iter().chain(self.secondary_models.iter())
    }

    pub fn models_mut(&mut self) -> impl Iterator<Item = &mut ModelConfig> {
        self.primary_model.iter_mut().chain(self.secondary_models.iter_mut())
    }

    /// Sets `engine_kind` on every model from its config file.
    pub fn derive_engine_kinds(&mut self) {
        for model in self.models_mut() {
            model.engine_kind = EngineKind::detect(&model.config_file);
        }
    }
}

/// Values needed to turn raw JSON into a `PipelineConfig`.
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub light_tracker_config_path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawModelConfig {
    Path(String),
    Full {
        #[serde(rename = "configFile")]
        config_file: String,
        #[serde(rename = "pyFile", default)]
        py_file: Option<String>,
        #[serde(default)]
        parser: Option<String>,
    },
}

impl RawModelConfig {
    fn into_model(self) -> Option<ModelConfig> {
        match self {
            RawModelConfig::Path(path) if path.is_empty() => None,
            RawModelConfig::Path(path) => Some(ModelConfig::new(path)),
            RawModelConfig::Full {
                config_file,
                py_file,
                parser,
            } => Some(ModelConfig {
                config_file: PathBuf::from(config_file),
                py_file: py_file.filter(|p| !p.is_empty()).map(PathBuf::from),
                parser: parser.filter(|p| !p.is_empty()),
                engine_kind: EngineKind::default(),
            }),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<RawModelConfig>),
    One(RawModelConfig),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntLike {
    Int(i64),
    Text(String),
}

impl IntLike {
    fn to_int(&self, field: &str) -> Result<i64> {
        match self {
            IntLike::Int(value) => Ok(*value),
            IntLike::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| NodeError::ParseError(format!("crop.{} is not an integer: {:?}", field, text))),
        }
    }
}

#[derive(Deserialize, Default)]
struct RawDewarp {
    #[serde(default)]
    enable: bool,
    #[serde(default)]
    config_file: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawCrop {
    #[serde(default)]
    enable: bool,
    x0: Option<IntLike>,
    x1: Option<IntLike>,
    y0: Option<IntLike>,
    y1: Option<IntLike>,
}

#[derive(Deserialize, Default)]
struct RawToggle {
    #[serde(default)]
    enable: bool,
}

#[derive(Deserialize, Default)]
struct RawPipelineOptions {
    #[serde(default)]
    dewarp: Option<RawDewarp>,
    #[serde(default)]
    crop: Option<RawCrop>,
    #[serde(default)]
    osd: Option<RawToggle>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPipelineConfig {
    id: String,
    #[serde(default)]
    unsecure_zip_url: Option<String>,
    #[serde(default)]
    primary_model_config_path: Option<RawModelConfig>,
    #[serde(default)]
    secondary_model_config_paths: Option<OneOrMany>,
    #[serde(default)]
    tracker_config_path: Option<String>,
    #[serde(default)]
    deepstream_passthrough: Option<String>,
    #[serde(default)]
    pipeline_options: Option<RawPipelineOptions>,
}

impl PipelineConfig {
    pub fn from_json(value: &Value, ctx: &ParseContext) -> Result<Self> {
        let raw: RawPipelineConfig = serde_json::from_value(value.clone())
            .map_err(|e| NodeError::ParseError(format!("pipeline config: {}", e)))?;

        if raw.id.is_empty() {
            return Err(NodeError::ParseError("pipeline config has an empty id".to_string()));
        }

        let mut config = PipelineConfig::new(raw.id);
        config.unsecure_zip_url = raw.unsecure_zip_url.unwrap_or_default();
        config.primary_model = raw.primary_model_config_path.and_then(RawModelConfig::into_model);
        config.secondary_models = match raw.secondary_model_config_paths {
            Some(OneOrMany::Many(models)) => models.into_iter().filter_map(RawModelConfig::into_model).collect(),
            Some(OneOrMany::One(model)) => model.into_model().into_iter().collect(),
            None => Vec::new(),
        };

        config.tracker = match raw.tracker_config_path.filter(|p| !p.is_empty()) {
            Some(path) if path.eq_ignore_ascii_case(LIGHT_TRACKER) => {
                debug!(
                    "Pipeline {} requested the light tracker, using {}",
                    config.id,
                    ctx.light_tracker_config_path.display()
                );
                Some(TrackerConfig::LightTracker(ctx.light_tracker_config_path.clone()))
            }
            Some(path) => Some(TrackerConfig::File(PathBuf::from(path))),
            None => None,
        };

        config.passthrough_graph_description = raw.deepstream_passthrough.filter(|d| !d.trim().is_empty());

        if let Some(options) = raw.pipeline_options {
            if let Some(dewarp) = options.dewarp.filter(|d| d.enable) {
                let file = dewarp.config_file.filter(|f| !f.is_empty()).ok_or_else(|| {
                    NodeError::ParseError(format!("pipeline {}: dewarp enabled without config_file", config.id))
                })?;
                config.dewarp_config = Some(PathBuf::from(file));
            }

            if let Some(crop) = options.crop.filter(|c| c.enable) {
                let field = |value: &Option<IntLike>, name: &str| -> Result<i64> {
                    value
                        .as_ref()
                        .ok_or_else(|| NodeError::ParseError(format!("crop.{} is missing", name)))?
                        .to_int(name)
                };
                config.crop_region = Some(CropRegion {
                    x0: field(&crop.x0, "x0")?,
                    x1: field(&crop.x1, "x1")?,
                    y0: field(&crop.y0, "y0")?,
                    y1: field(&crop.y1, "y1")?,
                });
            }

            config.osd_enabled = options.osd.map(|o| o.enable).unwrap_or(false);
        }

        Ok(config)
    }
}

/// Parses every element of a JSON array independently; a malformed element is
/// reported and skipped, the rest are kept.
pub fn parse_each<T, F>(values: &[Value], what: &str, mut parse: F) -> (Vec<T>, Vec<NodeError>)
where
    F: FnMut(&Value) -> Result<T>,
{
    let mut parsed = Vec::with_capacity(values.len());
    let mut errors = Vec::new();

    for (index, value) in values.iter().enumerate() {
        match parse(value) {
            Ok(item) => parsed.push(item),
            Err(e) => {
                warn!("Skipping {} #{}: {}", what, index, e);
                errors.push(e);
            }
        }
    }

    (parsed, errors)
}

pub fn parse_sensor(value: &Value) -> Result<Sensor> {
    serde_json::from_value(value.clone()).map_err(|e| NodeError::ParseError(format!("sensor: {}", e)))
}

pub fn parse_stream(value: &Value) -> Result<Stream> {
    serde_json::from_value(value.clone()).map_err(|e| NodeError::ParseError(format!("stream: {}", e)))
}
