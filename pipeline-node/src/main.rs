mod config;
mod error;
mod messaging;
mod provisioning;
mod recording;
mod supervisor;
mod twin;

use anyhow::Context as _;
use chrono::Local;
use clap::Parser;
use crate::config::{NodeConfig, MAX_SEGMENT_SECONDS_LIMIT};
use edgeguard_common::{InferenceBatch, RecordingState};
use error::{NodeError, Result};
use messaging::{zmq_bus, ControlPublisher, InboundMessage, LoggingPublisher, TwinPatch};
use provisioning::ModelProvisioner;
use recording::RecordingTriggerEngine;
use std::sync::Arc;
use supervisor::{PipelineSupervisor, ProcessLauncher};
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};
use twin::{ConfigurationTwin, ParseContext};
use validator::Validate;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node settings file
    #[arg(short, long, default_value = "config/edgeguard.toml")]
    config: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration document applied before any message arrives
    #[arg(long)]
    initial_configuration: Option<String>,
}

type LogFilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = init_logging(&args.log_level)?;

    let config = load_config(&args.config)?;
    info!("Starting edgeguard node {}", config.node_id);

    let cancel = CancellationToken::new();
    let zmq_context = zmq::Context::new();

    let publisher: Arc<dyn ControlPublisher> = if config.messaging.enabled {
        Arc::new(zmq_bus::ZmqPublisher::new(&zmq_context, &config.messaging)?)
    } else {
        info!("Messaging disabled, recording decisions are only logged");
        Arc::new(LoggingPublisher)
    };

    let app_state = AppState::new(config.clone(), publisher, Some(log_filter))?;

    if let Some(path) = &args.initial_configuration {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path))?;
        let raw: serde_json::Value = serde_json::from_str(raw.trim_start_matches('\u{feff}'))?;
        app_state
            .handle_message(InboundMessage::Configuration(raw))
            .await?;
    }

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<(String, Vec<u8>)>(256);
    let subscriber = if config.messaging.enabled {
        Some(zmq_bus::ZmqSubscriber::spawn(
            &zmq_context,
            &config.messaging,
            inbound_tx,
            cancel.clone(),
        )?)
    } else {
        drop(inbound_tx);
        None
    };

    let dispatcher = {
        let app_state = app_state.clone();
        tokio::spawn(async move {
            while let Some((topic, payload)) = inbound_rx.recv().await {
                let message = match InboundMessage::decode(&topic, &payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping message on {}: {}", topic, e);
                        continue;
                    }
                };
                if let Err(e) = app_state.handle_message(message).await {
                    error!("Handling message on {} failed: {}", topic, e);
                }
            }
        })
    };

    let ticker = {
        let engine = app_state.engine.clone();
        let cancel = cancel.clone();
        let period = config.recording.tick_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        engine.tick(Local::now()).await;
                    }
                }
            }
        })
    };

    wait_for_shutdown().await;

    info!("Shutting down edgeguard node");
    cancel.cancel();
    app_state.supervisor.shutdown().await;

    if let Some(subscriber) = subscriber {
        tokio::task::spawn_blocking(move || subscriber.join()).await?;
    }
    dispatcher.abort();
    let _ = ticker.await;

    Ok(())
}

fn init_logging(level: &str) -> Result<LogFilterHandle> {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| NodeError::ConfigError(e.to_string()))?;

    Ok(handle)
}

/// Remote `logLevel` names to filter directives.
fn map_log_level(level: &str) -> Option<&'static str> {
    match level.to_uppercase().as_str() {
        "DEBUG" => Some("debug"),
        "INFORMATION" | "INFO" => Some("info"),
        "WARNING" | "WARN" => Some("warn"),
        "ERROR" => Some("error"),
        _ => None,
    }
}

fn load_config(path: &str) -> Result<NodeConfig> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::with_name(path).required(false))
        .add_source(::config::Environment::with_prefix("EDGEGUARD").separator("__"))
        .build()?;

    let config: NodeConfig = settings.try_deserialize()?;
    config
        .validate()
        .map_err(|e| NodeError::ConfigError(e.to_string()))?;

    Ok(config)
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// Application state shared across components
#[derive(Clone)]
pub struct AppState {
    pub config: NodeConfig,
    pub twin: Arc<ConfigurationTwin>,
    pub engine: Arc<RecordingTriggerEngine>,
    pub supervisor: Arc<PipelineSupervisor>,
    log_filter: Option<LogFilterHandle>,
}

impl AppState {
    pub fn new(
        config: NodeConfig,
        publisher: Arc<dyn ControlPublisher>,
        log_filter: Option<LogFilterHandle>,
    ) -> Result<Self> {
        let provisioner = ModelProvisioner::from_config(config.provisioning.clone())?;
        let parse_context = ParseContext {
            light_tracker_config_path: config.provisioning.light_tracker_config_path.clone(),
        };
        let twin = Arc::new(ConfigurationTwin::new(
            provisioner,
            parse_context,
            config.recording.max_segment_seconds,
        ));

        let launcher = Arc::new(ProcessLauncher::new(config.launcher.clone()));
        Ok(Self::assemble(config, twin, publisher, launcher, log_filter))
    }

    fn assemble(
        config: NodeConfig,
        twin: Arc<ConfigurationTwin>,
        publisher: Arc<dyn ControlPublisher>,
        launcher: Arc<dyn supervisor::PipelineLauncher>,
        log_filter: Option<LogFilterHandle>,
    ) -> Self {
        let engine = Arc::new(RecordingTriggerEngine::new(
            twin.clone(),
            &config.recording.monitored_classes,
            publisher,
        ));
        let supervisor = Arc::new(PipelineSupervisor::new(twin.clone(), engine.clone(), launcher));

        Self {
            config,
            twin,
            engine,
            supervisor,
            log_filter,
        }
    }

    pub async fn handle_message(&self, message: InboundMessage) -> Result<()> {
        debug!("Handling {} message", message.topic());

        match message {
            InboundMessage::Configuration(raw) => {
                if let Some(level) = raw.get("logLevel").and_then(|v| v.as_str()) {
                    self.set_log_level(level);
                }
                let report = self.supervisor.reconfigure(&raw).await?;
                info!(
                    "Node {} running {} of {} pipelines",
                    self.config.node_id, report.valid_pipelines, report.pipelines
                );
            }
            InboundMessage::RegionsOfInterest(raw) => {
                let updated = self.twin.update_sensors(&raw).await?;
                info!("Regions of interest updated for {} sensors", updated);
                self.engine.reset_rois().await;
            }
            InboundMessage::Inference(raw) => {
                let (batch, errors) = InferenceBatch::decode(&raw)
                    .map_err(|e| NodeError::ParseError(e.to_string()))?;
                for e in errors {
                    warn!("{}", e);
                }
                self.engine.ingest(&batch).await;
            }
            InboundMessage::RecordingInput(control) => {
                self.request_recordings(&control.start_recording).await;
            }
            InboundMessage::TwinPatch(TwinPatch {
                output_video_length,
                start_recording,
            }) => {
                match output_video_length {
                    Some(0) => warn!("Ignoring outputVideoLength of 0"),
                    Some(seconds) if seconds > MAX_SEGMENT_SECONDS_LIMIT => warn!(
                        "Ignoring outputVideoLength of {}s, the limit is {}s",
                        seconds, MAX_SEGMENT_SECONDS_LIMIT
                    ),
                    Some(seconds) => self.twin.set_max_segment_seconds(seconds),
                    None => {}
                }
                if let Some(requests) = start_recording {
                    self.request_recordings(&requests).await;
                }
            }
        }

        Ok(())
    }

    async fn request_recordings(&self, requests: &[RecordingState]) {
        for request in requests {
            if let Err(e) = self
                .engine
                .request_recording(&request.config_id, request.state)
                .await
            {
                warn!("Recording request for {} rejected: {}", request.config_id, e);
            }
        }
    }

    fn set_log_level(&self, level: &str) {
        let Some(directive) = map_log_level(level) else {
            warn!("Unknown log level {}", level);
            return;
        };
        let Some(handle) = &self.log_filter else {
            return;
        };

        match handle.reload(EnvFilter::new(directive)) {
            Ok(()) => info!("Log level set to {}", directive),
            Err(e) => error!("Failed to change log level: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messaging::RecordingPublisher,
        supervisor::{LaunchSpec, PipelineLauncher},
        twin::tests::{offline_twin, two_camera_config},
    };
    use async_trait::async_trait;
    use edgeguard_common::RecordingControl;
    use serde_json::json;

    struct IdleLauncher;

    #[async_trait]
    impl PipelineLauncher for IdleLauncher {
        async fn run(&self, _spec: LaunchSpec, cancel: CancellationToken) -> anyhow::Result<()> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn app_state() -> (AppState, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let state = AppState::assemble(
            NodeConfig::default(),
            Arc::new(offline_twin()),
            publisher.clone(),
            Arc::new(IdleLauncher),
            None,
        );
        (state, publisher)
    }

    #[test]
    fn test_map_log_level() {
        assert_eq!(map_log_level("DEBUG"), Some("debug"));
        assert_eq!(map_log_level("Information"), Some("info"));
        assert_eq!(map_log_level("WARNING"), Some("warn"));
        assert_eq!(map_log_level("error"), Some("error"));
        assert_eq!(map_log_level("VERBOSE"), None);
    }

    #[test]
    fn test_missing_settings_file_falls_back_to_defaults() {
        let config = load_config("/nonexistent/edgeguard-settings").unwrap();
        assert_eq!(config.recording.max_segment_seconds, 30);
    }

    #[tokio::test]
    async fn test_message_flow() {
        let (state, publisher) = app_state();

        state
            .handle_message(InboundMessage::Configuration(two_camera_config()))
            .await
            .unwrap();
        assert_eq!(state.supervisor.running().await.len(), 2);

        state
            .handle_message(InboundMessage::TwinPatch(TwinPatch {
                output_video_length: Some(60),
                start_recording: Some(vec![RecordingState {
                    config_id: "P2".to_string(),
                    state: true,
                }]),
            }))
            .await
            .unwrap();
        assert_eq!(state.twin.max_segment_seconds(), 60);
        assert_eq!(publisher.controls(), vec![RecordingControl::single("P2", true)]);

        let inference = json!({
            "inferences": [{
                "sourceInfo": {"id": "cam1"},
                "type": "detection",
                "id": "P1",
                "detections": [{"classId": 0, "confidence": 0.8, "label": "defect", "rect": [0.2, 0.2, 0.1, 0.1]}]
            }]
        });
        state
            .handle_message(InboundMessage::Inference(inference))
            .await
            .unwrap();
        assert_eq!(publisher.controls().last(), Some(&RecordingControl::single("P1", true)));

        state
            .handle_message(InboundMessage::RegionsOfInterest(json!({"sensors": []})))
            .await
            .unwrap();
        assert_eq!(publisher.controls().last(), Some(&RecordingControl::single("P1", false)));

        state
            .handle_message(InboundMessage::TwinPatch(TwinPatch {
                output_video_length: Some(10_000_000_000_000_000),
                start_recording: None,
            }))
            .await
            .unwrap();
        assert_eq!(state.twin.max_segment_seconds(), 60);

        // Unknown pipelines are logged, not fatal.
        state
            .handle_message(InboundMessage::RecordingInput(RecordingControl::single("nope", true)))
            .await
            .unwrap();

        state.supervisor.shutdown().await;
    }
}
