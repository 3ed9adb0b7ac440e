use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::LauncherConfig,
    twin::{PipelineConfig, Sensor},
};

/// Everything the media engine needs to run one pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub pipeline: PipelineConfig,
    pub sources: Vec<String>,
    pub sensors: Vec<Sensor>,
    pub max_segment_seconds: u64,
}

/// Runs one pipeline until it exits or `cancel` fires.
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    async fn run(&self, spec: LaunchSpec, cancel: CancellationToken) -> Result<()>;
}

/// One OS process per pipeline.
pub struct ProcessLauncher {
    config: LauncherConfig,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn command(&self, spec: &LaunchSpec) -> Result<Command> {
        let mut command = match &spec.pipeline.passthrough_graph_description {
            Some(description) => {
                let mut command = Command::new(&self.config.passthrough_program);
                command.args(description.split_whitespace());
                command
            }
            None => {
                let mut command = Command::new(&self.config.program);
                command
                    .args(&self.config.args)
                    .arg("--pipeline-id")
                    .arg(&spec.pipeline.id);
                command
            }
        };

        let encoded = serde_json::to_string(spec).context("encoding launch spec")?;
        command
            .env(&self.config.spec_env_var, encoded)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        Ok(command)
    }
}

#[async_trait]
impl PipelineLauncher for ProcessLauncher {
    async fn run(&self, spec: LaunchSpec, cancel: CancellationToken) -> Result<()> {
        let id = spec.pipeline.id.clone();
        let mut child = self
            .command(&spec)?
            .spawn()
            .with_context(|| format!("spawning pipeline {}", id))?;

        info!("Pipeline {} started (pid {:?})", id, child.id());

        tokio::select! {
            status = child.wait() => {
                let status = status.with_context(|| format!("waiting for pipeline {}", id))?;
                if status.success() {
                    info!("Pipeline {} exited", id);
                    Ok(())
                } else {
                    Err(anyhow!("pipeline {} exited with {}", id, status))
                }
            }
            _ = cancel.cancelled() => {
                debug!("Stopping pipeline {}", id);
                child.start_kill().with_context(|| format!("killing pipeline {}", id))?;

                let stop_timeout = std::time::Duration::from_secs(self.config.stop_timeout_sec);
                match tokio::time::timeout(stop_timeout, child.wait()).await {
                    Ok(_) => info!("Pipeline {} stopped", id),
                    Err(_) => warn!("Pipeline {} did not stop within {:?}", id, stop_timeout),
                }
                Ok(())
            }
        }
    }
}
