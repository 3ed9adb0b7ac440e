use async_trait::async_trait;
use std::{path::Path, process::Stdio};
use tokio::process::Command;
use tracing::debug;

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Clean,
    /// The archive was extracted but the tool reported something worth a look.
    Warnings,
}

/// Unpacks a bundle archive into a directory.
#[async_trait]
pub trait BundleExtractor: Send + Sync {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<ExtractOutcome>;
}

/// Runs `unzip -o <archive> -d <destination>`. Exit code 1 is unzip's
/// "completed with warnings"; anything else non-zero is a failure.
pub struct UnzipExtractor {
    program: String,
}

impl UnzipExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

pub fn classify_exit_code(code: Option<i32>) -> Result<ExtractOutcome> {
    match code {
        Some(0) => Ok(ExtractOutcome::Clean),
        Some(1) => Ok(ExtractOutcome::Warnings),
        Some(code) => Err(NodeError::ProvisioningError(format!(
            "extractor exited with code {}",
            code
        ))),
        None => Err(NodeError::ProvisioningError(
            "extractor was terminated by a signal".to_string(),
        )),
    }
}

#[async_trait]
impl BundleExtractor for UnzipExtractor {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<ExtractOutcome> {
        debug!("Extracting {} into {}", archive.display(), destination.display());

        let output = Command::new(&self.program)
            .arg("-o")
            .arg(archive)
            .arg("-d")
            .arg(destination)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NodeError::ProvisioningError(format!("Failed to run {}: {}", self.program, e)))?;

        let outcome = classify_exit_code(output.status.code());
        if outcome.is_err() {
            debug!("{} stderr: {}", self.program, String::from_utf8_lossy(&output.stderr));
        }
        outcome
    }
}
