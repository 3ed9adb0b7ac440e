//! Fetches, unpacks and installs the model bundle a pipeline points at.
//!
//! A provisioning pass either returns a fully resolved copy of the pipeline
//! (every model path absolute and present on disk) or fails and leaves the
//! input untouched. Scratch files are removed on every exit path.

mod extract;
mod fetch;
mod scratch;

pub use extract::{BundleExtractor, ExtractOutcome, UnzipExtractor};
pub use fetch::{BundleFetcher, HttpFetcher};

use edgeguard_common::utils::validate_bundle_url;
use std::path::{Path, PathBuf};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::{
    config::ProvisioningConfig,
    error::{NodeError, Result},
    twin::{PipelineConfig, TrackerConfig},
};
use scratch::{remove_path, remove_paths, ScratchGuard};

/// Archive entries that are never part of a bundle.
const IGNORED_ENTRIES: [&str; 2] = ["__macosx", ".ds_store"];

fn is_ignored(name: &str) -> bool {
    IGNORED_ENTRIES.iter().any(|ignored| name.eq_ignore_ascii_case(ignored))
}

pub struct ModelProvisioner {
    config: ProvisioningConfig,
    fetcher: Box<dyn BundleFetcher>,
    extractor: Box<dyn BundleExtractor>,
}

impl ModelProvisioner {
    pub fn new(
        config: ProvisioningConfig,
        fetcher: Box<dyn BundleFetcher>,
        extractor: Box<dyn BundleExtractor>,
    ) -> Self {
        Self {
            config,
            fetcher,
            extractor,
        }
    }

    /// HTTP download plus `unzip`, as configured.
    pub fn from_config(config: ProvisioningConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.download_timeout(), config.accept_invalid_certs)?;
        let extractor = UnzipExtractor::new(config.unzip_program.clone());
        Ok(Self::new(config, Box::new(fetcher), Box::new(extractor)))
    }

    pub async fn provision(&self, pipeline: &PipelineConfig) -> Result<PipelineConfig> {
        if !pipeline.needs_download() {
            return Err(NodeError::ProvisioningError(format!(
                "pipeline {} has no bundle URL",
                pipeline.id
            )));
        }

        validate_bundle_url(&pipeline.unsecure_zip_url).map_err(|e| {
            NodeError::ProvisioningError(format!("pipeline {}: {}", pipeline.id, e))
        })?;

        let download_path = self.config.download_path.clone();
        let extract_dir = self.config.extract_dir();

        // Leftovers from an interrupted pass would corrupt this one.
        remove_paths(vec![download_path.clone(), extract_dir.clone()]).await;

        let mut scratch = ScratchGuard::new();
        scratch.track(&download_path);
        scratch.track(&extract_dir);

        let result = self.provision_into(pipeline, &download_path, &extract_dir).await;
        scratch.clear().await;
        result
    }

    async fn provision_into(
        &self,
        pipeline: &PipelineConfig,
        download_path: &Path,
        extract_dir: &Path,
    ) -> Result<PipelineConfig> {
        if let Some(parent) = download_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(extract_dir).await?;

        timeout(
            self.config.download_timeout(),
            self.fetcher.fetch(&pipeline.unsecure_zip_url, download_path),
        )
        .await
        .map_err(|_| {
            NodeError::Timeout(format!(
                "downloading bundle for pipeline {} took longer than {}s",
                pipeline.id, self.config.download_timeout_sec
            ))
        })??;

        let outcome = timeout(
            self.config.extract_timeout(),
            self.extractor.extract(download_path, extract_dir),
        )
        .await
        .map_err(|_| {
            NodeError::Timeout(format!(
                "extracting bundle for pipeline {} took longer than {}s",
                pipeline.id, self.config.extract_timeout_sec
            ))
        })??;

        if outcome == ExtractOutcome::Warnings {
            warn!("Bundle for pipeline {} extracted with warnings", pipeline.id);
        }

        let extracted = extract_dir.to_path_buf();
        let bundle = on_blocking_pool(move || bundle_root(&extracted)).await?;
        let installed = self.install(&bundle).await?;

        let input = pipeline.clone();
        let target = installed.clone();
        let resolved = on_blocking_pool(move || {
            resolve_paths(&input, &target).map_err(|e| {
                remove_path(&target);
                e
            })
        })
        .await?;

        info!(
            "Provisioned pipeline {} from {} into {}",
            pipeline.id,
            pipeline.unsecure_zip_url,
            installed.display()
        );
        Ok(resolved)
    }

    /// Moves the extracted folder to `<models_dir>/<name>`, replacing any
    /// previous install of the same name.
    async fn install(&self, bundle: &Path) -> Result<PathBuf> {
        let name = bundle
            .file_name()
            .ok_or_else(|| NodeError::ProvisioningError(format!("bundle path {} has no name", bundle.display())))?;
        let target = self.config.models_dir.join(name);

        match tokio::fs::metadata(&target).await {
            Ok(previous) => {
                debug!("Replacing previous install at {}", target.display());
                if previous.is_dir() {
                    tokio::fs::remove_dir_all(&target).await?;
                } else {
                    tokio::fs::remove_file(&target).await?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tokio::fs::rename(bundle, &target).await?;
        Ok(target)
    }
}

/// Directory walks and existence checks stay off the async workers.
async fn on_blocking_pool<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| NodeError::ProvisioningError(format!("bundle inspection failed: {}", e)))?
}

/// The single directory a bundle must unpack to.
fn bundle_root(extract_dir: &Path) -> Result<PathBuf> {
    let mut entries = Vec::new();

    for entry in std::fs::read_dir(extract_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_ignored(&name) {
            debug!("Ignoring archive entry {}", name);
            remove_path(&entry.path());
            continue;
        }
        entries.push(entry.path());
    }

    match entries.as_slice() {
        [] => Err(NodeError::ProvisioningError("bundle is empty".to_string())),
        [single] if single.is_dir() => Ok(single.clone()),
        [single] => Err(NodeError::ProvisioningError(format!(
            "bundle root {} is not a directory",
            single.display()
        ))),
        many => {
            let names: Vec<String> = many
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .collect();
            Err(NodeError::ProvisioningError(format!(
                "bundle must contain exactly one folder, found {}: {}",
                many.len(),
                names.join(", ")
            )))
        }
    }
}

fn resolve_paths(pipeline: &PipelineConfig, installed: &Path) -> Result<PipelineConfig> {
    let mut resolved = pipeline.clone();
    let mut missing: Vec<PathBuf> = Vec::new();

    let mut resolve = |path: &mut PathBuf| {
        *path = installed.join(&*path);
        if !path.exists() {
            missing.push(path.clone());
        }
    };

    for model in resolved.models_mut() {
        resolve(&mut model.config_file);
        if let Some(py_file) = model.py_file.as_mut() {
            resolve(py_file);
        }
    }

    if let Some(TrackerConfig::File(path)) = resolved.tracker.as_mut() {
        resolve(path);
    }

    if !missing.is_empty() {
        let missing: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
        let contents = list_contents(installed);
        error!(
            "Pipeline {}: bundle is missing {}; it contains: {}",
            pipeline.id,
            missing.join(", "),
            contents.join(", ")
        );
        return Err(NodeError::ProvisioningError(format!(
            "missing {} in bundle (contents: {})",
            missing.join(", "),
            contents.join(", ")
        )));
    }

    resolved.is_valid = true;
    Ok(resolved)
}

/// Every file under `root`, relative to it, sorted.
fn list_contents(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.display().to_string());
            }
        }
    }

    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twin::ModelConfig;
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    struct FakeFetcher {
        fail: bool,
        delay: Option<Duration>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BundleFetcher for FakeFetcher {
        async fn fetch(&self, _url: &str, destination: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(NodeError::ProvisioningError("404 Not Found".to_string()));
            }
            tokio::fs::write(destination, b"PK").await?;
            Ok(())
        }
    }

    /// Writes the given relative files into the destination.
    struct FakeExtractor {
        files: Vec<&'static str>,
        outcome: ExtractOutcome,
    }

    #[async_trait]
    impl BundleExtractor for FakeExtractor {
        async fn extract(&self, _archive: &Path, destination: &Path) -> Result<ExtractOutcome> {
            for file in &self.files {
                let path = destination.join(file);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, b"[property]\n")?;
            }
            Ok(self.outcome)
        }
    }

    struct Fixture {
        root: PathBuf,
        config: ProvisioningConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let root = std::env::temp_dir().join(format!("edgeguard-provision-{}", uuid::Uuid::new_v4()));
            let config = ProvisioningConfig {
                models_dir: root.join("models"),
                download_path: root.join("model.zip"),
                download_timeout_sec: 1,
                extract_timeout_sec: 1,
                ..ProvisioningConfig::default()
            };
            std::fs::create_dir_all(&config.models_dir).unwrap();
            Self { root, config }
        }

        fn provisioner(&self, files: Vec<&'static str>) -> ModelProvisioner {
            self.provisioner_with(
                FakeFetcher {
                    fail: false,
                    delay: None,
                    calls: Arc::new(AtomicUsize::new(0)),
                },
                files,
            )
        }

        fn provisioner_with(&self, fetcher: FakeFetcher, files: Vec<&'static str>) -> ModelProvisioner {
            ModelProvisioner::new(
                self.config.clone(),
                Box::new(fetcher),
                Box::new(FakeExtractor {
                    files,
                    outcome: ExtractOutcome::Warnings,
                }),
            )
        }

        fn models_entries(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(&self.config.models_dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect();
            names.sort();
            names
        }

        fn scratch_is_clean(&self) -> bool {
            !self.config.download_path.exists() && !self.config.extract_dir().exists()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn pipeline() -> PipelineConfig {
        let mut pipeline = PipelineConfig::new("P1");
        pipeline.unsecure_zip_url = "https://models.example.com/bundle.zip".to_string();
        let mut primary = ModelConfig::new("pgie.txt");
        primary.py_file = Some(PathBuf::from("parser.py"));
        pipeline.primary_model = Some(primary);
        pipeline.secondary_models.push(ModelConfig::new("sgie.txt"));
        pipeline.tracker = Some(TrackerConfig::File(PathBuf::from("tracker.yml")));
        pipeline
    }

    const GOOD_BUNDLE: [&str; 5] = [
        "yolo/pgie.txt",
        "yolo/parser.py",
        "yolo/sgie.txt",
        "yolo/tracker.yml",
        "yolo/weights/model.onnx",
    ];

    #[tokio::test]
    async fn test_successful_provisioning_resolves_absolute_paths() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(GOOD_BUNDLE.to_vec());

        let resolved = provisioner.provision(&pipeline()).await.unwrap();
        let installed = fixture.config.models_dir.join("yolo");

        let primary = resolved.primary_model.as_ref().unwrap();
        assert_eq!(primary.config_file, installed.join("pgie.txt"));
        assert_eq!(primary.py_file, Some(installed.join("parser.py")));
        assert_eq!(resolved.secondary_models[0].config_file, installed.join("sgie.txt"));
        assert_eq!(resolved.tracker, Some(TrackerConfig::File(installed.join("tracker.yml"))));
        assert!(resolved.is_valid);
        assert!(fixture.scratch_is_clean());
    }

    #[tokio::test]
    async fn test_provisioning_twice_is_idempotent() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(GOOD_BUNDLE.to_vec());

        let first = provisioner.provision(&pipeline()).await.unwrap();
        let second = provisioner.provision(&pipeline()).await.unwrap();

        assert_eq!(first.primary_model, second.primary_model);
        assert_eq!(first.secondary_models, second.secondary_models);
        assert_eq!(fixture.models_entries(), vec!["yolo".to_string()]);
        assert_eq!(list_contents(&fixture.config.models_dir.join("yolo")).len(), 5);
    }

    #[tokio::test]
    async fn test_two_folder_bundle_fails_and_cleans_up() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(vec!["a/pgie.txt", "b/pgie.txt"]);
        let input = pipeline();

        let result = provisioner.provision(&input).await;

        assert!(matches!(result, Err(NodeError::ProvisioningError(_))));
        assert_eq!(
            input.primary_model.as_ref().unwrap().config_file,
            PathBuf::from("pgie.txt")
        );
        assert!(fixture.scratch_is_clean());
        assert!(fixture.models_entries().is_empty());
    }

    #[tokio::test]
    async fn test_empty_bundle_fails() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(vec![]);
        assert!(provisioner.provision(&pipeline()).await.is_err());
        assert!(fixture.scratch_is_clean());
    }

    #[tokio::test]
    async fn test_file_at_bundle_root_fails() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(vec!["pgie.txt"]);
        assert!(provisioner.provision(&pipeline()).await.is_err());
        assert!(fixture.scratch_is_clean());
    }

    #[tokio::test]
    async fn test_macos_metadata_is_ignored() {
        let fixture = Fixture::new();
        let mut files = GOOD_BUNDLE.to_vec();
        files.push("__MACOSX/yolo/._pgie.txt");
        files.push(".DS_Store");
        let provisioner = fixture.provisioner(files);

        assert!(provisioner.provision(&pipeline()).await.is_ok());
        assert_eq!(fixture.models_entries(), vec!["yolo".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_file_removes_install() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(vec!["yolo/pgie.txt", "yolo/parser.py", "yolo/tracker.yml"]);

        match provisioner.provision(&pipeline()).await {
            Err(NodeError::ProvisioningError(message)) => {
                assert!(message.contains("sgie.txt"));
                assert!(message.contains("pgie.txt"), "bundle contents are listed");
            }
            other => panic!("expected a provisioning error, got {:?}", other.map(|p| p.id)),
        }
        assert!(fixture.models_entries().is_empty());
        assert!(fixture.scratch_is_clean());
    }

    #[tokio::test]
    async fn test_light_tracker_is_not_resolved() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(vec!["yolo/pgie.txt", "yolo/parser.py", "yolo/sgie.txt"]);
        let mut input = pipeline();
        input.tracker = Some(TrackerConfig::LightTracker(PathBuf::from("/opt/LightTrack.txt")));

        let resolved = provisioner.provision(&input).await.unwrap();
        assert_eq!(resolved.tracker, input.tracker);
    }

    #[tokio::test]
    async fn test_download_failure_leaves_nothing_behind() {
        let fixture = Fixture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let provisioner = fixture.provisioner_with(
            FakeFetcher {
                fail: true,
                delay: None,
                calls: calls.clone(),
            },
            GOOD_BUNDLE.to_vec(),
        );

        assert!(provisioner.provision(&pipeline()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fixture.scratch_is_clean());
        assert!(fixture.models_entries().is_empty());
    }

    #[tokio::test]
    async fn test_download_timeout() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner_with(
            FakeFetcher {
                fail: false,
                delay: Some(Duration::from_secs(3)),
                calls: Arc::new(AtomicUsize::new(0)),
            },
            GOOD_BUNDLE.to_vec(),
        );

        let result = provisioner.provision(&pipeline()).await;
        assert!(matches!(result, Err(NodeError::Timeout(_))));
        assert!(fixture.scratch_is_clean());
    }

    #[tokio::test]
    async fn test_pipeline_without_url_is_rejected() {
        let fixture = Fixture::new();
        let provisioner = fixture.provisioner(GOOD_BUNDLE.to_vec());
        let mut input = pipeline();
        input.unsecure_zip_url.clear();
        assert!(provisioner.provision(&input).await.is_err());

        input.unsecure_zip_url = "file:///tmp/bundle.zip".to_string();
        assert!(provisioner.provision(&input).await.is_err());
    }
}
