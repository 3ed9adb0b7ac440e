use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Paths removed when the guard goes out of scope, whatever the exit path.
/// Normal exits call [`ScratchGuard::clear`]; the synchronous `Drop` only
/// runs the removal when a pass is abandoned mid-way.
#[derive(Debug, Default)]
pub struct ScratchGuard {
    paths: Vec<PathBuf>,
}

impl ScratchGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// Removes every tracked path on the blocking pool.
    pub async fn clear(&mut self) {
        remove_paths(std::mem::take(&mut self.paths)).await;
    }
}

pub fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        return;
    };

    match result {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) => error!("Could not remove {}: {}", path.display(), e),
    }
}

pub async fn remove_paths(paths: Vec<PathBuf>) {
    if paths.is_empty() {
        return;
    }

    let removal = tokio::task::spawn_blocking(move || {
        for path in &paths {
            remove_path(path);
        }
    });
    if let Err(e) = removal.await {
        error!("Scratch cleanup failed: {}", e);
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            remove_path(path);
        }
    }
}
