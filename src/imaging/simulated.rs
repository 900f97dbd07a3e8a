//! Simulated imaging tool for tests and `--simulation` runs.
//!
//! Fabricates the filesystem effects the pipeline checks for (the mounted
//! `Windows` tree, the exported file) and exposes a journal handle so tests
//! can assert on invocation order, inject failures per operation, and read
//! the mount-section concurrency high-water mark.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ImageInfo, ImagingError, ImagingTool};

#[derive(Default)]
struct Shared {
    operations: Mutex<Vec<String>>,
    failures: Mutex<HashSet<&'static str>>,
    latency_ms: AtomicU64,
    mounted_now: AtomicUsize,
    mounted_peak: AtomicUsize,
}

/// Test-side handle onto the simulated tool's state.
#[derive(Clone)]
pub struct ToolJournal {
    shared: Arc<Shared>,
}

impl ToolJournal {
    /// Every invocation in order, as "op arg" strings.
    pub fn operations(&self) -> Vec<String> {
        self.shared.operations.lock().unwrap().clone()
    }

    pub fn invoked(&self, op: &str) -> bool {
        self.shared
            .operations
            .lock()
            .unwrap()
            .iter()
            .any(|o| o.starts_with(op))
    }

    pub fn invocation_count(&self) -> usize {
        self.shared.operations.lock().unwrap().len()
    }

    /// Highest number of images mounted at the same time.
    pub fn peak_concurrent_mounts(&self) -> usize {
        self.shared.mounted_peak.load(Ordering::SeqCst)
    }

    /// Make every future call of `op` fail until cleared.
    pub fn fail_on(&self, op: &'static str) {
        self.shared.failures.lock().unwrap().insert(op);
    }

    pub fn clear_failures(&self) {
        self.shared.failures.lock().unwrap().clear();
    }

    /// Artificial per-operation latency, for exercising stage boundaries.
    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }
}

pub struct SimulatedTool {
    shared: Arc<Shared>,
}

impl SimulatedTool {
    pub fn new() -> (Self, ToolJournal) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: shared.clone(),
            },
            ToolJournal { shared },
        )
    }

    async fn observe(&self, op: &'static str, arg: &Path) -> Result<(), ImagingError> {
        let latency = self.shared.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.shared
            .operations
            .lock()
            .unwrap()
            .push(format!("{op} {}", arg.display()));

        if self.shared.failures.lock().unwrap().contains(op) {
            return Err(ImagingError::Failed {
                code: 87,
                output: format!("simulated {op} failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImagingTool for SimulatedTool {
    async fn image_info(&self, image: &Path) -> Result<ImageInfo, ImagingError> {
        if !image.exists() {
            return Err(ImagingError::NotFound(image.display().to_string()));
        }
        self.observe("image_info", image).await?;
        Ok(ImageInfo {
            index: 1,
            name: Some("Simulated Image".to_string()),
            architecture: Some("x64".to_string()),
            size_bytes: std::fs::metadata(image).map(|m| m.len()).unwrap_or(0),
        })
    }

    async fn mount(&self, image: &Path, mount_dir: &Path) -> Result<(), ImagingError> {
        if !image.exists() {
            return Err(ImagingError::NotFound(image.display().to_string()));
        }
        self.observe("mount", mount_dir).await?;

        let now = self.shared.mounted_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.mounted_peak.fetch_max(now, Ordering::SeqCst);

        std::fs::create_dir_all(mount_dir.join("Windows"))?;
        Ok(())
    }

    async fn add_driver(&self, _mount_dir: &Path, driver_dir: &Path) -> Result<(), ImagingError> {
        self.observe("add_driver", driver_dir).await
    }

    async fn add_package(&self, _mount_dir: &Path, package: &Path) -> Result<(), ImagingError> {
        self.observe("add_package", package).await
    }

    async fn cleanup_image(&self, mount_dir: &Path) -> Result<(), ImagingError> {
        self.observe("cleanup_image", mount_dir).await
    }

    async fn unmount(&self, mount_dir: &Path, commit: bool) -> Result<(), ImagingError> {
        let op = if commit { "unmount_commit" } else { "unmount_discard" };
        let result = self.observe(op, mount_dir).await;

        // The mount is gone even when the unmount "fails"; occupancy must
        // not leak or the peak counter would lie to the exclusivity tests.
        self.shared.mounted_now.fetch_sub(1, Ordering::SeqCst);
        let _ = std::fs::remove_dir_all(mount_dir.join("Windows"));
        result
    }

    async fn export(&self, source: &Path, dest: &Path, _name: &str) -> Result<(), ImagingError> {
        self.observe("export", dest).await?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest)?;
        Ok(())
    }
}
