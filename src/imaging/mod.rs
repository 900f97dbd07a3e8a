//! Imaging tool boundary.
//!
//! The pipeline never talks to DISM directly; it goes through the
//! `ImagingTool` trait so the whole engine can run against a simulated
//! implementation in tests and in `--simulation` mode.

mod dism;
mod simulated;

use std::path::Path;

use async_trait::async_trait;

pub use dism::DismTool;
pub use simulated::{SimulatedTool, ToolJournal};

#[derive(Debug, thiserror::Error)]
pub enum ImagingError {
    #[error("image file not found: {0}")]
    NotFound(String),
    #[error("imaging tool exited with code {code}: {output}")]
    Failed { code: i32, output: String },
    #[error("imaging tool timed out after {0}s")]
    Timeout(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed metadata for an image file.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub index: u32,
    pub name: Option<String>,
    pub architecture: Option<String>,
    pub size_bytes: u64,
}

/// External imaging tool contract. One invocation per operation; exit code
/// and captured output are the only success/failure signal the pipeline
/// trusts.
#[async_trait]
pub trait ImagingTool: Send + Sync {
    async fn image_info(&self, image: &Path) -> Result<ImageInfo, ImagingError>;

    async fn mount(&self, image: &Path, mount_dir: &Path) -> Result<(), ImagingError>;

    /// Apply a serviceable (INF) driver package into the mounted image.
    async fn add_driver(&self, mount_dir: &Path, driver_dir: &Path) -> Result<(), ImagingError>;

    /// Apply a serviceable (MSU/CAB) update package into the mounted image.
    async fn add_package(&self, mount_dir: &Path, package: &Path) -> Result<(), ImagingError>;

    /// Run component cleanup inside the mount before committing.
    async fn cleanup_image(&self, mount_dir: &Path) -> Result<(), ImagingError>;

    /// Unmount, committing changes or discarding them.
    async fn unmount(&self, mount_dir: &Path, commit: bool) -> Result<(), ImagingError>;

    /// Export the finished image to its destination with a display name.
    async fn export(&self, source: &Path, dest: &Path, name: &str) -> Result<(), ImagingError>;
}
