//! DISM subprocess driver.
//!
//! Command shapes follow the stock DISM servicing contract: `/Mount-Wim`,
//! `/Add-Driver /Recurse`, `/Add-Package`, `/Cleanup-Image`, `/Unmount-Wim`
//! and `/Export-Image`. Every invocation runs under a timeout; a timeout is
//! a stage failure, never a silent hang.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::{ImageInfo, ImagingError, ImagingTool};

pub struct DismTool {
    dism_path: String,
    timeout: Duration,
}

impl DismTool {
    pub fn new(dism_path: &str, timeout: Duration) -> Self {
        Self {
            dism_path: dism_path.to_string(),
            timeout,
        }
    }

    async fn run(&self, args: &[String]) -> Result<String, ImagingError> {
        tracing::debug!(tool = %self.dism_path, ?args, "invoking imaging tool");

        let child = Command::new(&self.dism_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result?,
            Err(_) => return Err(ImagingError::Timeout(self.timeout.as_secs())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut combined = stdout;
            if !stderr.trim().is_empty() {
                combined.push('\n');
                combined.push_str(stderr.trim());
            }
            return Err(ImagingError::Failed {
                code,
                output: combined.trim().to_string(),
            });
        }

        Ok(stdout)
    }
}

#[async_trait]
impl ImagingTool for DismTool {
    async fn image_info(&self, image: &Path) -> Result<ImageInfo, ImagingError> {
        if !image.exists() {
            return Err(ImagingError::NotFound(image.display().to_string()));
        }
        let output = self
            .run(&[
                "/Get-WimInfo".to_string(),
                format!("/WimFile:{}", image.display()),
            ])
            .await?;

        let mut info = parse_image_info(&output);
        info.size_bytes = std::fs::metadata(image).map(|m| m.len()).unwrap_or(0);
        Ok(info)
    }

    async fn mount(&self, image: &Path, mount_dir: &Path) -> Result<(), ImagingError> {
        if !image.exists() {
            return Err(ImagingError::NotFound(image.display().to_string()));
        }
        std::fs::create_dir_all(mount_dir)?;
        self.run(&[
            "/Mount-Wim".to_string(),
            format!("/WimFile:{}", image.display()),
            "/Index:1".to_string(),
            format!("/MountDir:{}", mount_dir.display()),
        ])
        .await?;

        // Trust but verify: a successful mount exposes the Windows tree.
        if !mount_dir.join("Windows").is_dir() {
            return Err(ImagingError::Failed {
                code: 0,
                output: "mount verification failed: Windows directory not found".to_string(),
            });
        }
        Ok(())
    }

    async fn add_driver(&self, mount_dir: &Path, driver_dir: &Path) -> Result<(), ImagingError> {
        self.run(&[
            format!("/Image:{}", mount_dir.display()),
            "/Add-Driver".to_string(),
            format!("/Driver:{}", driver_dir.display()),
            "/Recurse".to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn add_package(&self, mount_dir: &Path, package: &Path) -> Result<(), ImagingError> {
        self.run(&[
            format!("/Image:{}", mount_dir.display()),
            "/Add-Package".to_string(),
            format!("/PackagePath:{}", package.display()),
        ])
        .await
        .map(|_| ())
    }

    async fn cleanup_image(&self, mount_dir: &Path) -> Result<(), ImagingError> {
        self.run(&[
            format!("/Image:{}", mount_dir.display()),
            "/Cleanup-Image".to_string(),
            "/StartComponentCleanup".to_string(),
            "/ResetBase".to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn unmount(&self, mount_dir: &Path, commit: bool) -> Result<(), ImagingError> {
        self.run(&[
            "/Unmount-Wim".to_string(),
            format!("/MountDir:{}", mount_dir.display()),
            if commit { "/Commit" } else { "/Discard" }.to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn export(&self, source: &Path, dest: &Path, name: &str) -> Result<(), ImagingError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.run(&[
            "/Export-Image".to_string(),
            format!("/SourceImageFile:{}", source.display()),
            "/SourceIndex:1".to_string(),
            format!("/DestinationImageFile:{}", dest.display()),
            "/Compress:max".to_string(),
            format!("/DestinationName:{}", name),
        ])
        .await?;

        if !dest.exists() {
            return Err(ImagingError::Failed {
                code: 0,
                output: "export reported success but destination file is missing".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_image_info(output: &str) -> ImageInfo {
    let field = |name: &str| -> Option<String> {
        let re = Regex::new(&format!(r"(?m)^{name}\s*:\s*(.+)$")).ok()?;
        re.captures(output)
            .map(|c| c[1].trim().to_string())
            .filter(|v| !v.is_empty())
    };

    ImageInfo {
        index: field("Index")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
        name: field("Name"),
        architecture: field("Architecture"),
        size_bytes: 0,
    }
}
