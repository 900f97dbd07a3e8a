//! Build pipeline executor.
//!
//! Runs the fixed nine-stage image-preparation sequence for one job on a
//! dedicated worker. Stages execute strictly in order; after every stage
//! the job row is persisted and a jobUpdate event is published, so
//! observers always see a consistent step/progress pair. Cancellation is
//! cooperative and observed only at stage boundaries, which bounds
//! cancellation latency to one stage's duration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::core::assets::{AssetCatalog, ResolvedAssets};
use crate::core::devices::{DeviceProfile, DeviceRegistry};
use crate::core::guard::{MountGuard, MountSlot};
use crate::core::models::{
    BuildResults, Job, JobStatus, LogCategory, LogEntry, LogLevel,
};
use crate::db;
use crate::imaging::{ImagingError, ImagingTool};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("device '{device}' does not support OS {os_id}")]
    InvalidRequest { device: String, os_id: u32 },
    #[error("no base image found for OS {os_id}")]
    AssetMissing { os_id: u32 },
    #[error("asset validation failed: {0}")]
    InvalidAssets(String),
    #[error("stage '{stage}' failed: {source}")]
    StageFailure {
        stage: &'static str,
        source: ImagingError,
    },
    #[error("stage '{stage}' timed out after {secs}s")]
    StageTimeout { stage: &'static str, secs: u64 },
    #[error("cancellation requested")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

impl From<anyhow::Error> for BuildError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

const STAGE_LABELS: [&str; 9] = [
    "Validating configuration",
    "Resolving assets",
    "Mounting base image",
    "Integrating drivers",
    "Integrating updates",
    "Staging post-deployment payloads",
    "Finalizing image",
    "Committing changes",
    "Exporting image",
];

/// Mutable working state threaded through the stages of one build.
#[derive(Default)]
struct BuildState {
    assets: ResolvedAssets,
    slot: Option<MountSlot>,
    temp_image: Option<PathBuf>,
    mount_dir: Option<PathBuf>,
    mounted: bool,
    drivers_integrated: u32,
    updates_integrated: u32,
    payloads_staged: u32,
}

impl BuildState {
    fn mount_dir(&self) -> Result<&std::path::Path, BuildError> {
        self.mount_dir
            .as_deref()
            .ok_or_else(|| BuildError::Internal("image is not mounted".into()))
    }
}

pub struct PipelineExecutor {
    ctx: AppContext,
    tool: Arc<dyn ImagingTool>,
    guard: MountGuard,
    catalog: Arc<AssetCatalog>,
    registry: Arc<DeviceRegistry>,
}

impl PipelineExecutor {
    pub fn new(
        ctx: AppContext,
        tool: Arc<dyn ImagingTool>,
        guard: MountGuard,
        catalog: Arc<AssetCatalog>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            ctx,
            tool,
            guard,
            catalog,
            registry,
        }
    }

    /// Execute the pipeline for one job, ending in a terminal status. Never
    /// returns an error: every failure mode is absorbed into the job record.
    pub async fn run(&self, mut job: Job, cancel: CancellationToken) -> JobStatus {
        let started = Instant::now();

        // A job cancelled while still queued never starts running and never
        // touches the imaging tool.
        if cancel.is_cancelled() {
            self.finish(&mut job, BuildState::default(), Err(BuildError::Cancelled), started)
                .await;
            return job.status;
        }

        if let Err(e) = job.transition(JobStatus::Running) {
            tracing::error!(job_id = %job.id, error = %e, "refusing to start job");
            return job.status;
        }
        self.persist(&job).await;
        self.log(
            &job,
            LogLevel::Info,
            LogCategory::Workflow,
            "Build job started",
        )
        .await;

        let mut state = BuildState::default();
        let outcome = self.execute(&mut job, &mut state, &cancel).await;
        self.finish(&mut job, state, outcome, started).await;
        job.status
    }

    async fn execute(
        &self,
        job: &mut Job,
        state: &mut BuildState,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, String, u64), BuildError> {
        let timeout = Duration::from_secs(self.ctx.config.stage_timeout_secs);

        // Stage 1: request validation against the device registry.
        self.checkpoint(cancel)?;
        self.advance(job, 1).await;
        let profile = self
            .registry
            .get(&job.device)
            .filter(|p| p.supports(job.os_id))
            .ok_or_else(|| BuildError::InvalidRequest {
                device: job.device.clone(),
                os_id: job.os_id,
            })?
            .clone();
        self.log(
            job,
            LogLevel::Info,
            LogCategory::Workflow,
            format!("Validated device '{}' for OS {}", job.device, job.os_id),
        )
        .await;

        // Stage 2: asset resolution and validation. Resolution walks the
        // asset tree, so it runs under the stage timeout like the tool
        // stages.
        self.checkpoint(cancel)?;
        self.advance(job, 2).await;
        self.staged(timeout, STAGE_LABELS[1], self.resolve_stage(job, state, &profile))
            .await?;

        // Stage 3: guard acquisition, working copy, mount.
        self.checkpoint(cancel)?;
        self.advance(job, 3).await;
        self.log(
            job,
            LogLevel::Info,
            LogCategory::System,
            "Waiting for mount slot",
        )
        .await;
        state.slot = Some(
            self.guard
                .acquire(cancel)
                .await
                .ok_or(BuildError::Cancelled)?,
        );
        self.staged(timeout, STAGE_LABELS[2], self.mount_stage(job, state))
            .await?;

        // Stage 4: serviceable driver integration.
        self.checkpoint(cancel)?;
        self.advance(job, 4).await;
        self.staged(timeout, STAGE_LABELS[3], self.driver_stage(job, state))
            .await?;

        // Stage 5: serviceable update integration.
        self.checkpoint(cancel)?;
        self.advance(job, 5).await;
        self.staged(timeout, STAGE_LABELS[4], self.update_stage(job, state))
            .await?;

        // Stage 6: post-deployment payload staging.
        self.checkpoint(cancel)?;
        self.advance(job, 6).await;
        self.staged(timeout, STAGE_LABELS[5], self.payload_stage(job, state))
            .await?;

        // Stage 7: in-mount finalization.
        self.checkpoint(cancel)?;
        self.advance(job, 7).await;
        self.staged(timeout, STAGE_LABELS[6], self.finalize_stage(job, state))
            .await?;

        // Stage 8: unmount with commit. The mount slot is released once the
        // image is no longer mounted.
        self.checkpoint(cancel)?;
        self.advance(job, 8).await;
        self.staged(timeout, STAGE_LABELS[7], self.commit_stage(job, state))
            .await?;
        state.slot = None;

        // Stage 9: export.
        self.checkpoint(cancel)?;
        self.advance(job, 9).await;
        self.staged(timeout, STAGE_LABELS[8], self.export_stage(job, state))
            .await
    }

    async fn resolve_stage(
        &self,
        job: &Job,
        state: &mut BuildState,
        profile: &DeviceProfile,
    ) -> Result<(), BuildError> {
        // Resolution scans asset directories recursively; keep that off the
        // async workers.
        let catalog = self.catalog.clone();
        let profile = profile.clone();
        let os_id = job.os_id;
        state.assets = tokio::task::spawn_blocking(move || catalog.resolve(&profile, os_id))
            .await
            .map_err(|e| BuildError::Internal(format!("asset resolution task failed: {e}")))?;

        let assets = &mut state.assets;
        self.log(
            job,
            LogLevel::Info,
            LogCategory::Workflow,
            format!(
                "Assets resolved: baseImage={}, drivers={}, updates={}, scripts={}",
                assets.base_image.is_some(),
                assets.drivers.len(),
                assets.updates.len(),
                assets.scripts.len()
            ),
        )
        .await;

        let base = assets
            .base_image
            .as_ref()
            .ok_or(BuildError::AssetMissing { os_id: job.os_id })?;
        if !base.valid {
            return Err(BuildError::InvalidAssets(format!(
                "base image '{}' failed validation",
                base.name
            )));
        }

        let invalid: Vec<String> = assets
            .drivers
            .iter()
            .filter(|d| !d.asset.valid)
            .map(|d| d.asset.name.clone())
            .chain(
                assets
                    .updates
                    .iter()
                    .filter(|u| !u.asset.valid)
                    .map(|u| u.asset.name.clone()),
            )
            .chain(
                assets
                    .scripts
                    .iter()
                    .filter(|s| !s.valid)
                    .map(|s| s.name.clone()),
            )
            .collect();

        if !invalid.is_empty() {
            if job.options.skip_validation {
                for name in &invalid {
                    self.log(
                        job,
                        LogLevel::Warning,
                        LogCategory::Workflow,
                        format!("Asset '{name}' failed validation, excluded from build"),
                    )
                    .await;
                }
                assets.drivers.retain(|d| d.asset.valid);
                assets.updates.retain(|u| u.asset.valid);
                assets.scripts.retain(|s| s.valid);
            } else {
                return Err(BuildError::InvalidAssets(invalid.join(", ")));
            }
        }
        Ok(())
    }

    async fn mount_stage(&self, job: &Job, state: &mut BuildState) -> Result<(), BuildError> {
        let base = state
            .assets
            .base_image
            .as_ref()
            .ok_or_else(|| BuildError::Internal("base image not resolved".into()))?;
        let config = &self.ctx.config;

        let file_name = base
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("base.wim");
        let temp_image = config.temp_dir.join(format!("{}_{}", job.id, file_name));
        tokio::fs::copy(&base.path, &temp_image)
            .await
            .map_err(|e| BuildError::StageFailure {
                stage: STAGE_LABELS[2],
                source: ImagingError::Io(e),
            })?;
        state.temp_image = Some(temp_image.clone());
        self.log(
            job,
            LogLevel::Info,
            LogCategory::Image,
            format!("Working copy created at {}", temp_image.display()),
        )
        .await;

        match self.tool.image_info(&temp_image).await {
            Ok(info) => {
                let entry = LogEntry::new(
                    &job.id,
                    LogLevel::Debug,
                    LogCategory::Image,
                    "pipeline",
                    "Image inspected",
                )
                .with_details(serde_json::json!({
                    "index": info.index,
                    "name": info.name,
                    "architecture": info.architecture,
                    "sizeBytes": info.size_bytes,
                }));
                self.record(job, entry).await;
            }
            Err(e) => {
                self.log(
                    job,
                    LogLevel::Warning,
                    LogCategory::Image,
                    format!("Image inspection failed, continuing: {e}"),
                )
                .await;
            }
        }

        let mount_dir = config.mount_dir.join(&job.id);
        self.tool
            .mount(&temp_image, &mount_dir)
            .await
            .map_err(|e| BuildError::StageFailure {
                stage: STAGE_LABELS[2],
                source: e,
            })?;
        state.mount_dir = Some(mount_dir.clone());
        state.mounted = true;
        self.log(
            job,
            LogLevel::Info,
            LogCategory::Image,
            format!("Image mounted at {}", mount_dir.display()),
        )
        .await;
        Ok(())
    }

    async fn driver_stage(&self, job: &Job, state: &mut BuildState) -> Result<(), BuildError> {
        if job.options.skip_drivers {
            self.log(
                job,
                LogLevel::Info,
                LogCategory::Driver,
                "Driver integration skipped by request",
            )
            .await;
            return Ok(());
        }

        let mount_dir = state.mount_dir()?.to_path_buf();
        let serviceable: Vec<_> = state
            .assets
            .drivers
            .iter()
            .filter(|d| d.driver_type.serviceable())
            .collect();
        if serviceable.is_empty() {
            self.log(
                job,
                LogLevel::Info,
                LogCategory::Driver,
                "No serviceable drivers to integrate",
            )
            .await;
            return Ok(());
        }

        for driver in serviceable {
            self.tool
                .add_driver(&mount_dir, &driver.asset.path)
                .await
                .map_err(|e| BuildError::StageFailure {
                    stage: STAGE_LABELS[3],
                    source: e,
                })?;
            state.drivers_integrated += 1;
            self.log(
                job,
                LogLevel::Info,
                LogCategory::Driver,
                format!("Integrated driver '{}'", driver.asset.name),
            )
            .await;
        }
        Ok(())
    }

    async fn update_stage(&self, job: &Job, state: &mut BuildState) -> Result<(), BuildError> {
        if job.options.skip_updates {
            self.log(
                job,
                LogLevel::Info,
                LogCategory::Update,
                "Update integration skipped by request",
            )
            .await;
            return Ok(());
        }

        let mount_dir = state.mount_dir()?.to_path_buf();
        // Resolution order is prerequisite-first; apply in that order.
        let serviceable: Vec<_> = state
            .assets
            .updates
            .iter()
            .filter(|u| u.update_type.serviceable())
            .collect();
        if serviceable.is_empty() {
            self.log(
                job,
                LogLevel::Info,
                LogCategory::Update,
                "No serviceable updates to integrate",
            )
            .await;
            return Ok(());
        }

        for update in serviceable {
            self.tool
                .add_package(&mount_dir, &update.asset.path)
                .await
                .map_err(|e| BuildError::StageFailure {
                    stage: STAGE_LABELS[4],
                    source: e,
                })?;
            state.updates_integrated += 1;
            self.log(
                job,
                LogLevel::Info,
                LogCategory::Update,
                format!("Integrated update '{}'", update.asset.name),
            )
            .await;
        }
        Ok(())
    }

    /// Non-serviceable drivers and updates, plus post-deployment scripts,
    /// are copied into the image's payload area for installation on first
    /// boot.
    async fn payload_stage(&self, job: &Job, state: &mut BuildState) -> Result<(), BuildError> {
        let target = state.mount_dir()?.join(&self.ctx.config.payload_dir);

        // Plan every transfer up front, then run the copies in one blocking
        // task; whole driver trees can be large.
        let mut transfers: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut staged_logs: Vec<(LogCategory, String)> = Vec::new();

        for driver in state
            .assets
            .drivers
            .iter()
            .filter(|d| !d.driver_type.serviceable() && !job.options.skip_drivers)
        {
            let dest = target.join("Drivers").join(
                driver
                    .asset
                    .path
                    .file_name()
                    .unwrap_or(driver.asset.name.as_ref()),
            );
            transfers.push((driver.asset.path.clone(), dest));
            staged_logs.push((
                LogCategory::Driver,
                format!("Staged driver package '{}' for post-deployment", driver.asset.name),
            ));
        }

        for update in state
            .assets
            .updates
            .iter()
            .filter(|u| !u.update_type.serviceable() && !job.options.skip_updates)
        {
            let file_name = update
                .asset
                .path
                .file_name()
                .unwrap_or(update.asset.name.as_ref());
            transfers.push((update.asset.path.clone(), target.join("Updates").join(file_name)));
            staged_logs.push((
                LogCategory::Update,
                format!("Staged update '{}' for post-deployment", update.asset.name),
            ));
        }

        for script in &state.assets.scripts {
            transfers.push((script.path.clone(), target.join("Scripts").join(&script.name)));
        }
        let script_count = state.assets.scripts.len();

        if transfers.is_empty() {
            return Ok(());
        }

        let staged = tokio::task::spawn_blocking(move || -> std::io::Result<u32> {
            let mut staged = 0;
            for (source, dest) in &transfers {
                if source.is_dir() {
                    copy_tree(source, dest)?;
                } else {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(source, dest)?;
                }
                staged += 1;
            }
            Ok(staged)
        })
        .await
        .map_err(|e| BuildError::Internal(format!("payload staging task failed: {e}")))?
        .map_err(|e| BuildError::StageFailure {
            stage: STAGE_LABELS[5],
            source: ImagingError::Io(e),
        })?;
        state.payloads_staged += staged;

        for (category, message) in staged_logs {
            self.log(job, LogLevel::Info, category, message).await;
        }
        if script_count > 0 {
            self.log(
                job,
                LogLevel::Info,
                LogCategory::Workflow,
                format!("Staged {script_count} post-deployment scripts"),
            )
            .await;
        }
        Ok(())
    }

    async fn finalize_stage(&self, job: &Job, state: &mut BuildState) -> Result<(), BuildError> {
        let mount_dir = state.mount_dir()?;
        self.tool
            .cleanup_image(mount_dir)
            .await
            .map_err(|e| BuildError::StageFailure {
                stage: STAGE_LABELS[6],
                source: e,
            })?;
        self.log(
            job,
            LogLevel::Info,
            LogCategory::Image,
            "Image finalization completed",
        )
        .await;
        Ok(())
    }

    async fn commit_stage(&self, job: &Job, state: &mut BuildState) -> Result<(), BuildError> {
        let mount_dir = state.mount_dir()?.to_path_buf();
        self.tool
            .unmount(&mount_dir, true)
            .await
            .map_err(|e| BuildError::StageFailure {
                stage: STAGE_LABELS[7],
                source: e,
            })?;
        state.mounted = false;
        self.log(
            job,
            LogLevel::Info,
            LogCategory::Image,
            "Changes committed, image unmounted",
        )
        .await;
        Ok(())
    }

    async fn export_stage(
        &self,
        job: &Job,
        state: &mut BuildState,
    ) -> Result<(PathBuf, String, u64), BuildError> {
        let temp_image = state
            .temp_image
            .as_ref()
            .ok_or_else(|| BuildError::Internal("working copy missing".into()))?;
        let export_name = format!(
            "{}_{}_{}.wim",
            job.os_id,
            job.device,
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        let export_path = self.ctx.config.export_dir.join(&export_name);
        let display_name = format!("{} OS{}", job.device, job.os_id);

        self.tool
            .export(temp_image, &export_path, &display_name)
            .await
            .map_err(|e| BuildError::StageFailure {
                stage: STAGE_LABELS[8],
                source: e,
            })?;

        let size = std::fs::metadata(&export_path).map(|m| m.len()).unwrap_or(0);
        self.log(
            job,
            LogLevel::Info,
            LogCategory::Image,
            format!("Image exported to {} ({} bytes)", export_path.display(), size),
        )
        .await;
        Ok((export_path, export_name, size))
    }

    /// Cleanup and terminal transition. The guard must be released on every
    /// exit path; a fault during cleanup is logged at CRITICAL but does not
    /// change the already-decided terminal status.
    async fn finish(
        &self,
        job: &mut Job,
        mut state: BuildState,
        outcome: Result<(PathBuf, String, u64), BuildError>,
        started: Instant,
    ) {
        if state.mounted
            && let Some(mount_dir) = &state.mount_dir
        {
            if let Err(e) = self.tool.unmount(mount_dir, false).await {
                self.log(
                    job,
                    LogLevel::Critical,
                    LogCategory::Image,
                    format!("Cleanup failed: discard-unmount of {}: {e}", mount_dir.display()),
                )
                .await;
            }
            state.mounted = false;
        }
        if let Some(temp_image) = &state.temp_image
            && let Err(e) = std::fs::remove_file(temp_image)
            && temp_image.exists()
        {
            self.log(
                job,
                LogLevel::Critical,
                LogCategory::System,
                format!("Cleanup failed: removing {}: {e}", temp_image.display()),
            )
            .await;
        }
        drop(state.slot.take());

        let terminal = match &outcome {
            Ok(_) => JobStatus::Completed,
            Err(BuildError::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };
        match &outcome {
            Ok((path, name, size)) => {
                job.results = Some(BuildResults {
                    export_path: path.display().to_string(),
                    export_name: name.clone(),
                    export_size_bytes: *size,
                    drivers_integrated: state.drivers_integrated,
                    updates_integrated: state.updates_integrated,
                    payloads_staged: state.payloads_staged,
                    duration_secs: started.elapsed().as_secs(),
                });
            }
            Err(BuildError::Cancelled) => {}
            Err(e) => job.error = Some(e.to_string()),
        }

        if let Err(e) = job.transition(terminal) {
            tracing::error!(job_id = %job.id, error = %e, "terminal transition rejected");
            return;
        }
        self.persist(job).await;

        let (level, message) = match terminal {
            JobStatus::Completed => (
                LogLevel::Info,
                format!("Build completed in {}s", started.elapsed().as_secs()),
            ),
            JobStatus::Cancelled => (LogLevel::Warning, "Build cancelled".to_string()),
            _ => (
                LogLevel::Error,
                format!(
                    "Build failed: {}",
                    job.error.as_deref().unwrap_or("unknown error")
                ),
            ),
        };
        self.log(job, level, LogCategory::Workflow, message).await;
        self.ctx.tracker.remove(&job.id).await;
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), BuildError> {
        if cancel.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn staged<T>(
        &self,
        timeout: Duration,
        stage: &'static str,
        fut: impl Future<Output = Result<T, BuildError>>,
    ) -> Result<T, BuildError> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BuildError::StageTimeout {
                stage,
                secs: timeout.as_secs(),
            }),
        }
    }

    async fn advance(&self, job: &mut Job, step: u32) {
        job.advance(step, STAGE_LABELS[(step - 1) as usize]);
        self.persist(job).await;
        self.log(
            job,
            LogLevel::Debug,
            LogCategory::Workflow,
            format!(
                "Stage {}/{}: {}",
                job.step_number, job.total_steps, job.current_step
            ),
        )
        .await;
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = db::jobs::update(&self.ctx.db, job.clone()).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to persist job");
        }
        self.ctx.tracker.update(job).await;
        self.ctx.broadcaster.job_update(job);
    }

    async fn log(
        &self,
        job: &Job,
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
    ) {
        let entry = LogEntry::new(&job.id, level, category, "pipeline", message);
        self.record(job, entry).await;
    }

    async fn record(&self, job: &Job, entry: LogEntry) {
        if let Err(e) = db::logs::append(&self.ctx.db, entry.clone()).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to append job log");
        }
        self.ctx.tracker.push_log(entry.clone()).await;
        self.ctx.broadcaster.job_log(&entry);
    }
}

fn copy_tree(source: &std::path::Path, dest: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
