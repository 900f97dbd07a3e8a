//! Job admission and dispatch.
//!
//! The scheduler is the single entry point for build submissions. Admission
//! is atomic: a queue slot is reserved before the job row is created, so a
//! rejected submission leaves no trace in the store. Accepted jobs are handed
//! to a dispatcher task that spawns one pipeline worker per job; the mount
//! guard, not the dispatcher, bounds how many of those workers can hold an
//! image mounted at once.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::core::devices::DeviceRegistry;
use crate::core::models::{Job, LogCategory, LogEntry, LogLevel};
use crate::core::pipeline::PipelineExecutor;
use crate::db;

pub use crate::core::models::BuildRequest;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("device '{device}' does not support OS {os_id}")]
    UnsupportedOs { device: String, os_id: u32 },
    #[error("build queue is full")]
    QueueFull,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: AppContext,
    executor: Arc<PipelineExecutor>,
    registry: Arc<DeviceRegistry>,
    queue: mpsc::Sender<Job>,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Scheduler {
    /// Build the scheduler and start its dispatcher task. The returned handle
    /// resolves when the queue is closed and all in-flight workers finished.
    pub fn start(
        ctx: AppContext,
        executor: PipelineExecutor,
        registry: Arc<DeviceRegistry>,
        queue_capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let scheduler = Self {
            ctx,
            executor: Arc::new(executor),
            registry,
            queue: tx,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
        };
        let dispatcher = tokio::spawn(scheduler.clone().dispatch(rx));
        (scheduler, dispatcher)
    }

    /// Mark jobs left non-terminal by a previous daemon run as failed. Call
    /// once at startup, before accepting submissions.
    pub async fn recover_interrupted(&self) -> anyhow::Result<()> {
        let recovered = db::jobs::mark_interrupted(&self.ctx.db).await?;
        if recovered > 0 {
            tracing::warn!(count = recovered, "marked interrupted jobs as failed");
        }
        Ok(())
    }

    /// Validate and enqueue a build request, returning the new job id.
    pub async fn submit(&self, request: BuildRequest) -> Result<String, SubmitError> {
        let profile = self
            .registry
            .get(&request.device)
            .ok_or_else(|| SubmitError::UnknownDevice(request.device.clone()))?;
        if !profile.supports(request.os_id) {
            return Err(SubmitError::UnsupportedOs {
                device: request.device.clone(),
                os_id: request.os_id,
            });
        }

        // Reserve the queue slot first so a full queue rejects the request
        // before any state is created.
        let permit = self
            .queue
            .try_reserve()
            .map_err(|_| SubmitError::QueueFull)?;

        let job = Job::new(&request);
        db::jobs::create(&self.ctx.db, job.clone())
            .await
            .map_err(SubmitError::Store)?;
        self.ctx.tracker.update(&job).await;
        self.ctx.broadcaster.job_update(&job);

        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(job.id.clone(), token);

        let entry = LogEntry::new(
            &job.id,
            LogLevel::Info,
            LogCategory::Job,
            "scheduler",
            format!("Job queued for device '{}', OS {}", job.device, job.os_id),
        );
        if let Err(e) = db::logs::append(&self.ctx.db, entry.clone()).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to append job log");
        }
        self.ctx.tracker.push_log(entry.clone()).await;
        self.ctx.broadcaster.job_log(&entry);

        tracing::info!(job_id = %job.id, device = %job.device, os_id = job.os_id, "job accepted");
        let id = job.id.clone();
        permit.send(job);
        Ok(id)
    }

    /// Request cancellation of a queued or running job. Returns false when
    /// the job is unknown or already terminal. Idempotent while the job is
    /// still live.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let cancellations = self.cancellations.lock().await;
        match cancellations.get(job_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(job_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    async fn dispatch(self, mut rx: mpsc::Receiver<Job>) {
        let mut workers = Vec::new();
        while let Some(job) = rx.recv().await {
            let token = {
                let cancellations = self.cancellations.lock().await;
                cancellations
                    .get(&job.id)
                    .cloned()
                    .unwrap_or_default()
            };
            let executor = self.executor.clone();
            let cancellations = self.cancellations.clone();
            let job_id = job.id.clone();
            workers.push(tokio::spawn(async move {
                let status = executor.run(job, token).await;
                cancellations.lock().await.remove(&job_id);
                tracing::info!(job_id = %job_id, status = status.as_str(), "job finished");
            }));
            workers.retain(|w| !w.is_finished());
        }
        for worker in workers {
            let _ = worker.await;
        }
    }
}
