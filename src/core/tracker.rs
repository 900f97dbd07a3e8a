//! In-memory live view of active jobs.
//!
//! This module provides a thread-safe store for the current snapshot and a
//! capped ring of recent log entries per active job. It backs the `live`
//! log source and the heartbeat's active-job count; the database remains
//! the source of truth for history and reconciliation after reconnects.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::models::{Job, LogEntry};

#[derive(Default)]
struct ActiveJob {
    snapshot: Option<Job>,
    recent_logs: VecDeque<LogEntry>,
}

/// Thread-safe in-memory store for active job state.
///
/// Shared across the application via `AppContext`. Entries exist only while
/// a job is non-terminal; terminal jobs are served from the job store.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<RwLock<HashMap<String, ActiveJob>>>,
    log_capacity: usize,
}

impl JobTracker {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            log_capacity: log_capacity.max(1),
        }
    }

    /// Replace the live snapshot for a job. Called after every stage.
    pub async fn update(&self, job: &Job) {
        let mut map = self.inner.write().await;
        map.entry(job.id.clone()).or_default().snapshot = Some(job.clone());
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        let map = self.inner.read().await;
        map.get(job_id).and_then(|j| j.snapshot.clone())
    }

    /// Append to the job's live ring buffer, evicting the oldest entry once
    /// the cap is reached.
    pub async fn push_log(&self, entry: LogEntry) {
        let mut map = self.inner.write().await;
        let active = map.entry(entry.job_id.clone()).or_default();
        if active.recent_logs.len() == self.log_capacity {
            active.recent_logs.pop_front();
        }
        active.recent_logs.push_back(entry);
    }

    pub async fn recent_logs(&self, job_id: &str, limit: usize) -> Vec<LogEntry> {
        let map = self.inner.read().await;
        match map.get(job_id) {
            Some(active) => {
                let skip = active.recent_logs.len().saturating_sub(limit);
                active.recent_logs.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Remove a job from tracking (called when it reaches a terminal state).
    pub async fn remove(&self, job_id: &str) {
        let mut map = self.inner.write().await;
        map.remove(job_id);
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}
