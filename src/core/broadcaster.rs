//! Event fan-out to live subscribers.
//!
//! At-most-once delivery per subscriber, no replay: a receiver that lags
//! falls behind and skips; a newly attached subscriber must query the job
//! store before relying on the stream (reconnect-then-resync). Heartbeats
//! run on a fixed interval independent of job activity so subscribers can
//! detect staleness.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::models::{Job, LogEntry};
use crate::core::tracker::JobTracker;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    JobUpdate { job: Job },
    #[serde(rename_all = "camelCase")]
    JobLog { job_id: String, entry: LogEntry },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        active_jobs: usize,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<Event>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    /// Send to all current subscribers. A send with no subscribers is not
    /// an error; events are fire-and-forget.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn job_update(&self, job: &Job) {
        self.publish(Event::JobUpdate { job: job.clone() });
    }

    pub fn job_log(&self, entry: &LogEntry) {
        self.publish(Event::JobLog {
            job_id: entry.job_id.clone(),
            entry: entry.clone(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Emit heartbeats until the returned handle is dropped or aborted.
    pub fn start_heartbeat(
        &self,
        interval: Duration,
        tracker: JobTracker,
    ) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = tx.send(Event::Heartbeat {
                    active_jobs: tracker.active_count().await,
                    timestamp: Utc::now(),
                });
            }
        })
    }
}
