use std::sync::Arc;

use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::broadcaster::EventBroadcaster;
use crate::core::tracker::JobTracker;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub broadcaster: EventBroadcaster,
    pub tracker: JobTracker,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Self {
        let tracker = JobTracker::new(config.live_log_capacity);
        Self {
            config: Arc::new(config),
            db,
            broadcaster: EventBroadcaster::new(256),
            tracker,
        }
    }
}
