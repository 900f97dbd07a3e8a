pub mod assets;
pub mod broadcaster;
pub mod devices;
pub mod guard;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod tracker;

pub use broadcaster::{Event, EventBroadcaster};
pub use guard::MountGuard;
pub use models::{BuildRequest, Job, JobStatus};
pub use scheduler::{Scheduler, SubmitError};
pub use tracker::JobTracker;
