//! Pipeline orchestration: configuration, remote reconciliation, scheduled
//! harvest runs, the pending-post queue and the analyst export.

pub mod analyst;
pub mod config;
pub mod pipeline;
pub mod queue;
pub mod reconciler;

pub use analyst::AnalystSync;
pub use config::{AppConfig, ConfigError, MASTER_FILE_NAME};
pub use pipeline::{
    build_scheduler, run_drive_sync, run_harvest, HarvestRunner, HarvestSummary, ScheduledJob,
};
pub use queue::{fill_slots, PendingPost, PostPublisher, PostQueue, PublishError, QueueError};
pub use reconciler::{DriveReconciler, SyncError};
