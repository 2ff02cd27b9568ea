//! Durable local store, retry primitives and the remote file-storage client
//! for Open-Metric.

pub mod remote;
pub mod retry;
mod store;

pub const CRATE_NAME: &str = "metric-storage";

pub use remote::{normalize_drive_folder_id, DriveClient, MemoryRemote, RemoteError, RemoteFileStore};
pub use retry::{run_with_retry, RetryError, RetryPolicy};
pub use store::{MetricStore, StoreError};
