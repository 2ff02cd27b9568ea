//! Delta-append reconciliation against the remote master copy.
//!
//! The master CSV on the remote store is the long-term source of truth; the
//! reconciler only ever appends records whose `post_id` the master does not
//! already hold. Rows already present remotely are never rewritten.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use metric_core::csv::{decode_master_csv, encode_master_csv, master_header};
use metric_core::MetricRecord;
use metric_storage::{run_with_retry, RemoteError, RemoteFileStore, RetryError, RetryPolicy};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MASTER_FILE_NAME;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote store unavailable after retries: {0}")]
    RemoteUnavailable(RemoteError),
    #[error("master file `{0}` not found on the remote; run `init-remote` first")]
    MasterMissing(String),
    #[error("sync cancelled")]
    Cancelled,
    #[error("local master cache: {0}")]
    Io(#[from] std::io::Error),
}

pub struct DriveReconciler {
    remote: Arc<dyn RemoteFileStore>,
    folder_id: String,
    /// Local mirror of the master copy, refreshed on every successful sync.
    local_cache: PathBuf,
    policy: RetryPolicy,
}

impl DriveReconciler {
    pub fn new(
        remote: Arc<dyn RemoteFileStore>,
        folder_id: impl Into<String>,
        local_cache: PathBuf,
    ) -> Self {
        Self {
            remote,
            folder_id: folder_id.into(),
            local_cache,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Look up the master copy, creating a header-only file when the folder
    /// does not have one yet. Returns the remote file id.
    pub async fn ensure_master(&self, cancel: &CancellationToken) -> Result<String, SyncError> {
        let found = self
            .remote_call("master lookup", cancel, || {
                self.remote.find(MASTER_FILE_NAME, &self.folder_id)
            })
            .await?;
        if let Some(id) = found {
            info!(file_id = %id, "master copy already present");
            return Ok(id);
        }
        info!("master copy not found; creating schema-only file");
        let header = master_header();
        let id = self
            .remote_call("master create", cancel, || {
                self.remote
                    .create(MASTER_FILE_NAME, &self.folder_id, header.as_bytes())
            })
            .await?;
        Ok(id)
    }

    /// Append to the master copy every incoming record whose id it does not
    /// already contain. Returns the number of appended rows; when the delta
    /// is empty no upload happens at all.
    pub async fn reconcile(
        &self,
        incoming: &[MetricRecord],
        cancel: &CancellationToken,
    ) -> Result<u64, SyncError> {
        // Batch-level dedup mirrors the local store: first occurrence wins,
        // records without an identity are dropped.
        let mut seen = HashSet::new();
        let incoming: Vec<&MetricRecord> = incoming
            .iter()
            .filter(|record| {
                !record.post_id.is_empty() && seen.insert(record.post_id.clone())
            })
            .collect();
        if incoming.is_empty() {
            info!("no records provided; nothing to reconcile");
            return Ok(0);
        }

        let file_id = self
            .remote_call("master lookup", cancel, || {
                self.remote.find(MASTER_FILE_NAME, &self.folder_id)
            })
            .await?
            .ok_or_else(|| SyncError::MasterMissing(MASTER_FILE_NAME.to_string()))?;

        let bytes = self
            .remote_call("master download", cancel, || self.remote.download(&file_id))
            .await?;
        let existing = decode_master_csv(&String::from_utf8_lossy(&bytes));
        let existing_ids: HashSet<&str> =
            existing.iter().map(|record| record.post_id.as_str()).collect();

        let delta: Vec<MetricRecord> = incoming
            .into_iter()
            .filter(|record| !existing_ids.contains(record.post_id.as_str()))
            .cloned()
            .collect();
        if delta.is_empty() {
            info!("master copy already holds every incoming record");
            return Ok(0);
        }

        let mut merged = existing;
        merged.extend(delta.iter().cloned());
        let encoded = encode_master_csv(&merged);

        if let Err(err) = self.write_local_cache(&encoded).await {
            // The remote upload is the sync outcome; a stale mirror only
            // degrades offline reads.
            warn!(error = %err, path = %self.local_cache.display(), "could not refresh local master mirror");
        }

        self.remote_call("master upload", cancel, || {
            self.remote.update(&file_id, encoded.as_bytes())
        })
        .await?;

        info!(
            appended = delta.len(),
            total = merged.len(),
            "master copy updated"
        );
        Ok(delta.len() as u64)
    }

    async fn write_local_cache(&self, content: &str) -> Result<(), std::io::Error> {
        if let Some(parent) = self.local_cache.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.local_cache, content).await
    }

    async fn remote_call<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        action: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        run_with_retry(self.policy, label, cancel, action)
            .await
            .map_err(|err| match err {
                RetryError::Cancelled => SyncError::Cancelled,
                RetryError::Exhausted(inner) => SyncError::RemoteUnavailable(inner),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metric_storage::MemoryRemote;
    use std::time::Duration;

    fn record(id: &str, platform: &str) -> MetricRecord {
        MetricRecord {
            post_id: id.to_string(),
            timestamp_utc: "2026-02-02T00:00:00+00:00".to_string(),
            platform: platform.to_string(),
            media_type: "Image".to_string(),
            engagement_score: 0.5,
            reach: 100.0,
            likes: 10.0,
            comments: 2.0,
            shares: 1.0,
            caption_text: format!("caption for {id}"),
            conversion_status: Default::default(),
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2,
        }
    }

    fn reconciler(remote: Arc<MemoryRemote>, cache: PathBuf) -> DriveReconciler {
        DriveReconciler::new(remote, "folder-1", cache).with_policy(quick_policy())
    }

    #[tokio::test]
    async fn ensure_master_creates_a_header_only_file_once() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let sync = reconciler(remote.clone(), dir.path().join("master.csv"));
        let cancel = CancellationToken::new();

        let id = sync.ensure_master(&cancel).await.unwrap();
        let again = sync.ensure_master(&cancel).await.unwrap();
        assert_eq!(id, again);
        let body = String::from_utf8(remote.content(&id).await.unwrap()).unwrap();
        assert!(body.starts_with("post_id,timestamp_utc"));
    }

    #[tokio::test]
    async fn reconcile_appends_only_unseen_records() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let sync = reconciler(remote.clone(), dir.path().join("master.csv"));
        let cancel = CancellationToken::new();
        let id = sync.ensure_master(&cancel).await.unwrap();

        let appended = sync
            .reconcile(&[record("metri_a", "Instagram")], &cancel)
            .await
            .unwrap();
        assert_eq!(appended, 1);

        // Second batch overlaps the first; only the new id lands.
        let appended = sync
            .reconcile(
                &[record("metri_a", "Instagram"), record("metri_b", "LinkedIn")],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(appended, 1);

        let body = String::from_utf8(remote.content(&id).await.unwrap()).unwrap();
        let rows = decode_master_csv(&body);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].post_id, "metri_a");
        assert_eq!(rows[1].post_id, "metri_b");
    }

    #[tokio::test]
    async fn empty_delta_never_uploads() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let sync = reconciler(remote.clone(), dir.path().join("master.csv"));
        let cancel = CancellationToken::new();
        sync.ensure_master(&cancel).await.unwrap();
        sync.reconcile(&[record("metri_a", "Instagram")], &cancel)
            .await
            .unwrap();

        let writes_before = remote.write_count().await;
        let appended = sync
            .reconcile(&[record("metri_a", "Instagram")], &cancel)
            .await
            .unwrap();
        assert_eq!(appended, 0);
        assert_eq!(remote.write_count().await, writes_before);
    }

    #[tokio::test]
    async fn empty_batch_short_circuits_before_touching_the_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let sync = reconciler(remote, dir.path().join("master.csv"));
        // Without a master file this would otherwise be MasterMissing.
        let appended = sync
            .reconcile(&[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(appended, 0);
    }

    #[tokio::test]
    async fn missing_master_is_reported_not_created() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let sync = reconciler(remote, dir.path().join("master.csv"));
        let err = sync
            .reconcile(&[record("metri_a", "Instagram")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MasterMissing(_)));
    }

    #[tokio::test]
    async fn corrupt_remote_rows_are_tolerated() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let sync = reconciler(remote.clone(), dir.path().join("master.csv"));
        let cancel = CancellationToken::new();
        let id = sync.ensure_master(&cancel).await.unwrap();
        remote
            .update(&id, b"totally,not\nthe,schema\n")
            .await
            .unwrap();

        let appended = sync
            .reconcile(&[record("metri_a", "Instagram")], &cancel)
            .await
            .unwrap();
        assert_eq!(appended, 1);
        let body = String::from_utf8(remote.content(&id).await.unwrap()).unwrap();
        assert!(body.contains("metri_a"));
    }

    #[tokio::test]
    async fn local_mirror_tracks_the_master() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("mirror").join("master.csv");
        let sync = reconciler(remote, cache.clone());
        let cancel = CancellationToken::new();
        sync.ensure_master(&cancel).await.unwrap();
        sync.reconcile(&[record("metri_a", "Instagram")], &cancel)
            .await
            .unwrap();

        let mirrored = std::fs::read_to_string(&cache).unwrap();
        assert!(mirrored.contains("metri_a"));
    }

    #[tokio::test]
    async fn duplicate_ids_within_a_batch_collapse_to_the_first() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let sync = reconciler(remote.clone(), dir.path().join("master.csv"));
        let cancel = CancellationToken::new();
        let id = sync.ensure_master(&cancel).await.unwrap();

        let mut second = record("metri_a", "LinkedIn");
        second.reach = 999.0;
        let appended = sync
            .reconcile(&[record("metri_a", "Instagram"), second], &cancel)
            .await
            .unwrap();
        assert_eq!(appended, 1);

        let body = String::from_utf8(remote.content(&id).await.unwrap()).unwrap();
        let rows = decode_master_csv(&body);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].platform, "Instagram");
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_sync_error() {
        let remote = Arc::new(MemoryRemote::new());
        let dir = tempfile::tempdir().unwrap();
        let sync = reconciler(remote, dir.path().join("master.csv"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sync
            .reconcile(&[record("metri_a", "Instagram")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
