//! Analyst export: pushes a full CSV snapshot of the local store to a
//! dedicated remote file consumed by NotebookLM.
//!
//! Unlike the reconciler, this is an overwrite: the analyst file is a
//! read-only projection of the local store, not a source of truth.

use std::sync::Arc;

use anyhow::Context;
use metric_core::csv::encode_master_csv;
use metric_storage::{
    run_with_retry, MetricStore, RemoteError, RemoteFileStore, RetryError, RetryPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct AnalystSync {
    remote: Arc<dyn RemoteFileStore>,
    /// Known file id, when configured; otherwise resolved by name in the
    /// folder below.
    file_id: Option<String>,
    folder_id: Option<String>,
    file_name: String,
    policy: RetryPolicy,
}

impl AnalystSync {
    pub fn new(
        remote: Arc<dyn RemoteFileStore>,
        file_id: Option<String>,
        folder_id: Option<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            file_id,
            folder_id,
            file_name: file_name.into(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Export the full store to the analyst file. Returns false when the
    /// export is not configured (no file id and no folder to create it in).
    pub async fn run(
        &self,
        store: &MetricStore,
        cancel: &CancellationToken,
    ) -> anyhow::Result<bool> {
        if self.file_id.is_none() && self.folder_id.is_none() {
            warn!("analyst export not configured; skipping");
            return Ok(false);
        }

        let records = store.export_all().await.context("reading local store")?;
        let body = encode_master_csv(&records);

        let file_id = match &self.file_id {
            Some(id) => id.clone(),
            None => self.resolve_by_name(&body, cancel).await?,
        };
        self.remote_call("analyst upload", cancel, || {
            self.remote.update(&file_id, body.as_bytes())
        })
        .await?;
        info!(rows = records.len(), file_id = %file_id, "analyst export updated");
        Ok(true)
    }

    async fn resolve_by_name(
        &self,
        body: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let folder = self
            .folder_id
            .as_deref()
            .context("analyst folder id missing")?;
        let found = self
            .remote_call("analyst lookup", cancel, || {
                self.remote.find(&self.file_name, folder)
            })
            .await?;
        if let Some(id) = found {
            return Ok(id);
        }
        info!(name = %self.file_name, "creating analyst export file");
        let id = self
            .remote_call("analyst create", cancel, || {
                self.remote.create(&self.file_name, folder, body.as_bytes())
            })
            .await?;
        Ok(id)
    }

    async fn remote_call<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        action: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        run_with_retry(self.policy, label, cancel, action)
            .await
            .map_err(|err| match err {
                RetryError::Cancelled => anyhow::anyhow!("analyst export cancelled"),
                RetryError::Exhausted(inner) => {
                    anyhow::Error::new(inner).context(format!("{label} failed after retries"))
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metric_core::csv::decode_master_csv;
    use metric_core::MetricRecord;
    use metric_storage::MemoryRemote;
    use std::time::Duration;

    fn record(id: &str) -> MetricRecord {
        MetricRecord {
            post_id: id.to_string(),
            timestamp_utc: "2026-02-02T00:00:00+00:00".to_string(),
            platform: "Instagram".to_string(),
            media_type: "Image".to_string(),
            engagement_score: 0.1,
            reach: 10.0,
            likes: 1.0,
            comments: 0.0,
            shares: 0.0,
            caption_text: "hi".to_string(),
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

    #[tokio::test]
    async fn unconfigured_export_is_skipped() {
        let store = MetricStore::open_in_memory().await.unwrap();
        let sync = AnalystSync::new(Arc::new(MemoryRemote::new()), None, None, "x.csv");
        let ran = sync.run(&store, &CancellationToken::new()).await.unwrap();
        assert!(!ran);
    }

    #[tokio::test]
    async fn export_creates_then_overwrites_by_name() {
        let store = MetricStore::open_in_memory().await.unwrap();
        store.upsert(&[record("metri_a")]).await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let sync = AnalystSync::new(
            remote.clone(),
            None,
            Some("folder-1".to_string()),
            "NotebookLM_Source.csv",
        )
        .with_policy(quick_policy());
        let cancel = CancellationToken::new();

        assert!(sync.run(&store, &cancel).await.unwrap());
        let id = remote
            .find("NotebookLM_Source.csv", "folder-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            decode_master_csv(&String::from_utf8(remote.content(&id).await.unwrap()).unwrap())
                .len(),
            1
        );

        // Second run reuses the same file instead of creating another.
        store.upsert(&[record("metri_b")]).await.unwrap();
        assert!(sync.run(&store, &cancel).await.unwrap());
        assert_eq!(
            remote.find("NotebookLM_Source.csv", "folder-1").await.unwrap(),
            Some(id.clone())
        );
        assert_eq!(
            decode_master_csv(&String::from_utf8(remote.content(&id).await.unwrap()).unwrap())
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn configured_file_id_is_used_directly() {
        let store = MetricStore::open_in_memory().await.unwrap();
        store.upsert(&[record("metri_a")]).await.unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let id = remote.create("existing.csv", "folder-1", b"").await.unwrap();
        let sync = AnalystSync::new(remote.clone(), Some(id.clone()), None, "ignored.csv")
            .with_policy(quick_policy());

        assert!(sync.run(&store, &CancellationToken::new()).await.unwrap());
        let body = String::from_utf8(remote.content(&id).await.unwrap()).unwrap();
        assert!(body.contains("metri_a"));
    }
}
