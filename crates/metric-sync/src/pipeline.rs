//! End-to-end pipeline runs: harvest → local store → remote reconcile,
//! plus the cron scheduler that triggers them.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metric_core::MetricRecord;
use metric_harvest::{DashboardSession, Harvester, HarvestError};
use metric_storage::MetricStore;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::reconciler::{DriveReconciler, SyncError};

/// Object-safe face of the harvester, so callers do not have to be generic
/// over the dashboard-session type.
#[async_trait]
pub trait HarvestRunner: Send + Sync {
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<MetricRecord>, HarvestError>;
}

#[async_trait]
impl<S: DashboardSession> HarvestRunner for Harvester<S> {
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<MetricRecord>, HarvestError> {
        Harvester::collect(self, cancel).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Rows scraped from the dashboard table.
    pub scraped: usize,
    /// Rows newly inserted into the local store.
    pub inserted: u64,
    /// Rows appended to the remote master, `None` when the remote step was
    /// skipped or failed.
    pub appended: Option<u64>,
}

/// One full harvest run. The local store is the primary outcome: a failing
/// remote sync is logged and reported as `appended: None`, never allowed to
/// lose the harvested data.
pub async fn run_harvest(
    harvester: &dyn HarvestRunner,
    store: &MetricStore,
    reconciler: Option<&DriveReconciler>,
    cancel: &CancellationToken,
) -> anyhow::Result<HarvestSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, "harvest run started");

    let records = harvester
        .collect(cancel)
        .await
        .context("collecting dashboard metrics")?;
    let inserted = store
        .upsert(&records)
        .await
        .context("persisting harvested records")?;
    info!(%run_id, scraped = records.len(), inserted, "local store updated");

    let appended = match reconciler {
        Some(reconciler) => match reconciler.reconcile(&records, cancel).await {
            Ok(count) => Some(count),
            Err(SyncError::Cancelled) => anyhow::bail!("harvest run cancelled during remote sync"),
            Err(err) => {
                warn!(%run_id, error = %err, "remote sync failed; local store is intact");
                None
            }
        },
        None => {
            info!(%run_id, "remote sync not configured; skipping");
            None
        }
    };

    Ok(HarvestSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        scraped: records.len(),
        inserted,
        appended,
    })
}

/// Push everything the local store holds through the reconciler. Used by the
/// manual sync action; the delta discipline keeps this idempotent.
pub async fn run_drive_sync(
    store: &MetricStore,
    reconciler: &DriveReconciler,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    let records = store.export_all().await.context("reading local store")?;
    if records.is_empty() {
        anyhow::bail!("local store is empty; run the harvester first");
    }
    let appended = reconciler.reconcile(&records, cancel).await?;
    Ok(appended)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledJob {
    Harvest,
}

/// Build (but do not start) a scheduler that emits [`ScheduledJob::Harvest`]
/// on the given six-field cron expression. The receiving side owns the
/// actual pipeline run, so job execution never blocks the scheduler tick.
pub async fn build_scheduler(
    cron: &str,
    trigger: mpsc::Sender<ScheduledJob>,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .context("creating job scheduler")?;
    let job = Job::new_async(cron, move |_id, _lock| {
        let trigger = trigger.clone();
        Box::pin(async move {
            if trigger.send(ScheduledJob::Harvest).await.is_err() {
                warn!("harvest trigger dropped; no active listener");
            }
        })
    })
    .with_context(|| format!("invalid harvest cron expression `{cron}`"))?;
    scheduler.add(job).await.context("registering harvest job")?;
    Ok(scheduler)
}
