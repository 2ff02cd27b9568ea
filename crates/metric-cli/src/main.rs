use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metric_harvest::{Harvester, HttpDashboardSession};
use metric_storage::{DriveClient, MetricStore, RemoteFileStore};
use metric_sync::{
    build_scheduler, run_drive_sync, run_harvest, AnalystSync, AppConfig, DriveReconciler,
    HarvestRunner, ScheduledJob, MASTER_FILE_NAME,
};
use metric_web::{AppState, CreativeEngine};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "open-metric")]
#[command(about = "Social metrics pipeline command center")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web control surface (and the scheduler when enabled).
    Serve,
    /// One harvest run: dashboard -> local store -> remote master.
    Harvest,
    /// Push everything the local store holds to the remote master.
    SyncDrive,
    /// Create the remote master file if the folder does not hold one.
    InitRemote,
    /// Overwrite the analyst export with a full store snapshot.
    SyncAnalyst,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolving working directory")?;
    let config = AppConfig::load(&root);
    let _log_guard = init_logging(&config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Harvest => harvest_once(config).await,
        Commands::SyncDrive => sync_drive(config).await,
        Commands::InitRemote => init_remote(config).await,
        Commands::SyncAnalyst => sync_analyst(config).await,
    }
}

/// Stdout plus a plain-text file layer; the file feeds the `/logs` endpoint.
fn init_logging(config: &AppConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(&config.data_dir, "system.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .context("initializing logging")?;
    Ok(guard)
}

fn build_remote(config: &AppConfig) -> Result<Option<Arc<dyn RemoteFileStore>>> {
    match (&config.drive_folder_id, &config.drive_access_token) {
        (Some(_), Some(token)) => Ok(Some(Arc::new(DriveClient::new(token.clone())?))),
        _ => Ok(None),
    }
}

fn build_reconciler(
    config: &AppConfig,
    remote: Option<&Arc<dyn RemoteFileStore>>,
) -> Option<DriveReconciler> {
    let remote = remote?.clone();
    let folder = config.drive_folder_id.clone()?;
    Some(DriveReconciler::new(
        remote,
        folder,
        config.data_dir.join(MASTER_FILE_NAME),
    ))
}

fn require_reconciler(config: &AppConfig) -> Result<(Arc<dyn RemoteFileStore>, DriveReconciler)> {
    let folder = AppConfig::require(&config.drive_folder_id, "GOOGLE_DRIVE_FOLDER_ID")?;
    let token = AppConfig::require(&config.drive_access_token, "GOOGLE_DRIVE_ACCESS_TOKEN")?;
    let remote: Arc<dyn RemoteFileStore> = Arc::new(DriveClient::new(token)?);
    let reconciler = DriveReconciler::new(
        remote.clone(),
        folder,
        config.data_dir.join(MASTER_FILE_NAME),
    );
    Ok((remote, reconciler))
}

fn build_harvester(config: &AppConfig) -> Result<Option<Arc<dyn HarvestRunner>>> {
    let Some(url) = &config.analytics_url else {
        return Ok(None);
    };
    let session = HttpDashboardSession::new(url.clone(), config.dashboard_cookie.clone())?;
    Ok(Some(Arc::new(Harvester::new(session))))
}

async fn serve(config: AppConfig) -> Result<()> {
    let store = MetricStore::open(&config.db_path).await?;
    let remote = build_remote(&config)?;
    let reconciler = build_reconciler(&config, remote.as_ref()).map(Arc::new);
    let analyst = remote.clone().map(|remote| {
        Arc::new(AnalystSync::new(
            remote,
            config.analyst_file_id.clone(),
            config.drive_folder_id.clone(),
            config.analyst_file_name.clone(),
        ))
    });
    let harvester = build_harvester(&config)?;
    let creative = Arc::new(CreativeEngine::new(
        config.ollama_url.clone(),
        config.ollama_model.clone(),
    )?);
    let cancel = CancellationToken::new();

    let mut state = AppState::new(store.clone(), config.clone()).with_creative(creative);
    state.cancel = cancel.clone();
    if let Some(harvester) = harvester.clone() {
        state = state.with_harvester(harvester);
    } else {
        warn!("harvester not configured; /action/harvest will be unavailable");
    }
    if let Some(reconciler) = reconciler.clone() {
        state = state.with_reconciler(reconciler);
    } else {
        warn!("remote sync not configured; /action/sync-drive will be unavailable");
    }
    if let Some(analyst) = analyst {
        state = state.with_analyst(analyst);
    }

    let mut scheduler = None;
    if config.scheduler_enabled {
        if let Some(harvester) = harvester {
            let (tx, mut rx) = tokio::sync::mpsc::channel(4);
            let sched = build_scheduler(&config.harvest_cron, tx).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.harvest_cron, "harvest scheduler running");

            let store = store.clone();
            let reconciler = reconciler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                while let Some(ScheduledJob::Harvest) = rx.recv().await {
                    match run_harvest(harvester.as_ref(), &store, reconciler.as_deref(), &cancel)
                        .await
                    {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            inserted = summary.inserted,
                            appended = ?summary.appended,
                            "scheduled harvest finished"
                        ),
                        Err(err) => error!(error = %err, "scheduled harvest failed"),
                    }
                }
            });
            scheduler = Some(sched);
        } else {
            warn!("scheduler enabled but harvester is not configured; skipping");
        }
    }

    let result = metric_web::serve(state).await;
    cancel.cancel();
    if let Some(mut scheduler) = scheduler {
        if let Err(err) = scheduler.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    result
}

async fn harvest_once(config: AppConfig) -> Result<()> {
    let store = MetricStore::open(&config.db_path).await?;
    let harvester = build_harvester(&config)?
        .context("harvester not configured; set METRICOOL_ANALYTICS_URL")?;
    let remote = build_remote(&config)?;
    let reconciler = build_reconciler(&config, remote.as_ref());
    if reconciler.is_none() {
        warn!("remote sync not configured; harvesting into the local store only");
    }

    let summary = run_harvest(
        harvester.as_ref(),
        &store,
        reconciler.as_ref(),
        &CancellationToken::new(),
    )
    .await?;
    println!(
        "harvest complete: scraped={} inserted={} appended={}",
        summary.scraped,
        summary.inserted,
        summary
            .appended
            .map(|count| count.to_string())
            .unwrap_or_else(|| "skipped".to_string()),
    );
    Ok(())
}

async fn sync_drive(config: AppConfig) -> Result<()> {
    let store = MetricStore::open(&config.db_path).await?;
    let (_remote, reconciler) = require_reconciler(&config)?;
    let appended = run_drive_sync(&store, &reconciler, &CancellationToken::new()).await?;
    println!("drive sync complete: appended={appended}");
    Ok(())
}

async fn init_remote(config: AppConfig) -> Result<()> {
    let (_remote, reconciler) = require_reconciler(&config)?;
    let file_id = reconciler.ensure_master(&CancellationToken::new()).await?;
    println!("master file ready: {file_id}");
    Ok(())
}

async fn sync_analyst(config: AppConfig) -> Result<()> {
    let store = MetricStore::open(&config.db_path).await?;
    let (remote, _reconciler) = require_reconciler(&config)?;
    let analyst = AnalystSync::new(
        remote,
        config.analyst_file_id.clone(),
        config.drive_folder_id.clone(),
        config.analyst_file_name.clone(),
    );
    let ran = analyst.run(&store, &CancellationToken::new()).await?;
    if ran {
        println!("analyst export updated: {}", config.analyst_file_name);
    } else {
        println!("analyst export skipped: not configured");
    }
    Ok(())
}
