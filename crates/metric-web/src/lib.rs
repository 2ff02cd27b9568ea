//! Axum control surface for the metrics pipeline.
//!
//! Every route speaks JSON. Long-running actions (harvest, drive sync,
//! queue fill) are spawned in the background and serialized through a
//! single lock so only one writer ever touches the store and the master
//! copy at a time.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metric_storage::{MetricStore, RetryPolicy};
use metric_sync::{
    fill_slots, run_drive_sync, run_harvest, AnalystSync, AppConfig, DriveReconciler,
    HarvestRunner, PendingPost, PostPublisher, PostQueue,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod creative;

pub use creative::CreativeEngine;

#[derive(Clone)]
pub struct AppState {
    pub store: MetricStore,
    pub config: AppConfig,
    pub harvester: Option<Arc<dyn HarvestRunner>>,
    pub reconciler: Option<Arc<DriveReconciler>>,
    pub analyst: Option<Arc<AnalystSync>>,
    pub publisher: Option<Arc<dyn PostPublisher>>,
    pub creative: Option<Arc<CreativeEngine>>,
    /// Serializes store-writing actions; the reconciler assumes a single
    /// writer against the master copy.
    sync_lock: Arc<Mutex<()>>,
    queue_lock: Arc<Mutex<()>>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(store: MetricStore, config: AppConfig) -> Self {
        Self {
            store,
            config,
            harvester: None,
            reconciler: None,
            analyst: None,
            publisher: None,
            creative: None,
            sync_lock: Arc::new(Mutex::new(())),
            queue_lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_harvester(mut self, harvester: Arc<dyn HarvestRunner>) -> Self {
        self.harvester = Some(harvester);
        self
    }

    pub fn with_reconciler(mut self, reconciler: Arc<DriveReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn with_analyst(mut self, analyst: Arc<AnalystSync>) -> Self {
        self.analyst = Some(analyst);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn PostPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_creative(mut self, creative: Arc<CreativeEngine>) -> Self {
        self.creative = Some(creative);
        self
    }
}

#[derive(Debug, Deserialize)]
struct QueueAddRequest {
    text: String,
    #[serde(default)]
    platforms: Option<Vec<String>>,
    #[serde(default)]
    image_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    topic: String,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/", get(index_handler))
        .route("/stats", get(stats_handler))
        .route("/queue", get(queue_handler))
        .route("/queue/add", post(queue_add_handler))
        .route("/action/harvest", post(action_harvest_handler))
        .route("/action/sync", post(action_analyst_handler))
        .route("/action/sync-drive", post(action_sync_drive_handler))
        .route("/action/fill_queue", post(action_fill_queue_handler))
        .route("/logs", get(logs_handler))
        .route("/generate", post(generate_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let host = state.config.host.clone();
    let port = state.config.port;
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!(%host, port, "control surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// All routes except the landing page require `x-api-key` once a key is
/// configured. Without a configured key the surface is open (local use).
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.api_key else {
        return next.run(request).await;
    };
    if request.uri().path() == "/" {
        return next.run(request).await;
    }
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid or missing x-api-key"})),
        )
            .into_response()
    }
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": "open-metric",
        "status": "ok",
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest().await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => Json(json!({"error": "No data yet. Run harvester."})).into_response(),
        Err(err) => server_error(err),
    }
}

async fn queue_handler(State(state): State<Arc<AppState>>) -> Response {
    let _guard = state.queue_lock.lock().await;
    match PostQueue::load(&state.config.queue_path) {
        Ok(queue) => Json(json!({
            "count": queue.len(),
            "posts": queue.posts(),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn queue_add_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueueAddRequest>,
) -> Response {
    if request.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "post text must not be empty"})),
        )
            .into_response();
    }
    let _guard = state.queue_lock.lock().await;
    let mut queue = match PostQueue::load(&state.config.queue_path) {
        Ok(queue) => queue,
        Err(err) => return server_error(err),
    };
    let mut post = PendingPost::new(request.text);
    if let Some(platforms) = request.platforms {
        post.platforms = platforms;
    }
    post.image_path = request.image_path;
    let id = queue.push(post);
    if let Err(err) = queue.save() {
        return server_error(err);
    }
    Json(json!({"status": "added", "id": id, "pending": queue.len()})).into_response()
}

async fn action_harvest_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(harvester) = state.harvester.clone() else {
        return service_unavailable("harvester not configured; set METRICOOL_ANALYTICS_URL");
    };
    let store = state.store.clone();
    let reconciler = state.reconciler.clone();
    let lock = state.sync_lock.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        let _guard = lock.lock().await;
        match run_harvest(harvester.as_ref(), &store, reconciler.as_deref(), &cancel).await {
            Ok(summary) => info!(
                run_id = %summary.run_id,
                scraped = summary.scraped,
                inserted = summary.inserted,
                appended = ?summary.appended,
                "background harvest finished"
            ),
            Err(err) => error!(error = %err, "background harvest failed"),
        }
    });
    Json(json!({"status": "started", "action": "harvest"})).into_response()
}

async fn action_sync_drive_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(reconciler) = state.reconciler.clone() else {
        return service_unavailable("remote sync not configured; set GOOGLE_DRIVE_FOLDER_ID");
    };
    let store = state.store.clone();
    let lock = state.sync_lock.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        let _guard = lock.lock().await;
        match run_drive_sync(&store, &reconciler, &cancel).await {
            Ok(appended) => info!(appended, "background drive sync finished"),
            Err(err) => error!(error = %err, "background drive sync failed"),
        }
    });
    Json(json!({"status": "started", "action": "sync-drive"})).into_response()
}

async fn action_analyst_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(analyst) = state.analyst.clone() else {
        return service_unavailable("analyst export not configured");
    };
    let store = state.store.clone();
    let lock = state.sync_lock.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        let _guard = lock.lock().await;
        match analyst.run(&store, &cancel).await {
            Ok(true) => info!("background analyst export finished"),
            Ok(false) => warn!("analyst export skipped; not configured"),
            Err(err) => error!(error = %err, "background analyst export failed"),
        }
    });
    Json(json!({"status": "started", "action": "sync"})).into_response()
}

async fn action_fill_queue_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(publisher) = state.publisher.clone() else {
        return service_unavailable("publisher not configured");
    };
    let queue_path = state.config.queue_path.clone();
    let max_queue = state.config.queue_max;
    let lock = state.queue_lock.clone();
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
        let _guard = lock.lock().await;
        let mut queue = match PostQueue::load(&queue_path) {
            Ok(queue) => queue,
            Err(err) => {
                error!(error = %err, "could not load pending-post queue");
                return;
            }
        };
        match fill_slots(
            &mut queue,
            publisher.as_ref(),
            max_queue,
            RetryPolicy::default(),
            &cancel,
        )
        .await
        {
            Ok(Some(id)) => info!(post_id = %id, "post handed to publisher"),
            Ok(None) => info!("no queue slot filled"),
            Err(err) => error!(error = %err, "queue fill failed"),
        }
    });
    Json(json!({"status": "started", "action": "fill_queue"})).into_response()
}

async fn logs_handler(State(state): State<Arc<AppState>>) -> Response {
    match tokio::fs::read_to_string(&state.config.log_path).await {
        Ok(text) => {
            let lines: Vec<&str> = text.lines().collect();
            let tail: Vec<&str> = lines.iter().rev().take(50).rev().copied().collect();
            Json(json!({"lines": tail})).into_response()
        }
        Err(_) => Json(json!({"lines": Vec::<String>::new()})).into_response(),
    }
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    let Some(creative) = state.creative.clone() else {
        return service_unavailable("creative engine not configured; set OLLAMA_URL");
    };
    let post = creative.generate(&request.topic).await;
    Json(json!({"post": post})).into_response()
}

fn service_unavailable(message: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": message})),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}
