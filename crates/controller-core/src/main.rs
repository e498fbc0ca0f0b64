use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, routing::post, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use controller_common::types::DependencyGraph;
use controller_core::checkpoint::CheckpointStore;
use controller_core::executor::CheckpointingExecutor;
use controller_core::health::HealthMonitor;
use controller_core::metrics::EventPlane;
use controller_core::pool::{Executor, WorkerPoolManager};
use controller_core::priority::PriorityAnalyzer;
use controller_core::queue::BoundedWorkQueue;
use controller_core::stuck::StuckWorkerHandler;

/// Shared application state accessible from axum handlers.
struct AppState {
    pool: Arc<WorkerPoolManager>,
    stuck: Arc<StuckWorkerHandler>,
    events: EventPlane,
    metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("sdlc-controller starting");

    let config_dir = std::env::var("CONTROLLER_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let config = match controller_core::config::load_config(&config_dir) {
        Ok(config) => {
            tracing::info!("configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration, refusing to start");
            std::process::exit(1);
        }
    };

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus metrics recorder");

    let events = EventPlane::new(config.metrics.prefix.clone(), config.metrics.event_buffer_capacity);

    let queue = Arc::new(BoundedWorkQueue::new(config.queue.clone(), events.clone()));
    let health = Arc::new(HealthMonitor::new(config.health.clone(), events.clone()));
    let stuck = Arc::new(StuckWorkerHandler::new(config.stuck.clone(), events.clone()));
    let checkpoints = Arc::new(CheckpointStore::new(config.checkpoint.clone()));
    let executor: Arc<dyn Executor> = Arc::new(CheckpointingExecutor::new(Arc::clone(&checkpoints)));
    let analyzer = Arc::new(Mutex::new(PriorityAnalyzer::new(config.priority.clone())));

    let pool = WorkerPoolManager::start(
        config.pool.clone(),
        Arc::clone(&queue),
        events.clone(),
        Arc::clone(&health),
        Arc::clone(&stuck),
        Arc::clone(&checkpoints),
        executor,
        analyzer,
    );

    tracing::info!("all components wired and running");

    let state = Arc::new(AppState {
        pool,
        stuck,
        events,
        metrics_handle,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/submit", post(submit_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    let port: u16 = std::env::var("CONTROLLER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(port, "sdlc-controller listening");

    axum::serve(listener, app).await.expect("HTTP server error");
}

/// Reports whether the pipeline has been paused by a critical
/// stuck-worker escalation. The process itself has no external
/// dependencies to probe, unlike a database-backed service.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let paused = state.stuck.is_paused();
    let status = if paused { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    let body = serde_json::json!({
        "status": if paused { "paused" } else { "healthy" },
    });
    (status, Json(body))
}

/// Prometheus text-format metrics.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

/// POST /submit — analyze a dependency graph and enqueue every currently
/// executable item into the worker pool. Items blocked behind a dependency
/// are submitted later, as the pool observes their predecessors complete.
async fn submit_handler(State(state): State<Arc<AppState>>, Json(graph): Json<DependencyGraph>) -> impl IntoResponse {
    let submitted = match state.pool.submit_graph(&graph).await {
        Ok(submitted) => submitted,
        Err(e) => {
            let body = serde_json::json!({ "error": e });
            return (StatusCode::BAD_REQUEST, Json(body));
        }
    };

    let cycles = state.pool.get_analyzer().lock().unwrap().get_blocked_by_cycle().len();

    let body = serde_json::json!({
        "submitted": submitted,
        "cycles_detected": cycles,
    });
    (StatusCode::ACCEPTED, Json(body))
}

/// GET /status — worker slots, queue occupancy, and running event counters.
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let workers = state.pool.get_status();
    let queue = state.pool.get_queue().get_status();
    let body = serde_json::json!({
        "workers": workers,
        "queue": queue,
        "events": state.events.snapshot_json(),
        "paused": state.stuck.is_paused(),
    });
    Json(body)
}
