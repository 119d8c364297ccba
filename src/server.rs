//! # Server Configuration
//!
//! Wires the job store, collaborators, executor and scheduler together and
//! serves the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::connectors::{NoopNotifier, Notifier, SheetWriter, SourceReader, WebhookNotifier};
use crate::handlers::{self, jobs};
use crate::repositories::{JobStore, SeaOrmJobStore};
use crate::scheduler::JobScheduler;
use crate::sync_executor::{ExecutorConfig, SyncExecutor};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<JobScheduler>,
    pub store: Arc<dyn JobStore>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/scheduler/status", get(jobs::scheduler_status))
        .route("/scheduler/reload", post(jobs::reload_scheduler))
        .route("/jobs/{id}/trigger", post(jobs::trigger_job))
        .route("/jobs/{id}/logs", get(jobs::list_job_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Notifier for the configured webhook, or a no-op when none is set.
pub fn build_notifier(config: &AppConfig) -> Result<Arc<dyn Notifier>, Box<dyn std::error::Error>> {
    match &config.notify_webhook_url {
        Some(url) => {
            let timeout = Duration::from_secs(config.executor.notify_timeout_seconds);
            Ok(Arc::new(WebhookNotifier::new(url, timeout)?))
        }
        None => Ok(Arc::new(NoopNotifier)),
    }
}

/// Build the scheduler and its executor on top of `db`.
pub fn build_state(
    config: &AppConfig,
    db: DatabaseConnection,
    source: Arc<dyn SourceReader>,
    sheet: Arc<dyn SheetWriter>,
    notifier: Arc<dyn Notifier>,
) -> AppState {
    let store: Arc<dyn JobStore> = Arc::new(SeaOrmJobStore::new(Arc::new(db)));
    let executor = Arc::new(SyncExecutor::new(
        source,
        sheet,
        Arc::clone(&store),
        notifier,
        ExecutorConfig::from_app_config(config),
    ));
    let scheduler = Arc::new(JobScheduler::new(
        Arc::clone(&store),
        executor,
        &config.scheduler,
    ));
    AppState { scheduler, store }
}

/// Starts the scheduler and the server, and runs until Ctrl-C.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
    source: Arc<dyn SourceReader>,
    sheet: Arc<dyn SheetWriter>,
) -> Result<(), Box<dyn std::error::Error>> {
    let notifier = build_notifier(&config)?;
    let state = build_state(&config, db, source, sheet, notifier);
    let scheduler = Arc::clone(&state.scheduler);

    let armed = scheduler.initialize().await?;
    let shutdown = CancellationToken::new();
    scheduler.start(shutdown.clone());

    let app = create_app(state);

    // Resolve the configured bind address
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, armed, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Failed to listen for shutdown signal");
            }
            shutdown.cancel();
        })
        .await?;

    scheduler.shutdown().await;
    info!("Waiting for in-flight sync runs to finish");
    scheduler.wait_idle().await;
    info!("Server stopped");

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::jobs::scheduler_status,
        crate::handlers::jobs::reload_scheduler,
        crate::handlers::jobs::trigger_job,
        crate::handlers::jobs::list_job_logs,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::ExecutionLog,
            crate::models::ValidationError,
            crate::models::RunStatus,
            crate::models::JobStatus,
            crate::models::Severity,
            crate::scheduler::TriggerResult,
            crate::scheduler::JobRuntimeStatus,
            crate::handlers::jobs::SchedulerStatusResponse,
            crate::handlers::jobs::ExecutionLogsResponse,
            crate::handlers::jobs::ReloadResponse,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "scheduler", description = "Scheduler state and control"),
        (name = "jobs", description = "Manual runs and execution history"),
    ),
    info(
        title = "sheetsync API",
        description = "Sync job scheduling and execution for WeCom smart sheets",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
