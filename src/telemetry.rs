//! Telemetry utilities for per-run tracing metadata and global subscriber management.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;

/// Correlation data for the job run executing on the current task.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub job_id: Uuid,
    pub run_id: Uuid,
}

task_local! {
    static ACTIVE_RUN_CONTEXT: RunContext;
}

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring `log::` macros into the tracing pipeline.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // Install log bridge first so sqlx/sea-orm `log::` output routes through tracing.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. legacy `log::` macros will not emit structured tracing events.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: Failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    Ok(())
}

/// Execute `future` with `context` available through task-local storage.
pub async fn with_run_context<Fut, R>(context: RunContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_RUN_CONTEXT.scope(context, future).await
}

/// Run id of the job run executing on the current task, if any.
pub fn current_run_id() -> Option<Uuid> {
    ACTIVE_RUN_CONTEXT.try_with(|ctx| ctx.run_id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_context_is_scoped_to_future() {
        assert!(current_run_id().is_none());
        let run_id = Uuid::new_v4();
        let seen = with_run_context(
            RunContext {
                job_id: Uuid::new_v4(),
                run_id,
            },
            async { current_run_id() },
        )
        .await;
        assert_eq!(seen, Some(run_id));
        assert!(current_run_id().is_none());
    }
}
