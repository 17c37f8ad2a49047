//! Logging and observability setup.
//!
//! Structured logging via `tracing`. Dispatcher and handler log lines carry
//! correlation fields (job_id, run_id, correlation_id, worker_id,
//! execution_mode) through spans created with [`run_span`], so a single job
//! can be traced across queue, handler, and artifact writes.

use tracing::{span, Level};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize the tracing subscriber.
///
/// `json` selects machine-readable JSON lines; otherwise a compact
/// human-readable format is used. `RUST_LOG` overrides the default filter.
pub fn init_tracing(verbose: bool, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("quarry=debug,info")
            } else {
                EnvFilter::try_new("quarry=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .try_init()?;
    }

    Ok(())
}

/// Span carrying the correlation fields for one run of one job.
pub fn run_span(
    job_id: &str,
    run_id: &str,
    correlation_id: &str,
    worker_id: &str,
    execution_mode: &str,
) -> tracing::Span {
    span!(
        Level::INFO,
        "job_run",
        job_id = %job_id,
        run_id = %run_id,
        correlation_id = %correlation_id,
        worker_id = %worker_id,
        execution_mode = %execution_mode,
    )
}

/// Span for one ingest work item.
pub fn work_item_span(work_item_id: &str, worker_id: &str, resource_id: &str) -> tracing::Span {
    span!(
        Level::INFO,
        "work_item",
        work_item_id = %work_item_id,
        worker_id = %worker_id,
        resource_id = %resource_id,
    )
}
