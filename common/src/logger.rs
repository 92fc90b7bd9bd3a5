use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGER_INIT: OnceCell<()> = OnceCell::new();

/// Initialize the process-wide tracing subscriber.
///
/// Safe to call more than once; only the first call installs the subscriber.
/// `json=true` switches the fmt layer to structured JSON output for log
/// shipping; the pretty format is meant for local development.
pub fn init_tracing(service_name: &'static str, json: bool) {
    LOGGER_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let base = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            // Includes timing when the span closes
            .with_span_events(fmt::format::FmtSpan::CLOSE);

        if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(base.json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(base.pretty())
                .init();
        }

        tracing::info!(service = service_name, "logger initialized");
    });
}

/// Time a store-bound future against a latency threshold.
///
/// Returns the result together with the measured latency so callers can put
/// the number on their own spans or counters; overruns additionally raise a
/// structured warning. Measured on the tokio clock, so tests driving paused
/// time see deterministic durations.
pub async fn timed<F, T>(op: &'static str, slow_after: Duration, fut: F) -> (T, Duration)
where
    F: std::future::Future<Output = T>,
{
    let start = tokio::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > slow_after {
        tracing::warn!(
            target: "slow_ops",
            op,
            elapsed_ms = elapsed.as_millis() as u64,
            threshold_ms = slow_after.as_millis() as u64,
            "operation overran its latency threshold"
        );
    }
    (out, elapsed)
}
