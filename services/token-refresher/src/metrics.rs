//! Prometheus metrics for one invocation
//!
//! The process exits after each run, so nothing scrapes it. Instead the
//! rendered exposition is written to a node-exporter textfile at the end.
//!
//! - `token_refresher_invocations_total` (counter): labels `mode`, `outcome`
//! - `token_refresher_invocation_duration_seconds` (histogram): label `mode`
//!
//! The lifecycle counters from `token-lifecycle` land in the same recorder.

use std::path::Path;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "token_refresher_invocation_duration_seconds";

/// Invocations are bounded by the scheduler's deadline, a few minutes at most.
const DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        metrics_exporter_prometheus::Matcher::Full(DURATION_METRIC.to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a finished invocation.
pub fn record_invocation(mode: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("token_refresher_invocations_total", "mode" => mode, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "mode" => mode).record(duration_secs);
}

/// Write the rendered exposition to `path`, replacing it atomically so the
/// collector never reads a half-written file.
pub fn write_textfile(handle: &PrometheusHandle, path: &Path) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("token_refresher.prom");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    std::fs::write(&tmp, handle.render())?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}
