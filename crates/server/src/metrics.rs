//! Prometheus exporter wiring

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and describe the bridge's metrics
///
/// Call once at startup, before any session is created.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    let _ = HANDLE.set(handle.clone());
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!("voicebridge_turns_started_total", "Turns started");
    metrics::describe_counter!(
        "voicebridge_turns_total",
        "Turns terminated, labelled by outcome"
    );
    metrics::describe_counter!("voicebridge_barge_ins_total", "Barge-ins detected");
    metrics::describe_counter!(
        "voicebridge_provider_errors_total",
        "Provider errors, labelled by lane"
    );
    metrics::describe_counter!(
        "voicebridge_provider_retries_total",
        "Provider retries, labelled by lane"
    );
    metrics::describe_histogram!(
        "voicebridge_turn_end_to_end_ms",
        "End-to-end turn latency in milliseconds"
    );
    metrics::describe_histogram!("voicebridge_turn_cost_usd", "Estimated cost per turn in USD");
}

/// Render the Prometheus exposition text
pub async fn prometheus_handler() -> String {
    HANDLE.get().map(|handle| handle.render()).unwrap_or_default()
}
