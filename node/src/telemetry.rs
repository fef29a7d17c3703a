// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs + metrics)
pub fn init_telemetry() {
    // 1. Initialize Tracing (Logs)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "forgeline_node=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Initialize Metrics (Prometheus)
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // Store handle for rendering by the external HTTP layer
    if PROM_HANDLE.set(handle).is_err() {
        tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
    }

    metrics::describe_counter!(
        "forgeline_events_submitted_total",
        "Events accepted into the pending log"
    );
    metrics::describe_counter!(
        "forgeline_events_rejected_total",
        "Events rejected at submission"
    );
    metrics::describe_counter!(
        "forgeline_blocks_committed_total",
        "Blocks committed to the local chain"
    );
    metrics::describe_counter!("forgeline_reorgs_total", "Chain reorganizations performed");
    metrics::describe_counter!(
        "forgeline_peer_validation_failures_total",
        "Inbound blocks that failed validation"
    );
    metrics::describe_histogram!(
        "forgeline_seal_duration_seconds",
        "Time taken to seal and commit a local block"
    );
    metrics::describe_gauge!("forgeline_chain_height", "Current height of the local chain");

    metrics::gauge!("forgeline_node_up", 1.0);
}

/// Render the Prometheus metrics text for the external HTTP layer.
pub fn get_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
