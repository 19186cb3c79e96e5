//! Prometheus metrics definitions and registration.
//!
//! Exposed on `/metrics` when enabled in the configuration. Without an
//! installed recorder the helpers below are no-ops.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the Prometheus recorder and register all metric descriptions.
///
/// Fails if a recorder is already installed in this process.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metric_descriptions();
    Ok(handle)
}

fn register_metric_descriptions() {
    describe_gauge!(
        "settings_uptime_seconds",
        "Time in seconds since the settings service started"
    );
    describe_counter!(
        "settings_saves_total",
        "Total number of settings records committed"
    );
    describe_counter!(
        "settings_save_failures_total",
        "Total number of settings saves that failed in storage"
    );
    describe_counter!(
        "settings_rejected_total",
        "Total number of settings requests rejected before storage"
    );
    describe_counter!(
        "data_reads_total",
        "Total number of /data reads, by whether a record was stored"
    );
    describe_counter!(
        "reset_requests_total",
        "Total number of /reset requests, by whether they were accepted"
    );
}

pub struct Metrics;

impl Metrics {
    pub fn set_uptime(start_time: Instant) {
        gauge!("settings_uptime_seconds").set(start_time.elapsed().as_secs_f64());
    }

    pub fn inc_saves() {
        counter!("settings_saves_total").increment(1);
    }

    pub fn inc_save_failures() {
        counter!("settings_save_failures_total").increment(1);
    }

    pub fn inc_rejected(reason: &'static str) {
        counter!("settings_rejected_total", "reason" => reason).increment(1);
    }

    pub fn inc_data_reads(configured: bool) {
        counter!("data_reads_total", "configured" => bool_label(configured)).increment(1);
    }

    pub fn inc_reset_requests(accepted: bool) {
        counter!("reset_requests_total", "accepted" => bool_label(accepted)).increment(1);
    }
}

fn bool_label(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}
