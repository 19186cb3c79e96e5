//! State shared with all route handlers.

use metrics_exporter_prometheus::PrometheusHandle;
use minijinja::Environment;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::restart::Restarter;
use crate::store::SettingsStore;

pub const SETTINGS_TEMPLATE: &str = "settings.html";

#[derive(Clone)]
pub struct AppState {
    /// Persisted settings record.
    pub store: Arc<SettingsStore>,
    /// Invoked by a confirmed `/reset`.
    pub restarter: Arc<dyn Restarter>,
    /// Pause between the `/reset` acknowledgment and the restart.
    pub restart_delay: Duration,
    /// How often the settings page polls `/data`.
    pub poll_interval: Duration,
    /// Template environment.
    pub templates: Arc<Environment<'static>>,
    /// Prometheus handle, `None` when metrics are disabled.
    pub metrics_handle: Option<PrometheusHandle>,
    /// Service start time.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<SettingsStore>,
        restarter: Arc<dyn Restarter>,
        restart_delay: Duration,
        poll_interval: Duration,
    ) -> Result<Self, minijinja::Error> {
        Ok(Self {
            store,
            restarter,
            restart_delay,
            poll_interval,
            templates: Arc::new(templates()?),
            metrics_handle: None,
            start_time: Instant::now(),
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

fn templates() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template(
        SETTINGS_TEMPLATE,
        include_str!("../../templates/settings.html"),
    )?;
    Ok(env)
}
