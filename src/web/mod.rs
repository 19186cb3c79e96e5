//! HTTP interface of the settings service.
//!
//! `/settings` serves the configuration page or, when called with a query,
//! replaces the stored record. `/data` returns the stored record verbatim and
//! `/reset?ok=1` restarts the device. `/metrics` is only routed when a
//! Prometheus handle was configured.

pub mod metrics;
pub mod state;

use axum::{
    Json, Router,
    extract::{RawQuery, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use minijinja::context;
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::query::{QueryError, SettingsRequest};
use crate::record::{AGC_LEVEL_RANGE, DELIMITER, DEVICE_SLOTS, MAX_PIN, NAME_CAPACITY, encode};
use crate::restart::ResetRequest;
use crate::web::metrics::Metrics;
use crate::web::state::{AppState, SETTINGS_TEMPLATE};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/settings", get(settings_handler))
        .route("/data", get(data_handler))
        .route("/reset", get(reset_handler));
    if state.metrics_handle.is_some() {
        app = app.route("/metrics", get(metrics_handler));
    }
    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// `/settings`: page on a bare request, bulk save otherwise.
async fn settings_handler(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let form = match SettingsRequest::from_query(query.as_deref()) {
        Ok(SettingsRequest::Read) => return settings_page(&state),
        Ok(SettingsRequest::Write(form)) => form,
        Err(e) => return rejected(e),
    };
    let record = match form.to_record() {
        Ok(record) => record,
        Err(e) => return rejected(e),
    };

    let raw = encode(&record);
    let store = state.store.clone();
    let saved = tokio::task::spawn_blocking(move || store.save(&raw)).await;
    match saved {
        Ok(Ok(())) => {
            Metrics::inc_saves();
            (StatusCode::OK, Json(json!({ "status": "success" }))).into_response()
        }
        Ok(Err(e)) => {
            // The store already logged the cause.
            debug!("Settings write failed: {}", e);
            Metrics::inc_save_failures();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist settings")
        }
        Err(e) => {
            error!("Settings save task failed: {}", e);
            Metrics::inc_save_failures();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist settings")
        }
    }
}

fn rejected(e: QueryError) -> Response {
    warn!("Rejected settings request: {}", e);
    let status = match e {
        QueryError::TooLong { .. } => {
            Metrics::inc_rejected("too_long");
            StatusCode::URI_TOO_LONG
        }
        QueryError::InvalidField { .. } => {
            Metrics::inc_rejected("invalid_field");
            StatusCode::BAD_REQUEST
        }
    };
    error_response(status, &e.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}

fn settings_page(state: &AppState) -> Response {
    Metrics::set_uptime(state.start_time);

    let template = match state.templates.get_template(SETTINGS_TEMPLATE) {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to get settings template: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Template error").into_response();
        }
    };

    let html = match template.render(context! {
        title => "Smart Home Settings",
        slots => (1..=DEVICE_SLOTS).collect::<Vec<_>>(),
        name_max => NAME_CAPACITY,
        pin_max => MAX_PIN,
        agc_min => AGC_LEVEL_RANGE.start(),
        agc_max => AGC_LEVEL_RANGE.end(),
        delimiter => DELIMITER.to_string(),
        poll_ms => state.poll_interval.as_millis() as u64,
    }) {
        Ok(html) => html,
        Err(e) => {
            error!("Failed to render settings template: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Render error").into_response();
        }
    };

    Html(html).into_response()
}

/// `/data`: the stored record, or an empty body before the first save.
async fn data_handler(State(state): State<AppState>) -> Response {
    let store = state.store.clone();
    let raw = tokio::task::spawn_blocking(move || store.load())
        .await
        .unwrap_or_else(|e| {
            error!("Settings load task failed: {}", e);
            None
        });
    Metrics::inc_data_reads(raw.is_some());

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, TEXT_PLAIN)],
        raw.unwrap_or_default(),
    )
        .into_response()
}

/// `/reset`: restarts the device once the acknowledgment has gone out.
async fn reset_handler(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    match ResetRequest::from_query(query.as_deref()) {
        ResetRequest::Invalid => {
            warn!("Rejected reset request: {:?}", query);
            Metrics::inc_reset_requests(false);
            (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, TEXT_PLAIN)],
                "Invalid reset request",
            )
                .into_response()
        }
        ResetRequest::Confirmed => {
            info!("Restart requested, restarting in {:?}", state.restart_delay);
            Metrics::inc_reset_requests(true);
            let restarter = state.restarter.clone();
            let delay = state.restart_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = tokio::task::spawn_blocking(move || restarter.restart()).await {
                    error!("Restart task failed: {}", e);
                }
            });
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, TEXT_PLAIN)],
                "Device is restarting...",
            )
                .into_response()
        }
    }
}

/// Prometheus scrape endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(handle) = state.metrics_handle.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    Metrics::set_uptime(state.start_time);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
        .into_response()
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owner of the single HTTP listener.
///
/// Starting an already running server returns the address it is bound to
/// without opening a second listener.
#[derive(Default)]
pub struct SettingsServer {
    running: Mutex<Option<RunningServer>>,
}

impl SettingsServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `addr` and serves `state` in the background.
    ///
    /// Returns the bound address, which differs from `addr` when port 0 is used.
    pub async fn start(&self, addr: SocketAddr, state: AppState) -> io::Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            if !server.task.is_finished() {
                debug!("Settings server already running on {}", server.addr);
                return Ok(server.addr);
            }
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);

        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Settings server error: {}", e);
            }
        });

        info!("Settings server listening on http://{}", local_addr);
        *running = Some(RunningServer {
            addr: local_addr,
            shutdown: shutdown_tx,
            task,
        });
        Ok(local_addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|server| !server.task.is_finished())
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(&self) {
        let Some(server) = self.running.lock().await.take() else {
            return;
        };
        let _ = server.shutdown.send(());
        if let Err(e) = server.task.await {
            error!("Settings server task failed: {}", e);
        }
        info!("Settings server on {} stopped", server.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::testing::RecordingRestarter;
    use crate::store::SettingsStore;
    use crate::store::memory::{FaultPoint, MemoryKvStore};
    use std::sync::Arc;
    use std::time::Duration;

    const SCENARIO: &str = "Den1=Light&Den1IO=5&Den1Sta=1&Den2=&Den2IO=&Den2Sta=0&Den3=&Den3IO=&Den3Sta=0&Den4=&Den4IO=&Den4Sta=0&AgcW=1&AgcA=0&AgcL=70";

    struct TestServer {
        server: SettingsServer,
        base: String,
        backend: Arc<MemoryKvStore>,
        restarter: Arc<RecordingRestarter>,
        client: reqwest::Client,
    }

    impl TestServer {
        async fn start() -> Self {
            let backend = Arc::new(MemoryKvStore::new());
            let restarter = Arc::new(RecordingRestarter::default());
            let state = AppState::new(
                Arc::new(SettingsStore::new(backend.clone())),
                restarter.clone(),
                Duration::ZERO,
                Duration::from_secs(3),
            )
            .unwrap();
            Self::with_state(state, backend, restarter).await
        }

        async fn with_state(
            state: AppState,
            backend: Arc<MemoryKvStore>,
            restarter: Arc<RecordingRestarter>,
        ) -> Self {
            let server = SettingsServer::new();
            let addr = server
                .start(SocketAddr::from(([127, 0, 0, 1], 0)), state)
                .await
                .unwrap();
            Self {
                server,
                base: format!("http://{}", addr),
                backend,
                restarter,
                client: reqwest::Client::new(),
            }
        }

        async fn get(&self, path: &str) -> reqwest::Response {
            self.client
                .get(format!("{}{}", self.base, path))
                .send()
                .await
                .unwrap()
        }

        async fn data(&self) -> String {
            let response = self.get("/data").await;
            assert_eq!(response.status(), 200);
            response.text().await.unwrap()
        }

        async fn stop(self) {
            drop(self.client);
            self.server.shutdown().await;
        }
    }

    async fn json_body(response: reqwest::Response) -> serde_json::Value {
        response.json().await.unwrap()
    }

    #[tokio::test]
    async fn test_data_empty_before_first_save() {
        let server = TestServer::start().await;
        let response = server.get("/data").await;
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE.as_str()],
            "text/plain; charset=utf-8"
        );
        assert_eq!(response.text().await.unwrap(), "");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_save_then_read_back() {
        let server = TestServer::start().await;
        let response = server.get(&format!("/settings?{}", SCENARIO)).await;
        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await, json!({ "status": "success" }));

        assert_eq!(server.data().await, "Light#5#1###0###0###0#1#0#70");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_data_returns_stored_value_verbatim() {
        let server = TestServer::start().await;
        SettingsStore::new(server.backend.clone())
            .save("Lamp#5")
            .unwrap();
        assert_eq!(server.data().await, "Lamp#5");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_same_save_twice_is_idempotent() {
        let server = TestServer::start().await;
        server.get(&format!("/settings?{}", SCENARIO)).await;
        let first = server.data().await;
        server.get(&format!("/settings?{}", SCENARIO)).await;
        assert_eq!(server.data().await, first);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_save_replaces_whole_record() {
        let server = TestServer::start().await;
        server.get(&format!("/settings?{}", SCENARIO)).await;
        server.get("/settings?Den2=Fan&Den2IO=12&Den2Sta=1").await;
        assert_eq!(server.data().await, "##0#Fan#12#1###0###0#0#0#");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_settings_page_without_query() {
        let server = TestServer::start().await;
        let response = server.get("/settings").await;
        assert_eq!(response.status(), 200);
        let content_type = response.headers()[header::CONTENT_TYPE.as_str()]
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("text/html"));
        let html = response.text().await.unwrap();
        assert!(html.contains("name=\"Den4Sta\""));
        assert!(html.contains("maxlength=\"32\""));
        assert!(html.contains("setInterval(refresh, 3000)"));

        // Showing the page never writes.
        assert_eq!(server.data().await, "");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_query_too_long() {
        let server = TestServer::start().await;
        let name = "x".repeat(3000);
        let response = server.get(&format!("/settings?Den1={}", name)).await;
        assert_eq!(response.status(), 414);
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("too long"));
        assert_eq!(server.data().await, "");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_field_rejects_whole_write() {
        let server = TestServer::start().await;
        server.get(&format!("/settings?{}", SCENARIO)).await;

        let response = server.get("/settings?Den1=Lamp&Den1IO=99").await;
        assert_eq!(response.status(), 400);
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Invalid value for Den1IO");

        assert_eq!(server.data().await, "Light#5#1###0###0###0#1#0#70");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_previous_record() {
        let server = TestServer::start().await;
        server.get(&format!("/settings?{}", SCENARIO)).await;

        server.backend.inject_fault(Some(FaultPoint::Commit));
        let response = server.get("/settings?Den1=Other").await;
        assert_eq!(response.status(), 500);
        assert_eq!(
            json_body(response).await,
            json!({ "status": "error", "message": "Failed to persist settings" })
        );

        server.backend.inject_fault(None);
        assert_eq!(server.data().await, "Light#5#1###0###0###0#1#0#70");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_long_name_truncated_without_touching_neighbours() {
        let server = TestServer::start().await;
        let name = "abcdefghij".repeat(4);
        let response = server
            .get(&format!("/settings?Den1={}&Den1IO=7&Den1Sta=1", name))
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(
            server.data().await,
            format!("{}#7#1###0###0###0#0#0#", &name[..32])
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_encoded_name_round_trips() {
        let server = TestServer::start().await;
        server
            .get("/settings?Den1=%C4%90%C3%A8n+ng%E1%BB%A7&Den1IO=4")
            .await;
        assert_eq!(server.data().await, "Đèn ngủ#4#0###0###0###0#0#0#");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_reset_rejected_without_confirmation() {
        let server = TestServer::start().await;
        for path in ["/reset", "/reset?ok=0", "/reset?ok=1&now=1"] {
            let response = server.get(path).await;
            assert_eq!(response.status(), 400);
            assert_eq!(response.text().await.unwrap(), "Invalid reset request");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.restarter.calls(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_reset_restarts_once() {
        let server = TestServer::start().await;
        let response = server.get("/reset?ok=1").await;
        assert_eq!(response.status(), 200);
        assert!(!response.text().await.unwrap().is_empty());

        for _ in 0..100 {
            if server.restarter.calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.restarter.calls(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_metrics_route_absent_when_disabled() {
        let server = TestServer::start().await;
        assert_eq!(server.get("/metrics").await.status(), 404);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_metrics_route_present_when_enabled() {
        let backend = Arc::new(MemoryKvStore::new());
        let restarter = Arc::new(RecordingRestarter::default());
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let state = AppState::new(
            Arc::new(SettingsStore::new(backend.clone())),
            restarter.clone(),
            Duration::ZERO,
            Duration::from_secs(3),
        )
        .unwrap()
        .with_metrics(handle);
        let server = TestServer::with_state(state, backend, restarter).await;

        let response = server.get("/metrics").await;
        assert_eq!(response.status(), 200);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let backend = Arc::new(MemoryKvStore::new());
        let state = AppState::new(
            Arc::new(SettingsStore::new(backend)),
            Arc::new(RecordingRestarter::default()),
            Duration::ZERO,
            Duration::from_secs(3),
        )
        .unwrap();

        let server = SettingsServer::new();
        assert!(!server.is_running().await);

        let addr = server
            .start(SocketAddr::from(([127, 0, 0, 1], 0)), state.clone())
            .await
            .unwrap();
        assert!(server.is_running().await);

        // A second start keeps the first listener.
        let again = server
            .start(SocketAddr::from(([127, 0, 0, 1], 0)), state)
            .await
            .unwrap();
        assert_eq!(again, addr);

        server.shutdown().await;
        assert!(!server.is_running().await);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        // Shutting down twice is harmless.
        server.shutdown().await;
    }
}
