//! Axum HTTP + WebSocket surface and process wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, field, info, info_span, warn, Instrument};

use tabwatch_core::events::BroadcastEvent;
use tabwatch_core::ids::{RequestId, TabId, UserId};
use tabwatch_core::session::{SessionState, TelemetryRequest};
use tabwatch_core::{Config, IngestError, AUDIT_TARGET};
use tabwatch_store::{DurableWriteQueue, RecordStore, RetryingExecutor, SessionStore, TaskApplier};
use tabwatch_telemetry::{HealthAggregator, LogQuery, SqliteLogSink};

use crate::client::{handle_ws_connection, SubscriberRegistry};
use crate::ingest::{IngestReply, TelemetryPipeline};
use crate::maintenance::Maintenance;
use crate::notify::Notifier;
use crate::watchdog::SubscriberWatchdog;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const HISTORY_DEFAULT_LIMIT: u32 = 100;
const HISTORY_MAX_LIMIT: u32 = 1000;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TelemetryPipeline>,
    pub sessions: Arc<SessionStore>,
    pub health: Arc<HealthAggregator>,
    pub maintenance: Arc<Maintenance>,
    pub registry: Arc<SubscriberRegistry>,
    pub notifier: Arc<Notifier>,
    pub store: Arc<dyn RecordStore>,
    pub logs: Option<Arc<SqliteLogSink>>,
}

impl AppState {
    /// Wire every component from one immutable `Config`.
    pub fn new(
        config: &Config,
        store: Arc<dyn RecordStore>,
        queue: Arc<DurableWriteQueue>,
        logs: Option<Arc<SqliteLogSink>>,
    ) -> Self {
        let flags = config.flags.clone();
        let executor = Arc::new(if flags.reliability_layer {
            RetryingExecutor::new(config.retry.clone())
        } else {
            RetryingExecutor::disabled()
        });
        let sessions = Arc::new(SessionStore::new(
            &flags,
            config.session.clone(),
            Arc::clone(&store),
            executor,
            queue,
        ));
        let health = Arc::new(HealthAggregator::new(config.health.clone()));
        let registry = Arc::new(SubscriberRegistry::new(config.server.max_send_queue));
        let notifier = Arc::new(Notifier::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            flags.async_notify.then_some(config.server.notify_queue_max),
        ));
        let pipeline = Arc::new(TelemetryPipeline::new(
            flags.clone(),
            &config.idempotency,
            &config.coalesce,
            Arc::clone(&sessions),
            Arc::clone(&health),
            Arc::clone(&notifier),
        ));
        let maintenance = Arc::new(Maintenance::new(
            flags,
            config.session.prune_interval,
            Arc::clone(&sessions),
            Arc::clone(&health),
        ));
        Self {
            pipeline,
            sessions,
            health,
            maintenance,
            registry,
            notifier,
            store,
            logs,
        }
    }

    fn task_applier(&self) -> TaskApplier {
        TaskApplier::new(Arc::clone(&self.store), Arc::clone(self.sessions.executor()))
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/telemetry", post(telemetry_handler))
        .route("/logout", post(logout_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/sessions", get(sessions_handler))
        .route("/history", get(history_handler))
        .route("/users/{user_id}/status", get(user_status_handler))
        .route("/diagnostics/logs", get(logs_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A running server and its background tasks.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub state: AppState,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting requests, stop background loops, then flush what the
    /// write queue still holds.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        info!(task_count = self.tasks.len(), "waiting for tasks to complete");
        join_or_abort(self.tasks, SHUTDOWN_TIMEOUT).await;

        let queue = self.state.sessions.queue();
        if !queue.is_empty() {
            let applied = queue.drain_pending(&self.state.task_applier()).await;
            info!(
                applied,
                remaining = queue.len(),
                durable = queue.is_durable(),
                "flushed write queue on shutdown"
            );
        }
    }
}

/// Wait for `tasks` up to `timeout`, then abort the rest and wait for them to
/// unwind. Returns how many tasks had to be aborted.
async fn join_or_abort(tasks: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    let aborts: Vec<AbortHandle> = tasks.iter().map(JoinHandle::abort_handle).collect();
    let joined = futures::future::join_all(tasks);
    tokio::pin!(joined);
    if tokio::time::timeout(timeout, &mut joined).await.is_ok() {
        return 0;
    }

    let stuck = aborts.iter().filter(|a| !a.is_finished()).count();
    warn!(
        timeout_secs = timeout.as_secs(),
        stuck, "shutdown timed out, aborting remaining tasks"
    );
    for handle in &aborts {
        handle.abort();
    }
    joined
        .await
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_cancelled()))
        .count()
}

/// Bind, spawn background loops and serve until the handle is shut down.
pub async fn start(
    config: &Config,
    store: Arc<dyn RecordStore>,
    queue: Arc<DurableWriteQueue>,
    logs: Option<Arc<SqliteLogSink>>,
) -> std::io::Result<ServerHandle> {
    let state = AppState::new(config, store, Arc::clone(&queue), logs);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(
        Arc::clone(&queue).run_drain(state.task_applier(), cancel.clone()),
    ));
    if let Some(bridge) = state.notifier.spawn_bridge(cancel.clone()) {
        tasks.push(bridge);
    }
    if config.flags.subscriber_watchdog {
        let watchdog = SubscriberWatchdog::new(Arc::clone(&state.registry), config.watchdog.clone());
        tasks.push(watchdog.spawn(cancel.clone()));
    }
    tasks.extend(Arc::clone(&state.maintenance).spawn(&cancel));

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let addr = listener.local_addr()?;
    let app = build_router(state.clone());
    let shutdown = cancel.clone();
    tasks.push(tokio::spawn(async move {
        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = served {
            error!(error = %e, "http server failed");
        }
    }));

    info!(
        %addr,
        mode = state.sessions.mode().as_str(),
        recovered_tasks = queue.recovered(),
        durable_queue = queue.is_durable(),
        "tabwatch server listening"
    );
    Ok(ServerHandle {
        addr,
        state,
        cancel,
        tasks,
    })
}

fn json_response(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

/// First hop of `x-forwarded-for`, else the socket peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn request_id(headers: &HeaderMap) -> RequestId {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(RequestId::from_raw)
        .unwrap_or_default()
}

/// POST /telemetry. The body is parsed as JSON whatever the content type,
/// since `sendBeacon` posts `text/plain`.
async fn telemetry_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let request: TelemetryRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "malformed telemetry body");
            let reply = IngestReply::error(&IngestError::Validation("malformed body".into()));
            return json_response(reply.status, reply.body);
        }
    };

    let span = info_span!(
        "telemetry",
        request_id = %request_id,
        user_id = field::Empty,
        tab_id = field::Empty
    );
    if let Some(user_id) = &request.user_id {
        span.record("user_id", user_id.as_str());
    }
    if let Some(tab_id) = &request.tab_id {
        span.record("tab_id", tab_id.as_str());
    }

    let ip = client_ip(&headers, peer);
    let reply = state
        .pipeline
        .ingest(request, Some(ip), request_id)
        .instrument(span)
        .await;
    json_response(reply.status, reply.body)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogoutRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    tab_id: Option<String>,
}

/// POST /logout
async fn logout_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: LogoutRequest = serde_json::from_slice(&body).unwrap_or_default();
    let (Some(user_id), Some(tab_id)) = (
        request.user_id.filter(|s| !s.is_empty()),
        request.tab_id.filter(|s| !s.is_empty()),
    ) else {
        return error_response(StatusCode::BAD_REQUEST, "missing identity");
    };
    let request_id = request_id(&headers);
    state
        .pipeline
        .logout(&UserId::from_raw(user_id), &TabId::from_raw(tab_id), &request_id)
        .await;
    Json(json!({ "success": true })).into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Response {
    Json(state.maintenance.snapshot().await).into_response()
}

/// GET /ws: real-time subscriber channel.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| subscriber_session(socket, state))
}

async fn subscriber_session(socket: WebSocket, state: AppState) {
    let (subscriber_id, rx) = state.registry.register();
    let snapshot = BroadcastEvent::FullSnapshot(state.sessions.all_sessions().await);
    if let Some(wire) = snapshot.to_wire() {
        state.registry.send_to(&subscriber_id, wire);
    }
    info!(
        target: AUDIT_TARGET,
        subscriber_id = %subscriber_id,
        subscribers = state.registry.count(),
        "subscriber joined"
    );
    handle_ws_connection(socket, subscriber_id, rx, Arc::clone(&state.registry)).await;
}

/// GET /sessions
async fn sessions_handler(State(state): State<AppState>) -> Response {
    Json(state.sessions.all_sessions().await).into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
}

/// GET /history?limit=N
async fn history_handler(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> Response {
    let limit = params
        .limit
        .unwrap_or(HISTORY_DEFAULT_LIMIT)
        .clamp(1, HISTORY_MAX_LIMIT);
    let store = &state.store;
    match state
        .sessions
        .executor()
        .execute("recent_logs", || store.recent_logs(limit))
        .await
    {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!(operation = "recent_logs", error_kind = e.error_kind(), error = %e, "history query failed");
            let err = IngestError::from(e);
            let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &err.to_string())
        }
    }
}

/// GET /users/{user_id}/status
async fn user_status_handler(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    let user_id = UserId::from_raw(user_id);
    let sessions = state.sessions.all_sessions().await;
    let status = match sessions.get(&user_id) {
        None => "offline",
        Some(tabs) if tabs.is_empty() => "offline",
        Some(tabs) if tabs.values().any(|s| s.state == Some(SessionState::Focused)) => "active",
        Some(_) => "online",
    };
    let stats = state.sessions.user_stats(&user_id).await;
    Json(json!({ "userId": user_id, "status": status, "stats": stats })).into_response()
}

/// GET /diagnostics/logs
async fn logs_handler(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Response {
    let Some(logs) = &state.logs else {
        return error_response(StatusCode::NOT_FOUND, "log persistence disabled");
    };
    match logs.query(&query) {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!(error = %e, "log query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "log query failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tabwatch_core::config::{QueueConfig, SaturationPolicy};
    use tabwatch_store::MemoryRecordStore;

    async fn serve(records: Arc<MemoryRecordStore>) -> (ServerHandle, String) {
        let dir = std::env::temp_dir().join(format!("tabwatch-server-{}", uuid::Uuid::now_v7()));
        let mut config = Config::with_data_dir(dir.clone());
        config.server.host = "127.0.0.1".into();
        config.server.port = 0;
        let queue = DurableWriteQueue::in_memory(
            &QueueConfig::with_log_path(dir.join("queue.log")),
            SaturationPolicy::Reject,
        );
        let handle = start(&config, records, Arc::new(queue), None).await.unwrap();
        let base = format!("http://{}", handle.addr);
        (handle, base)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn telemetry_round_trip_over_http() {
        let records = Arc::new(MemoryRecordStore::new());
        records.insert_user(&UserId::from_raw("u1"), "alice");
        let (handle, base) = serve(Arc::clone(&records)).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/telemetry"))
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .header("x-request-id", "req-fixed")
            .json(&json!({ "userId": "u1", "tabId": "t1", "type": "init", "state": "FOCUSED" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["sessionVersion"], 1);

        let sessions: Value = client
            .get(format!("{base}/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sessions["u1"]["t1"]["sourceIp"], "203.0.113.9");
        assert_eq!(sessions["u1"]["t1"]["username"], "alice");

        let status: Value = client
            .get(format!("{base}/users/u1/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "active");
        assert_eq!(status["stats"]["tabCount"], 1);

        // The drain worker persists the queued upsert and log row.
        wait_for(|| records.session(&TabId::from_raw("t1")).is_some()).await;
        wait_for(|| !records.logs().is_empty()).await;
        let history: Value = client
            .get(format!("{base}/history?limit=5"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["requestId"], "req-fixed");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn beacon_body_and_logout() {
        let records = Arc::new(MemoryRecordStore::new());
        let (handle, base) = serve(records).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/telemetry"))
            .header("content-type", "text/plain;charset=UTF-8")
            .body(r#"{"userId":"u1","tabId":"t1","type":"state_change","state":"HIDDEN"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let status: Value = client
            .get(format!("{base}/users/u1/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "online");

        let resp = client
            .post(format!("{base}/logout"))
            .json(&json!({ "userId": "u1", "tabId": "t1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let status: Value = client
            .get(format!("{base}/users/u1/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "offline");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let (handle, base) = serve(Arc::new(MemoryRecordStore::new())).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/telemetry"))
            .json(&json!({ "tabId": "t1", "type": "heartbeat" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{base}/telemetry"))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{base}/logout"))
            .json(&json!({ "userId": "u1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .get(format!("{base}/diagnostics/logs"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn health_reports_snapshot() {
        let (handle, base) = serve(Arc::new(MemoryRecordStore::new())).await;
        let client = reqwest::Client::new();
        client
            .post(format!("{base}/telemetry"))
            .json(&json!({ "userId": "u1", "tabId": "t1", "type": "heartbeat", "state": "FOCUSED" }))
            .send()
            .await
            .unwrap();

        let health: Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["activeTabs"], 1);
        assert_eq!(health["eventCount"], 1);
        assert_eq!(health["breakerState"], "CLOSED");
        assert!(health["generatedAt"].is_string());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_writes() {
        let records = Arc::new(MemoryRecordStore::new());
        let (handle, base) = serve(Arc::clone(&records)).await;
        reqwest::Client::new()
            .post(format!("{base}/telemetry"))
            .json(&json!({ "userId": "u1", "tabId": "t9", "type": "init", "state": "FOCUSED" }))
            .send()
            .await
            .unwrap();
        let queue = Arc::clone(handle.state.sessions.queue());
        handle.shutdown().await;
        assert!(queue.is_empty());
        assert!(records.session(&TabId::from_raw("t9")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_aborted_after_shutdown_timeout() {
        let quick = tokio::spawn(tokio::time::sleep(Duration::from_millis(5)));
        let stuck = tokio::spawn(std::future::pending::<()>());
        let aborted = join_or_abort(vec![quick, stuck], Duration::from_secs(1)).await;
        assert_eq!(aborted, 1);

        let done = tokio::spawn(async {});
        assert_eq!(join_or_abort(vec![done], Duration::from_secs(1)).await, 0);
    }
}
