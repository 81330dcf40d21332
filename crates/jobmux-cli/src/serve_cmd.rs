//! `jobmux serve`: the HTTP submission API plus the WebSocket live event
//! channel, both backed by a shared [`Coordinator`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use jobmux_core::coordinator::Coordinator;
use jobmux_core::scheduler::SubmitRequest;
use jobmux_core::syncbus::{ClientId, ClientKind, SyncEvent};
use jobmux_db::queries::events;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobBody {
    pub query: String,
    pub location: Option<String>,
    pub region: Option<String>,
    pub platforms: Option<Vec<String>>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Milliseconds from now.
    pub deadline: Option<i64>,
    pub user_tag: Option<String>,
}

fn default_priority() -> i32 {
    3
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub accepted_platforms: Vec<String>,
    pub estimated_completion: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub cursor: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub active_jobs: i64,
    pub per_platform_health: Vec<jobmux_db::models::PlatformHealth>,
    pub storage_connected: bool,
    pub memory_kb: u64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(coordinator: Arc<Coordinator>, started_at: Instant) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/events", get(get_job_events))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(ServeState {
            coordinator,
            started_at,
        })
}

#[derive(Clone)]
struct ServeState {
    coordinator: Arc<Coordinator>,
    started_at: Instant,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(coordinator: Arc<Coordinator>, bind: &str, port: u16) -> Result<()> {
    let started_at = Instant::now();
    let app = build_router(Arc::clone(&coordinator), started_at);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("jobmux serve listening on http://{addr}");

    let shutdown = tokio_util::sync::CancellationToken::new();
    let run_shutdown = shutdown.clone();
    let coordinator_handle = tokio::spawn(async move { coordinator.run(run_shutdown).await });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    coordinator_handle.await??;
    tracing::info!("jobmux serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn submit_job(
    State(state): State<ServeState>,
    Json(body): Json<SubmitJobBody>,
) -> Result<axum::response::Response, AppError> {
    if body.query.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty"));
    }

    let deadline = body
        .deadline
        .map(|ms| Utc::now() + chrono::Duration::milliseconds(ms));

    let job = state
        .coordinator
        .submit(SubmitRequest {
            query: body.query,
            location: body.location,
            region: body.region,
            platforms: body.platforms,
            priority: body.priority,
            user_tag: body.user_tag,
            deadline,
        })
        .await
        .map_err(AppError::internal)?;

    let registry = state.coordinator.registry();
    let max_timeout_secs = job
        .platforms
        .iter()
        .filter_map(|p| registry.platform(p))
        .map(|p| p.timeout_seconds)
        .max()
        .unwrap_or(60);

    Ok(Json(SubmitJobResponse {
        job_id: job.id,
        accepted_platforms: job.platforms.clone(),
        estimated_completion: job.submitted_at + chrono::Duration::seconds(max_timeout_secs as i64),
    })
    .into_response())
}

async fn get_job(
    State(state): State<ServeState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let (job, tasks) = state
        .coordinator
        .status(id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    let integrity_report = if job.status.is_terminal() {
        state
            .coordinator
            .integrity_report(id)
            .await
            .map_err(AppError::internal)?
    } else {
        None
    };

    Ok(Json(serde_json::json!({
        "job": job,
        "platform_tasks": tasks,
        "integrity_report": integrity_report,
    }))
    .into_response())
}

async fn get_job_events(
    State(state): State<ServeState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<axum::response::Response, AppError> {
    let events = events::list_events(
        &state.coordinator.pool(),
        id,
        query.cursor,
        query.limit.unwrap_or(100),
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(events).into_response())
}

async fn cancel_job(
    State(state): State<ServeState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let cancelled = state
        .coordinator
        .cancel(id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "job_id": id, "cancelled": cancelled })).into_response())
}

async fn health(State(state): State<ServeState>) -> Result<axum::response::Response, AppError> {
    let snapshot = state.coordinator.health().await.map_err(AppError::internal)?;
    let active_jobs = state
        .coordinator
        .list_jobs(&jobmux_db::queries::jobs::JobFilter {
            status: Some(jobmux_db::models::JobStatus::Processing),
            user_tag: None,
            limit: 10_000,
        })
        .await
        .map(|jobs| jobs.len() as i64)
        .unwrap_or(0);

    Ok(Json(HealthResponse {
        status: if snapshot.alert { "degraded" } else { "ok" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_jobs,
        per_platform_health: snapshot.platforms,
        storage_connected: true,
        memory_kb: current_memory_kb(),
    })
    .into_response())
}

/// Best-effort resident memory in KB, read from `/proc/self/statm` on
/// Linux. Returns 0 on any other platform or if the read fails.
fn current_memory_kb() -> u64 {
    let Ok(contents) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let page_size_kb = 4;
    contents
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * page_size_kb)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// WebSocket live event channel
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Auth {
        client_type: String,
        user_id: Option<String>,
        subscribe: Vec<String>,
    },
    Subscribe {
        event_types: Vec<String>,
    },
    Unsubscribe {
        event_types: Vec<String>,
    },
    Heartbeat,
    GetStatus {
        job_id: Uuid,
    },
    GetHistory {
        job_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: Option<i64>,
    },
}

#[derive(Debug, Serialize)]
struct ServerFrame {
    event_id: Uuid,
    #[serde(rename = "type")]
    event_type: String,
    job_id: Option<Uuid>,
    platform: Option<String>,
    data: serde_json::Value,
    timestamp: DateTime<Utc>,
    source: &'static str,
}

impl From<SyncEvent> for ServerFrame {
    fn from(event: SyncEvent) -> Self {
        Self {
            event_id: event.event_id,
            event_type: format!("{:?}", event.event_type),
            job_id: event.job_id,
            platform: event.platform,
            data: event.data,
            timestamp: event.timestamp,
            source: "jobmux",
        }
    }
}

fn client_kind_from_str(s: &str) -> ClientKind {
    match s {
        "cli" => ClientKind::Cli,
        "service" => ClientKind::Service,
        _ => ClientKind::Browser,
    }
}

async fn ws_upgrade(
    State(state): State<ServeState>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: ServeState) {
    let Some(sync_bus) = state.coordinator.sync_bus().cloned() else {
        let _ = socket
            .send(Message::text(
                serde_json::json!({"type": "error", "data": "live events are not enabled"})
                    .to_string(),
            ))
            .await;
        return;
    };

    let client_id: ClientId = Uuid::new_v4();
    let mut outbox = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else { continue };
                match frame {
                    ClientFrame::Auth { client_type, user_id, subscribe } => {
                        outbox = Some(
                            sync_bus
                                .connect(client_id, client_kind_from_str(&client_type), user_id, subscribe)
                                .await,
                        );
                    }
                    ClientFrame::Heartbeat => {
                        sync_bus.heartbeat(client_id).await;
                    }
                    ClientFrame::GetStatus { job_id } => {
                        if let Ok(Some((job, _))) = state.coordinator.status(job_id).await {
                            let _ = socket
                                .send(Message::text(serde_json::to_string(&job).unwrap_or_default()))
                                .await;
                        }
                    }
                    ClientFrame::GetHistory { job_id, cursor, limit } => {
                        if let Ok(history) = events::list_events(
                            &state.coordinator.pool(),
                            job_id,
                            cursor,
                            limit.unwrap_or(100),
                        )
                        .await
                        {
                            let _ = socket
                                .send(Message::text(serde_json::to_string(&history).unwrap_or_default()))
                                .await;
                        }
                    }
                    ClientFrame::Subscribe { .. } | ClientFrame::Unsubscribe { .. } => {
                        // Re-subscription after the initial auth frame is not
                        // supported yet; clients reconnect with a new
                        // subscribe list instead.
                    }
                }
            }
            event = async {
                match &mut outbox {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(event) = event else { break };
                let frame: ServerFrame = event.into();
                if socket
                    .send(Message::text(serde_json::to_string(&frame).unwrap_or_default()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    sync_bus.disconnect(client_id).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use jobmux_core::adapter::AdapterRegistry;
    use jobmux_core::coordinator::CoordinatorConfig;
    use jobmux_core::registry::Registry;
    use jobmux_core::scheduler::SchedulerConfig;
    use jobmux_test_utils::{create_test_db, drop_test_db};

    use super::*;

    fn test_coordinator(pool: sqlx::PgPool) -> Arc<Coordinator> {
        Arc::new(Coordinator::new(
            pool,
            Arc::new(Registry::default_catalog()),
            Arc::new(AdapterRegistry::new()),
            SchedulerConfig {
                poll_interval: Duration::from_millis(20),
                ..SchedulerConfig::default()
            },
            HashMap::new(),
            CoordinatorConfig {
                terminal_poll_interval: Duration::from_secs(3600),
                health_check_interval: Duration::from_secs(3600),
                ..CoordinatorConfig::default()
            },
            None,
            16,
        ))
    }

    async fn send_json_request(
        coordinator: Arc<Coordinator>,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let app = super::build_router(coordinator, Instant::now());
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let mut request = Request::builder().method(method).uri(uri);
        if body.size_hint().exact() != Some(0) {
            request = request.header("content-type", "application/json");
        }
        app.oneshot(request.body(body).unwrap()).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_job_returns_job_id_and_accepted_platforms() {
        let (pool, db_name) = create_test_db().await;
        let coordinator = test_coordinator(pool.clone());

        let resp = send_json_request(
            Arc::clone(&coordinator),
            "POST",
            "/jobs",
            Some(serde_json::json!({
                "query": "rust engineer",
                "platforms": ["linkedin"],
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json.get("job_id").is_some());
        assert_eq!(json["accepted_platforms"], serde_json::json!(["linkedin"]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn submit_job_rejects_empty_query() {
        let (pool, db_name) = create_test_db().await;
        let coordinator = test_coordinator(pool.clone());

        let resp = send_json_request(
            coordinator,
            "POST",
            "/jobs",
            Some(serde_json::json!({ "query": "" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_job_not_found() {
        let (pool, db_name) = create_test_db().await;
        let coordinator = test_coordinator(pool.clone());

        let random_id = Uuid::new_v4();
        let resp = send_json_request(coordinator, "GET", &format!("/jobs/{random_id}"), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cancel_job_round_trip() {
        let (pool, db_name) = create_test_db().await;
        let coordinator = test_coordinator(pool.clone());

        let submit_resp = send_json_request(
            Arc::clone(&coordinator),
            "POST",
            "/jobs",
            Some(serde_json::json!({ "query": "rust", "platforms": ["linkedin"] })),
        )
        .await;
        let submitted = body_json(submit_resp).await;
        let job_id = submitted["job_id"].as_str().unwrap();

        let resp = send_json_request(
            Arc::clone(&coordinator),
            "POST",
            &format!("/jobs/{job_id}/cancel"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["cancelled"], serde_json::json!(true));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn health_reports_ok_with_no_platform_failures() {
        let (pool, db_name) = create_test_db().await;
        let coordinator = test_coordinator(pool.clone());

        let resp = send_json_request(coordinator, "GET", "/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], serde_json::json!("ok"));
        assert_eq!(json["storage_connected"], serde_json::json!(true));

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
