use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use steward_core::{
    load_preferences, save_preferences, Orchestrator, SchedulerHandle, TriggerResponse,
};
use steward_types::{EngineEvent, UserPreferences};

/// Shared state for the supervisor-facing API.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: SchedulerHandle,
    pub health_staleness: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/events", get(events))
        .route("/run", post(trigger_run))
        .route("/preferences", get(get_preferences).put(put_preferences))
        .route("/decisions/{run_id}", get(list_decisions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn healthcheck(State(state): State<AppState>) -> Response {
    let snapshot = state
        .orchestrator
        .health()
        .snapshot(state.health_staleness)
        .await;
    let status = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot)).into_response()
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state
        .orchestrator
        .health()
        .snapshot(state.health_staleness)
        .await;
    let last_run = state.orchestrator.last_run().await;
    Json(json!({
        "agent_state": snapshot.agent_state,
        "healthy": snapshot.healthy,
        "is_running": state.orchestrator.is_running(),
        "last_run": last_run,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct EventFilterQuery {
    run_id: Option<String>,
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let rx = state.orchestrator.events().subscribe();
    let connected = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({})))
            .unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) => {
            if let Some(run_id) = filter.run_id.as_deref() {
                let event_run = event.properties.get("run_id").and_then(|v| v.as_str());
                if event_run != Some(run_id) {
                    return None;
                }
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        // Lagged receivers drop what they missed and keep streaming.
        Err(_) => None,
    });
    connected.chain(live)
}

/// Live run events (state transitions, receipts, run completion) as
/// server-sent events, optionally filtered to one run id.
async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(sse_stream(state, filter))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn trigger_run(State(state): State<AppState>) -> Response {
    match state.scheduler.trigger().await {
        TriggerResponse::Accepted => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted" })),
        )
            .into_response(),
        TriggerResponse::Busy => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a run is already in progress" })),
        )
            .into_response(),
    }
}

async fn get_preferences(State(state): State<AppState>) -> Response {
    match load_preferences(state.orchestrator.state_store()).await {
        Ok(prefs) => Json(prefs).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn put_preferences(
    State(state): State<AppState>,
    Json(prefs): Json<UserPreferences>,
) -> Response {
    if let Err(err) = prefs.validate() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    match save_preferences(state.orchestrator.state_store(), &prefs).await {
        Ok(()) => Json(prefs).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn list_decisions(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.orchestrator.decision_log().read(&run_id).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
