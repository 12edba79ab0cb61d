//! # Status and control surface
//!
//! A small axum server wrapping a scan run: start a batch against a target,
//! stop it, and watch progress counters and the inferred state graph while
//! it crawls. CORS is wide open: this surface exists for development
//! dashboards, not production exposure.
//!
//! | Route | Method | Returns |
//! |-------|--------|---------|
//! | `/start` | POST | `{status}`; spawns a run for `{batch_name, target_url}` |
//! | `/stop` | GET | `{status}`; cancels the active run |
//! | `/endpoints` | GET | `{available, visited}` |
//! | `/interactions` | GET | `{count}` |
//! | `/state_graph` | GET | `{nodes, edges, current_state_id}` |

use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use statecrawl::config::Config;
use statecrawl::scan::{start_scan, ScanHandle};
use statecrawl::store::{Store, StoreFactory};

/// One running (or finished) scan.
struct ActiveRun {
    batch_name: String,
    store: Arc<dyn Store>,
    handle: ScanHandle,
}

/// Shared server state: the configuration, the store factory and the
/// currently active run, if any.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    factory: Arc<dyn StoreFactory>,
    run: Arc<Mutex<Option<ActiveRun>>>,
}

impl AppState {
    /// Create server state around a config and a store factory.
    pub fn new(config: Arc<Config>, factory: Arc<dyn StoreFactory>) -> Self {
        Self {
            config,
            factory,
            run: Arc::new(Mutex::new(None)),
        }
    }
}

/// Build the router with every status route and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start_run))
        .route("/stop", get(stop_run))
        .route("/endpoints", get(endpoints))
        .route("/interactions", get(interactions))
        .route("/state_graph", get(state_graph))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState) -> statecrawl::Result<()> {
    let bind_addr = state.config.api.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| statecrawl::Error::config(format!("cannot bind '{bind_addr}': {e}")))?;
    info!(addr = %bind_addr, "status surface listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| statecrawl::Error::store(format!("server error: {e}")))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    batch_name: String,
    target_url: String,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_name: Option<String>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn internal_error(e: &statecrawl::Error) -> ApiError {
    error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

fn no_active_run() -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "no active run" })),
    )
}

async fn start_run(
    AxumState(state): AxumState<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let mut run = state.run.lock().await;

    if let Some(active) = run.as_ref() {
        if !active.handle.is_finished() {
            return Ok(Json(StartResponse {
                status: "Already running".to_string(),
                batch_name: Some(active.batch_name.clone()),
            }));
        }
    }

    let store = state
        .factory
        .open(&request.batch_name)
        .await
        .map_err(|e| internal_error(&e))?;
    let handle = start_scan(
        Arc::clone(&state.config),
        Arc::clone(&store),
        &request.target_url,
    )
    .await
    .map_err(|e| internal_error(&e))?;

    info!(batch = %request.batch_name, target = %request.target_url, "run started");
    *run = Some(ActiveRun {
        batch_name: request.batch_name,
        store,
        handle,
    });

    Ok(Json(StartResponse {
        status: "Started".to_string(),
        batch_name: None,
    }))
}

async fn stop_run(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut run = state.run.lock().await;
    match run.take() {
        Some(active) => {
            active.handle.stop();
            info!(batch = %active.batch_name, "run stopped");
            Ok(Json(json!({ "status": "Stopped" })))
        }
        None => Ok(Json(json!({ "status": "Already stopped" }))),
    }
}

async fn endpoints(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state.run.lock().await;
    let active = run.as_ref().ok_or_else(no_active_run)?;

    let available = active
        .store
        .count_endpoints_available()
        .await
        .map_err(|e| internal_error(&e))?;
    let visited = active
        .store
        .count_endpoints_visited()
        .await
        .map_err(|e| internal_error(&e))?;
    Ok(Json(json!({ "available": available, "visited": visited })))
}

async fn interactions(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state.run.lock().await;
    let active = run.as_ref().ok_or_else(no_active_run)?;

    let count = active
        .store
        .count_interactions()
        .await
        .map_err(|e| internal_error(&e))?;
    Ok(Json(json!({ "count": count })))
}

async fn state_graph(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state.run.lock().await;
    let active = run.as_ref().ok_or_else(no_active_run)?;

    let states = active
        .store
        .states_matching(None, Some(false))
        .await
        .map_err(|e| internal_error(&e))?;
    let current_state_id = active
        .store
        .get_current_state_id()
        .await
        .map_err(|e| internal_error(&e))?;

    let live_ids: Vec<&str> = states.iter().map(|s| s.id.as_str()).collect();
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for state in &states {
        nodes.push(json!({
            "id": state.id,
            "label": if state.initial { "Initial state" } else { "State" },
            "initial": state.initial,
            "current": state.current,
            "explored": state.explored,
            "fuzzed": state.fuzzed,
        }));
        if live_ids.contains(&state.previous_state_id.as_str()) {
            edges.push(json!({
                "from": state.previous_state_id,
                "to": state.id,
                "caused_by_interaction_id": state.caused_by_interaction_id,
            }));
        }
        for reachability in &state.reachable_from {
            edges.push(json!({
                "from": reachability.from_state_id,
                "to": state.id,
                "caused_by_interaction_id": reachability.caused_by_interaction_id,
            }));
        }
    }

    Ok(Json(json!({
        "nodes": nodes,
        "edges": edges,
        "current_state_id": current_state_id,
    })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use statecrawl::model::{State, StateReachability};
    use statecrawl::store::{MemoryStore, MemoryStoreFactory};
    use tower::util::ServiceExt;

    fn app_state() -> AppState {
        AppState::new(
            Arc::new(Config::default()),
            Arc::new(MemoryStoreFactory::default()),
        )
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_stop_without_run() {
        let app = router(app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "Already stopped");
    }

    #[tokio::test]
    async fn test_counters_require_active_run() {
        let app = router(app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/endpoints")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_state_graph_includes_reachability_edges() {
        let state = app_state();
        let store = Arc::new(MemoryStore::new());

        let root_id = store.add_state(State::initial()).await.unwrap();
        let mut child = State::new(root_id.as_str(), "cause-1");
        child.reachable_from.push(StateReachability {
            from_state_id: root_id.clone(),
            caused_by_interaction_id: "cause-2".to_string(),
        });
        let child_id = store.add_state(child).await.unwrap();

        // Install a run by hand so the read endpoints have data to serve.
        // The spawned scan targets nothing routable and is stopped at once;
        // the graph route reads only the store.
        {
            let config = Arc::new(Config::default());
            let scratch: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let handle = statecrawl::scan::start_scan(
                Arc::clone(&config),
                Arc::clone(&scratch),
                "http://127.0.0.1:1",
            )
            .await
            .expect("spawn scan");
            handle.stop();
            *state.run.lock().await = Some(ActiveRun {
                batch_name: "graph-test".to_string(),
                store: Arc::clone(&store) as Arc<dyn Store>,
                handle,
            });
        }

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/state_graph")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;

        let nodes = body["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);

        let edges = body["edges"].as_array().unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().any(|e| {
            e["from"] == serde_json::Value::String(root_id.clone())
                && e["to"] == serde_json::Value::String(child_id.clone())
                && e["caused_by_interaction_id"] == "cause-1"
        }));
        assert!(edges
            .iter()
            .any(|e| e["caused_by_interaction_id"] == "cause-2"));

        assert_eq!(body["current_state_id"], serde_json::Value::String(root_id));
    }
}
