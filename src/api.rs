//! REST API for ambulance routing sessions.
//!
//! Provides endpoints for:
//! - Demo networks and OSM-backed session creation
//! - Session controls (config, capacities, emergencies, base)
//! - Solving and the renderable map payload
//! - Swagger UI at /q/swagger-ui

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{ConfigError, SessionConfig};
use crate::console;
use crate::demo_data::{available_datasets, DemoData};
use crate::dto::{
    CreateSessionRequest, EmergencyDto, ErrorResponse, HealthResponse, InfoResponse, LatLng,
    MapDto, OutcomeDto, PlanDto, RelocateBaseRequest, RouteDto, SessionDto,
};
use crate::network::{Area, NetworkCache, NetworkError};
use crate::session::{RoutingSession, SessionService, SolveInProgress};

/// Application state shared across handlers.
pub struct AppState {
    pub sessions: SessionService,
    pub networks: NetworkCache,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            sessions: SessionService::new(),
            networks: NetworkCache::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors surfaced to API clients as `{ kind, message }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Busy(#[from] SolveInProgress),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::Config(_) => (StatusCode::UNPROCESSABLE_ENTITY, "CONFIGURATION"),
            ApiError::Network(_) => (StatusCode::BAD_GATEWAY, "EXTERNAL_SERVICE"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Busy(_) => (StatusCode::CONFLICT, "SOLVER_BUSY"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        } else {
            warn!(error = %self, "Request rejected");
        }
        let body = ErrorResponse {
            kind,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Creates the API router with CORS and Swagger UI enabled.
pub fn create_router() -> Router {
    router_with_state(Arc::new(AppState::new()))
}

/// Router over existing state.
pub fn router_with_state(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & Info
        .route("/health", get(health))
        .route("/info", get(info))
        // Demo data
        .route("/demo-data", get(list_demo_data))
        .route("/demo-data/{name}/sessions", post(create_demo_session))
        // Sessions
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/config", put(update_config))
        .route("/sessions/{id}/capacities", post(regenerate_capacities))
        .route("/sessions/{id}/emergencies", post(regenerate_emergencies))
        .route("/sessions/{id}/base", post(relocate_base))
        .route("/sessions/{id}/solve", post(solve_session))
        .route("/sessions/{id}/map", get(get_map))
        .merge(SwaggerUi::new("/q/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .with_state(state)
}

fn find(state: &AppState, id: &str) -> Result<Arc<RwLock<RoutingSession>>, ApiError> {
    state
        .sessions
        .get_session(id)
        .ok_or_else(|| ApiError::NotFound(format!("session {}", id)))
}

// ============================================================================
// Health & Info
// ============================================================================

/// GET /health - Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "UP" })
}

/// GET /info - Application info endpoint.
#[utoipa::path(
    get,
    path = "/info",
    responses((status = 200, description = "Application info", body = InfoResponse))
)]
async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: "Ambulance Routing",
        version: env!("CARGO_PKG_VERSION"),
        solver_engine: state.sessions.solver().name(),
    })
}

// ============================================================================
// Session creation
// ============================================================================

/// GET /demo-data - List available demo networks.
#[utoipa::path(
    get,
    path = "/demo-data",
    responses((status = 200, description = "List of demo dataset names", body = Vec<String>))
)]
async fn list_demo_data() -> Json<Vec<&'static str>> {
    Json(available_datasets())
}

/// POST /demo-data/{name}/sessions - Start a session on an offline network.
#[utoipa::path(
    post,
    path = "/demo-data/{name}/sessions",
    params(("name" = String, Path, description = "Demo dataset name")),
    responses(
        (status = 200, description = "Session created", body = SessionDto),
        (status = 404, description = "Dataset not found", body = ErrorResponse),
        (status = 422, description = "Invalid configuration", body = ErrorResponse)
    )
)]
async fn create_demo_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<SessionDto> {
    let demo: DemoData = name
        .parse()
        .map_err(|()| ApiError::NotFound(format!("demo dataset {}", name)))?;
    let network = Arc::new(demo.network());
    console::print_network(demo.name(), network.node_count(), network.edge_count());

    let session = state
        .sessions
        .create_session(demo.name(), network, demo.config())?;
    let dto = SessionDto::from_session(&session.read());
    Ok(Json(dto))
}

/// POST /sessions - Download the street network of an area and start a session.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session created", body = SessionDto),
        (status = 422, description = "Invalid configuration", body = ErrorResponse),
        (status = 502, description = "Map data unavailable", body = ErrorResponse)
    )
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<SessionDto> {
    let config = request.config.unwrap_or_default();
    config.validate()?;

    let area = request.area.unwrap_or_default();
    let network = state.networks.load_or_fetch(&area).await?;
    console::print_network("OSM", network.node_count(), network.edge_count());

    let session = state.sessions.create_session("OSM", network, config)?;
    let dto = SessionDto::from_session(&session.read());
    Ok(Json(dto))
}

/// GET /sessions - List all session IDs.
#[utoipa::path(
    get,
    path = "/sessions",
    responses((status = 200, description = "List of session IDs", body = Vec<String>))
)]
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.sessions.list_sessions())
}

/// GET /sessions/{id} - Session overview.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session retrieved", body = SessionDto),
        (status = 404, description = "Not found", body = ErrorResponse)
    )
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SessionDto> {
    let session = find(&state, &id)?;
    let dto = SessionDto::from_session(&session.read());
    Ok(Json(dto))
}

/// DELETE /sessions/{id} - Close a session.
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session removed", body = SessionDto),
        (status = 404, description = "Not found", body = ErrorResponse)
    )
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SessionDto> {
    let session = state
        .sessions
        .remove_session(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session {}", id)))?;
    let dto = SessionDto::from_session(&session.read());
    Ok(Json(dto))
}

// ============================================================================
// Session controls
// ============================================================================

/// PUT /sessions/{id}/config - Replace the session configuration.
#[utoipa::path(
    put,
    path = "/sessions/{id}/config",
    params(("id" = String, Path, description = "Session ID")),
    request_body = SessionConfig,
    responses(
        (status = 200, description = "Configuration applied", body = SessionDto),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 422, description = "Invalid configuration", body = ErrorResponse)
    )
)]
async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(config): Json<SessionConfig>,
) -> ApiResult<SessionDto> {
    let session = find(&state, &id)?;
    let mut guard = session.write();
    guard.update_config(config)?;
    Ok(Json(SessionDto::from_session(&guard)))
}

/// POST /sessions/{id}/capacities - Draw new street capacities.
#[utoipa::path(
    post,
    path = "/sessions/{id}/capacities",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Capacities regenerated", body = SessionDto),
        (status = 404, description = "Not found", body = ErrorResponse)
    )
)]
async fn regenerate_capacities(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SessionDto> {
    let session = find(&state, &id)?;
    let mut guard = session.write();
    guard.regenerate_capacities()?;
    Ok(Json(SessionDto::from_session(&guard)))
}

/// POST /sessions/{id}/emergencies - Draw new emergencies around the same base.
#[utoipa::path(
    post,
    path = "/sessions/{id}/emergencies",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Emergencies regenerated", body = SessionDto),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 422, description = "Network too small", body = ErrorResponse)
    )
)]
async fn regenerate_emergencies(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SessionDto> {
    let session = find(&state, &id)?;
    let mut guard = session.write();
    guard.regenerate_emergencies()?;
    Ok(Json(SessionDto::from_session(&guard)))
}

/// POST /sessions/{id}/base - Move the ambulance base.
#[utoipa::path(
    post,
    path = "/sessions/{id}/base",
    params(("id" = String, Path, description = "Session ID")),
    request_body = RelocateBaseRequest,
    responses(
        (status = 200, description = "Base moved, emergencies regenerated", body = SessionDto),
        (status = 404, description = "Not found", body = ErrorResponse)
    )
)]
async fn relocate_base(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RelocateBaseRequest>,
) -> ApiResult<SessionDto> {
    let session = find(&state, &id)?;
    let mut guard = session.write();
    guard.relocate_base(request.position.map(|p| (p.lat, p.lng)))?;
    Ok(Json(SessionDto::from_session(&guard)))
}

// ============================================================================
// Solving and map
// ============================================================================

/// POST /sessions/{id}/solve - Route every emergency and return the plan.
#[utoipa::path(
    post,
    path = "/sessions/{id}/solve",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Dispatch plan", body = PlanDto),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Previous solve still running", body = ErrorResponse)
    )
)]
async fn solve_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<PlanDto> {
    let session = find(&state, &id)?;
    let request = session.write().begin_dispatch()?;
    let solver = state.sessions.solver();

    // The session lock is only taken again to store the plan.
    let dto = tokio::task::spawn_blocking(move || {
        let plan = request.run(solver);
        let dto = PlanDto::from_plan(&plan, request.emergencies(), request.network());
        session.write().finish_dispatch(request, plan);
        dto
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(dto))
}

/// GET /sessions/{id}/map - Renderable map payload.
#[utoipa::path(
    get,
    path = "/sessions/{id}/map",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Map payload", body = MapDto),
        (status = 404, description = "Not found", body = ErrorResponse)
    )
)]
async fn get_map(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<MapDto> {
    let session = find(&state, &id)?;
    let dto = MapDto::from_session(&session.read());
    Ok(Json(dto))
}

// ============================================================================
// OpenAPI Documentation
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        info,
        list_demo_data,
        create_demo_session,
        create_session,
        list_sessions,
        get_session,
        delete_session,
        update_config,
        regenerate_capacities,
        regenerate_emergencies,
        relocate_base,
        solve_session,
        get_map,
    ),
    components(schemas(
        HealthResponse,
        InfoResponse,
        ErrorResponse,
        SessionConfig,
        Area,
        LatLng,
        CreateSessionRequest,
        RelocateBaseRequest,
        SessionDto,
        EmergencyDto,
        OutcomeDto,
        RouteDto,
        PlanDto,
        MapDto,
    ))
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlowModel;
    use crate::solver::{LpSolution, LpSolver, MicroLpSolver};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    /// Sleeps on its first call, then solves normally.
    struct SleepyFirstSolver {
        slept: AtomicBool,
        pause: Duration,
    }

    impl LpSolver for SleepyFirstSolver {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        fn solve(&self, model: &FlowModel) -> LpSolution {
            if !self.slept.swap(true, Ordering::SeqCst) {
                std::thread::sleep(self.pause);
            }
            MicroLpSolver.solve(model)
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn demo_session(app: &Router, name: &str) -> String {
        let uri = format!("/demo-data/{}/sessions", name);
        let (status, body) = call(app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let app = create_router();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "UP");

        let (_, body) = call(&app, "GET", "/info", None).await;
        assert_eq!(body["solverEngine"], "microlp");
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let app = create_router();
        let (status, body) = call(&app, "GET", "/sessions/nope/map", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "NOT_FOUND");

        let (status, _) = call(&app, "POST", "/demo-data/ATLANTIS/sessions", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_config_is_unprocessable() {
        let app = create_router();
        let id = demo_session(&app, "GRID").await;
        let uri = format!("/sessions/{}/config", id);
        let config = serde_json::json!({ "capacity": { "minKmh": 90.0, "maxKmh": 10.0 } });

        let (status, body) = call(&app, "PUT", &uri, Some(config)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "CONFIGURATION");
        assert!(body["message"].as_str().unwrap().contains("capacity"));

        let counts = serde_json::json!({ "counts": { "leve": 2147483647, "media": 0, "critica": 0 } });
        let (status, body) = call(&app, "PUT", &uri, Some(counts)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "CONFIGURATION");

        let (_, session) = call(&app, "GET", &format!("/sessions/{}", id), None).await;
        assert_eq!(session["emergencies"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_session_controls_and_solve() {
        let app = create_router();
        let id = demo_session(&app, "GRID").await;

        let config = serde_json::json!({ "counts": { "leve": 1, "media": 0, "critica": 1 }, "seed": 5 });
        let (status, body) = call(&app, "PUT", &format!("/sessions/{}/config", id), Some(config)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["emergencies"].as_array().unwrap().len(), 2);

        let (status, _) = call(&app, "POST", &format!("/sessions/{}/capacities", id), None).await;
        assert_eq!(status, StatusCode::OK);

        let position = serde_json::json!({ "position": { "lat": 6.2433, "lng": -75.5881 } });
        let (status, _) = call(&app, "POST", &format!("/sessions/{}/base", id), Some(position)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, plan) = call(&app, "POST", &format!("/sessions/{}/solve", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plan["outcomes"].as_array().unwrap().len(), 2);

        let (status, map) = call(&app, "GET", &format!("/sessions/{}/map", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(map["plan"].is_object());
        assert_eq!(map["emergencies"][1]["color"], "red");

        let (status, _) = call(&app, "DELETE", &format!("/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, ids) = call(&app, "GET", "/sessions", None).await;
        assert!(ids.as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_session_readable_while_solving() {
        let pause = Duration::from_millis(1500);
        let state = Arc::new(AppState {
            sessions: SessionService::with_solver(Arc::new(SleepyFirstSolver {
                slept: AtomicBool::new(false),
                pause,
            })),
            networks: NetworkCache::new(),
        });
        let app = router_with_state(state);
        let id = demo_session(&app, "DIAMOND").await;

        let solving = {
            let app = app.clone();
            let uri = format!("/sessions/{}/solve", id);
            tokio::spawn(async move { call(&app, "POST", &uri, None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let (status, map) = call(&app, "GET", &format!("/sessions/{}/map", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(map["plan"].is_null());
        assert!(started.elapsed() < pause / 2);

        let (status, body) = call(&app, "POST", &format!("/sessions/{}/solve", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "SOLVER_BUSY");

        let (status, plan) = solving.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plan["outcomes"].as_array().unwrap().len(), 3);

        let (_, map) = call(&app, "GET", &format!("/sessions/{}/map", id), None).await;
        assert!(map["plan"].is_object());
    }
}
