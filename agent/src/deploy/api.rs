//! REST control plane for the deployment server
//!
//! Thin HTTP boundary over the supervisor, installer, and store. The
//! supervisor speaks in `Option<bool>`; this layer translates that into
//! status codes: unknown name -> 404, operation failed -> 500 with the
//! instance's diagnostics, success -> 200.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::package::{InstallError, InstallOutcome, Installer};
use super::store::{DeploymentEvent, MetadataStore, StoreStats};
use super::supervisor::{AgentInstance, Supervisor};
use crate::config::DeploymentServerConfig;

/// Uploaded archives are capped at 256 MiB
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(format!("unknown agent '{}'", what))),
    )
}

fn internal(msg: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(msg)),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub installer: Arc<Installer>,
    pub store: MetadataStore,
}

/// Start the control-plane HTTP server. Runs until the task is aborted.
/// The API port was already resolved at config load.
pub async fn serve(config: &DeploymentServerConfig, state: AppState) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.api_port);
    tracing::info!("Deployment API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route("/status/:agent_name", get(agent_status))
        .route("/check", post(check_deployed))
        .route("/deploy", post(deploy))
        .route("/start", post(start_agent))
        .route("/stop", post(stop_agent))
        .route("/restart", post(restart_agent))
        .route("/history/:agent_name", get(agent_history))
        .route("/stats", get(stats))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    agents: usize,
    running: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let agents = state.supervisor.list().await;
    let running = agents
        .iter()
        .filter(|a| a.status == super::supervisor::AgentStatus::Running)
        .count();
    Json(HealthResponse {
        status: "ok".to_string(),
        agents: agents.len(),
        running,
    })
}

#[derive(Debug, Serialize)]
struct AgentsListResponse {
    agents: Vec<AgentInstance>,
    total: usize,
}

async fn list_agents(State(state): State<AppState>) -> Json<AgentsListResponse> {
    let agents = state.supervisor.list().await;
    let total = agents.len();
    Json(AgentsListResponse { agents, total })
}

async fn agent_status(
    State(state): State<AppState>,
    Path(agent_name): Path<String>,
) -> Result<Json<AgentInstance>, ApiError> {
    match state.supervisor.get(&agent_name).await {
        Some(instance) => Ok(Json(instance)),
        None => Err(not_found(&agent_name)),
    }
}

#[derive(Debug, Deserialize)]
struct CheckParams {
    checksum: String,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    deployed: bool,
    running: bool,
    agent_name: Option<String>,
}

/// Pre-upload probe: has this exact archive been deployed already, and
/// is it currently running?
async fn check_deployed(
    State(state): State<AppState>,
    Query(params): Query<CheckParams>,
) -> Json<CheckResponse> {
    match state.store.get_agent_by_checksum(&params.checksum) {
        Some(record) => {
            let running = state
                .supervisor
                .get(&record.name)
                .await
                .map(|i| i.status == super::supervisor::AgentStatus::Running)
                .unwrap_or(false);
            Json(CheckResponse {
                deployed: true,
                running,
                agent_name: Some(record.name),
            })
        }
        None => Json(CheckResponse {
            deployed: false,
            running: false,
            agent_name: None,
        }),
    }
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    agent_name: String,
    checksum: String,
    already_installed: bool,
}

/// Multipart upload: a `package` (or `file`) part with the archive
/// bytes (ZIP or tar.gz) and an optional `force` part ("true" to
/// replace a name conflict).
async fn deploy(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<DeployResponse>, ApiError> {
    let mut archive: Option<Vec<u8>> = None;
    let mut force = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(e.to_string()))))?
    {
        match field.name() {
            Some("package") | Some("file") => {
                let bytes = field.bytes().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(e.to_string())))
                })?;
                archive = Some(bytes.to_vec());
            }
            Some("force") => {
                let value = field.text().await.unwrap_or_default();
                force = value.trim().eq_ignore_ascii_case("true");
            }
            _ => {}
        }
    }

    let archive = archive.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("missing 'package' field")),
        )
    })?;

    let outcome = state
        .installer
        .install(&archive, force, &state.store)
        .await
        .map_err(install_error_to_api)?;

    let already_installed = matches!(outcome, InstallOutcome::AlreadyInstalled { .. });
    let name = outcome.name().to_string();
    let checksum = outcome.checksum().to_string();

    if !already_installed {
        let config_path = state
            .installer
            .definition_path(&name)
            .ok_or_else(|| internal("installed agent has no definition file"))?;
        state
            .supervisor
            .register(&name, config_path, Some(checksum.clone()))
            .await;
    }

    Ok(Json(DeployResponse {
        agent_name: name,
        checksum,
        already_installed,
    }))
}

fn install_error_to_api(err: InstallError) -> ApiError {
    let status = match &err {
        InstallError::InvalidArchive(_) | InstallError::InvalidDefinition(_) => {
            StatusCode::BAD_REQUEST
        }
        InstallError::Conflict { .. } => StatusCode::CONFLICT,
        InstallError::DependencyInstall(_) | InstallError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ErrorResponse::new(err.to_string())))
}

#[derive(Debug, Deserialize)]
struct AgentActionRequest {
    agent_name: String,
}

#[derive(Debug, Serialize)]
struct AgentActionResponse {
    agent_name: String,
    status: String,
    port: Option<u16>,
    pid: Option<u32>,
}

async fn action_response(
    state: &AppState,
    agent_name: &str,
    result: Option<bool>,
) -> Result<Json<AgentActionResponse>, ApiError> {
    match result {
        None => Err(not_found(agent_name)),
        Some(true) => {
            let instance = state
                .supervisor
                .get(agent_name)
                .await
                .ok_or_else(|| not_found(agent_name))?;
            Ok(Json(AgentActionResponse {
                agent_name: agent_name.to_string(),
                status: instance.status.to_string(),
                port: instance.port,
                pid: instance.pid,
            }))
        }
        Some(false) => {
            let detail = state
                .supervisor
                .get(agent_name)
                .await
                .and_then(|i| i.error_message)
                .unwrap_or_else(|| "operation failed".to_string());
            Err(internal(detail))
        }
    }
}

async fn start_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentActionRequest>,
) -> Result<Json<AgentActionResponse>, ApiError> {
    let result = state.supervisor.start(&req.agent_name).await;
    action_response(&state, &req.agent_name, result).await
}

async fn stop_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentActionRequest>,
) -> Result<Json<AgentActionResponse>, ApiError> {
    let result = state.supervisor.stop(&req.agent_name).await;
    action_response(&state, &req.agent_name, result).await
}

async fn restart_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentActionRequest>,
) -> Result<Json<AgentActionResponse>, ApiError> {
    let result = state.supervisor.restart(&req.agent_name).await;
    action_response(&state, &req.agent_name, result).await
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    agent_name: String,
    events: Vec<DeploymentEvent>,
}

async fn agent_history(
    State(state): State<AppState>,
    Path(agent_name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    if state.supervisor.get(&agent_name).await.is_none() {
        return Err(not_found(&agent_name));
    }
    let events = state
        .store
        .get_history(Some(&agent_name), params.limit.unwrap_or(50) as usize);
    Ok(Json(HistoryResponse { agent_name, events }))
}

async fn stats(State(state): State<AppState>) -> Json<StoreStats> {
    Json(state.store.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentServerConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(agents_dir: &std::path::Path) -> AppState {
        let store = MetadataStore::open_in_memory().unwrap();
        let config = DeploymentServerConfig {
            agents_directory: agents_dir.to_path_buf(),
            base_port: 19700,
            start_grace_ms: 200,
            ..Default::default()
        };
        AppState {
            supervisor: Supervisor::new(config, store.clone()),
            installer: Arc::new(Installer::new(agents_dir.to_path_buf())),
            store,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(dir.path()));

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["agents"], 0);
    }

    #[tokio::test]
    async fn test_status_unknown_agent_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(dir.path()));

        let response = app
            .oneshot(Request::get("/status/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_start_unknown_agent_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::post("/start")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"agent_name": "ghost"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_check_unknown_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::post("/check?checksum=abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["deployed"], false);
    }

    #[tokio::test]
    async fn test_agents_list_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(dir.path()));

        let response = app
            .oneshot(Request::get("/agents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total"], 0);
    }
}
