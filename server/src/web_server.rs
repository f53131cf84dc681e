//! Axum HTTP + WebSocket server: session/worker/repository/agent CRUD under
//! /api, the app broadcast channel at /ws/app, per-worker streams at
//! /ws/session/{sid}/worker/{wid}, and optional static SPA serving.

use axum::{
    extract::{
        ws::WebSocketUpgrade,
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use axum::body::Body;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;

use common::agents::{AgentRegistry, NewAgent};
use common::config::Config;
use common::db::{self, Db};
use common::error::CoreError;
use common::git::GitRunner;
use common::lifecycle::{CreateWorkerRequest, WorkerLifecycle};
use common::session::{AppEvent, NewSession, SessionManager, SessionType};

use crate::ws;

/// Shared app state, built in `main` and cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Db,
    pub sessions: Arc<SessionManager>,
    pub lifecycle: Arc<WorkerLifecycle>,
    pub agents: Arc<AgentRegistry>,
    pub git: Arc<dyn GitRunner>,
    pub dist_path: Option<PathBuf>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn err(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

fn core_err(e: CoreError) -> ApiError {
    match e {
        CoreError::InvalidInput(msg) => err(StatusCode::BAD_REQUEST, msg),
        CoreError::NotFound(msg) => err(StatusCode::NOT_FOUND, msg),
        other => err(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/api", get(api_root_handler))
        .route("/api/config", get(config_handler))
        .route(
            "/api/sessions",
            get(list_sessions_handler).post(create_session_handler),
        )
        .route(
            "/api/sessions/{id}",
            get(get_session_handler)
                .delete(delete_session_handler)
                .patch(patch_session_handler),
        )
        .route(
            "/api/sessions/{id}/workers",
            get(list_workers_handler).post(create_worker_handler),
        )
        .route(
            "/api/sessions/{id}/workers/{wid}",
            axum::routing::delete(delete_worker_handler),
        )
        .route(
            "/api/sessions/{id}/workers/{wid}/restart",
            post(restart_worker_handler),
        )
        .route(
            "/api/repositories",
            get(list_repositories_handler).post(create_repository_handler),
        )
        .route(
            "/api/repositories/{id}",
            axum::routing::delete(delete_repository_handler),
        )
        .route(
            "/api/repositories/{id}/worktrees",
            get(list_worktrees_handler).post(create_worktree_handler),
        )
        .route(
            "/api/repositories/{id}/worktrees/{*path}",
            axum::routing::delete(delete_worktree_handler),
        )
        .route(
            "/api/agents",
            get(list_agents_handler).post(create_agent_handler),
        )
        .route(
            "/api/agents/{id}",
            axum::routing::patch(patch_agent_handler).delete(delete_agent_handler),
        )
        .route("/api/system/open", post(system_open_handler))
        .route("/ws/app", get(ws_app_handler))
        .route(
            "/ws/session/{sid}/worker/{wid}",
            get(ws_worker_handler),
        );

    if let Some(dist) = &state.dist_path {
        let assets = dist.join("assets");
        app = app
            .nest_service("/assets", ServeDir::new(assets))
            .fallback(any(spa_fallback_handler));
    }
    app.with_state(state)
}

/// Runs the server on 127.0.0.1 (localhost only) until shutdown is requested.
pub async fn run_web_server(
    port: u16,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), anyhow::Error> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "agent console listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn spa_fallback_handler(State(state): State<AppState>) -> Response {
    let Some(dist) = &state.dist_path else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let index = dist.join("index.html");
    match tokio::fs::read_to_string(&index).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Body::from(content))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read index.html");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn api_root_handler() -> Json<serde_json::Value> {
    Json(json!({"message": "Agent Console API"}))
}

/// Advertises the home dir and this server's pid; clients compare the pid
/// against cached terminal snapshots to detect a restart.
async fn config_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "homeDir": state.config.home.to_string_lossy(),
        "serverPid": state.sessions.server_pid(),
    }))
}

// -- sessions --

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    #[serde(rename = "type", default)]
    session_type: String,
    #[serde(default)]
    location_path: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    repository_id: Option<String>,
    #[serde(default)]
    worktree_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    initial_prompt: Option<String>,
}

async fn list_sessions_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"sessions": state.sessions.list_public()}))
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(session_type) = SessionType::parse(&body.session_type) else {
        return Err(err(
            StatusCode::BAD_REQUEST,
            format!("unknown session type: {}", body.session_type),
        ));
    };
    let location = body.location_path.trim();
    if location.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "locationPath is required"));
    }
    let location_path = PathBuf::from(location);
    if !location_path.exists() {
        return Err(err(
            StatusCode::BAD_REQUEST,
            format!("Path does not exist: {location}"),
        ));
    }
    if let Some(branch) = &body.worktree_id {
        if branch.trim().is_empty() {
            return Err(err(StatusCode::BAD_REQUEST, "branch must not be empty"));
        }
    }
    let session = state
        .sessions
        .create_session(NewSession {
            session_type,
            location_path,
            repository_id: body.repository_id,
            worktree_id: body.worktree_id,
            title: body.title,
            initial_prompt: body.initial_prompt.clone(),
        })
        .map_err(core_err)?;

    // A session opens with one agent worker driving the configured agent.
    let created = state
        .lifecycle
        .create_worker(
            &session.id,
            CreateWorkerRequest {
                worker_type: "agent".into(),
                name: None,
                agent_id: body.agent_id,
                base_commit: None,
            },
            false,
            body.initial_prompt,
        )
        .await;
    if let Err(e) = created {
        // Roll the empty session back rather than hand out a dead one.
        let _ = state.lifecycle.delete_session(&session.id).await;
        return Err(core_err(e));
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({"session": session.to_public()})),
    ))
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.sessions.get(&id) {
        Some(s) => Ok(Json(json!({"session": s.to_public()}))),
        None => Err(err(StatusCode::NOT_FOUND, "session not found")),
    }
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.lifecycle.delete_session(&id).await.map_err(core_err)? {
        true => Ok(Json(json!({"success": true}))),
        false => Err(err(StatusCode::NOT_FOUND, "session not found")),
    }
}

#[derive(serde::Deserialize)]
struct PatchSessionBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    branch: Option<String>,
}

async fn patch_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchSessionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.title.is_none() && body.branch.is_none() {
        return Err(err(StatusCode::BAD_REQUEST, "nothing to update"));
    }
    if let Some(branch) = &body.branch {
        if branch.trim().is_empty() {
            return Err(err(StatusCode::BAD_REQUEST, "branch must not be empty"));
        }
    }
    let Some(session) = state.sessions.get(&id) else {
        return Err(err(StatusCode::NOT_FOUND, "session not found"));
    };

    // A branch patch renames the worktree branch in git first.
    if let Some(branch) = &body.branch {
        if session.session_type != SessionType::Worktree {
            return Err(err(
                StatusCode::BAD_REQUEST,
                "branch can only be changed on worktree sessions",
            ));
        }
        let current = state
            .git
            .current_branch(&session.location_path)
            .await
            .map_err(core_err)?;
        if &current != branch {
            state
                .git
                .rename_branch(&session.location_path, &current, branch)
                .await
                .map_err(core_err)?;
        }
    }
    let patched = state
        .sessions
        .patch_session(&id, body.title, body.branch)
        .map_err(core_err)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "session not found"))?;
    Ok(Json(json!({"session": patched})))
}

// -- workers --

async fn list_workers_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.sessions.get(&id) {
        Some(s) => Ok(Json(json!({"workers": s.to_public().workers}))),
        None => Err(err(StatusCode::NOT_FOUND, "session not found")),
    }
}

async fn create_worker_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateWorkerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match state
        .lifecycle
        .create_worker(&id, body, false, None)
        .await
        .map_err(core_err)?
    {
        Some(worker) => Ok((StatusCode::CREATED, Json(json!({"worker": worker})))),
        None => Err(err(StatusCode::NOT_FOUND, "session not found")),
    }
}

async fn delete_worker_handler(
    State(state): State<AppState>,
    Path((id, wid)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state
        .lifecycle
        .delete_worker(&id, &wid)
        .await
        .map_err(core_err)?
    {
        true => Ok(Json(json!({"success": true}))),
        false => Err(err(StatusCode::NOT_FOUND, "worker not found")),
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartWorkerBody {
    #[serde(default)]
    continue_conversation: bool,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    branch: Option<String>,
}

async fn restart_worker_handler(
    State(state): State<AppState>,
    Path((id, wid)): Path<(String, String)>,
    Json(body): Json<RestartWorkerBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state
        .lifecycle
        .restart_agent_worker(&id, &wid, body.continue_conversation, body.agent_id, body.branch)
        .await
        .map_err(core_err)?
    {
        Some(worker) => Ok(Json(json!({"worker": worker}))),
        None => Err(err(StatusCode::NOT_FOUND, "worker not found")),
    }
}

// -- repositories --

#[derive(serde::Deserialize)]
struct CreateRepositoryBody {
    #[serde(default)]
    path: String,
}

async fn list_repositories_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repos = state.db.with(db::list_repositories).map_err(core_err)?;
    Ok(Json(json!({"repositories": repos})))
}

async fn create_repository_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateRepositoryBody>,
) -> Result<impl IntoResponse, ApiError> {
    let path = body.path.trim();
    if path.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "path is required"));
    }
    let path_buf = PathBuf::from(path);
    if !path_buf.is_dir() {
        return Err(err(
            StatusCode::BAD_REQUEST,
            format!("Path does not exist: {path}"),
        ));
    }
    if !state.git.is_git_repo(&path_buf).await {
        return Err(err(
            StatusCode::BAD_REQUEST,
            format!("Not a git repository: {path}"),
        ));
    }
    if state
        .db
        .with(|c| db::get_repository_by_path(c, path))
        .map_err(core_err)?
        .is_some()
    {
        return Err(err(
            StatusCode::BAD_REQUEST,
            format!("Repository already registered: {path}"),
        ));
    }
    let name = path_buf
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let now = db::now_rfc3339();
    let row = db::RepositoryRow {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        path: path.to_string(),
        description: None,
        setup_command: None,
        cleanup_command: None,
        env_vars: None,
        default_agent_id: None,
        created_at: now.clone(),
        updated_at: now,
    };
    state
        .db
        .with(|c| db::insert_repository(c, &row))
        .map_err(core_err)?;
    state.sessions.emit(AppEvent::RepositoryCreated(row.clone()));
    Ok((StatusCode::CREATED, Json(json!({"repository": row}))))
}

async fn delete_repository_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state
        .db
        .with(|c| db::delete_repository(c, &id))
        .map_err(core_err)?;
    if !deleted {
        return Err(err(StatusCode::NOT_FOUND, "repository not found"));
    }
    state.sessions.emit(AppEvent::RepositoryDeleted { repository_id: id });
    Ok(Json(json!({"success": true})))
}

// -- worktrees --

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorktreeBody {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    initial_prompt: Option<String>,
}

async fn list_worktrees_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state
        .db
        .with(|c| db::get_repository(c, &id))
        .map_err(core_err)?
        .is_none()
    {
        return Err(err(StatusCode::NOT_FOUND, "repository not found"));
    }
    let worktrees = state
        .db
        .with(|c| db::list_worktrees(c, &id))
        .map_err(core_err)?;
    Ok(Json(json!({"worktrees": worktrees})))
}

async fn create_worktree_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateWorktreeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(repo) = state
        .db
        .with(|c| db::get_repository(c, &id))
        .map_err(core_err)?
    else {
        return Err(err(StatusCode::NOT_FOUND, "repository not found"));
    };
    let create_branch = match body.mode.as_str() {
        "new" => true,
        "existing" => false,
        other => {
            return Err(err(
                StatusCode::BAD_REQUEST,
                format!("unknown worktree mode: {other}"),
            ))
        }
    };
    let index = state
        .db
        .with(|c| db::next_worktree_index(c, &id))
        .map_err(core_err)?;
    let branch = match (&body.branch, create_branch) {
        (Some(b), _) if !b.trim().is_empty() => b.trim().to_string(),
        (_, true) => format!("worktree-{index}"),
        (_, false) => {
            return Err(err(
                StatusCode::BAD_REQUEST,
                "branch is required for existing mode",
            ))
        }
    };
    let repo_path = PathBuf::from(&repo.path);
    let worktree_path = PathBuf::from(format!("{}-worktrees", repo.path)).join(&branch);
    state
        .git
        .add_worktree(&repo_path, &worktree_path, &branch, create_branch)
        .await
        .map_err(core_err)?;
    let row = db::WorktreeRow {
        id: uuid::Uuid::new_v4().to_string(),
        repository_id: id,
        path: worktree_path.to_string_lossy().into_owned(),
        index_number: index,
        created_at: db::now_rfc3339(),
    };
    state
        .db
        .with(|c| db::insert_worktree(c, &row))
        .map_err(core_err)?;
    let _ = body.initial_prompt;
    Ok((StatusCode::CREATED, Json(json!({"worktree": row}))))
}

async fn delete_worktree_handler(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(repo) = state
        .db
        .with(|c| db::get_repository(c, &id))
        .map_err(core_err)?
    else {
        return Err(err(StatusCode::NOT_FOUND, "repository not found"));
    };
    let decoded = urldecode(&path);
    if decoded.trim().is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "invalid worktree path"));
    }
    let worktree_path = PathBuf::from(&decoded);
    if let Err(e) = state
        .git
        .remove_worktree(&PathBuf::from(&repo.path), &worktree_path)
        .await
    {
        tracing::warn!(path = %decoded, error = %e, "git worktree remove failed, deleting record anyway");
    }
    state
        .db
        .with(|c| db::delete_worktree_by_path(c, &decoded))
        .map_err(core_err)?;
    Ok(Json(json!({"success": true})))
}

/// Percent-decode a URL path segment; leaves malformed escapes in place.
fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(v) = hex {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// -- agents --

async fn list_agents_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"agents": state.agents.list()}))
}

async fn create_agent_handler(
    State(state): State<AppState>,
    Json(body): Json<NewAgent>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state.agents.register(body).map_err(core_err)?;
    state.sessions.emit(AppEvent::AgentCreated(agent.clone()));
    Ok((StatusCode::CREATED, Json(json!({"agent": agent}))))
}

async fn patch_agent_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NewAgent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.agents.update(&id, body).map_err(core_err)? {
        Some(agent) => {
            state.sessions.emit(AppEvent::AgentUpdated(agent.clone()));
            Ok(Json(json!({"agent": agent})))
        }
        None => Err(err(StatusCode::NOT_FOUND, "agent not found")),
    }
}

async fn delete_agent_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.agents.delete(&id).map_err(core_err)? {
        true => {
            state.sessions.emit(AppEvent::AgentDeleted { agent_id: id });
            Ok(Json(json!({"success": true})))
        }
        false => Err(err(StatusCode::NOT_FOUND, "agent not found")),
    }
}

// -- system --

#[derive(serde::Deserialize)]
struct SystemOpenBody {
    #[serde(default)]
    path: Option<String>,
}

/// Open a path in the OS file manager.
async fn system_open_handler(
    Json(body): Json<SystemOpenBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(path) = body.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) else {
        return Err(err(StatusCode::BAD_REQUEST, "path is required"));
    };
    if !std::path::Path::new(path).exists() {
        return Err(err(
            StatusCode::NOT_FOUND,
            format!("Path does not exist: {path}"),
        ));
    }
    #[cfg(target_os = "macos")]
    let opener = "open";
    #[cfg(not(target_os = "macos"))]
    let opener = "xdg-open";
    match std::process::Command::new(opener).arg(path).spawn() {
        Ok(_) => Ok(Json(json!({"success": true}))),
        Err(e) => Err(err(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to open path: {e}"),
        )),
    }
}

// -- websockets --

async fn ws_app_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_app_socket(socket, state))
}

async fn ws_worker_handler(
    State(state): State<AppState>,
    Path((sid, wid)): Path<(String, String)>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_worker_socket(socket, state, sid, wid))
}
