//! HTTP router assembly and the session management surface.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::audit::AuditSink;
use crate::auth::{auth_gate, AuthUser, IdentityGate};
use crate::config::Config;
use crate::errors::{GatewayError, GatewayResult};
use crate::models::{CreateSessionRequest, RenameSessionRequest, SessionTab, SessionTabs};
use crate::repos::RepoRegistry;
use crate::sessions::SessionManager;
use crate::settings::SettingsStore;
use crate::tasks::TaskRunner;
use crate::worktrees::WorktreeManager;
use crate::{files, git_api, search, tasks, term_ws};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<RepoRegistry>,
    pub worktrees: Arc<WorktreeManager>,
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<IdentityGate>,
    pub settings: Arc<SettingsStore>,
    pub audit: Arc<AuditSink>,
    pub tasks: Arc<TaskRunner>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([http::header::CONTENT_TYPE])
        .allow_origin(HeaderValue::from_static("*"));

    let api = Router::new()
        .route("/api/repos", get(list_repos))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/all", get(list_all_sessions))
        .route(
            "/api/sessions/{id}",
            axum::routing::delete(delete_session).patch(rename_session),
        )
        .route("/api/tree", get(files::get_tree))
        .route(
            "/api/file",
            get(files::get_file)
                .put(files::put_file)
                .delete(files::delete_file),
        )
        .route("/api/search", post(search::search))
        .route("/api/git/status", get(git_api::status))
        .route("/api/git/diff", get(git_api::diff))
        .route("/api/git/log", get(git_api::log))
        .route("/api/git/branches", get(git_api::branches))
        .route("/api/git/checkout", post(git_api::checkout))
        .route("/api/worktrees", get(list_worktrees).delete(delete_worktree))
        .route("/api/admin/settings", get(get_settings).put(put_settings))
        .route("/api/tasks", get(tasks::list).post(tasks::start))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate));

    Router::new()
        .route("/healthz", get(health))
        // WS routes authenticate inside the handler so failures map to the
        // protocol's close codes instead of HTTP rejections.
        .route("/ws/claude", get(term_ws::ws_claude))
        .route("/ws/tasks", get(tasks::ws_tasks))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.total_sessions(),
    }))
}

async fn list_repos(
    State(state): State<AppState>,
    Extension(_user): Extension<AuthUser>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "repos": state.registry.discover() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoScope {
    repo_id: String,
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(scope): Query<RepoScope>,
) -> GatewayResult<Json<SessionTabs>> {
    state.registry.resolve(&scope.repo_id)?;
    let tabs = state
        .sessions
        .list_for_user_repo(&user.email, &scope.repo_id)
        .iter()
        .map(|s| s.to_tab())
        .collect();
    Ok(Json(SessionTabs { tabs }))
}

async fn list_all_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Json<SessionTabs> {
    let tabs = state
        .sessions
        .list_for_user(&user.email)
        .iter()
        .map(|s| s.to_tab())
        .collect();
    Json(SessionTabs { tabs })
}

async fn create_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateSessionRequest>,
) -> GatewayResult<(StatusCode, Json<SessionTab>)> {
    let repo_root = state.registry.resolve(&request.repo_id)?;
    // Capacity gates before the worktree is materialized; a rejected create
    // must leave no branch or checkout behind.
    state.sessions.capacity_check(&user.email)?;

    let workdir = match request.branch.as_deref() {
        Some(branch) => {
            if branch.len() > term_ws::MAX_BRANCH_PARAM {
                return Err(GatewayError::InvalidRequest("branch name too long".into()));
            }
            let worktrees = state.worktrees.clone();
            let email = user.email.clone();
            let branch = branch.to_string();
            tokio::task::spawn_blocking(move || {
                worktrees.ensure_worktree_from_existing(&repo_root, &email, &branch)
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("worktree task failed: {e}")))??
        }
        None => repo_root,
    };

    let session = state.sessions.create(
        &user.email,
        &request.repo_id,
        request.branch.clone(),
        workdir,
        request.name.clone(),
        request.cols,
        request.rows,
    )?;

    state.audit.audit(
        "session_create",
        &user.email,
        serde_json::json!({
            "repoId": request.repo_id,
            "sessionId": session.id,
            "branch": request.branch,
        }),
    );
    Ok((StatusCode::CREATED, Json(session.to_tab())))
}

/// Owner check: a session that is not yours is indistinguishable from one
/// that does not exist.
fn owned_session(
    state: &AppState,
    user: &AuthUser,
    session_id: &str,
) -> GatewayResult<Arc<crate::sessions::Session>> {
    state
        .sessions
        .get(session_id)
        .filter(|s| s.user_email == user.email)
        .ok_or_else(|| GatewayError::NotFound(format!("session '{session_id}'")))
}

async fn delete_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<String>,
) -> GatewayResult<StatusCode> {
    owned_session(&state, &user, &session_id)?;
    state.sessions.terminate(&session_id, "terminated").await;
    state.audit.audit(
        "session_delete",
        &user.email,
        serde_json::json!({ "sessionId": session_id }),
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn rename_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<String>,
    Json(request): Json<RenameSessionRequest>,
) -> GatewayResult<Json<SessionTab>> {
    let session = owned_session(&state, &user, &session_id)?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(GatewayError::InvalidRequest("empty session name".into()));
    }
    session.set_name(name.to_string());
    Ok(Json(session.to_tab()))
}

async fn list_worktrees(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(scope): Query<RepoScope>,
) -> GatewayResult<Json<serde_json::Value>> {
    let repo_root = state.registry.resolve(&scope.repo_id)?;
    let worktrees = state.worktrees.list_for_user(&repo_root, &user.email);
    Ok(Json(serde_json::json!({ "worktrees": worktrees })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorktreeScope {
    repo_id: String,
    branch: String,
}

/// Worktrees survive session reap; this is the one place they are removed.
async fn delete_worktree(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(scope): Query<WorktreeScope>,
) -> GatewayResult<StatusCode> {
    let repo_root = state.registry.resolve(&scope.repo_id)?;
    crate::worktrees::validate_branch_name(&scope.branch)?;
    let short = crate::worktrees::short_user_id(&user.email);
    let worktree_path = repo_root
        .join(crate::worktrees::WORKTREES_DIR)
        .join(&short)
        .join(&scope.branch);
    if !worktree_path.exists() {
        return Err(GatewayError::NotFound(format!(
            "worktree for '{}'",
            scope.branch
        )));
    }

    let worktrees = state.worktrees.clone();
    tokio::task::spawn_blocking(move || worktrees.cleanup(&repo_root, &worktree_path))
        .await
        .map_err(|e| GatewayError::Internal(format!("worktree task failed: {e}")))?;

    state.audit.audit(
        "worktree_delete",
        &user.email,
        serde_json::json!({ "repoId": scope.repo_id, "branch": scope.branch }),
    );
    Ok(StatusCode::NO_CONTENT)
}

fn require_admin(user: &AuthUser) -> GatewayResult<()> {
    if user.is_admin {
        Ok(())
    } else {
        Err(GatewayError::Forbidden)
    }
}

/// Worktree retention is a fixed property of this build; the admin surface
/// reports it so operators know reaped sessions keep their checkouts.
const WORKTREE_RETENTION: &str = "retain";

async fn get_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> GatewayResult<Json<serde_json::Value>> {
    require_admin(&user)?;
    let settings = state.settings.current();
    Ok(Json(serde_json::json!({
        "settings": settings,
        "worktreeRetention": WORKTREE_RETENTION,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSettingsRequest {
    allowlist_emails: Vec<String>,
    admin_emails: Vec<String>,
}

async fn put_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<UpdateSettingsRequest>,
) -> GatewayResult<Json<serde_json::Value>> {
    require_admin(&user)?;
    let updated = state.settings.update(
        request.allowlist_emails,
        request.admin_emails,
        &user.email,
    )?;
    state.audit.audit(
        "settings_update",
        &user.email,
        serde_json::json!({ "allowlistCount": updated.allowlist_emails.len() }),
    );
    Ok(Json(serde_json::json!({
        "settings": updated,
        "worktreeRetention": WORKTREE_RETENTION,
    })))
}
