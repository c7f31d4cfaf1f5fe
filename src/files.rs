//! File surface: tree listing and read/write/delete inside a repo or a
//! user's worktree. Every path crosses the containment checks in `paths`.

use std::path::{Path, PathBuf};

use axum::extract::{Extension, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::errors::{GatewayError, GatewayResult};
use crate::models::{FileResponse, TreeEntry, TreeEntryKind, TreeResponse, WriteFileRequest};
use crate::paths;

/// Directories the tree never descends into.
pub const ELIDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "vendor",
    ".next",
    "__pycache__",
    ".venv",
    "coverage",
];

/// Hidden entries the tree still shows.
const HIDDEN_ALLOWLIST: &[&str] = &[
    ".github",
    ".gitignore",
    ".gitattributes",
    ".editorconfig",
    ".env.example",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQuery {
    pub repo_id: String,
    pub path: Option<String>,
    pub branch: Option<String>,
}

/// Root for the operation: the repo itself, or the caller's worktree when a
/// branch is named. Worktree creation is idempotent, so a session's worktree
/// and its file API always agree.
pub async fn effective_root(
    state: &AppState,
    user_email: &str,
    repo_id: &str,
    branch: Option<&str>,
) -> GatewayResult<PathBuf> {
    let repo_root = state.registry.resolve(repo_id)?;
    match branch {
        Some(branch) => {
            let worktrees = state.worktrees.clone();
            let root = repo_root.clone();
            let user = user_email.to_string();
            let branch = branch.to_string();
            tokio::task::spawn_blocking(move || {
                worktrees.ensure_worktree_from_existing(&root, &user, &branch)
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("worktree task failed: {e}")))?
        }
        None => Ok(repo_root),
    }
}

pub async fn get_tree(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<FileQuery>,
) -> GatewayResult<Json<TreeResponse>> {
    let root = effective_root(&state, &user.email, &query.repo_id, query.branch.as_deref()).await?;
    let rel = query.path.unwrap_or_default();
    let dir = if rel.is_empty() {
        root.clone()
    } else {
        paths::resolve_file_path(&root, &rel)?
    };
    if !dir.is_dir() {
        return Err(GatewayError::NotFound(format!("directory '{rel}'")));
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if name.starts_with('.') && !HIDDEN_ALLOWLIST.contains(&name.as_str()) {
            continue;
        }
        if is_dir && ELIDED_DIRS.contains(&name.as_str()) {
            continue;
        }
        entries.push(TreeEntry {
            name,
            kind: if is_dir {
                TreeEntryKind::Dir
            } else {
                TreeEntryKind::File
            },
        });
    }
    entries.sort_by(|a, b| {
        let dir_rank = |e: &TreeEntry| matches!(e.kind, TreeEntryKind::File) as u8;
        dir_rank(a)
            .cmp(&dir_rank(b))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    Ok(Json(TreeResponse { path: rel, entries }))
}

pub async fn get_file(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<FileQuery>,
) -> GatewayResult<Json<FileResponse>> {
    let rel = required_path(&query)?;
    refuse_binary(&rel)?;
    let root = effective_root(&state, &user.email, &query.repo_id, query.branch.as_deref()).await?;
    let target = paths::resolve_file_path(&root, &rel)?;
    if !target.is_file() {
        return Err(GatewayError::NotFound(format!("file '{rel}'")));
    }
    let size = std::fs::metadata(&target)?.len();
    if size > state.config.max_file_size_bytes {
        return Err(GatewayError::FileTooLarge);
    }
    let bytes = tokio::fs::read(&target).await?;
    let content = String::from_utf8_lossy(&bytes).to_string();
    Ok(Json(FileResponse { path: rel, content }))
}

pub async fn put_file(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<FileQuery>,
    Json(body): Json<WriteFileRequest>,
) -> GatewayResult<Json<serde_json::Value>> {
    let rel = required_path(&query)?;
    refuse_binary(&rel)?;
    if body.content.len() as u64 > state.config.max_file_size_bytes {
        return Err(GatewayError::FileTooLarge);
    }
    let root = effective_root(&state, &user.email, &query.repo_id, query.branch.as_deref()).await?;
    let target = paths::resolve_file_path(&root, &rel)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, body.content.as_bytes()).await?;

    state.audit.audit(
        "file_write",
        &user.email,
        serde_json::json!({ "repoId": query.repo_id, "path": rel, "bytes": body.content.len() }),
    );
    Ok(Json(serde_json::json!({ "path": rel })))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<FileQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let rel = required_path(&query)?;
    let root = effective_root(&state, &user.email, &query.repo_id, query.branch.as_deref()).await?;
    let target = paths::resolve_file_path(&root, &rel)?;
    if target.is_dir() {
        return Err(GatewayError::InvalidRequest(
            "refusing to delete a directory".into(),
        ));
    }
    if !target.exists() {
        return Err(GatewayError::NotFound(format!("file '{rel}'")));
    }
    tokio::fs::remove_file(&target).await?;

    state.audit.audit(
        "file_delete",
        &user.email,
        serde_json::json!({ "repoId": query.repo_id, "path": rel }),
    );
    Ok(Json(serde_json::json!({ "path": rel })))
}

fn required_path(query: &FileQuery) -> GatewayResult<String> {
    query
        .path
        .clone()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("missing path".into()))
}

fn refuse_binary(rel: &str) -> GatewayResult<()> {
    let name = Path::new(rel)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(rel);
    if paths::is_binary_by_extension(name) {
        return Err(GatewayError::InvalidRequest(
            "binary files are not served as text".into(),
        ));
    }
    Ok(())
}
