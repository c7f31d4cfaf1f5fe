//! Safe git allowlist over a repo or worktree: status, diff, log, branches,
//! and checkout-with-worktree-creation. Everything is parameterized API
//! calls; nothing is interpolated into a shell.

use std::path::{Path, PathBuf};

use axum::extract::{Extension, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use git2::{DiffFormat, DiffOptions, Repository, StatusOptions};
use serde::Deserialize;

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::errors::{GatewayError, GatewayResult};
use crate::files::effective_root;
use crate::models::{CheckoutRequest, CheckoutResponse, GitLogEntry, GitStatusEntry};
use crate::paths;
use crate::worktrees;

pub const MAX_LOG_LIMIT: usize = 100;
const DEFAULT_LOG_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitQuery {
    pub repo_id: String,
    pub branch: Option<String>,
    pub path: Option<String>,
    pub limit: Option<usize>,
    pub commit: Option<String>,
}

fn open_repo(root: &Path) -> GatewayResult<Repository> {
    Repository::open(root).map_err(|_| GatewayError::NotAGitRepo)
}

pub fn validate_commit_hash(hash: &str) -> GatewayResult<()> {
    let ok = (7..=40).contains(&hash.len())
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if ok {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest("invalid commit hash".into()))
    }
}

pub async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<GitQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let root = effective_root(&state, &user.email, &query.repo_id, query.branch.as_deref()).await?;
    let entries = tokio::task::spawn_blocking(move || -> GatewayResult<Vec<GitStatusEntry>> {
        let repo = open_repo(&root)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        let mut entries = Vec::new();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else { continue };
            entries.push(GitStatusEntry {
                path: path.to_string(),
                status: describe_status(entry.status()),
            });
        }
        Ok(entries)
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("git task failed: {e}")))??;

    Ok(Json(serde_json::json!({ "entries": entries })))
}

fn describe_status(status: git2::Status) -> String {
    if status.is_conflicted() {
        "conflicted"
    } else if status.is_wt_new() || status.is_index_new() {
        "new"
    } else if status.is_wt_deleted() || status.is_index_deleted() {
        "deleted"
    } else if status.is_wt_renamed() || status.is_index_renamed() {
        "renamed"
    } else if status.is_wt_typechange() || status.is_index_typechange() {
        "typechange"
    } else {
        "modified"
    }
    .to_string()
}

/// Unified patch of the working tree against HEAD (or a named commit).
pub async fn diff(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<GitQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let root = effective_root(&state, &user.email, &query.repo_id, query.branch.as_deref()).await?;
    let pathspec = match query.path.as_deref() {
        Some(path) => Some(paths::validate_relative_path(path)?),
        None => None,
    };
    if let Some(commit) = query.commit.as_deref() {
        validate_commit_hash(commit)?;
    }
    let commit = query.commit.clone();

    let patch = tokio::task::spawn_blocking(move || -> GatewayResult<String> {
        let repo = open_repo(&root)?;
        let tree = match commit.as_deref() {
            Some(hash) => {
                let oid = repo
                    .revparse_single(hash)
                    .map_err(|_| GatewayError::NotFound(format!("commit '{hash}'")))?
                    .id();
                Some(repo.find_commit(oid)?.tree()?)
            }
            None => match repo.head() {
                Ok(head) => Some(head.peel_to_tree()?),
                Err(_) => None,
            },
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        if let Some(spec) = pathspec {
            opts.pathspec(spec);
        }
        let diff = repo.diff_tree_to_workdir_with_index(tree.as_ref(), Some(&mut opts))?;

        let mut out = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => out.push(line.origin()),
                _ => {}
            }
            out.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(out)
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("git task failed: {e}")))??;

    Ok(Json(serde_json::json!({ "diff": patch })))
}

pub async fn log(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<GitQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let root = effective_root(&state, &user.email, &query.repo_id, query.branch.as_deref()).await?;
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);

    let entries = tokio::task::spawn_blocking(move || -> GatewayResult<Vec<GitLogEntry>> {
        let repo = open_repo(&root)?;
        let mut walk = repo.revwalk()?;
        if walk.push_head().is_err() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for oid in walk.flatten().take(limit) {
            let commit = repo.find_commit(oid)?;
            let author = commit.author();
            let date = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0)
                .unwrap_or_else(Utc::now);
            entries.push(GitLogEntry {
                hash: oid.to_string(),
                author: author.name().unwrap_or("unknown").to_string(),
                date,
                message: commit.summary().unwrap_or("").to_string(),
            });
        }
        Ok(entries)
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("git task failed: {e}")))??;

    Ok(Json(serde_json::json!({ "entries": entries })))
}

pub async fn branches(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<GitQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let root = effective_root(&state, &user.email, &query.repo_id, query.branch.as_deref()).await?;

    let (branches, current) =
        tokio::task::spawn_blocking(move || -> GatewayResult<(Vec<String>, Option<String>)> {
            let repo = open_repo(&root)?;
            let mut names = Vec::new();
            for branch in repo.branches(None)?.flatten() {
                if let Ok(Some(name)) = branch.0.name() {
                    names.push(name.to_string());
                }
            }
            names.sort();
            let current = repo
                .head()
                .ok()
                .and_then(|h| h.shorthand().map(str::to_string));
            Ok((names, current))
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("git task failed: {e}")))??;

    Ok(Json(
        serde_json::json!({ "branches": branches, "current": current }),
    ))
}

/// Checkout materializes as a worktree; the main checkout is never moved.
pub async fn checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CheckoutRequest>,
) -> GatewayResult<Json<CheckoutResponse>> {
    let repo_root = state.registry.resolve(&request.repo_id)?;
    // Reject non-git targets before any worktree machinery runs.
    {
        let probe = repo_root.clone();
        tokio::task::spawn_blocking(move || open_repo(&probe).map(|_| ()))
            .await
            .map_err(|e| GatewayError::Internal(format!("git task failed: {e}")))??;
    }

    let worktrees = state.worktrees.clone();
    let email = user.email.clone();
    let branch = request.branch.clone();
    let create = request.create;
    let root = repo_root.clone();
    let worktree_path: PathBuf = tokio::task::spawn_blocking(move || {
        if create {
            worktrees.ensure_worktree_from_new_branch(&root, &email, &branch)
        } else {
            worktrees.ensure_worktree_from_existing(&root, &email, &branch)
        }
    })
    .await
    .map_err(|e| GatewayError::Internal(format!("worktree task failed: {e}")))??;

    state.audit.audit(
        "git_checkout",
        &user.email,
        serde_json::json!({
            "repoId": request.repo_id,
            "branch": request.branch,
            "create": request.create,
        }),
    );

    Ok(Json(CheckoutResponse {
        worktree_path: worktree_path.display().to_string(),
        branch: worktrees::user_branch(&user.email, &request.branch),
    }))
}
