//! Per-user worktree isolation. Every user editing `(repo, branch)` gets a
//! dedicated checkout under `<repo>/.worktrees/<shortUserId>/<branch>` whose
//! HEAD is the user-namespaced branch `logpose/<shortUserId>/<branch>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::{GatewayError, GatewayResult};
use crate::paths;

pub const BRANCH_NAMESPACE: &str = "logpose";
pub const WORKTREES_DIR: &str = ".worktrees";

/// Path-safe identifier derived from the email local part: lowercased, runs
/// of anything outside `[a-z0-9]` collapsed to a single `-`, trimmed.
pub fn short_user_id(email: &str) -> String {
    let local = email.split('@').next().unwrap_or(email);
    let mut out = String::with_capacity(local.len());
    let mut last_dash = false;
    for c in local.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Git branch-name rules enforced before any ref is created or resolved.
/// Slashes are allowed so namespaced branches work; each segment must be
/// non-empty and must not begin or end with a dot.
pub fn validate_branch_name(name: &str) -> GatewayResult<()> {
    let invalid = |reason: &str| {
        Err(GatewayError::InvalidBranchName(format!(
            "'{name}': {reason}"
        )))
    };
    if name.is_empty() {
        return invalid("empty");
    }
    if name == "@" {
        return invalid("reserved");
    }
    if name.starts_with('-') {
        return invalid("leading dash");
    }
    if name.contains("..") || name.contains("@{") {
        return invalid("forbidden sequence");
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '\\' | '~' | '^' | ':' | '*' | '[' | ']' | '?'))
    {
        return invalid("forbidden character");
    }
    for segment in name.split('/') {
        if segment.is_empty() {
            return invalid("empty segment");
        }
        if segment.starts_with('.') || segment.ends_with('.') {
            return invalid("segment begins or ends with a dot");
        }
    }
    Ok(())
}

pub fn user_branch(email: &str, base_branch: &str) -> String {
    format!("{BRANCH_NAMESPACE}/{}/{base_branch}", short_user_id(email))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeEntry {
    pub branch: String,
    pub path: String,
}

/// Serializes worktree creation/cleanup per repository; `.git` mutation from
/// two requests against the same repo must never interleave.
#[derive(Default)]
pub struct WorktreeManager {
    repo_locks: Mutex<HashMap<PathBuf, Arc<std::sync::Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn repo_lock(&self, repo_root: &Path) -> Arc<std::sync::Mutex<()>> {
        let mut locks = self.repo_locks.lock();
        locks
            .entry(repo_root.to_path_buf())
            .or_insert_with(|| Arc::new(std::sync::Mutex::new(())))
            .clone()
    }

    /// Returns the worktree path for `(user, base_branch)`, creating branch
    /// and checkout on first use. The base branch must exist locally or as
    /// `origin/<base>`.
    pub fn ensure_worktree_from_existing(
        &self,
        repo_root: &Path,
        user_email: &str,
        base_branch: &str,
    ) -> GatewayResult<PathBuf> {
        validate_branch_name(base_branch)?;
        let short = short_user_id(user_email);
        if short.is_empty() {
            return Err(GatewayError::InvalidRequest("unusable user id".into()));
        }
        let worktree_path = repo_root.join(WORKTREES_DIR).join(&short).join(base_branch);
        if worktree_path.exists() {
            return self.contained(repo_root, &short, base_branch);
        }

        let lock = self.repo_lock(repo_root);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        // Re-check under the lock; a concurrent request may have won.
        if worktree_path.exists() {
            return self.contained(repo_root, &short, base_branch);
        }

        let repo = Repository::open(repo_root).map_err(|_| GatewayError::NotAGitRepo)?;
        let branch_name = user_branch(user_email, base_branch);

        let (base_commit, remote_only) =
            match repo.find_branch(base_branch, BranchType::Local) {
                Ok(local) => (local.get().peel_to_commit()?, false),
                Err(_) => {
                    let remote_name = format!("origin/{base_branch}");
                    match repo.find_branch(&remote_name, BranchType::Remote) {
                        Ok(remote) => (remote.get().peel_to_commit()?, true),
                        Err(_) => {
                            return Err(GatewayError::BranchMissing(base_branch.to_string()))
                        }
                    }
                }
            };

        let branch = match repo.find_branch(&branch_name, BranchType::Local) {
            Ok(existing) => existing,
            Err(_) => {
                let mut created = repo.branch(&branch_name, &base_commit, false)?;
                if remote_only {
                    // Track the remote ref the base came from.
                    created
                        .set_upstream(Some(&format!("origin/{base_branch}")))
                        .ok();
                }
                created
            }
        };

        self.add_worktree(&repo, &short, base_branch, branch, &worktree_path)?;
        self.contained(repo_root, &short, base_branch)
    }

    /// Creates the user's namespaced branch from current HEAD under a new
    /// base-branch name. Fails if the namespaced branch already exists.
    pub fn ensure_worktree_from_new_branch(
        &self,
        repo_root: &Path,
        user_email: &str,
        new_base_branch: &str,
    ) -> GatewayResult<PathBuf> {
        validate_branch_name(new_base_branch)?;
        let short = short_user_id(user_email);
        if short.is_empty() {
            return Err(GatewayError::InvalidRequest("unusable user id".into()));
        }
        let worktree_path = repo_root
            .join(WORKTREES_DIR)
            .join(&short)
            .join(new_base_branch);

        let lock = self.repo_lock(repo_root);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let repo = Repository::open(repo_root).map_err(|_| GatewayError::NotAGitRepo)?;
        let branch_name = user_branch(user_email, new_base_branch);
        if repo.find_branch(&branch_name, BranchType::Local).is_ok() {
            return Err(GatewayError::BranchExists(branch_name));
        }

        let head = repo.head()?.peel_to_commit()?;
        let branch = repo.branch(&branch_name, &head, false)?;
        self.add_worktree(&repo, &short, new_base_branch, branch, &worktree_path)?;
        self.contained(repo_root, &short, new_base_branch)
    }

    fn add_worktree(
        &self,
        repo: &Repository,
        short: &str,
        base_branch: &str,
        branch: git2::Branch<'_>,
        worktree_path: &Path,
    ) -> GatewayResult<()> {
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Worktree registrations need a repo-unique flat name.
        let wt_name = format!("{short}-{}", base_branch.replace('/', "-"));
        if let Ok(stale) = repo.find_worktree(&wt_name) {
            if !stale.path().exists() {
                stale.prune(Some(&mut WorktreePruneOptions::new())).ok();
            }
        }

        let branch_ref = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));

        if let Err(e) = repo.worktree(&wt_name, worktree_path, Some(&opts)) {
            // Leave no half-created checkout behind.
            if worktree_path.exists() {
                std::fs::remove_dir_all(worktree_path).ok();
            }
            return Err(e.into());
        }
        tracing::info!(
            "[worktree] created {} on {}",
            worktree_path.display(),
            branch_ref.shorthand().unwrap_or("?")
        );
        Ok(())
    }

    fn contained(&self, repo_root: &Path, short: &str, branch: &str) -> GatewayResult<PathBuf> {
        let rel = Path::new(WORKTREES_DIR).join(short).join(branch);
        paths::resolve_repo_path(repo_root, &rel)
    }

    /// Removes the git registration and the directory. Runs during session
    /// teardown, so failures are logged and swallowed.
    pub fn cleanup(&self, repo_root: &Path, worktree_path: &Path) {
        let lock = self.repo_lock(repo_root);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let canonical_target = worktree_path
            .canonicalize()
            .unwrap_or_else(|_| worktree_path.to_path_buf());

        match Repository::open(repo_root) {
            Ok(repo) => match repo.worktrees() {
                Ok(names) => {
                    for name in names.iter().flatten() {
                        let Ok(wt) = repo.find_worktree(name) else {
                            continue;
                        };
                        let wt_path = wt.path().to_path_buf();
                        let canonical_wt =
                            wt_path.canonicalize().unwrap_or_else(|_| wt_path.clone());
                        if canonical_wt != canonical_target && wt_path != worktree_path {
                            continue;
                        }
                        if worktree_path.exists() {
                            if let Err(e) = std::fs::remove_dir_all(worktree_path) {
                                tracing::warn!(
                                    "[worktree] failed to remove {}: {e}",
                                    worktree_path.display()
                                );
                            }
                        }
                        if let Err(e) = wt.prune(Some(&mut WorktreePruneOptions::new())) {
                            tracing::warn!("[worktree] failed to prune '{name}': {e}");
                        }
                        return;
                    }
                }
                Err(e) => tracing::warn!("[worktree] cannot list worktrees: {e}"),
            },
            Err(e) => tracing::warn!("[worktree] cannot open {}: {e}", repo_root.display()),
        }

        // Unregistered directory: remove best-effort.
        if worktree_path.exists() {
            if let Err(e) = std::fs::remove_dir_all(worktree_path) {
                tracing::warn!(
                    "[worktree] failed to remove {}: {e}",
                    worktree_path.display()
                );
            }
        }
    }

    /// The user's checkouts under `<repo>/.worktrees/<shortUserId>/`, found by
    /// filesystem listing. A checkout is any directory holding a `.git` file.
    pub fn list_for_user(&self, repo_root: &Path, user_email: &str) -> Vec<WorktreeEntry> {
        let short = short_user_id(user_email);
        let base = repo_root.join(WORKTREES_DIR).join(&short);
        let mut out = Vec::new();
        collect_checkouts(&base, &base, &mut out);
        out.sort_by(|a, b| a.branch.cmp(&b.branch));
        out
    }
}

fn collect_checkouts(base: &Path, dir: &Path, out: &mut Vec<WorktreeEntry>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.join(".git").is_file() {
            let branch = path
                .strip_prefix(base)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            out.push(WorktreeEntry {
                branch,
                path: path.display().to_string(),
            });
        } else {
            collect_checkouts(base, &path, out);
        }
    }
}
