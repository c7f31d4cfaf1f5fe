//! Repo registry: opaque `<rootName>/<sub-path>` ids resolved against the
//! configured roots. Stateless beyond the immutable root list.

use std::path::PathBuf;

use serde::Serialize;

use crate::errors::{GatewayError, GatewayResult};
use crate::paths;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoEntry {
    pub repo_id: String,
    pub display_name: String,
    pub path_hint: String,
}

#[derive(Clone)]
pub struct RepoRegistry {
    roots: Vec<PathBuf>,
}

impl RepoRegistry {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Immediate readable child directories of each root, excluding dotted
    /// names. Sorted by display name, case-insensitive.
    pub fn discover(&self) -> Vec<RepoEntry> {
        let mut entries = Vec::new();
        for root in &self.roots {
            let Some(root_name) = root.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(children) = std::fs::read_dir(root) else {
                tracing::warn!("[repos] unreadable root {}", root.display());
                continue;
            };
            for child in children.flatten() {
                let Ok(name) = child.file_name().into_string() else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let path = child.path();
                if !path.is_dir() {
                    continue;
                }
                entries.push(RepoEntry {
                    repo_id: format!("{root_name}/{name}"),
                    display_name: name,
                    path_hint: path.display().to_string(),
                });
            }
        }
        entries.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
        });
        entries
    }

    /// `repoId` → unique real directory path, or NotFound.
    pub fn resolve(&self, repo_id: &str) -> GatewayResult<PathBuf> {
        let (root_name, sub) = repo_id
            .split_once('/')
            .ok_or_else(|| GatewayError::NotFound(format!("repository '{repo_id}'")))?;
        if root_name.is_empty() || sub.is_empty() {
            return Err(GatewayError::NotFound(format!("repository '{repo_id}'")));
        }
        let sub = paths::validate_relative_path(sub)
            .map_err(|_| GatewayError::NotFound(format!("repository '{repo_id}'")))?;

        let root = self
            .roots
            .iter()
            .find(|r| r.file_name().and_then(|n| n.to_str()) == Some(root_name))
            .ok_or_else(|| GatewayError::NotFound(format!("repository '{repo_id}'")))?;

        let real = paths::resolve_repo_path(root, &sub)?;
        if !real.is_dir() {
            return Err(GatewayError::NotFound(format!("repository '{repo_id}'")));
        }
        Ok(real)
    }
}
