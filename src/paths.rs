//! Path containment checks shared by the worktree, file, and git surfaces.
//!
//! External callers never hand the server an absolute path; everything is a
//! `(repoId, relativePath)` pair, validated here before any filesystem touch.

use std::path::{Component, Path, PathBuf};

use crate::errors::{GatewayError, GatewayResult};

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "tar", "gz", "bz2", "xz",
    "7z", "rar", "exe", "dll", "so", "dylib", "bin", "o", "a", "class", "jar", "war", "woff",
    "woff2", "ttf", "otf", "eot", "mp3", "mp4", "avi", "mov", "mkv", "webm", "wasm", "db",
    "sqlite", "pyc",
];

/// Rejects empty, absolute, and `..`-carrying paths. Returns the normalized
/// relative path with any `.` segments dropped.
pub fn validate_relative_path(raw: &str) -> GatewayResult<PathBuf> {
    if raw.is_empty() {
        return Err(GatewayError::UnsafePath("empty path".into()));
    }
    if raw.starts_with('/') || raw.starts_with('\\') {
        return Err(GatewayError::UnsafePath(raw.into()));
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(GatewayError::UnsafePath(raw.into()));
    }
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(GatewayError::UnsafePath(raw.into()))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(GatewayError::UnsafePath(raw.into()));
    }
    Ok(clean)
}

/// Resolves `<root>/<sub>` to its real path and verifies it stays under the
/// real root. Used for repoId resolution and worktree containment.
pub fn resolve_repo_path(root: &Path, sub: &Path) -> GatewayResult<PathBuf> {
    let real_root = root
        .canonicalize()
        .map_err(|_| GatewayError::NotFound(format!("repo root {}", root.display())))?;
    let candidate = real_root.join(sub);
    let real = candidate
        .canonicalize()
        .map_err(|_| GatewayError::NotFound(format!("repository {}", sub.display())))?;
    if !real.starts_with(&real_root) {
        return Err(GatewayError::PathEscape);
    }
    Ok(real)
}

/// Validates `rel`, joins it with `repo_root`, and real-path resolves the
/// result. A target that does not exist yet is resolved through its parent
/// directory so symlinked parents still cannot escape the root.
pub fn resolve_file_path(repo_root: &Path, rel: &str) -> GatewayResult<PathBuf> {
    let rel = validate_relative_path(rel)?;
    let real_root = repo_root
        .canonicalize()
        .map_err(|_| GatewayError::NotFound(format!("repo root {}", repo_root.display())))?;
    let joined = real_root.join(&rel);

    let real = match joined.canonicalize() {
        Ok(real) => real,
        Err(_) => {
            // Target absent: resolve the parent and re-attach the basename.
            let parent = joined
                .parent()
                .ok_or_else(|| GatewayError::UnsafePath(rel.display().to_string()))?;
            let name = joined
                .file_name()
                .ok_or_else(|| GatewayError::UnsafePath(rel.display().to_string()))?;
            let real_parent = parent
                .canonicalize()
                .map_err(|_| GatewayError::NotFound(rel.display().to_string()))?;
            real_parent.join(name)
        }
    };

    if real != real_root && !real.starts_with(&real_root) {
        return Err(GatewayError::PathEscape);
    }
    Ok(real)
}

/// Textual file reads refuse these extensions outright.
pub fn is_binary_by_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            BINARY_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        for bad in ["", "/etc/passwd", "../x", "a/../../x", "a/..", ".."] {
            assert!(validate_relative_path(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn accepts_and_normalizes_safe_paths() {
        assert_eq!(
            validate_relative_path("a/./b.txt").unwrap(),
            PathBuf::from("a/b.txt")
        );
        assert_eq!(
            validate_relative_path("src/main.rs").unwrap(),
            PathBuf::from("src/main.rs")
        );
    }

    #[test]
    fn resolve_file_path_allows_new_files_under_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let resolved = resolve_file_path(tmp.path(), "brand-new.txt").unwrap();
        assert!(resolved.starts_with(tmp.path().canonicalize().unwrap()));
    }

    #[test]
    fn resolve_file_path_detects_symlink_escape() {
        let tmp = tempfile::TempDir::new().unwrap();
        let outside = tempfile::TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("evil")).unwrap();

        let err = resolve_file_path(tmp.path(), "evil/secret").unwrap_err();
        assert!(matches!(err, GatewayError::PathEscape));
    }

    #[test]
    fn resolve_repo_path_rejects_escape() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("repo")).unwrap();
        assert!(resolve_repo_path(tmp.path(), Path::new("repo")).is_ok());

        let outside = tempfile::TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        let err = resolve_repo_path(tmp.path(), Path::new("link")).unwrap_err();
        assert!(matches!(err, GatewayError::PathEscape));
    }

    #[test]
    fn binary_extension_denylist() {
        assert!(is_binary_by_extension("logo.PNG"));
        assert!(is_binary_by_extension("app.wasm"));
        assert!(!is_binary_by_extension("main.rs"));
        assert!(!is_binary_by_extension("Makefile"));
    }
}
