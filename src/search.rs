//! Code search delegated to ripgrep's JSON-lines output. The gateway never
//! interprets the query; it only caps and reshapes the matches.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use axum::extract::{Extension, State};
use axum::Json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::errors::{GatewayError, GatewayResult};
use crate::files::{effective_root, ELIDED_DIRS};
use crate::models::{SearchMatch, SearchRequest, SearchResponse};
use crate::paths;

pub const MAX_MATCHES: usize = 200;
const MATCHES_PER_FILE: &str = "10";
const MAX_FILESIZE: &str = "1M";
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn search(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<SearchRequest>,
) -> GatewayResult<Json<SearchResponse>> {
    if request.query.is_empty() {
        return Err(GatewayError::InvalidRequest("empty query".into()));
    }
    let root = effective_root(
        &state,
        &user.email,
        &request.repo_id,
        request.branch.as_deref(),
    )
    .await?;

    let mut scoped = Vec::new();
    for path in &request.paths {
        // Scope paths obey the same containment rules as file reads.
        let rel = paths::validate_relative_path(path)?;
        scoped.push(rel.display().to_string());
    }

    let matches = run_ripgrep(&root, &request.query, &scoped).await?;
    Ok(Json(SearchResponse { matches }))
}

async fn run_ripgrep(
    root: &Path,
    query: &str,
    scoped_paths: &[String],
) -> GatewayResult<Vec<SearchMatch>> {
    let mut cmd = Command::new("rg");
    cmd.args([
        "--json",
        "--max-count",
        MATCHES_PER_FILE,
        "--max-filesize",
        MAX_FILESIZE,
        "--follow",
        "--smart-case",
    ]);
    for dir in ELIDED_DIRS {
        cmd.arg("--glob").arg(format!("!{dir}"));
    }
    cmd.arg("--").arg(query);
    if scoped_paths.is_empty() {
        cmd.arg("./");
    } else {
        cmd.args(scoped_paths);
    }
    cmd.current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| GatewayError::Internal(format!("failed to spawn rg: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| GatewayError::Internal("rg stdout unavailable".into()))?;

    let collect = async {
        let mut matches = Vec::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if matches.len() >= MAX_MATCHES {
                break;
            }
            if let Some(found) = parse_match_line(&line) {
                matches.push(found);
            }
        }
        let _ = child.wait().await;
        matches
    };

    match tokio::time::timeout(SEARCH_TIMEOUT, collect).await {
        Ok(matches) => Ok(matches),
        // kill_on_drop reaps the straggler.
        Err(_) => Err(GatewayError::InvalidRequest("search timed out".into())),
    }
}

/// One rg `--json` event per line; only `match` events carry results.
fn parse_match_line(line: &str) -> Option<SearchMatch> {
    let event: serde_json::Value = serde_json::from_str(line).ok()?;
    if event.get("type")?.as_str()? != "match" {
        return None;
    }
    let data = event.get("data")?;
    Some(SearchMatch {
        path: data.get("path")?.get("text")?.as_str()?.to_string(),
        line: data.get("line_number")?.as_u64()?,
        text: data
            .get("lines")?
            .get("text")?
            .as_str()?
            .trim_end_matches('\n')
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rg_match_events() {
        let line = r#"{"type":"match","data":{"path":{"text":"src/main.rs"},"lines":{"text":"fn main() {\n"},"line_number":3,"absolute_offset":20,"submatches":[{"match":{"text":"main"},"start":3,"end":7}]}}"#;
        let found = parse_match_line(line).unwrap();
        assert_eq!(found.path, "src/main.rs");
        assert_eq!(found.line, 3);
        assert_eq!(found.text, "fn main() {");
    }

    #[test]
    fn skips_non_match_events() {
        assert!(parse_match_line(r#"{"type":"begin","data":{}}"#).is_none());
        assert!(parse_match_line("not json").is_none());
    }

    fn rg_available() -> bool {
        std::process::Command::new("rg")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[tokio::test]
    async fn finds_text_in_a_repo_and_caps_output() {
        if !rg_available() {
            eprintln!("rg not installed; skipping");
            return;
        }
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "needle here\nnothing\n").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "no hay nada\n").unwrap();

        let matches = run_ripgrep(tmp.path(), "needle", &[]).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "a.txt");
        assert_eq!(matches[0].line, 1);
    }

    #[tokio::test]
    async fn smart_case_is_insensitive_for_lowercase_queries() {
        if !rg_available() {
            eprintln!("rg not installed; skipping");
            return;
        }
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "MixedCase token\n").unwrap();

        let hits = run_ripgrep(tmp.path(), "mixedcase", &[]).await.unwrap();
        assert_eq!(hits.len(), 1);

        // An uppercase query is exact.
        let misses = run_ripgrep(tmp.path(), "MIXEDCASE", &[]).await.unwrap();
        assert!(misses.is_empty());
    }
}
