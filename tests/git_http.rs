mod common;

use common::{http_client, spawn_gateway, USER_A};
use serde_json::json;

#[tokio::test]
async fn status_diff_log_branches_cover_a_dirty_repo() {
    let gateway = spawn_gateway(3, 20).await;
    std::fs::write(gateway.repo_root.join("README.md"), "demo repo\nedited\n").unwrap();
    std::fs::write(gateway.repo_root.join("untracked.txt"), "new file\n").unwrap();
    let client = http_client(USER_A);

    let status: serde_json::Value = client
        .get(format!("{}/api/git/status", gateway.base))
        .query(&[("repoId", gateway.repo_id.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = status["entries"].as_array().unwrap();
    let by_path = |p: &str| {
        entries
            .iter()
            .find(|e| e["path"] == p)
            .unwrap_or_else(|| panic!("no status entry for {p}"))
    };
    assert_eq!(by_path("README.md")["status"], "modified");
    assert_eq!(by_path("untracked.txt")["status"], "new");

    let diff: serde_json::Value = client
        .get(format!("{}/api/git/diff", gateway.base))
        .query(&[("repoId", gateway.repo_id.as_str()), ("path", "README.md")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let patch = diff["diff"].as_str().unwrap();
    assert!(patch.contains("+edited"));
    assert!(!patch.contains("untracked.txt"));

    let log: serde_json::Value = client
        .get(format!("{}/api/git/log", gateway.base))
        .query(&[("repoId", gateway.repo_id.as_str()), ("limit", "10")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let commits = log["entries"].as_array().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0]["message"], "init");
    assert_eq!(commits[0]["author"], "Test");

    let branches: serde_json::Value = client
        .get(format!("{}/api/git/branches", gateway.base))
        .query(&[("repoId", gateway.repo_id.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names = branches["branches"].as_array().unwrap();
    assert!(names
        .iter()
        .any(|b| b.as_str() == Some(gateway.default_branch.as_str())));
    assert_eq!(branches["current"], gateway.default_branch);
}

#[tokio::test]
async fn checkout_creates_a_namespaced_worktree() {
    let gateway = spawn_gateway(3, 20).await;
    let client = http_client(USER_A);

    let body: serde_json::Value = client
        .post(format!("{}/api/git/checkout", gateway.base))
        .json(&json!({
            "repoId": gateway.repo_id,
            "branch": gateway.default_branch,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let worktree_path = body["worktreePath"].as_str().unwrap();
    assert!(worktree_path.contains(".worktrees/a"));
    assert_eq!(
        body["branch"],
        format!("logpose/a/{}", gateway.default_branch)
    );

    // Idempotent: the same request lands on the same path.
    let again: serde_json::Value = client
        .post(format!("{}/api/git/checkout", gateway.base))
        .json(&json!({
            "repoId": gateway.repo_id,
            "branch": gateway.default_branch,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["worktreePath"], *worktree_path);
}

#[tokio::test]
async fn checkout_with_create_conflicts_on_second_call() {
    let gateway = spawn_gateway(3, 20).await;
    let client = http_client(USER_A);

    let resp = client
        .post(format!("{}/api/git/checkout", gateway.base))
        .json(&json!({
            "repoId": gateway.repo_id,
            "branch": "feature/topic",
            "create": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client
        .post(format!("{}/api/git/checkout", gateway.base))
        .json(&json!({
            "repoId": gateway.repo_id,
            "branch": "feature/topic",
            "create": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "BRANCH_EXISTS");
}

#[tokio::test]
async fn invalid_branch_names_are_rejected() {
    let gateway = spawn_gateway(3, 20).await;
    let client = http_client(USER_A);

    for bad in ["-x", "a..b", "@", "a@{1}", "a//b", ".hidden"] {
        let resp = client
            .post(format!("{}/api/git/checkout", gateway.base))
            .json(&json!({"repoId": gateway.repo_id, "branch": bad}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400, "branch {bad:?} accepted");
    }
}

#[tokio::test]
async fn non_git_repo_is_a_bad_request() {
    let gateway = spawn_gateway(3, 20).await;
    // A plain directory under the root resolves but is not a repository.
    std::fs::create_dir(gateway.repo_root.parent().unwrap().join("plain")).unwrap();
    let client = http_client(USER_A);

    let resp = client
        .get(format!("{}/api/git/status", gateway.base))
        .query(&[("repoId", "roots/plain")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "NOT_A_GIT_REPO");
}
