#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use git2::Repository;
use logpose::api::AppState;
use logpose::audit::AuditSink;
use logpose::auth::IdentityGate;
use logpose::build_router;
use logpose::config::{Config, Environment};
use logpose::repos::RepoRegistry;
use logpose::sessions::{SessionLimits, SessionManager};
use logpose::settings::SettingsStore;
use logpose::tasks::TaskRunner;
use logpose::worktrees::WorktreeManager;
use tempfile::TempDir;

pub const USER_A: &str = "a@x.com";
pub const USER_B: &str = "b@x.com";

pub struct Gateway {
    pub base: String,
    pub ws_base: String,
    pub repo_id: String,
    pub repo_root: PathBuf,
    pub default_branch: String,
    pub state: AppState,
    // Keeps the on-disk fixture alive for the test's duration.
    pub tmp: TempDir,
}

pub fn init_repo(dir: &Path) -> String {
    let repo = Repository::init(dir).unwrap();
    {
        let mut cfg = repo.config().unwrap();
        cfg.set_str("user.name", "Test").unwrap();
        cfg.set_str("user.email", "test@example.com").unwrap();
    }
    std::fs::write(dir.join("README.md"), "demo repo\n").unwrap();
    std::fs::create_dir(dir.join("src")).unwrap();
    std::fs::write(dir.join("src/main.rs"), "fn main() {}\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.add_path(Path::new("src/main.rs")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = repo.signature().unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
        .unwrap();
    let head = repo.head().unwrap();
    head.shorthand().unwrap().to_string()
}

/// Stand-in for the assistant binary: prints a banner, then echoes stdin.
pub fn fake_assistant(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-assistant.sh");
    std::fs::write(&path, "#!/bin/sh\necho ready\nexec cat\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

pub async fn spawn_gateway(max_per_user: usize, max_total: usize) -> Gateway {
    let tmp = TempDir::new().unwrap();
    let roots = tmp.path().join("roots");
    let repo_root = roots.join("demo");
    std::fs::create_dir_all(&repo_root).unwrap();
    let default_branch = init_repo(&repo_root);
    let data_dir = tmp.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();

    let config = Arc::new(Config {
        host: "127.0.0.1".into(),
        port: 0,
        environment: Environment::Development,
        repo_roots: vec![roots],
        allowlist_emails: vec![USER_A.into(), USER_B.into()],
        admin_emails: vec![USER_A.into()],
        cf_access_team_domain: None,
        cf_access_aud: None,
        dev_auth: true,
        max_sessions_per_user: max_per_user,
        max_total_sessions: max_total,
        disconnected_ttl_minutes: 20,
        max_file_size_bytes: 2_000_000,
        tasks_enabled: true,
        claude_path: fake_assistant(tmp.path()),
        data_dir: data_dir.clone(),
    });

    let settings = Arc::new(SettingsStore::load(
        &data_dir,
        config.allowlist_emails.clone(),
        config.admin_emails.clone(),
    ));
    let audit = Arc::new(AuditSink::new(&data_dir));
    let sessions = SessionManager::new(
        config.claude_path.clone(),
        SessionLimits {
            max_per_user: config.max_sessions_per_user,
            max_total: config.max_total_sessions,
            disconnected_ttl: config.disconnected_ttl(),
        },
    );
    sessions.spawn_reaper();

    let state = AppState {
        registry: Arc::new(RepoRegistry::new(config.repo_roots.clone())),
        worktrees: Arc::new(WorktreeManager::new()),
        sessions,
        auth: Arc::new(IdentityGate::new(config.clone(), settings.clone())),
        settings,
        audit,
        tasks: Arc::new(TaskRunner::load(&data_dir, true)),
        config,
    };

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Gateway {
        base: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
        repo_id: "roots/demo".into(),
        repo_root,
        default_branch,
        state,
        tmp,
    }
}

pub fn http_client(email: &str) -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("x-dev-email", email.parse().unwrap());
    reqwest::Client::builder()
        .default_headers(headers)
        .no_proxy()
        .build()
        .unwrap()
}

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub async fn connect_ws(gateway: &Gateway, email: &str) -> WsStream {
    let encoded = email.replace('@', "%40");
    let url = format!(
        "{}/ws/claude?repoId={}&devEmail={encoded}",
        gateway.ws_base, gateway.repo_id
    );
    let (ws, _resp) = tokio::time::timeout(
        Duration::from_secs(10),
        tokio_tungstenite::connect_async(url),
    )
    .await
    .expect("ws connect timed out")
    .unwrap();
    ws
}

pub async fn next_json(ws: &mut WsStream) -> serde_json::Value {
    use futures_util::StreamExt;
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("ws frame timed out")
            .expect("ws closed")
            .expect("ws errored");
        if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

pub async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    use futures_util::SinkExt;
    ws.send(tokio_tungstenite::tungstenite::Message::Text(
        value.to_string().into(),
    ))
    .await
    .unwrap();
}
