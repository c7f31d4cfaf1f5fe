//! Whitelisted ad-hoc task runner. Tasks come from `<data>/tasks.json`; a run
//! executes one whitelisted command in the target repo and streams its output
//! over a read-only WebSocket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocketUpgrade};
use axum::extract::{Extension, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::errors::{GatewayError, GatewayResult};
use crate::sessions::{ReplayRing, SessionState, REPLAY_CAPACITY};
use crate::term_ws::{ServerFrame, CLOSE_NOT_FOUND, CLOSE_UNAUTHORIZED};

const TASKS_FILE: &str = "tasks.json";
const TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const TASK_CLIENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

pub struct TaskRun {
    pub run_id: String,
    pub task_id: String,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    ring: Mutex<ReplayRing>,
    clients: Mutex<Vec<tokio::sync::mpsc::Sender<ServerFrame>>>,
}

impl std::fmt::Debug for TaskRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRun").field("run_id", &self.run_id).finish()
    }
}

impl TaskRun {
    fn push_output(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk).to_string();
        let mut ring = self.ring.lock();
        ring.push(chunk);
        drop(ring);
        self.fanout(ServerFrame::Output { data: text });
    }

    fn finish(&self, message: String) {
        *self.state.write() = SessionState::Exited;
        self.fanout(ServerFrame::Status {
            state: SessionState::Exited,
            session_id: Some(self.run_id.clone()),
            session_name: None,
            branch: None,
            message: Some(message),
        });
    }

    fn fanout(&self, frame: ServerFrame) {
        self.clients
            .lock()
            .retain(|tx| tx.try_send(frame.clone()).is_ok());
    }

    fn subscribe(&self, tx: tokio::sync::mpsc::Sender<ServerFrame>) {
        let ring = self.ring.lock();
        let replay = String::from_utf8_lossy(&ring.snapshot()).to_string();
        let _ = tx.try_send(ServerFrame::Output { data: replay });
        let _ = tx.try_send(ServerFrame::Status {
            state: *self.state.read(),
            session_id: Some(self.run_id.clone()),
            session_name: None,
            branch: None,
            message: None,
        });
        drop(ring);
        self.clients.lock().push(tx);
    }
}

pub struct TaskRunner {
    enabled: bool,
    defs: Vec<TaskDef>,
    runs: Mutex<HashMap<String, Arc<TaskRun>>>,
}

impl TaskRunner {
    pub fn load(data_dir: &Path, enabled: bool) -> Self {
        let path = data_dir.join(TASKS_FILE);
        let defs = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("[tasks] unparsable {}: {e}", path.display());
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            enabled,
            defs,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn defs(&self) -> &[TaskDef] {
        &self.defs
    }

    pub fn get_run(&self, run_id: &str) -> Option<Arc<TaskRun>> {
        self.runs.lock().get(run_id).cloned()
    }

    pub fn list_runs(&self) -> Vec<Arc<TaskRun>> {
        let mut runs: Vec<_> = self.runs.lock().values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub fn start(
        self: &Arc<Self>,
        task_id: &str,
        workdir: PathBuf,
        started_by: &str,
    ) -> GatewayResult<Arc<TaskRun>> {
        if !self.enabled {
            return Err(GatewayError::Forbidden);
        }
        let def = self
            .defs
            .iter()
            .find(|d| d.id == task_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("task '{task_id}'")))?;

        let run = Arc::new(TaskRun {
            run_id: Uuid::new_v4().to_string(),
            task_id: def.id.clone(),
            started_by: started_by.to_string(),
            started_at: Utc::now(),
            state: RwLock::new(SessionState::Running),
            ring: Mutex::new(ReplayRing::new(REPLAY_CAPACITY)),
            clients: Mutex::new(Vec::new()),
        });
        self.runs.lock().insert(run.run_id.clone(), run.clone());

        let spawned = run.clone();
        tokio::spawn(async move {
            execute(def, workdir, spawned).await;
        });
        info!("[tasks] {started_by} started '{task_id}' as {}", run.run_id);
        Ok(run)
    }
}

async fn execute(def: TaskDef, workdir: PathBuf, run: Arc<TaskRun>) {
    let mut cmd = tokio::process::Command::new(&def.command);
    cmd.args(&def.args)
        .current_dir(&workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            run.finish(format!("failed to start: {e}"));
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_run = run.clone();
    let err_run = run.clone();
    let out_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            pump(stdout, out_run).await;
        }
    });
    let err_task = tokio::spawn(async move {
        if let Some(stderr) = stderr {
            pump(stderr, err_run).await;
        }
    });

    let outcome = tokio::time::timeout(TASK_TIMEOUT, child.wait()).await;
    let _ = out_task.await;
    let _ = err_task.await;
    match outcome {
        Ok(Ok(status)) => run.finish(format!("exited with {status}")),
        Ok(Err(e)) => run.finish(format!("wait failed: {e}")),
        Err(_) => {
            let _ = child.kill().await;
            run.finish("timed out".to_string());
        }
    }
}

async fn pump<R: tokio::io::AsyncRead + Unpin>(reader: R, run: Arc<TaskRun>) {
    let mut reader = BufReader::new(reader);
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => run.push_output(&buf[..n]),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskRequest {
    pub task_id: String,
    pub repo_id: String,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(_user): Extension<AuthUser>,
) -> Json<serde_json::Value> {
    let runs: Vec<_> = state
        .tasks
        .list_runs()
        .iter()
        .map(|r| {
            serde_json::json!({
                "runId": r.run_id,
                "taskId": r.task_id,
                "startedBy": r.started_by,
                "startedAt": r.started_at,
                "state": *r.state.read(),
            })
        })
        .collect();
    Json(serde_json::json!({ "tasks": state.tasks.defs(), "runs": runs }))
}

pub async fn start(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<StartTaskRequest>,
) -> GatewayResult<(axum::http::StatusCode, Json<serde_json::Value>)> {
    let root = state.registry.resolve(&request.repo_id)?;
    let run = state.tasks.start(&request.task_id, root, &user.email)?;
    state.audit.audit(
        "task_start",
        &user.email,
        serde_json::json!({ "taskId": request.task_id, "repoId": request.repo_id, "runId": run.run_id }),
    );
    Ok((
        axum::http::StatusCode::CREATED,
        Json(serde_json::json!({ "runId": run.run_id })),
    ))
}

/// Read-only stream of a run's output and final status.
pub async fn ws_tasks(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let run_id = params.get("runId").cloned();
    let auth = state.auth.authenticate(&headers, &params).await;

    ws.on_upgrade(move |mut socket| async move {
        if auth.is_err() {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_UNAUTHORIZED,
                    reason: "unauthorized".into(),
                })))
                .await;
            return;
        }
        let run = run_id.as_deref().and_then(|id| state.tasks.get_run(id));
        let Some(run) = run else {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_NOT_FOUND,
                    reason: "unknown runId".into(),
                })))
                .await;
            return;
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel::<ServerFrame>(TASK_CLIENT_QUEUE);
        run.subscribe(tx);

        let (mut ws_tx, mut ws_rx) = socket.split();
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                msg = ws_rx.next() => match msg {
                    // Read-only: client frames are ignored, closure ends the stream.
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    })
}
