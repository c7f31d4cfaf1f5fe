//! Terminal WebSocket endpoint: JSON frame protocol, heartbeat, and the
//! bridge between one socket and the session fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::errors::GatewayError;
use crate::sessions::{ClientHandle, Session, SessionState};

pub const MAX_WS_PAYLOAD: usize = 1024 * 1024;
pub const MAX_INPUT_FRAME: usize = 64 * 1024;
pub const MAX_BRANCH_PARAM: usize = 100;
const HEARTBEAT: Duration = Duration::from_secs(30);
const READY_WAIT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 256;

pub const CLOSE_BAD_REQUEST: u16 = 4000;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_PING_TIMEOUT: u16 = 4002;
pub const CLOSE_NOT_FOUND: u16 = 4004;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Attach {
        session_id: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
        branch: Option<String>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Ping,
    Restart,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Output {
        data: String,
    },
    Replay {
        data: String,
    },
    Status {
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
    Pong,
}

pub async fn ws_claude(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let repo_id = params.get("repoId").cloned();
    let auth = state.auth.authenticate(&headers, &params).await;

    ws.max_message_size(MAX_WS_PAYLOAD)
        .on_upgrade(move |socket| async move {
            let Some(repo_id) = repo_id else {
                close(socket, CLOSE_BAD_REQUEST, "missing repoId").await;
                return;
            };
            let user = match auth {
                Ok(user) => user,
                Err(_) => {
                    close(socket, CLOSE_UNAUTHORIZED, "unauthorized").await;
                    return;
                }
            };
            if state.registry.resolve(&repo_id).is_err() {
                close(socket, CLOSE_NOT_FOUND, "unknown repoId").await;
                return;
            }
            handle_terminal_socket(state, socket, user.email, repo_id).await;
        })
        .into_response()
}

async fn close(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_terminal_socket(
    state: AppState,
    socket: WebSocket,
    user_email: String,
    repo_id: String,
) {
    let client_id = Uuid::new_v4().to_string();
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);
    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<(u16, String)>();

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Single writer: session fan-out and direct responses share one queue so
    // each client observes frames in enqueue order.
    let send_task = tokio::spawn(async move {
        tokio::pin!(close_rx);
        loop {
            tokio::select! {
                maybe = frame_rx.recv() => match maybe {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                res = &mut close_rx => {
                    if let Ok((code, reason)) = res {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                    }
                    break;
                }
            }
        }
    });

    let mut attached: Option<Arc<Session>> = None;
    let mut close_tx = Some(close_tx);
    let mut heartbeat = tokio::time::interval(HEARTBEAT);
    heartbeat.tick().await; // the first tick completes immediately
    let mut missed_heartbeats = 0u8;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if missed_heartbeats >= 2 {
                    debug!("[ws:{client_id}] ping timeout");
                    if let Some(tx) = close_tx.take() {
                        let _ = tx.send((CLOSE_PING_TIMEOUT, "ping timeout".into()));
                    }
                    break;
                }
                missed_heartbeats += 1;
                let _ = frame_tx.send(ServerFrame::Pong).await;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        missed_heartbeats = 0;
                        let outcome = handle_frame(
                            &state,
                            &user_email,
                            &repo_id,
                            &client_id,
                            &frame_tx,
                            &mut attached,
                            &text,
                        )
                        .await;
                        if let Some((code, reason)) = outcome {
                            if let Some(tx) = close_tx.take() {
                                let _ = tx.send((code, reason));
                            }
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        missed_heartbeats = 0;
                    }
                    Some(Err(e)) => {
                        debug!("[ws:{client_id}] receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // Exactly one detach per socket.
    if let Some(session) = attached.take() {
        state.sessions.detach(&session.id, &client_id);
    }
    drop(frame_tx);
    let _ = send_task.await;
}

/// Processes one client frame. Returns `Some((code, reason))` when the socket
/// must close; protocol-level problems only elicit an `error` frame.
async fn handle_frame(
    state: &AppState,
    user_email: &str,
    repo_id: &str,
    client_id: &str,
    frame_tx: &tokio::sync::mpsc::Sender<ServerFrame>,
    attached: &mut Option<Arc<Session>>,
    text: &str,
) -> Option<(u16, String)> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            send_error(frame_tx, format!("malformed frame: {e}")).await;
            return None;
        }
    };

    match frame {
        ClientFrame::Ping => {
            let _ = frame_tx.send(ServerFrame::Pong).await;
        }
        ClientFrame::Attach {
            session_id,
            cols,
            rows,
            branch,
        } => {
            if attached.is_some() {
                send_error(frame_tx, "already attached".into()).await;
                return None;
            }
            if let Some(branch) = branch.as_deref() {
                if branch.len() > MAX_BRANCH_PARAM {
                    send_error(frame_tx, "branch name too long".into()).await;
                    return None;
                }
            }
            let cols_ok = cols.map(|c| (1..=500).contains(&c)).unwrap_or(true);
            let rows_ok = rows.map(|r| (1..=200).contains(&r)).unwrap_or(true);
            if !cols_ok || !rows_ok {
                send_error(frame_tx, "cols/rows out of range".into()).await;
                return None;
            }

            match session_id {
                Some(id) => {
                    let handle = ClientHandle {
                        id: client_id.to_string(),
                        tx: frame_tx.clone(),
                    };
                    match state.sessions.attach(&id, user_email, repo_id, handle) {
                        Ok(session) => *attached = Some(session),
                        Err(_) => return Some((CLOSE_NOT_FOUND, "unknown sessionId".into())),
                    }
                }
                None => {
                    match create_and_attach(
                        state, user_email, repo_id, client_id, frame_tx, cols, rows, branch,
                    )
                    .await
                    {
                        Ok(session) => *attached = Some(session),
                        Err(e) => send_error(frame_tx, e.to_string()).await,
                    }
                }
            }
        }
        ClientFrame::Input { data } => {
            let Some(session) = attached.as_ref() else {
                send_error(frame_tx, "Not attached".into()).await;
                return None;
            };
            if data.len() > MAX_INPUT_FRAME {
                send_error(frame_tx, "input frame too large".into()).await;
                return None;
            }
            if let Err(e) = state.sessions.input(&session.id, data.as_bytes()) {
                send_error(frame_tx, e.to_string()).await;
            }
        }
        ClientFrame::Resize { cols, rows } => {
            let Some(session) = attached.as_ref() else {
                send_error(frame_tx, "Not attached".into()).await;
                return None;
            };
            if !dims_valid(cols, rows) {
                send_error(frame_tx, "cols/rows out of range".into()).await;
                return None;
            }
            if let Err(e) = state.sessions.resize(&session.id, cols, rows) {
                send_error(frame_tx, e.to_string()).await;
            }
        }
        ClientFrame::Restart => {
            let Some(session) = attached.as_ref() else {
                send_error(frame_tx, "Not attached".into()).await;
                return None;
            };
            if let Err(e) = state.sessions.restart(&session.id).await {
                send_error(frame_tx, e.to_string()).await;
            }
        }
    }
    None
}

/// Fresh-session attach: status(starting) straight to this socket, then a
/// bounded wait for readiness so the client observes starting → running →
/// replay in order.
#[allow(clippy::too_many_arguments)]
async fn create_and_attach(
    state: &AppState,
    user_email: &str,
    repo_id: &str,
    client_id: &str,
    frame_tx: &tokio::sync::mpsc::Sender<ServerFrame>,
    cols: Option<u16>,
    rows: Option<u16>,
    branch: Option<String>,
) -> Result<Arc<Session>, GatewayError> {
    let repo_root = state.registry.resolve(repo_id)?;
    // Capacity gates before the worktree is materialized; a rejected attach
    // must leave no branch or checkout behind.
    state.sessions.capacity_check(user_email)?;

    let workdir = match branch.as_deref() {
        Some(branch) => {
            let worktrees = state.worktrees.clone();
            let root = repo_root.clone();
            let user = user_email.to_string();
            let branch = branch.to_string();
            tokio::task::spawn_blocking(move || {
                worktrees.ensure_worktree_from_existing(&root, &user, &branch)
            })
            .await
            .map_err(|e| GatewayError::Internal(format!("worktree task failed: {e}")))??
        }
        None => repo_root,
    };

    let session = state.sessions.create(
        user_email,
        repo_id,
        branch,
        workdir,
        None,
        cols,
        rows,
    )?;

    let _ = frame_tx
        .send(ServerFrame::Status {
            state: SessionState::Starting,
            session_id: Some(session.id.clone()),
            session_name: Some(session.name()),
            branch: session.branch.clone(),
            message: None,
        })
        .await;

    wait_for_ready(&session).await;

    let handle = ClientHandle {
        id: client_id.to_string(),
        tx: frame_tx.clone(),
    };
    state
        .sessions
        .attach(&session.id, user_email, repo_id, handle)?;

    state.audit.analytics(
        "session_attach",
        user_email,
        serde_json::json!({ "repoId": repo_id, "sessionId": session.id }),
    );
    Ok(session)
}

async fn wait_for_ready(session: &Arc<Session>) {
    let deadline = tokio::time::Instant::now() + READY_WAIT;
    while session.state() == SessionState::Starting && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    if session.state() == SessionState::Starting {
        warn!("[session:{}] still starting after ready wait", session.id);
    }
}

fn dims_valid(cols: u16, rows: u16) -> bool {
    (1..=500).contains(&cols) && (1..=200).contains(&rows)
}

async fn send_error(tx: &tokio::sync::mpsc::Sender<ServerFrame>, message: String) {
    let _ = tx.send(ServerFrame::Error { message }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_protocol_shapes() {
        let attach: ClientFrame =
            serde_json::from_str(r#"{"type":"attach","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(
            attach,
            ClientFrame::Attach {
                session_id: None,
                cols: Some(80),
                rows: Some(24),
                branch: None
            }
        ));

        let reattach: ClientFrame =
            serde_json::from_str(r#"{"type":"attach","sessionId":"abc"}"#).unwrap();
        assert!(matches!(
            reattach,
            ClientFrame::Attach { session_id: Some(ref id), .. } if id == "abc"
        ));

        let input: ClientFrame =
            serde_json::from_str(r#"{"type":"input","data":"hello\r"}"#).unwrap();
        assert!(matches!(input, ClientFrame::Input { ref data } if data == "hello\r"));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn status_frame_serializes_camel_case() {
        let frame = ServerFrame::Status {
            state: SessionState::Running,
            session_id: Some("s1".into()),
            session_name: Some("Session 1".into()),
            branch: None,
            message: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["state"], "running");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["sessionName"], "Session 1");
        assert!(json.get("branch").is_none());
    }

    #[test]
    fn dims_bounds() {
        assert!(dims_valid(1, 1));
        assert!(dims_valid(500, 200));
        assert!(!dims_valid(0, 10));
        assert!(!dims_valid(501, 10));
        assert!(!dims_valid(10, 201));
    }
}
