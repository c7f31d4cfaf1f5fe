//! PTY session lifecycle: spawn, attach, detach, reap. One PTY per session,
//! many attached clients, a bounded replay ring of recent output.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{GatewayError, GatewayResult};
use crate::models::SessionTab;
use crate::term_ws::ServerFrame;

pub const REPLAY_CAPACITY: usize = 128 * 1024;
const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;
const CLIENT_QUEUE_SIZE: usize = 256;

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Exited,
}

/// Byte ring of recent PTY output. Appending never exceeds capacity; the
/// oldest bytes are dropped first.
pub struct ReplayRing {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl ReplayRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.bytes.clear();
            self.bytes
                .extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
        self.bytes.extend(chunk);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A WS attachment. Frames are queued on a bounded channel; the socket task
/// drains it. A full or closed queue marks the client dead.
pub struct ClientHandle {
    pub id: String,
    pub tx: tokio::sync::mpsc::Sender<ServerFrame>,
}

struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    input_tx: std::sync::mpsc::SyncSender<Vec<u8>>,
}

/// Ring and client set share one lock so a ring append plus its fan-out is
/// atomic with respect to an attach snapshot; no byte is replayed twice or
/// skipped.
struct SessionIo {
    ring: ReplayRing,
    clients: HashMap<String, ClientHandle>,
}

pub struct Session {
    pub id: String,
    pub user_email: String,
    pub repo_id: String,
    pub branch: Option<String>,
    pub workdir: PathBuf,
    pub created_at: DateTime<Utc>,
    name: RwLock<String>,
    state: RwLock<SessionState>,
    exit_code: RwLock<Option<i32>>,
    size: RwLock<(u16, u16)>,
    pty: Mutex<Option<PtyHandle>>,
    io: Mutex<SessionIo>,
    disconnected_at: Mutex<Option<Instant>>,
    last_activity: Mutex<Instant>,
    /// Bumped on restart so a superseded reader thread cannot tear the
    /// session down when its old PTY hits EOF.
    epoch: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.read()
    }

    pub fn client_count(&self) -> usize {
        self.io.lock().clients.len()
    }

    pub fn to_tab(&self) -> SessionTab {
        SessionTab {
            id: self.id.clone(),
            name: self.name(),
            state: self.state(),
            created_at: self.created_at,
            branch: self.branch.clone(),
            repo_id: self.repo_id.clone(),
        }
    }

    fn status_frame(&self, message: Option<String>) -> ServerFrame {
        ServerFrame::Status {
            state: self.state(),
            session_id: Some(self.id.clone()),
            session_name: Some(self.name()),
            branch: self.branch.clone(),
            message,
        }
    }

    /// Queue a frame on every attached client; a client whose queue is full
    /// or closed is dropped from the set, the session is unaffected.
    fn broadcast(&self, frame: ServerFrame) {
        let mut io = self.io.lock();
        io.clients.retain(|client_id, client| {
            match client.tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!("[session:{}] dropping client {client_id}: {e}", self.id);
                    false
                }
            }
        });
    }
}

pub struct SessionLimits {
    pub max_per_user: usize,
    pub max_total: usize,
    pub disconnected_ttl: Duration,
}

pub struct SessionManager {
    claude_path: String,
    limits: SessionLimits,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    runtime: tokio::runtime::Handle,
}

impl SessionManager {
    /// Must be constructed inside a tokio runtime; reap timers and teardown
    /// hop through the captured handle.
    pub fn new(claude_path: String, limits: SessionLimits) -> Arc<Self> {
        Arc::new(Self {
            claude_path,
            limits,
            sessions: Mutex::new(HashMap::new()),
            runtime: tokio::runtime::Handle::current(),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn list_for_user(&self, user_email: &str) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.user_email == user_email)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn list_for_user_repo(&self, user_email: &str, repo_id: &str) -> Vec<Arc<Session>> {
        self.list_for_user(user_email)
            .into_iter()
            .filter(|s| s.repo_id == repo_id)
            .collect()
    }

    pub fn total_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    fn check_capacity(
        &self,
        sessions: &HashMap<String, Arc<Session>>,
        user_email: &str,
    ) -> GatewayResult<()> {
        if sessions.len() >= self.limits.max_total {
            return Err(GatewayError::GlobalLimit);
        }
        let user_count = sessions
            .values()
            .filter(|s| s.user_email == user_email)
            .count();
        if user_count >= self.limits.max_per_user {
            return Err(GatewayError::PerUserLimit);
        }
        Ok(())
    }

    /// Precondition check for callers that do expensive work (worktree
    /// creation) before `create`. `create` re-checks under the same lock.
    pub fn capacity_check(&self, user_email: &str) -> GatewayResult<()> {
        self.check_capacity(&self.sessions.lock(), user_email)
    }

    /// Capacity is enforced before any PTY is spawned.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        self: &Arc<Self>,
        user_email: &str,
        repo_id: &str,
        branch: Option<String>,
        workdir: PathBuf,
        name: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> GatewayResult<Arc<Session>> {
        let cols = cols.unwrap_or(DEFAULT_COLS);
        let rows = rows.unwrap_or(DEFAULT_ROWS);

        let session = {
            let mut sessions = self.sessions.lock();
            self.check_capacity(&sessions, user_email)?;
            let repo_count = sessions
                .values()
                .filter(|s| s.user_email == user_email && s.repo_id == repo_id)
                .count();
            let name = name.unwrap_or_else(|| format!("Session {}", repo_count + 1));

            let session = Arc::new(Session {
                id: Uuid::new_v4().to_string(),
                user_email: user_email.to_string(),
                repo_id: repo_id.to_string(),
                branch,
                workdir,
                created_at: Utc::now(),
                name: RwLock::new(name),
                state: RwLock::new(SessionState::Starting),
                exit_code: RwLock::new(None),
                size: RwLock::new((cols, rows)),
                pty: Mutex::new(None),
                io: Mutex::new(SessionIo {
                    ring: ReplayRing::new(REPLAY_CAPACITY),
                    clients: HashMap::new(),
                }),
                disconnected_at: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                epoch: AtomicU64::new(0),
            });
            sessions.insert(session.id.clone(), session.clone());
            session
        };

        if let Err(e) = self.spawn_pty(&session) {
            *session.state.write() = SessionState::Exited;
            self.sessions.lock().remove(&session.id);
            return Err(e);
        }
        info!(
            "[session:{}] created for {user_email} in {} (total {})",
            session.id,
            session.workdir.display(),
            self.total_sessions()
        );
        Ok(session)
    }

    /// The assistant binary runs inside a login shell that is exec-replaced,
    /// so when the binary exits there is no shell left to fall back to.
    fn spawn_pty(self: &Arc<Self>, session: &Arc<Session>) -> GatewayResult<()> {
        let (cols, rows) = *session.size.read();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| GatewayError::Internal(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new("/bin/sh");
        let exec_line = format!("exec {}", sh_quote(&self.claude_path));
        cmd.args(["-l", "-c", exec_line.as_str()]);
        cmd.cwd(&session.workdir);
        cmd.env_clear();
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("LANG", "en_US.UTF-8");
        cmd.env(
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| GatewayError::Internal(format!("pty spawn failed: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| GatewayError::Internal(format!("pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| GatewayError::Internal(format!("pty writer: {e}")))?;

        let (input_tx, input_rx) = std::sync::mpsc::sync_channel(PTY_INPUT_CHANNEL_SIZE);
        spawn_pty_writer_thread(session.id.clone(), writer, input_rx);

        *session.pty.lock() = Some(PtyHandle {
            master: pair.master,
            child,
            input_tx,
        });

        let epoch = session.epoch.load(Ordering::SeqCst);
        spawn_pty_reader_thread(self.clone(), session.clone(), reader, epoch);
        Ok(())
    }

    /// Registers a client and delivers `status` then `replay` before any
    /// subsequent `output` can interleave.
    pub fn attach(
        &self,
        session_id: &str,
        user_email: &str,
        repo_id: &str,
        client: ClientHandle,
    ) -> GatewayResult<Arc<Session>> {
        let session = self
            .get(session_id)
            .filter(|s| s.user_email == user_email && s.repo_id == repo_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session '{session_id}'")))?;

        {
            let mut io = session.io.lock();
            *session.disconnected_at.lock() = None;
            let _ = client.tx.try_send(session.status_frame(None));
            let replay = String::from_utf8_lossy(&io.ring.snapshot()).to_string();
            let _ = client.tx.try_send(ServerFrame::Replay { data: replay });
            io.clients.insert(client.id.clone(), client);
        }
        Ok(session)
    }

    /// Idempotent. Arms a one-shot reap timer when the last client leaves.
    pub fn detach(self: &Arc<Self>, session_id: &str, client_id: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let now_empty = {
            let mut io = session.io.lock();
            io.clients.remove(client_id);
            io.clients.is_empty()
        };
        if !now_empty {
            return;
        }
        let mut disconnected = session.disconnected_at.lock();
        if disconnected.is_none() {
            *disconnected = Some(Instant::now());
            drop(disconnected);
            let manager = self.clone();
            let id = session_id.to_string();
            let ttl = self.limits.disconnected_ttl;
            self.runtime.spawn(async move {
                tokio::time::sleep(ttl).await;
                manager.reap_if_expired(&id).await;
            });
        }
    }

    pub fn input(&self, session_id: &str, data: &[u8]) -> GatewayResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session '{session_id}'")))?;
        if session.state() != SessionState::Running {
            return Err(GatewayError::InvalidRequest("session is not running".into()));
        }
        let pty = session.pty.lock();
        let Some(handle) = pty.as_ref() else {
            return Err(GatewayError::InvalidRequest("session has no terminal".into()));
        };
        // Non-blocking: the kernel-side buffer is owned by the writer thread.
        handle
            .input_tx
            .try_send(data.to_vec())
            .map_err(|_| GatewayError::InvalidRequest("terminal input backpressure".into()))?;
        *session.last_activity.lock() = Instant::now();
        Ok(())
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> GatewayResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session '{session_id}'")))?;
        *session.size.write() = (cols, rows);
        let pty = session.pty.lock();
        if let Some(handle) = pty.as_ref() {
            handle
                .master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| GatewayError::Internal(format!("resize failed: {e}")))?;
        }
        Ok(())
    }

    /// Kill the PTY, drop the ring, respawn in the same working directory at
    /// the recorded size. Clients stay attached across the restart.
    pub async fn restart(self: &Arc<Self>, session_id: &str) -> GatewayResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session '{session_id}'")))?;

        session.epoch.fetch_add(1, Ordering::SeqCst);
        let handle = session.pty.lock().take();
        if let Some(handle) = handle {
            kill_pty(handle).await;
        }
        {
            let mut io = session.io.lock();
            io.ring.clear();
        }
        *session.state.write() = SessionState::Starting;
        *session.exit_code.write() = None;
        session.broadcast(session.status_frame(Some("restarting".into())));

        if let Err(e) = self.spawn_pty(&session) {
            *session.state.write() = SessionState::Exited;
            session.broadcast(session.status_frame(Some("restart failed".into())));
            self.sessions.lock().remove(session_id);
            return Err(e);
        }
        Ok(())
    }

    /// Kill the PTY, tell every client, forget the session.
    pub async fn terminate(&self, session_id: &str, reason: &str) {
        let Some(session) = self.sessions.lock().remove(session_id) else {
            return;
        };
        session.epoch.fetch_add(1, Ordering::SeqCst);
        *session.state.write() = SessionState::Exited;
        session.broadcast(session.status_frame(Some(reason.to_string())));
        let handle = session.pty.lock().take();
        if let Some(handle) = handle {
            kill_pty(handle).await;
        }
        info!("[session:{}] terminated ({reason})", session.id);
    }

    /// One-shot timer and sweeper both land here; whichever runs second finds
    /// nothing to do.
    pub async fn reap_if_expired(&self, session_id: &str) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        let expired = {
            if !session.io.lock().clients.is_empty() {
                return;
            }
            session
                .disconnected_at
                .lock()
                .map(|at| at.elapsed() >= self.limits.disconnected_ttl)
                .unwrap_or(false)
        };
        if expired {
            self.terminate(session_id, "terminated").await;
        }
    }

    /// Low-frequency background sweep; converges with the per-session timers.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let manager = self.clone();
        self.runtime.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                let ids: Vec<String> = manager.sessions.lock().keys().cloned().collect();
                for id in ids {
                    manager.reap_if_expired(&id).await;
                }
            }
        });
    }

    fn handle_pty_exit(&self, session: &Arc<Session>, epoch: u64) {
        if session.epoch.load(Ordering::SeqCst) != epoch {
            // A restart superseded this PTY; the new reader owns the session.
            return;
        }
        let exit_code = {
            let mut pty = session.pty.lock();
            pty.take().and_then(|mut handle| {
                handle
                    .child
                    .try_wait()
                    .ok()
                    .flatten()
                    .map(|status| status.exit_code() as i32)
            })
        };
        *session.exit_code.write() = exit_code;
        *session.state.write() = SessionState::Exited;
        let message = match exit_code {
            Some(code) => format!("process exited with code {code}"),
            None => "process exited".to_string(),
        };
        session.broadcast(session.status_frame(Some(message)));
        self.sessions.lock().remove(&session.id);
        info!("[session:{}] exited (code {:?})", session.id, exit_code);
    }
}

fn sh_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "'\\''"))
}

/// Dedicated writer thread; chunked writes let the PTY buffer drain between
/// bursts instead of blocking the socket task.
fn spawn_pty_writer_thread(
    session_id: String,
    mut writer: Box<dyn Write + Send>,
    input_rx: std::sync::mpsc::Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if writer.write_all(chunk).is_err() || writer.flush().is_err() {
                    warn!("[writer:{session_id}] pty write failed, stopping");
                    return;
                }
                std::thread::yield_now();
            }
        }
    });
}

/// Blocking reader draining the PTY master. The first byte flips the session
/// to `running`; EOF or a read error counts as process exit.
fn spawn_pty_reader_thread(
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    mut reader: Box<dyn Read + Send>,
    epoch: u64,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if session.epoch.load(Ordering::SeqCst) != epoch {
                        return;
                    }
                    {
                        let mut state = session.state.write();
                        if *state == SessionState::Starting {
                            *state = SessionState::Running;
                            drop(state);
                            session.broadcast(session.status_frame(None));
                        }
                    }
                    pending.extend_from_slice(&buf[..n]);
                    let valid = utf8_boundary(&pending);
                    if valid == 0 {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&pending[..valid]).to_string();
                    {
                        // Ring append plus fan-out is one critical section so
                        // attach snapshots stay exact.
                        let mut io = session.io.lock();
                        io.ring.push(&pending[..valid]);
                        let frame = ServerFrame::Output { data: text };
                        let session_id = session.id.clone();
                        io.clients.retain(|client_id, client| {
                            match client.tx.try_send(frame.clone()) {
                                Ok(()) => true,
                                Err(e) => {
                                    warn!(
                                        "[reader:{session_id}] dropping client {client_id}: {e}"
                                    );
                                    false
                                }
                            }
                        });
                    }
                    pending.drain(..valid);
                    *session.last_activity.lock() = Instant::now();
                }
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::WouldBlock {
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    break;
                }
            }
        }
        manager.handle_pty_exit(&session, epoch);
    });
}

async fn kill_pty(handle: PtyHandle) {
    let _ = tokio::task::spawn_blocking(move || {
        let mut handle = handle;
        if let Err(e) = handle.child.kill() {
            warn!("failed to kill pty child: {e}");
        }
        let _ = handle.child.wait();
    })
    .await;
}

/// Longest prefix of `bytes` that ends on a UTF-8 character boundary. A
/// trailing incomplete sequence is carried over to the next read.
fn utf8_boundary(bytes: &[u8]) -> usize {
    if std::str::from_utf8(bytes).is_ok() {
        return bytes.len();
    }
    for i in 1..=4.min(bytes.len()) {
        let end = bytes.len() - i;
        if std::str::from_utf8(&bytes[..end]).is_ok() {
            return end;
        }
    }
    // Not a dangling multi-byte tail; emit everything and let the lossy
    // conversion mark the damage.
    bytes.len()
}
