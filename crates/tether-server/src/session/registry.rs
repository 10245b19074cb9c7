//! Session lifecycle management.
//!
//! The registry owns every session record. All mutations (client requests,
//! process events, timer firings) go through one lock, so handlers for the
//! same session never interleave. Each session's attached connection is the
//! only authority for where output goes.

use super::connection::ConnectionHandle;
use super::process::{ProcessControl, ProcessExit, ProcessSpawner, PtyEvent, SpawnRequest};
use super::resume::ResumeScanner;
use super::ring_buffer::RingBuffer;
use super::timers::ScheduledTask;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::messages::{DataPayload, ExitPayload, SessionEntry, SessionPayload};
use tether_core::{DetachReason, ResumableEntry, ServerMessage, TetherError, TetherResult};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn and timing policy applied to every session.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Hosted program.
    pub program: String,
    pub args: Vec<String>,
    /// Flag placed before the resume hint.
    pub resume_flag: String,
    /// Program used for `init{shell:true}`.
    pub shell: String,
    pub default_cwd: PathBuf,
    pub strip_env: Vec<String>,
    pub buffer_bytes: usize,
    /// Quiet period before an `input_needed` notice.
    pub idle_notify: Duration,
    /// Grace period for a detached session whose process is alive.
    pub detached_timeout: Duration,
    /// Grace period for a detached session whose process has exited.
    pub exited_timeout: Duration,
    pub max_sessions: usize,
}

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    /// Working directory; the policy default when absent.
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    pub shell: bool,
    pub resume_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Detached,
    Exited,
}

/// A session record.
struct Session {
    id: String,
    cwd: PathBuf,
    process: Box<dyn ProcessControl>,
    attached: Option<ConnectionHandle>,
    history: RingBuffer,
    cols: u16,
    rows: u16,
    exit: Option<ProcessExit>,
    resumable_id: Option<String>,
    idle_notified: bool,
    idle_timer: Option<ScheduledTask>,
    eviction_timer: Option<ScheduledTask>,
    pump: Option<JoinHandle<()>>,
    created_at: Instant,
}

impl Session {
    fn is_exited(&self) -> bool {
        self.exit.is_some()
    }

    fn is_attached_to(&self, conn_id: u64) -> bool {
        self.attached.as_ref().is_some_and(|c| c.id() == conn_id)
    }

    fn state(&self) -> SessionState {
        if self.is_exited() {
            SessionState::Exited
        } else if self.attached.is_some() {
            SessionState::Active
        } else {
            SessionState::Detached
        }
    }

    fn identity(&self, is_reconnect: bool) -> ServerMessage {
        ServerMessage::Session(SessionPayload {
            session_id: self.id.clone(),
            cwd: self.cwd.display().to_string(),
            cols: self.cols,
            rows: self.rows,
            is_reconnect,
        })
    }

    fn exit_message(&self) -> Option<ServerMessage> {
        self.exit.as_ref().map(|exit| {
            ServerMessage::Exit(ExitPayload {
                exit_code: exit.code,
                signal: exit.signal.clone(),
                resumable_id: self.resumable_id.clone(),
            })
        })
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            cols: self.cols,
            rows: self.rows,
            state: self.state(),
            attached: self.attached.is_some(),
            buffered_bytes: self.history.len(),
            created_at: self.created_at,
        }
    }
}

/// Snapshot of a session without its output history.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub state: SessionState,
    pub attached: bool,
    /// Bytes of output history retained for replay.
    pub buffered_bytes: usize,
    pub created_at: Instant,
}

impl SessionSummary {
    pub fn to_entry(&self) -> SessionEntry {
        SessionEntry {
            session_id: self.id.clone(),
            cwd: self.cwd.display().to_string(),
            cols: self.cols,
            rows: self.rows,
            attached: self.attached,
            created_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

struct RegistryState {
    sessions: HashMap<String, Session>,
    /// Set by the shutdown coordinator; stops eviction timers from arming.
    draining: bool,
    /// Creates that passed the limit check and are still spawning.
    starting: usize,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    spawner: Arc<dyn ProcessSpawner>,
    policy: SessionPolicy,
    scanner: ResumeScanner,
}

/// Authoritative map of session id to session record.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        policy: SessionPolicy,
        scanner: ResumeScanner,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    sessions: HashMap::new(),
                    draining: false,
                    starting: 0,
                }),
                spawner,
                policy,
                scanner,
            }),
        }
    }

    /// Spawn a process and register a session for it.
    ///
    /// When `attach` is given, the connection is attached before any output
    /// can be delivered and receives `session{isReconnect:false}`.
    pub async fn create(
        &self,
        request: SessionRequest,
        attach: Option<&ConnectionHandle>,
    ) -> TetherResult<SessionSummary> {
        let policy = &self.inner.policy;
        let cwd = request
            .cwd
            .clone()
            .unwrap_or_else(|| policy.default_cwd.clone());
        let spawn = self.spawn_request(&request, cwd.clone());

        // Reserve a slot so concurrent creates cannot overrun the limit
        // while the lock is released for the spawn.
        {
            let mut state = self.inner.state.lock().await;
            if state.draining {
                return Err(TetherError::Other("server is shutting down".into()));
            }
            let live = state.sessions.values().filter(|s| !s.is_exited()).count();
            if live + state.starting >= policy.max_sessions {
                return Err(TetherError::SessionLimit(policy.max_sessions));
            }
            state.starting += 1;
        }

        let spawned = self.inner.spawner.spawn(&spawn);

        let mut state = self.inner.state.lock().await;
        state.starting -= 1;
        let spawned = spawned?;
        if state.draining {
            if let Err(e) = spawned.control.kill() {
                warn!(error = %e, "kill of late session failed");
            }
            return Err(TetherError::Other("server is shutting down".into()));
        }

        let id = loop {
            let candidate = generate_session_id();
            if !state.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let mut session = Session {
            id: id.clone(),
            cwd,
            process: spawned.control,
            attached: None,
            history: RingBuffer::new(policy.buffer_bytes),
            cols: request.cols,
            rows: request.rows,
            exit: None,
            resumable_id: None,
            idle_notified: false,
            idle_timer: None,
            eviction_timer: None,
            pump: None,
            created_at: Instant::now(),
        };

        match attach {
            Some(conn) => {
                conn.send(session.identity(false));
                session.attached = Some(conn.clone());
            }
            None => {
                session.eviction_timer = Some(self.schedule_eviction(&id, policy.detached_timeout));
            }
        }
        session.idle_timer = Some(self.schedule_idle(&id));
        // Blocks on the lock until this insert is done.
        session.pump = Some(self.start_pump(id.clone(), spawned.events));

        info!(
            session_id = %id,
            pid = ?spawned.pid,
            cwd = %session.cwd.display(),
            program = %spawn.program,
            "session created"
        );
        let summary = session.summary();
        state.sessions.insert(id, session);
        Ok(summary)
    }

    /// Look up a session.
    pub async fn get(&self, session_id: &str) -> Option<SessionSummary> {
        let state = self.inner.state.lock().await;
        state.sessions.get(session_id).map(Session::summary)
    }

    /// Sessions whose process is still running, oldest first.
    pub async fn list_active(&self) -> Vec<SessionSummary> {
        let state = self.inner.state.lock().await;
        let mut active: Vec<SessionSummary> = state
            .sessions
            .values()
            .filter(|s| !s.is_exited())
            .map(Session::summary)
            .collect();
        active.sort_by_key(|s| s.created_at);
        active
    }

    /// Number of resident sessions, exited or not.
    pub async fn count(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    /// Attach `conn` to a session, replacing any current attachment.
    ///
    /// Sends `session{isReconnect:true}`, the retained history as `replay`
    /// messages, and the exit notice if the process already ended. A supplied
    /// size is applied to a live process last.
    pub async fn attach(
        &self,
        session_id: &str,
        conn: &ConnectionHandle,
        size: Option<(u16, u16)>,
    ) -> TetherResult<SessionSummary> {
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TetherError::SessionNotFound(session_id.to_string()))?;

        if let Some(timer) = session.eviction_timer.take() {
            timer.cancel();
        }

        if let Some(previous) = session.attached.take() {
            if previous.id() != conn.id() {
                info!(
                    session_id,
                    replaced = previous.id(),
                    conn_id = conn.id(),
                    "attachment replaced"
                );
                previous.evict(DetachReason::Replaced);
            }
        }
        session.attached = Some(conn.clone());

        let resize = size.filter(|&(cols, rows)| cols > 0 && rows > 0 && !session.is_exited());
        if let Some((cols, rows)) = resize {
            session.cols = cols;
            session.rows = rows;
        }

        conn.send(session.identity(true));
        for chunk in session.history.chunks() {
            conn.send(ServerMessage::Replay(DataPayload {
                data: String::from_utf8_lossy(chunk).into_owned(),
            }));
        }
        if let Some(exit) = session.exit_message() {
            conn.send(exit);
        }
        if let Some((cols, rows)) = resize {
            if let Err(e) = session.process.resize(cols, rows) {
                warn!(session_id, error = %e, "resize on attach failed");
            }
        }

        info!(
            session_id,
            conn_id = conn.id(),
            replayed_chunks = session.history.chunk_count(),
            exited = session.is_exited(),
            "client attached"
        );
        Ok(session.summary())
    }

    /// Detach `conn_id` from a session and arm its eviction timer.
    ///
    /// A no-op returning false when the connection is no longer the
    /// session's attachment (a late close from a replaced connection).
    pub async fn detach(&self, session_id: &str, conn_id: u64) -> bool {
        let mut state = self.inner.state.lock().await;
        let draining = state.draining;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return false;
        };
        if !session.is_attached_to(conn_id) {
            debug!(session_id, conn_id, "stale detach ignored");
            return false;
        }

        session.attached = None;
        if !draining {
            let timeout = if session.is_exited() {
                self.inner.policy.exited_timeout
            } else {
                self.inner.policy.detached_timeout
            };
            session.eviction_timer = Some(self.schedule_eviction(session_id, timeout));
            info!(session_id, conn_id, timeout_secs = timeout.as_secs(), "client detached");
        }
        true
    }

    /// Forward input from `conn_id` to the session's process.
    ///
    /// Dropped unless the process is alive and `conn_id` holds the session.
    pub async fn write_input(&self, session_id: &str, conn_id: u64, data: Vec<u8>) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return false;
        };
        if session.is_exited() || !session.is_attached_to(conn_id) {
            debug!(session_id, conn_id, "input dropped");
            return false;
        }
        if let Err(e) = session.process.write(data) {
            warn!(session_id, error = %e, "PTY write failed");
            return false;
        }
        self.note_activity(session);
        true
    }

    /// Record new terminal dimensions and apply them to a live process.
    ///
    /// Ignored unless `conn_id` holds the session.
    pub async fn resize(&self, session_id: &str, conn_id: u64, cols: u16, rows: u16) -> TetherResult<()> {
        if cols == 0 || rows == 0 {
            return Err(TetherError::InvalidMessage(format!(
                "invalid terminal size {cols}x{rows}"
            )));
        }
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TetherError::SessionNotFound(session_id.to_string()))?;
        if !session.is_attached_to(conn_id) {
            debug!(session_id, conn_id, "resize from detached connection ignored");
            return Ok(());
        }
        session.cols = cols;
        session.rows = rows;
        if !session.is_exited() {
            if let Err(e) = session.process.resize(cols, rows) {
                warn!(session_id, error = %e, "resize failed");
            }
        }
        Ok(())
    }

    /// Destroy a session. Absent ids are a no-op returning false.
    pub async fn destroy(&self, session_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        destroy_locked(&mut state.sessions, session_id, DetachReason::Destroyed)
    }

    /// Destroy every session.
    pub async fn destroy_all(&self) -> usize {
        self.destroy_all_with(DetachReason::Destroyed).await
    }

    /// Destroy every session, telling attached clients why.
    pub async fn destroy_all_with(&self, reason: DetachReason) -> usize {
        let mut state = self.inner.state.lock().await;
        let ids: Vec<String> = state.sessions.keys().cloned().collect();
        ids.iter()
            .filter(|id| destroy_locked(&mut state.sessions, id, reason))
            .count()
    }

    // ── Shutdown support ────────────────────────────────────────────

    /// Stop arming eviction timers, cancel pending ones and kill every live
    /// process. Returns the ids of sessions that were still running.
    pub async fn begin_drain(&self) -> Vec<String> {
        let mut state = self.inner.state.lock().await;
        state.draining = true;
        let mut pending = Vec::new();
        for (id, session) in state.sessions.iter_mut() {
            if let Some(timer) = session.eviction_timer.take() {
                timer.cancel();
            }
            if session.is_exited() {
                continue;
            }
            if let Err(e) = session.process.kill() {
                warn!(session_id = %id, error = %e, "kill failed during drain");
            }
            pending.push(id.clone());
        }
        pending
    }

    /// Whether every listed session has exited or is gone.
    pub async fn all_exited(&self, session_ids: &[String]) -> bool {
        let state = self.inner.state.lock().await;
        session_ids
            .iter()
            .all(|id| state.sessions.get(id).map_or(true, Session::is_exited))
    }

    /// Working directory and resumable id of every resident session that
    /// printed a resume marker, oldest session first.
    pub async fn resumable_entries(&self) -> Vec<ResumableEntry> {
        let state = self.inner.state.lock().await;
        let mut sessions: Vec<&Session> = state.sessions.values().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
            .into_iter()
            .filter_map(|s| {
                let resumable_id = self.scan_resumable(s)?;
                Some(ResumableEntry {
                    working_directory: s.cwd.display().to_string(),
                    resumable_id,
                })
            })
            .collect()
    }

    // ── Internals ───────────────────────────────────────────────────

    fn spawn_request(&self, request: &SessionRequest, cwd: PathBuf) -> SpawnRequest {
        let policy = &self.inner.policy;
        let (program, args) = if request.shell {
            (policy.shell.clone(), Vec::new())
        } else {
            let mut args = policy.args.clone();
            if let Some(hint) = request.resume_hint.as_deref().filter(|h| !h.is_empty()) {
                args.push(policy.resume_flag.clone());
                args.push(hint.to_string());
            }
            (policy.program.clone(), args)
        };
        SpawnRequest {
            program,
            args,
            cwd,
            cols: request.cols,
            rows: request.rows,
            strip_env: policy.strip_env.clone(),
        }
    }

    fn scan_resumable(&self, session: &Session) -> Option<String> {
        let scanner = &self.inner.scanner;
        scanner.extract(&session.history.tail(scanner.window()))
    }

    /// Consume one session's process events in order.
    fn start_pump(&self, session_id: String, mut events: mpsc::Receiver<PtyEvent>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let is_exit = matches!(event, PtyEvent::Exit(_));
                registry.handle_event(&session_id, event).await;
                if is_exit {
                    break;
                }
            }
        })
    }

    async fn handle_event(&self, session_id: &str, event: PtyEvent) {
        let mut state = self.inner.state.lock().await;
        let draining = state.draining;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };
        if session.is_exited() {
            return;
        }

        match event {
            PtyEvent::Data(chunk) => {
                if let Some(conn) = &session.attached {
                    conn.send(ServerMessage::Output(DataPayload {
                        data: String::from_utf8_lossy(&chunk).into_owned(),
                    }));
                }
                session.history.push(chunk);
                self.note_activity(session);
            }
            PtyEvent::Exit(exit) => {
                if let Some(timer) = session.idle_timer.take() {
                    timer.cancel();
                }
                session.resumable_id = self.scan_resumable(session);
                info!(
                    session_id,
                    code = exit.code,
                    signal = ?exit.signal,
                    resumable_id = ?session.resumable_id,
                    "session process exited"
                );
                session.exit = Some(exit);

                match &session.attached {
                    Some(conn) => {
                        if let Some(msg) = session.exit_message() {
                            conn.send(msg);
                        }
                    }
                    None if !draining => {
                        let timer = self.schedule_eviction(session_id, self.inner.policy.exited_timeout);
                        session.eviction_timer = Some(timer);
                    }
                    None => {}
                }
            }
        }
    }

    /// Clear the idle flag and restart the idle timer.
    fn note_activity(&self, session: &mut Session) {
        session.idle_notified = false;
        let timer = self.schedule_idle(&session.id);
        session.idle_timer = Some(timer);
    }

    fn schedule_idle(&self, session_id: &str) -> ScheduledTask {
        let registry = self.clone();
        let session_id = session_id.to_string();
        ScheduledTask::schedule(self.inner.policy.idle_notify, move |token| async move {
            registry.idle_fired(&session_id, token).await;
        })
    }

    fn schedule_eviction(&self, session_id: &str, timeout: Duration) -> ScheduledTask {
        let registry = self.clone();
        let session_id = session_id.to_string();
        ScheduledTask::schedule(timeout, move |token| async move {
            registry.eviction_fired(&session_id, token).await;
        })
    }

    async fn idle_fired(&self, session_id: &str, token: u64) {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };
        if session.idle_timer.as_ref().map(ScheduledTask::token) != Some(token) {
            return;
        }
        session.idle_timer = None;
        if session.is_exited() || session.idle_notified {
            return;
        }
        session.idle_notified = true;
        if let Some(conn) = &session.attached {
            conn.send(ServerMessage::InputNeeded);
        }
        debug!(session_id, attached = session.attached.is_some(), "session awaiting input");
    }

    async fn eviction_fired(&self, session_id: &str, token: u64) {
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.sessions.get(session_id) else {
            return;
        };
        if session.eviction_timer.as_ref().map(ScheduledTask::token) != Some(token) {
            return;
        }
        info!(session_id, exited = session.is_exited(), "evicting unclaimed session");
        destroy_locked(&mut state.sessions, session_id, DetachReason::Destroyed);
    }
}

/// Remove a session: cancel its timers, kill a live process, and evict any
/// attached connection.
fn destroy_locked(
    sessions: &mut HashMap<String, Session>,
    session_id: &str,
    reason: DetachReason,
) -> bool {
    let Some(mut session) = sessions.remove(session_id) else {
        return false;
    };
    if let Some(timer) = session.idle_timer.take() {
        timer.cancel();
    }
    if let Some(timer) = session.eviction_timer.take() {
        timer.cancel();
    }
    if !session.is_exited() {
        if let Err(e) = session.process.kill() {
            debug!(session_id, error = %e, "kill on destroy failed");
        }
    }
    if let Some(conn) = session.attached.take() {
        conn.evict(reason);
    }
    if let Some(pump) = session.pump.take() {
        pump.abort();
    }
    info!(session_id, ?reason, "session destroyed");
    true
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}
