//! Scripted process spawner for registry and multiplexer tests.

use super::connection::{Outbound, OutboundQueue};
use super::process::{ProcessControl, ProcessExit, ProcessSpawner, PtyEvent, SpawnRequest, SpawnedProcess};
use super::registry::{SessionPolicy, SessionRegistry};
use super::resume::{ResumeScanner, DEFAULT_RESUME_PATTERN};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{TetherError, TetherResult};
use tokio::sync::mpsc;

pub const IDLE: Duration = Duration::from_secs(5);
pub const DETACHED_TIMEOUT: Duration = Duration::from_secs(4 * 3600);
pub const EXITED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct FakeLog {
    pub written: Vec<u8>,
    pub resizes: Vec<(u16, u16)>,
    pub kills: usize,
    pub exited: bool,
}

/// Test-side handle for one spawned fake process.
#[derive(Clone)]
pub struct FakeProcess {
    events: mpsc::Sender<PtyEvent>,
    log: Arc<Mutex<FakeLog>>,
}

impl FakeProcess {
    pub async fn emit(&self, data: &str) {
        self.events
            .send(PtyEvent::Data(data.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    pub async fn exit(&self, code: i32) {
        self.log.lock().unwrap().exited = true;
        self.events
            .send(PtyEvent::Exit(ProcessExit { code, signal: None }))
            .await
            .unwrap();
    }

    pub fn written(&self) -> String {
        String::from_utf8(self.log.lock().unwrap().written.clone()).unwrap()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.log.lock().unwrap().resizes.clone()
    }

    pub fn kills(&self) -> usize {
        self.log.lock().unwrap().kills
    }
}

struct FakeControl {
    events: mpsc::Sender<PtyEvent>,
    log: Arc<Mutex<FakeLog>>,
    exit_on_kill: bool,
}

impl ProcessControl for FakeControl {
    fn write(&self, data: Vec<u8>) -> TetherResult<()> {
        self.log.lock().unwrap().written.extend(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> TetherResult<()> {
        self.log.lock().unwrap().resizes.push((cols, rows));
        Ok(())
    }

    fn kill(&self) -> TetherResult<()> {
        let mut log = self.log.lock().unwrap();
        log.kills += 1;
        if self.exit_on_kill && !log.exited {
            log.exited = true;
            let _ = self.events.try_send(PtyEvent::Exit(ProcessExit {
                code: 1,
                signal: Some("SIGHUP".into()),
            }));
        }
        Ok(())
    }
}

#[derive(Default)]
struct SpawnerState {
    requests: Vec<SpawnRequest>,
    processes: Vec<FakeProcess>,
    fail: bool,
    ignore_kill: bool,
    /// Blocks the spawning thread, like a slow fork/exec.
    delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeSpawner {
    state: Arc<Mutex<SpawnerState>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every spawn fails.
    pub fn failing() -> Self {
        let spawner = Self::default();
        spawner.state.lock().unwrap().fail = true;
        spawner
    }

    /// Processes survive `kill`.
    pub fn ignoring_kill() -> Self {
        let spawner = Self::default();
        spawner.state.lock().unwrap().ignore_kill = true;
        spawner
    }

    /// Every spawn blocks its thread for `delay` first.
    pub fn slow(delay: Duration) -> Self {
        let spawner = Self::default();
        spawner.state.lock().unwrap().delay = Some(delay);
        spawner
    }

    pub fn process(&self, index: usize) -> FakeProcess {
        self.state.lock().unwrap().processes[index].clone()
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> TetherResult<SpawnedProcess> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if state.fail {
            return Err(TetherError::Spawn(format!("no such program: {}", request.program)));
        }
        let (tx, rx) = mpsc::channel(64);
        let log = Arc::new(Mutex::new(FakeLog::default()));
        state.processes.push(FakeProcess {
            events: tx.clone(),
            log: log.clone(),
        });
        Ok(SpawnedProcess {
            control: Box::new(FakeControl {
                events: tx,
                log,
                exit_on_kill: !state.ignore_kill,
            }),
            events: rx,
            pid: None,
        })
    }
}

pub fn policy() -> SessionPolicy {
    SessionPolicy {
        program: "claude".into(),
        args: vec![],
        resume_flag: "--resume".into(),
        shell: "/bin/sh".into(),
        default_cwd: PathBuf::from("/home/tester"),
        strip_env: vec!["SSH_AUTH_SOCK".into(), "SSH_AGENT_PID".into()],
        buffer_bytes: 1024,
        idle_notify: IDLE,
        detached_timeout: DETACHED_TIMEOUT,
        exited_timeout: EXITED_TIMEOUT,
        max_sessions: 4,
    }
}

pub fn registry_with(spawner: &FakeSpawner, policy: SessionPolicy) -> SessionRegistry {
    let scanner = ResumeScanner::new(DEFAULT_RESUME_PATTERN, 4096).unwrap();
    SessionRegistry::new(policy, scanner, Arc::new(spawner.clone()))
}

pub fn registry(spawner: &FakeSpawner) -> SessionRegistry {
    registry_with(spawner, policy())
}

/// Let spawned tasks run until they block, advancing paused time by 1ms.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Everything queued on a connection so far.
pub fn drain(rx: &mut OutboundQueue) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
