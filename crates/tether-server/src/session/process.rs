//! Process seam between the session registry and whatever runs the job.
//!
//! The registry only sees [`ProcessSpawner`], [`ProcessControl`] and the
//! ordered [`PtyEvent`] stream, so the PTY can be swapped for a scripted
//! process in tests.

use std::path::PathBuf;
use tether_core::TetherResult;
use tokio::sync::mpsc;

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: i32,
    pub signal: Option<String>,
}

/// Events emitted by a running process, in emission order.
///
/// `Exit` is sent exactly once and is always the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exit(ProcessExit),
}

/// Everything needed to start one session's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Environment variables removed from the inherited environment.
    pub strip_env: Vec<String>,
}

/// Non-blocking control surface over a running process.
///
/// Errors are immediate failures only; effects surface later as events.
pub trait ProcessControl: Send {
    fn write(&self, data: Vec<u8>) -> TetherResult<()>;
    fn resize(&self, cols: u16, rows: u16) -> TetherResult<()>;
    fn kill(&self) -> TetherResult<()>;
}

/// A freshly started process and its event stream.
pub struct SpawnedProcess {
    pub control: Box<dyn ProcessControl>,
    pub events: mpsc::Receiver<PtyEvent>,
    pub pid: Option<u32>,
}

/// Starts processes for new sessions.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> TetherResult<SpawnedProcess>;
}
