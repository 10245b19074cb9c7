//! PTY adapter using portable-pty.
//!
//! Opens a pseudo-terminal, spawns the session program on it, and moves all
//! blocking I/O onto dedicated threads: one reader that turns PTY output into
//! ordered [`PtyEvent`]s followed by a single exit event, and one writer that
//! drains queued input.

use super::process::{ProcessControl, ProcessExit, ProcessSpawner, PtyEvent, SpawnRequest, SpawnedProcess};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::Mutex;
use tether_core::{TetherError, TetherResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Read size for the PTY master.
const READ_BUF_SIZE: usize = 8192;

/// Bounded so a stalled consumer applies backpressure to the reader thread.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Spawns session programs on native pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, request: &SpawnRequest) -> TetherResult<SpawnedProcess> {
        PtyHandle::spawn(request)
    }
}

/// Control side of a running PTY child.
pub struct PtyHandle {
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Mutex because MasterPty is not Sync.
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyHandle {
    /// Open a PTY, spawn the requested program on it and start the I/O threads.
    pub fn spawn(request: &SpawnRequest) -> TetherResult<SpawnedProcess> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| TetherError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        for key in &request.strip_env {
            cmd.env_remove(key);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        cmd.env("FORCE_COLOR", "1");

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            TetherError::Spawn(format!("failed to spawn {}: {e}", request.program))
        })?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let guard = SpawnGuard::new(child.clone_killer());

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TetherError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TetherError::Spawn(format!("failed to take PTY writer: {e}")))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || read_loop(reader, child, event_tx))
            .map_err(|e| TetherError::Spawn(format!("failed to start PTY reader: {e}")))?;
        std::thread::Builder::new()
            .name("pty-writer".into())
            .spawn(move || write_loop(writer, input_rx))
            .map_err(|e| TetherError::Spawn(format!("failed to start PTY writer: {e}")))?;
        guard.disarm();

        info!(
            program = %request.program,
            cwd = %request.cwd.display(),
            cols = request.cols,
            rows = request.rows,
            pid = ?pid,
            "PTY spawned"
        );

        let handle = PtyHandle {
            input_tx,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        };

        Ok(SpawnedProcess {
            control: Box::new(handle),
            events: event_rx,
            pid,
        })
    }
}

impl ProcessControl for PtyHandle {
    fn write(&self, data: Vec<u8>) -> TetherResult<()> {
        self.input_tx
            .send(data)
            .map_err(|_| TetherError::Other("PTY writer closed".into()))
    }

    fn resize(&self, cols: u16, rows: u16) -> TetherResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| TetherError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| TetherError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn kill(&self) -> TetherResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| TetherError::Other("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| TetherError::Other(format!("kill failed: {e}")))
    }
}

/// Kills a freshly spawned child unless spawning completes.
struct SpawnGuard {
    killer: Box<dyn ChildKiller + Send + Sync>,
    armed: bool,
}

impl SpawnGuard {
    fn new(killer: Box<dyn ChildKiller + Send + Sync>) -> Self {
        Self { killer, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("PTY setup failed, killing child");
            if let Err(e) = self.killer.kill() {
                debug!(error = %e, "kill after failed setup failed");
            }
        }
    }
}

/// Pump PTY output into the event channel, then report the exit status.
fn read_loop(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    events: mpsc::Sender<PtyEvent>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut carry = Utf8Carry::default();
    let mut consumer_alive = true;

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = carry.feed(&buf[..n]);
                if consumer_alive
                    && !chunk.is_empty()
                    && events.blocking_send(PtyEvent::Data(chunk)).is_err()
                {
                    // Keep draining so the child never blocks on a full PTY.
                    consumer_alive = false;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the child side is gone.
            Err(_) => break,
        }
    }

    let rest = carry.finish();
    if consumer_alive && !rest.is_empty() {
        let _ = events.blocking_send(PtyEvent::Data(rest));
    }

    let exit = match child.wait() {
        Ok(status) => ProcessExit {
            code: i32::try_from(status.exit_code()).unwrap_or(-1),
            signal: status.signal().map(str::to_string),
        },
        Err(e) => {
            warn!(error = %e, "failed to wait for PTY child");
            ProcessExit {
                code: -1,
                signal: None,
            }
        }
    };
    info!(code = exit.code, signal = ?exit.signal, "PTY child exited");
    let _ = events.blocking_send(PtyEvent::Exit(exit));
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            debug!(error = %e, "PTY write failed, stopping writer");
            break;
        }
    }
}

/// Holds back an incomplete trailing UTF-8 sequence until the next read so
/// chunk boundaries never split a character.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);
        let keep = incomplete_tail(&self.pending);
        let rest = self.pending.split_off(self.pending.len() - keep);
        std::mem::replace(&mut self.pending, rest)
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let need = if b & 0xE0 == 0xC0 {
            2
        } else if b & 0xF0 == 0xE0 {
            3
        } else if b & 0xF8 == 0xF0 {
            4
        } else {
            1
        };
        return if need > back { back } else { 0 };
    }
    0
}
