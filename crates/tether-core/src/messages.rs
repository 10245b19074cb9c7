//! Protocol message types.
//!
//! Every frame is a JSON record with a `type` discriminator. Field names are
//! camelCase on the wire.

use serde::{Deserialize, Serialize};

/// Default terminal width when the client omits one.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height when the client omits one.
pub const DEFAULT_ROWS: u16 = 24;

// ── Client → Server ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Init(InitPayload),
    Attach(AttachPayload),
    Input(InputPayload),
    Resize(ResizePayload),
    Ping,
    List,
    Destroy(SessionRefPayload),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    /// Spawn the login shell instead of the hosted program.
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub resume_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachPayload {
    pub session_id: String,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPayload {
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePayload {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefPayload {
    pub session_id: String,
}

// ── Server → Client ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Session(SessionPayload),
    Output(DataPayload),
    Replay(DataPayload),
    Exit(ExitPayload),
    Error(ErrorPayload),
    InputNeeded,
    Detached(DetachedPayload),
    Pong,
    Sessions(SessionsPayload),
    Destroyed(SessionRefPayload),
    Resumable(ResumablePayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub session_id: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub is_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitPayload {
    pub exit_code: i32,
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumable_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    InvalidRequest,
    SpawnFailed,
    SessionLimit,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetachReason {
    /// Another connection attached to the same session.
    Replaced,
    /// The session was destroyed while this connection held it.
    Destroyed,
    /// The server is going down.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedPayload {
    pub reason: DetachReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionsPayload {
    pub sessions: Vec<SessionEntry>,
}

/// One live session as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub attached: bool,
    pub created_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumablePayload {
    pub sessions: Vec<ResumableEntry>,
}

/// A working directory paired with the identifier that resumes the hosted
/// program there. Also the record format of the durable resume store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumableEntry {
    pub working_directory: String,
    pub resumable_id: String,
}

impl ServerMessage {
    /// Shorthand for an `error` reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            message: message.into(),
            code,
        })
    }

    pub fn detached(reason: DetachReason) -> Self {
        ServerMessage::Detached(DetachedPayload { reason })
    }
}
