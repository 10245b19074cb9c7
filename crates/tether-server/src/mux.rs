//! Per-connection protocol state machine.
//!
//! A [`Connection`] remembers at most one session association and turns
//! decoded client frames into registry operations. Every reply goes through
//! the connection's outbound queue, so replies and session output share one
//! ordering.

use crate::session::{ConnectionHandle, SessionRegistry, SessionRequest};
use std::path::PathBuf;
use tether_core::messages::{
    AttachPayload, InitPayload, SessionRefPayload, SessionsPayload, DEFAULT_COLS, DEFAULT_ROWS,
};
use tether_core::{decode_text, ClientMessage, ErrorCode, Inbound, ServerMessage, TetherError};
use tracing::{debug, info, warn};

pub struct Connection {
    handle: ConnectionHandle,
    registry: SessionRegistry,
    session_id: Option<String>,
}

impl Connection {
    pub fn new(handle: ConnectionHandle, registry: SessionRegistry) -> Self {
        Self {
            handle,
            registry,
            session_id: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Session this connection last attached to, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match decode_text(text) {
            Ok(Inbound::Message(msg)) => self.dispatch(msg).await,
            Ok(Inbound::Passthrough(raw)) => self.forward_input(raw.into_bytes()).await,
            Err(e) => {
                debug!(conn_id = self.id(), error = %e, "rejected frame");
                self.reply_error(&e);
            }
        }
    }

    /// Handle one inbound binary frame: always literal input.
    pub async fn handle_binary(&mut self, data: Vec<u8>) {
        self.forward_input(data).await;
    }

    pub async fn dispatch(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Init(p) => self.init(p).await,
            ClientMessage::Attach(p) => self.attach(p).await,
            ClientMessage::Input(p) => self.forward_input(p.data.into_bytes()).await,
            ClientMessage::Resize(p) => self.resize(p.cols, p.rows).await,
            ClientMessage::Ping => {
                self.handle.send(ServerMessage::Pong);
            }
            ClientMessage::List => {
                let sessions = self
                    .registry
                    .list_active()
                    .await
                    .iter()
                    .map(|s| s.to_entry())
                    .collect();
                self.handle
                    .send(ServerMessage::Sessions(SessionsPayload { sessions }));
            }
            ClientMessage::Destroy(p) => self.destroy(p.session_id).await,
        }
    }

    /// The transport closed or failed. Detaches unless this connection was
    /// already superseded.
    pub async fn on_close(&mut self) {
        if let Some(id) = self.session_id.take() {
            self.registry.detach(&id, self.handle.id()).await;
        }
    }

    async fn init(&mut self, p: InitPayload) {
        self.detach_current().await;

        let request = SessionRequest {
            cwd: p.cwd.filter(|c| !c.is_empty()).map(PathBuf::from),
            cols: p.cols.filter(|&c| c > 0).unwrap_or(DEFAULT_COLS),
            rows: p.rows.filter(|&r| r > 0).unwrap_or(DEFAULT_ROWS),
            shell: p.shell,
            resume_hint: p.resume_hint,
        };
        match self.registry.create(request, Some(&self.handle)).await {
            Ok(summary) => {
                self.session_id = Some(summary.id);
            }
            Err(e) => {
                warn!(conn_id = self.id(), error = %e, "session creation failed");
                self.reply_error(&e);
            }
        }
    }

    async fn attach(&mut self, p: AttachPayload) {
        if self.registry.get(&p.session_id).await.is_none() {
            info!(conn_id = self.id(), session_id = %p.session_id, "attach to unknown session");
            self.reply_error(&TetherError::SessionNotFound(p.session_id));
            return;
        }
        if self.session_id.as_deref() != Some(p.session_id.as_str()) {
            self.detach_current().await;
        }

        let size = p.cols.zip(p.rows);
        match self.registry.attach(&p.session_id, &self.handle, size).await {
            Ok(summary) => {
                debug!(
                    conn_id = self.id(),
                    session_id = %summary.id,
                    state = ?summary.state,
                    buffered_bytes = summary.buffered_bytes,
                    "reattached"
                );
                self.session_id = Some(p.session_id);
            }
            Err(e) => {
                self.session_id = None;
                self.reply_error(&e);
            }
        }
    }

    async fn forward_input(&mut self, data: Vec<u8>) {
        match &self.session_id {
            Some(id) => {
                self.registry.write_input(id, self.handle.id(), data).await;
            }
            None => debug!(conn_id = self.id(), "input without a session dropped"),
        }
    }

    async fn resize(&mut self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            self.reply_error(&TetherError::InvalidMessage(format!(
                "invalid terminal size {cols}x{rows}"
            )));
            return;
        }
        let Some(id) = self.session_id.clone() else {
            debug!(conn_id = self.id(), "resize without a session ignored");
            return;
        };
        if let Err(e) = self.registry.resize(&id, self.handle.id(), cols, rows).await {
            self.reply_error(&e);
        }
    }

    async fn destroy(&mut self, session_id: String) {
        if self.registry.get(&session_id).await.is_none() {
            self.reply_error(&TetherError::SessionNotFound(session_id));
            return;
        }
        if self.session_id.as_deref() == Some(session_id.as_str()) {
            self.session_id = None;
        }
        self.handle.send(ServerMessage::Destroyed(SessionRefPayload {
            session_id: session_id.clone(),
        }));
        self.registry.destroy(&session_id).await;
        info!(conn_id = self.id(), session_id = %session_id, "session destroyed on request");
    }

    async fn detach_current(&mut self) {
        if let Some(id) = self.session_id.take() {
            self.registry.detach(&id, self.handle.id()).await;
        }
    }

    fn reply_error(&self, e: &TetherError) {
        let code = e.code();
        let message = match code {
            ErrorCode::SessionNotFound => "Session not found".to_string(),
            _ => e.to_string(),
        };
        self.handle.send(ServerMessage::error(code, message));
    }
}
