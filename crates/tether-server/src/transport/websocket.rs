//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts upgrades on a single path; every other request is answered with
//! 404. Accepted connections are handed to the server through a channel.

use crate::session::Outbound;
use std::net::SocketAddr;
use tether_core::{encode, TetherError, TetherResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Maximum inbound frame size (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted
/// connections. The accept loop stops once the receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    path: String,
) -> TetherResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TetherError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        let check_path = |req: &Request, resp: Response| {
                            if req.uri().path() == path {
                                Ok(resp)
                            } else {
                                Err(not_found())
                            }
                        };
                        match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

fn not_found() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("Not Found".to_string()));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

/// Convert a queued outbound item into a WebSocket frame.
pub fn to_ws_message(item: Outbound) -> TetherResult<Message> {
    match item {
        Outbound::Message(msg) => Ok(Message::Text(encode(&msg)?.into())),
        Outbound::Close { code, reason } => Ok(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        }))),
    }
}

/// Reject inbound frames larger than [`MAX_WS_FRAME_SIZE`].
pub fn check_frame_size(len: usize) -> TetherResult<()> {
    if len > MAX_WS_FRAME_SIZE {
        return Err(TetherError::InvalidMessage(format!(
            "WS frame too large: {len} bytes (max {MAX_WS_FRAME_SIZE})"
        )));
    }
    Ok(())
}
