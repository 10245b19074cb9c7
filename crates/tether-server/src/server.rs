//! Core server: accepts WebSocket connections and runs one multiplexer per
//! connection.
//!
//! Owns the session registry handle, the resumable-session offers loaded at
//! startup, and the broadcast used to close connections at shutdown.

use crate::config::ServerConfig;
use crate::mux::Connection;
use crate::session::connection::CLOSE_GOING_AWAY;
use crate::session::{ConnectionHandle, Outbound, SessionRegistry};
use crate::transport::websocket::{self, WebSocketConnection};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_core::messages::ResumablePayload;
use tether_core::{ResumableEntry, ServerMessage, TetherResult};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// How long a finished connection waits for its writer to flush.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// The tether server instance.
pub struct TetherServer {
    bind_addr: SocketAddr,
    path: String,
    registry: SessionRegistry,
    /// Sessions persisted by the previous run, offered to every connection.
    offers: Vec<ResumableEntry>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl TetherServer {
    pub fn new(config: &ServerConfig, registry: SessionRegistry, offers: Vec<ResumableEntry>) -> Self {
        Self {
            bind_addr: SocketAddr::new(config.bind, config.port),
            path: config.path.clone(),
            registry,
            offers,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the listener and serve until the listener closes.
    pub async fn run(self: Arc<Self>) -> TetherResult<()> {
        let (addr, rx) = websocket::start_listener(self.bind_addr, self.path.clone()).await?;
        info!(
            addr = %addr,
            path = %self.path,
            offers = self.offers.len(),
            "tether-server ready"
        );
        self.serve(rx).await;
        Ok(())
    }

    /// Accept connections from the listener channel.
    pub async fn serve(self: Arc<Self>, mut ws_rx: mpsc::Receiver<WebSocketConnection>) {
        while let Some(ws_conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                srv.handle_websocket(ws_conn).await;
            });
        }
        info!("listener closed");
    }

    /// Ask every open connection to close.
    pub fn notify_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn handle_websocket(&self, conn: WebSocketConnection) {
        let remote = conn.remote_addr;
        let (mut sink, mut stream) = conn.ws_stream.split();
        let (handle, mut outbound_rx) = ConnectionHandle::new();
        let conn_id = handle.id();
        info!(remote = %remote, conn_id, "client connected");

        // Sole writer for this socket; stops after a close frame.
        let mut writer = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                let is_close = matches!(item, Outbound::Close { .. });
                let msg = match websocket::to_ws_message(item) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(conn_id, error = %e, "dropping unencodable message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(msg).await {
                    debug!(conn_id, error = %e, "WebSocket send failed");
                    return;
                }
                if is_close {
                    return;
                }
            }
            let _ = sink.close().await;
        });

        if !self.offers.is_empty() {
            handle.send(ServerMessage::Resumable(ResumablePayload {
                sessions: self.offers.clone(),
            }));
        }

        let mut connection = Connection::new(handle.clone(), self.registry.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut writer_done = false;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id, "shutdown signal received, closing connection");
                    handle.close(CLOSE_GOING_AWAY, "Server shutting down");
                    break;
                }

                _ = &mut writer => {
                    writer_done = true;
                    break;
                }

                _ = handle.overflowed() => {
                    warn!(conn_id, "client not reading, dropping connection");
                    writer.abort();
                    writer_done = true;
                    break;
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = websocket::check_frame_size(text.len()) {
                                warn!(conn_id, error = %e, "oversized frame dropped");
                                continue;
                            }
                            connection.handle_text(text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if let Err(e) = websocket::check_frame_size(data.len()) {
                                warn!(conn_id, error = %e, "oversized frame dropped");
                                continue;
                            }
                            connection.handle_binary(data.to_vec()).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(conn_id, "WebSocket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(conn_id, error = %e, "WebSocket session ended");
                            break;
                        }
                    }
                }
            }
        }

        let session_id = connection.session_id().map(str::to_string);
        connection.on_close().await;
        drop(connection);
        drop(handle);

        if !writer_done {
            if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        info!(remote = %remote, conn_id, session_id = ?session_id, "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::*;
    use futures_util::stream::SplitStream;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(registry: SessionRegistry, offers: Vec<ResumableEntry>) -> (Arc<TetherServer>, SocketAddr) {
        let server = Arc::new(TetherServer {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            path: "/ws/terminal".into(),
            registry,
            offers,
            shutdown_tx: broadcast::channel(1).0,
        });
        let (addr, rx) = websocket::start_listener(server.bind_addr, server.path.clone())
            .await
            .unwrap();
        tokio::spawn(server.clone().serve(rx));
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/terminal"))
            .await
            .unwrap();
        client
    }

    async fn next_json(stream: &mut SplitStream<Client>) -> serde_json::Value {
        loop {
            match stream.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn init_output_and_reattach_over_websocket() {
        let spawner = FakeSpawner::new();
        let (_server, addr) = start(registry(&spawner), Vec::new()).await;

        let (mut tx, mut rx) = connect(addr).await.split();
        tx.send(Message::Text(r#"{"type":"init","cwd":"/tmp"}"#.to_string().into()))
            .await
            .unwrap();
        let session = next_json(&mut rx).await;
        assert_eq!(session["type"], "session");
        assert_eq!(session["isReconnect"], false);
        let id = session["sessionId"].as_str().unwrap().to_string();

        spawner.process(0).emit("hello").await;
        let output = next_json(&mut rx).await;
        assert_eq!(output, serde_json::json!({"type": "output", "data": "hello"}));

        tx.send(Message::Text("ls\r".to_string().into())).await.unwrap();
        tx.send(Message::Binary(b"pwd\r".to_vec().into())).await.unwrap();
        tx.send(Message::Text(r#"{"type":"ping"}"#.to_string().into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut rx).await["type"], "pong");
        assert_eq!(spawner.process(0).written(), "ls\rpwd\r");

        // Second client takes over; the first is told why and closed.
        let (mut tx2, mut rx2) = connect(addr).await.split();
        tx2.send(Message::Text(
            format!(r#"{{"type":"attach","sessionId":"{id}"}}"#).into(),
        ))
        .await
        .unwrap();
        let reattached = next_json(&mut rx2).await;
        assert_eq!(reattached["isReconnect"], true);
        assert_eq!(
            next_json(&mut rx2).await,
            serde_json::json!({"type": "replay", "data": "hello"})
        );

        assert_eq!(
            next_json(&mut rx).await,
            serde_json::json!({"type": "detached", "reason": "replaced"})
        );
        match rx.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4001),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offers_resumable_sessions_on_connect() {
        let spawner = FakeSpawner::new();
        let offers = vec![ResumableEntry {
            working_directory: "/work".into(),
            resumable_id: "abc".into(),
        }];
        let (_server, addr) = start(registry(&spawner), offers).await;

        let (_tx, mut rx) = connect(addr).await.split();
        assert_eq!(
            next_json(&mut rx).await,
            serde_json::json!({
                "type": "resumable",
                "sessions": [{"workingDirectory": "/work", "resumableId": "abc"}]
            })
        );
    }

    #[tokio::test]
    async fn disconnect_detaches_session() {
        let spawner = FakeSpawner::new();
        let reg = registry(&spawner);
        let (_server, addr) = start(reg.clone(), Vec::new()).await;

        let (mut tx, mut rx) = connect(addr).await.split();
        tx.send(Message::Text(r#"{"type":"init"}"#.to_string().into()))
            .await
            .unwrap();
        let id = next_json(&mut rx).await["sessionId"]
            .as_str()
            .unwrap()
            .to_string();
        tx.close().await.unwrap();
        drop(rx);

        for _ in 0..100 {
            if !reg.get(&id).await.unwrap().attached {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session still attached after client disconnect");
    }

    #[tokio::test]
    async fn shutdown_closes_idle_connections() {
        let spawner = FakeSpawner::new();
        let (server, addr) = start(registry(&spawner), Vec::new()).await;

        let (_tx, mut rx) = connect(addr).await.split();
        // Give the server a moment to subscribe to the shutdown broadcast.
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.notify_shutdown();
        match rx.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1001),
            other => panic!("expected close, got {other:?}"),
        }
    }
}
