//! Outbound side of a client connection as seen by sessions.
//!
//! Sessions never touch sockets. They push [`Outbound`] items into the
//! connection's queue; the transport's writer task serializes them in order.
//! The queue is bounded by bytes: a client that stops reading is flagged as
//! overflowed and dropped instead of growing the server's memory.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tether_core::{DetachReason, ServerMessage};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// Close code sent to a connection superseded by another attach.
pub const CLOSE_REPLACED: u16 = 4001;
/// Close code sent when the held session is destroyed.
pub const CLOSE_DESTROYED: u16 = 4002;
/// Close code sent on server shutdown (RFC 6455 "going away").
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Bytes a connection may have queued before it is dropped as too slow.
/// Several times `config::MAX_BUFFER_BYTES`, so a full replay always fits.
pub const OUTBOUND_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// Weight charged per queued item on top of its payload.
const ITEM_OVERHEAD: usize = 64;

/// Close code and reason that accompany a `detached` notice.
pub fn close_frame(reason: DetachReason) -> (u16, &'static str) {
    match reason {
        DetachReason::Replaced => (CLOSE_REPLACED, "Replaced by new client"),
        DetachReason::Destroyed => (CLOSE_DESTROYED, "Session destroyed"),
        DetachReason::Shutdown => (CLOSE_GOING_AWAY, "Server shutting down"),
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// An item queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

impl Outbound {
    fn weight(&self) -> usize {
        match self {
            Outbound::Message(ServerMessage::Output(p) | ServerMessage::Replay(p)) => {
                p.data.len() + ITEM_OVERHEAD
            }
            _ => ITEM_OVERHEAD,
        }
    }
}

/// Byte accounting shared by a connection's handles and its queue.
#[derive(Debug)]
struct Backlog {
    queued: AtomicUsize,
    limit: usize,
    overflowed: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    backlog: Arc<Backlog>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh connection id and the queue its writer drains.
    pub fn new() -> (Self, OutboundQueue) {
        Self::with_limit(OUTBOUND_LIMIT_BYTES)
    }

    /// Like [`ConnectionHandle::new`] with a custom backlog limit in bytes.
    pub fn with_limit(limit: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(Backlog {
            queued: AtomicUsize::new(0),
            limit,
            overflowed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let queue = OutboundQueue {
            rx,
            backlog: backlog.clone(),
        };
        (Self { id, tx, backlog }, queue)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a message. Returns false if the connection is gone or overflowed.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.push(Outbound::Message(msg))
    }

    /// Tell the client it lost its session, then close the connection.
    pub fn evict(&self, reason: DetachReason) {
        let (code, text) = close_frame(reason);
        self.send(ServerMessage::detached(reason));
        self.close(code, text);
    }

    /// Queue a close frame; the writer stops after sending it.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.push(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Resolves once the backlog limit has been exceeded.
    pub async fn overflowed(&self) {
        if self.backlog.overflowed.load(Ordering::Acquire) {
            return;
        }
        self.backlog.notify.notified().await;
    }

    fn push(&self, item: Outbound) -> bool {
        let backlog = &self.backlog;
        if backlog.overflowed.load(Ordering::Acquire) {
            return false;
        }
        let weight = item.weight();
        let queued = backlog.queued.fetch_add(weight, Ordering::AcqRel) + weight;
        if queued > backlog.limit {
            backlog.queued.fetch_sub(weight, Ordering::AcqRel);
            if !backlog.overflowed.swap(true, Ordering::AcqRel) {
                warn!(conn_id = self.id, queued, limit = backlog.limit, "outbound backlog full");
                backlog.notify.notify_one();
            }
            return false;
        }
        if self.tx.send(item).is_err() {
            backlog.queued.fetch_sub(weight, Ordering::AcqRel);
            return false;
        }
        true
    }
}

/// Receiving end of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Outbound>,
    backlog: Arc<Backlog>,
}

impl OutboundQueue {
    pub async fn recv(&mut self) -> Option<Outbound> {
        let item = self.rx.recv().await?;
        self.release(&item);
        Some(item)
    }

    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        let item = self.rx.try_recv()?;
        self.release(&item);
        Ok(item)
    }

    fn release(&self, item: &Outbound) {
        self.backlog.queued.fetch_sub(item.weight(), Ordering::AcqRel);
    }
}
