//! Gateway session bookkeeping and message dispatch.
//!
//! One coarse lock guards the user→connection table; every read and
//! write goes through it. Connection handles are outbound senders plus a
//! connection id. Handlers capture user ids, never connection objects,
//! and resolve the live handle through the table, so no reference cycles
//! form.

use crate::envelope::{self, MsgId};
use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Outbound half of one client connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<String>,
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ClientHandle {
    /// Wrap an outbound sender; ids are process-unique.
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed), tx }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue a payload toward the client. `false` when the connection is
    /// already gone; callers treat that like a disconnect.
    pub fn send(&self, payload: impl Into<String>) -> bool {
        self.tx.send(payload.into()).is_ok()
    }
}

/// The gateway-local user→connection table.
#[derive(Debug, Default)]
pub struct SessionManager {
    table: Mutex<HashMap<i32, ClientHandle>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a user with a connection. Returns the handle this user
    /// was previously bound to, if any (login replacing a stale entry).
    /// A connection appears at most once: any other user bound to the
    /// same connection is evicted first.
    pub fn bind(&self, user_id: i32, handle: ClientHandle) -> Option<ClientHandle> {
        let mut table = self.table.lock().expect("session lock");
        table.retain(|uid, bound| *uid == user_id || bound.conn_id() != handle.conn_id());
        table.insert(user_id, handle)
    }

    /// Remove a user's binding (logout).
    pub fn unbind(&self, user_id: i32) -> Option<ClientHandle> {
        self.table.lock().expect("session lock").remove(&user_id)
    }

    /// Remove whatever user is bound to `conn_id` (disconnect path) and
    /// report who it was.
    pub fn unbind_conn(&self, conn_id: u64) -> Option<i32> {
        let mut table = self.table.lock().expect("session lock");
        let user_id = table
            .iter()
            .find(|(_, handle)| handle.conn_id() == conn_id)
            .map(|(user_id, _)| *user_id)?;
        table.remove(&user_id);
        Some(user_id)
    }

    pub fn find(&self, user_id: i32) -> Option<ClientHandle> {
        self.table.lock().expect("session lock").get(&user_id).cloned()
    }

    /// Forward a payload to a locally connected user. `false` when the
    /// user is not here or the connection is dead.
    pub fn send_to(&self, user_id: i32, payload: &str) -> bool {
        match self.find(user_id) {
            Some(handle) => handle.send(payload),
            None => false,
        }
    }

    pub fn online_count(&self) -> usize {
        self.table.lock().expect("session lock").len()
    }
}

/// Async message handler: `(conn, envelope, receive time)`.
pub type MsgHandler =
    Arc<dyn Fn(ClientHandle, Value, DateTime<Local>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Statically built msgid→handler table with a single unknown fallback.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<i64, MsgHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: MsgId, handler: MsgHandler) {
        self.handlers.insert(id.as_i64(), handler);
    }

    /// Parse one inbound buffer as a JSON envelope and dispatch it.
    ///
    /// The whole buffer is treated as one message. The client protocol
    /// carries no framing, which is reliable only while one client
    /// message fits one segment.
    pub async fn dispatch(&self, conn: ClientHandle, raw: &str) {
        let js: Value = match serde_json::from_str(raw) {
            Ok(js) => js,
            Err(e) => {
                tracing::error!(error = %e, "failed to parse client message");
                conn.send(envelope::error_reply("Invalid message format").to_string());
                return;
            }
        };
        let Ok(msgid) = envelope::field_i64(&js, "msgid") else {
            tracing::error!("client message lacks msgid");
            conn.send(envelope::error_reply("Invalid message format").to_string());
            return;
        };
        match self.handlers.get(&msgid) {
            Some(handler) => handler(conn, js, Local::now()).await,
            None => {
                tracing::error!(msgid, "unknown message id");
                conn.send(envelope::error_reply("Unknown message type").to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(tx), rx)
    }

    #[test]
    fn bind_find_unbind_round_trip() {
        let sessions = SessionManager::new();
        let (conn, _rx) = handle();
        assert!(sessions.bind(1001, conn.clone()).is_none());
        assert_eq!(sessions.find(1001).unwrap().conn_id(), conn.conn_id());
        assert_eq!(sessions.online_count(), 1);
        sessions.unbind(1001);
        assert!(sessions.find(1001).is_none());
    }

    #[test]
    fn rebind_returns_the_replaced_handle() {
        let sessions = SessionManager::new();
        let (old, _rx1) = handle();
        let (new, _rx2) = handle();
        sessions.bind(1001, old.clone());
        let replaced = sessions.bind(1001, new).unwrap();
        assert_eq!(replaced.conn_id(), old.conn_id());
        assert_eq!(sessions.online_count(), 1);
    }

    #[test]
    fn a_connection_appears_at_most_once() {
        let sessions = SessionManager::new();
        let (conn, _rx) = handle();
        sessions.bind(1, conn.clone());
        sessions.bind(2, conn.clone());
        assert_eq!(sessions.online_count(), 1);
        assert!(sessions.find(1).is_none());
        assert_eq!(sessions.find(2).unwrap().conn_id(), conn.conn_id());
    }

    #[test]
    fn unbind_conn_finds_the_owning_user() {
        let sessions = SessionManager::new();
        let (a, _rx1) = handle();
        let (b, _rx2) = handle();
        sessions.bind(1, a.clone());
        sessions.bind(2, b.clone());

        assert_eq!(sessions.unbind_conn(b.conn_id()), Some(2));
        assert_eq!(sessions.online_count(), 1);
        assert_eq!(sessions.unbind_conn(b.conn_id()), None);
    }

    #[test]
    fn send_to_unknown_user_reports_false() {
        let sessions = SessionManager::new();
        assert!(!sessions.send_to(404, "hello"));
    }

    #[tokio::test]
    async fn dispatch_routes_by_msgid() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let mut dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicI64::new(0));
        let sink = seen.clone();
        dispatcher.register(
            MsgId::OneChat,
            Arc::new(move |_conn, js, _ts| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.store(envelope::field_i64(&js, "toid").unwrap(), Ordering::SeqCst);
                })
            }),
        );

        let (conn, mut rx) = handle();
        dispatcher.dispatch(conn, r#"{"msgid":7,"toid":1002}"#).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1002);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_msgid_replies_error() {
        let dispatcher = Dispatcher::new();
        let (conn, mut rx) = handle();
        dispatcher.dispatch(conn, r#"{"msgid":99}"#).await;
        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["msgid"], 14);
        assert_eq!(reply["errmsg"], "Unknown message type");
    }

    #[tokio::test]
    async fn parse_failure_replies_error() {
        let dispatcher = Dispatcher::new();
        let (conn, mut rx) = handle();
        dispatcher.dispatch(conn, "{not json").await;
        let reply: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["msgid"], 14);
        assert_eq!(reply["errmsg"], "Invalid message format");
    }
}
