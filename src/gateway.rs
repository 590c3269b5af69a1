//! Gateway TCP front door.
//!
//! Terminates client sessions: accepts connections, pumps inbound bytes
//! into the dispatcher (each read is treated as one complete JSON
//! message; the client protocol has no framing), and drains the
//! per-connection outbound queue back to the socket. Disconnects flow
//! into the router's bookkeeping.

use crate::router::ChatRouter;
use crate::session::{ClientHandle, Dispatcher};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

/// Upper bound on one inbound client read.
const READ_BUF_SIZE: usize = 64 * 1024;

pub struct GatewayServer {
    router: Arc<ChatRouter>,
    dispatcher: Arc<Dispatcher>,
    stop: Arc<Notify>,
}

impl GatewayServer {
    pub fn new(router: Arc<ChatRouter>) -> Self {
        let dispatcher = Arc::new(router.dispatcher());
        Self { router, dispatcher, stop: Arc::new(Notify::new()) }
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    /// Accept loop; runs until the stop handle fires.
    pub async fn serve(self, listener: TcpListener) {
        tracing::info!(addr = ?listener.local_addr().ok(), "gateway serving");
        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    tracing::info!("gateway stopping");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!(%peer, "client connected");
                            let router = self.router.clone();
                            let dispatcher = self.dispatcher.clone();
                            tokio::spawn(handle_client(router, dispatcher, stream));
                        }
                        Err(e) => tracing::error!(error = %e, "gateway accept failed"),
                    }
                }
            }
        }
    }
}

async fn handle_client(router: Arc<ChatRouter>, dispatcher: Arc<Dispatcher>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let (mut read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = ClientHandle::new(tx);
    let conn_id = conn.conn_id();

    let writer = tokio::spawn(write_outbound(write_half, rx));

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::error!(?peer, error = %e, "client read failed");
                break;
            }
        };
        let raw = String::from_utf8_lossy(&buf[..n]).into_owned();
        dispatcher.dispatch(conn.clone(), &raw).await;
    }

    tracing::info!(?peer, "client disconnected");
    router.handle_disconnect(conn_id).await;
    // Dropping our sender (and the table's copy, removed above) ends the
    // writer task.
    drop(conn);
    let _ = writer.await;
}

async fn write_outbound(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(payload) = rx.recv().await {
        if half.write_all(payload.as_bytes()).await.is_err() {
            return;
        }
    }
    let _ = half.shutdown().await;
}
