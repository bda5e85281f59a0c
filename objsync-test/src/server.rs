//! WebSocket notification server.
//!
//! Accepts any number of clients on a loopback port and pushes the same
//! text messages to all of them, the way the backend's notification endpoint
//! does. Built on tokio-tungstenite so the client side is tested against an
//! independent protocol implementation.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use objsync_wire::{CloseStatus, Event};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Clone)]
enum Push {
    Text(String),
    Close(CloseStatus),
}

#[derive(Default)]
struct Counters {
    accepted: AtomicUsize,
    open: AtomicUsize,
}

pub struct NotificationServer {
    addr: SocketAddr,
    pushes: broadcast::Sender<Push>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl NotificationServer {
    /// Bind a free loopback port and start accepting.
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (pushes, _) = broadcast::channel(256);
        let counters = Arc::new(Counters::default());

        let task = tokio::spawn(accept_loop(listener, pushes.clone(), counters.clone()));
        log::debug!("Notification server listening on {addr}");
        Ok(Self {
            addr,
            pushes,
            counters,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of this server with the given path and query.
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Push one Event to every connected client.
    pub fn publish(&self, event: &Event) {
        self.send_text(event.to_json());
    }

    pub fn send_text(&self, text: impl Into<String>) {
        // No connected clients means nobody to notify.
        let _ = self.pushes.send(Push::Text(text.into()));
    }

    /// Close every open connection with `status`. Clients may reconnect.
    pub fn close_all(&self, status: CloseStatus) {
        let _ = self.pushes.send(Push::Close(status));
    }

    /// Connections accepted since start.
    pub fn accepted(&self) -> usize {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> usize {
        self.counters.open.load(Ordering::Relaxed)
    }

    /// Wait until `count` connections have completed the handshake.
    pub async fn wait_for_accepted(&self, count: usize, limit: Duration) -> bool {
        timeout(limit, async {
            while self.accepted() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for NotificationServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    pushes: broadcast::Sender<Push>,
    counters: Arc<Counters>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("Accept failed: {err}");
                continue;
            }
        };
        // Subscribe before the handshake so nothing published after
        // `accepted()` moves is missed.
        let rx = pushes.subscribe();
        let counters = counters.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(stream, rx, &counters).await {
                log::debug!("Connection from {peer} ended: {err}");
            }
        });
    }
}

type WsError = tokio_tungstenite::tungstenite::Error;

async fn serve(
    stream: TcpStream,
    pushes: broadcast::Receiver<Push>,
    counters: &Counters,
) -> Result<(), WsError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    counters.accepted.fetch_add(1, Ordering::Relaxed);
    counters.open.fetch_add(1, Ordering::Relaxed);
    let result = pump(ws, pushes).await;
    counters.open.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn pump(
    mut ws: WebSocketStream<TcpStream>,
    mut pushes: broadcast::Receiver<Push>,
) -> Result<(), WsError> {
    loop {
        tokio::select! {
            push = pushes.recv() => match push {
                Ok(Push::Text(text)) => ws.send(Message::text(text)).await?,
                Ok(Push::Close(status)) => {
                    ws.close(Some(CloseFrame {
                        code: CloseCode::from(status.code()),
                        reason: "".into(),
                    }))
                    .await?;
                    // Drain until the client echoes the close.
                    while let Some(message) = ws.next().await {
                        message?;
                    }
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Notification server dropped {skipped} pushes");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            incoming = ws.next() => match incoming {
                Some(message) => {
                    message?;
                }
                None => return Ok(()),
            },
        }
    }
}
