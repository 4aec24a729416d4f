//! Broadcast endpoint
//!
//! A WebSocket listener plus the set of connected viewers. Transcoder
//! chunks are fanned out with a non-blocking send into each viewer's small
//! queue; a viewer whose queue is full misses the chunk. Nothing is retried
//! and one slow viewer never delays the others.

use super::types::{ClientId, PipelineEvent, VideoError, VideoResult};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Connected viewers of one endpoint
pub struct BroadcastHub {
    clients: Mutex<HashMap<ClientId, mpsc::Sender<Bytes>>>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    port: AtomicU16,
    queue_depth: usize,
    dropped: AtomicU64,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl BroadcastHub {
    pub fn new(queue_depth: usize, event_tx: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(false),
            port: AtomicU16::new(0),
            queue_depth: queue_depth.max(1),
            dropped: AtomicU64::new(0),
            event_tx,
        }
    }

    /// Offer `chunk` to every viewer without waiting on any of them
    ///
    /// Returns how many viewers accepted it.
    pub fn broadcast(&self, chunk: Bytes) -> usize {
        let mut clients = self.clients.lock();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, tx) in clients.iter() {
            match tx.try_send(chunk.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("Client {} is behind, dropping {} bytes", id, chunk.len());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            clients.remove(&id);
        }

        delivered
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Total chunks skipped because a viewer's queue was full
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Add a viewer. Returns `None` while the endpoint is closed.
    pub(crate) fn register(&self) -> Option<(ClientId, mpsc::Receiver<Bytes>)> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.clients.lock().insert(id, tx);

        let _ = self.event_tx.send(PipelineEvent::ClientConnected {
            port: self.port(),
            client_id: id,
        });
        Some((id, rx))
    }

    fn unregister(&self, id: ClientId) {
        self.clients.lock().remove(&id);
        let _ = self.event_tx.send(PipelineEvent::ClientDisconnected {
            port: self.port(),
            client_id: id,
        });
    }

    fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    fn open(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Stop accepting and drop every viewer's queue, which ends its
    /// connection task
    fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let dropped: Vec<ClientId> = self.clients.lock().drain().map(|(id, _)| id).collect();
        if !dropped.is_empty() {
            tracing::info!("Disconnected {} clients", dropped.len());
        }
    }
}

/// A bound WebSocket listener feeding a hub
pub struct BroadcastListener {
    local_addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    accept_task: JoinHandle<()>,
}

impl BroadcastListener {
    /// Bind `host:port` and start accepting viewers into `hub`
    pub async fn bind(host: &str, port: u16, hub: Arc<BroadcastHub>) -> VideoResult<Self> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| VideoError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        hub.open(local_addr.port());
        let accept_task = tokio::spawn(accept_loop(listener, hub.clone()));

        tracing::info!("Video WebSocket server started on {}", local_addr);
        Ok(Self {
            local_addr,
            hub,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL viewers connect to
    pub fn ws_url(&self) -> String {
        if self.local_addr.ip().is_unspecified() {
            format!("ws://localhost:{}", self.local_addr.port())
        } else {
            format!("ws://{}", self.local_addr)
        }
    }

    /// Close the listening socket and disconnect every viewer
    pub async fn close(self) {
        self.accept_task.abort();
        // The listener is dropped once the aborted task is reaped
        let _ = self.accept_task.await;
        self.hub.close();
        tracing::info!("Video WebSocket server on {} stopped", self.local_addr);
    }
}

async fn accept_loop(listener: TcpListener, hub: Arc<BroadcastHub>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(serve_client(stream, peer, hub.clone()));
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, hub: Arc<BroadcastHub>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            let err = VideoError::Connection(format!("handshake with {} failed: {}", peer, e));
            tracing::debug!("{}", err);
            return;
        }
    };

    let Some((client_id, mut rx)) = hub.register() else {
        tracing::debug!("Endpoint closed during handshake with {}", peer);
        return;
    };
    tracing::info!("Client {} connected from {}", client_id, peer);

    let (mut sink, mut incoming) = ws.split();
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = sink.send(Message::Binary(chunk.to_vec())).await {
                        tracing::debug!("Client {} send failed: {}", client_id, e);
                        break;
                    }
                }
                None => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Client {} connection error: {}", client_id, e);
                    break;
                }
            },
        }
    }

    let _ = sink.close().await;
    hub.unregister(client_id);
    tracing::info!("Client {} disconnected", client_id);
}
