//! TCP relay server.
//!
//! Accepts client connections and relays every `publish` frame to each
//! connection subscribed to the frame's topic, the publishing connection
//! included.
//!
//! # Thread Safety
//!
//! Each connection runs a reader task and a writer task. The reader owns the
//! read half and routes frames; the writer drains an unbounded queue into the
//! write half, so a slow client never blocks relays to other clients. The
//! topic routing table is shared behind a `Mutex` that is never held across an
//! `.await`.

use super::protocol::{read_frame, write_frame, HubFrame};
use crate::config::HubConfig;
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

type ConnectionId = u64;
type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

/// topic -> connection -> outbound queue
type RouteTable = HashMap<String, HashMap<ConnectionId, FrameSender>>;

#[derive(Default)]
struct Routes {
    topics: Mutex<RouteTable>,
}

impl Routes {
    fn lock(&self) -> MutexGuard<'_, RouteTable> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn subscribe(&self, topic: &str, conn: ConnectionId, tx: FrameSender) {
        let mut topics = self.lock();
        topics.entry(topic.to_string()).or_default().insert(conn, tx);
    }

    fn relay(&self, topic: &str, bytes: &[u8]) -> usize {
        let topics = self.lock();
        let Some(subscribers) = topics.get(topic) else {
            return 0;
        };
        subscribers
            .values()
            .filter(|tx| tx.send(bytes.to_vec()).is_ok())
            .count()
    }

    fn disconnect(&self, conn: ConnectionId) {
        let mut topics = self.lock();
        topics.retain(|_, subscribers| {
            subscribers.remove(&conn);
            !subscribers.is_empty()
        });
    }

    fn topic_count(&self) -> usize {
        self.lock().len()
    }
}

/// Handle to a running hub. Dropping shuts down the hub.
pub struct HubServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    routes: Arc<Routes>,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl HubServerHandle {
    /// Get the address the hub is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.routes.topic_count()
    }

    /// Stop accepting connections and close the active ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for HubServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Relay server shared by peers in separate processes.
pub struct HubServer;

impl HubServer {
    /// Bind `addr` and start relaying in background tasks.
    ///
    /// Use port 0 to let the OS pick one; the chosen port is on the handle.
    pub async fn start(addr: SocketAddr) -> Result<HubServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Hub listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));
        let routes = Arc::new(Routes::default());

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            routes.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(HubServerHandle {
            addr,
            port,
            routes,
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        routes: Arc<Routes>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let next_id = AtomicU64::new(1);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Hub shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= HubConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting hub connection from {}: at max capacity ({})",
                                    peer_addr,
                                    HubConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let conn = next_id.fetch_add(1, Ordering::Relaxed);
                            let routes = routes.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Hub connection {} from {}", conn, peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, conn, &routes, &mut conn_shutdown).await
                                {
                                    debug!("Hub connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Hub accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        conn: ConnectionId,
        routes: &Routes,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    debug!("Hub connection {} write failed: {}", conn, e);
                    break;
                }
            }
        });

        let result = Self::read_loop(&mut reader, conn, routes, &tx, shutdown_rx).await;

        // The writer exits once every queue handle for this connection is gone.
        routes.disconnect(conn);
        drop(tx);
        let _ = writer_task.await;
        result
    }

    async fn read_loop(
        reader: &mut OwnedReadHalf,
        conn: ConnectionId,
        routes: &Routes,
        tx: &FrameSender,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let bytes = tokio::select! {
                result = read_frame(reader) => {
                    match result? {
                        Some(bytes) => bytes,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(()); // Hub shutting down
                }
            };

            match HubFrame::from_bytes(&bytes)? {
                HubFrame::Subscribe { topic } => {
                    routes.subscribe(&topic, conn, tx.clone());
                    debug!("Hub connection {} subscribed to {}", conn, topic);
                    let ack = HubFrame::Subscribed { topic }.to_bytes()?;
                    tx.send(ack)
                        .map_err(|_| RpcError::transport("hub writer closed"))?;
                }
                HubFrame::Publish { topic, payload } => {
                    let deliver = HubFrame::Deliver {
                        topic: topic.clone(),
                        payload,
                    }
                    .to_bytes()?;
                    let delivered = routes.relay(&topic, &deliver);
                    debug!(
                        "Hub relayed publish on {} from connection {} to {} subscribers",
                        topic, conn, delivered
                    );
                }
                other => {
                    warn!(
                        "Hub connection {} sent unexpected frame {:?}; ignoring",
                        conn, other
                    );
                }
            }
        }
    }
}
