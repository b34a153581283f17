//! TCP client for a hub.
//!
//! One connection carries every topic a process subscribes to. A background
//! reader task fans delivered payloads out to the local subscriptions of their
//! topic and resolves pending subscribe acknowledgements.
//!
//! # Thread Safety
//!
//! Writes go through a tokio `Mutex` around the write half, so concurrent
//! publishes from different channels are serialized frame by frame.

use super::protocol::{read_frame, write_frame, HubFrame};
use crate::config::HubConfig;
use crate::transport::{Subscription, Transport};
use crate::{Result, RpcError};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct Local {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    acks: HashMap<String, VecDeque<oneshot::Sender<()>>>,
}

impl Local {
    /// Drop local subscriptions and acknowledgement waiters whose receivers
    /// are gone.
    fn forget_closed(&mut self, topic: &str) {
        if let Some(acks) = self.acks.get_mut(topic) {
            acks.retain(|tx| !tx.is_closed());
            if acks.is_empty() {
                self.acks.remove(topic);
            }
        }
        if let Some(subscribers) = self.subscribers.get_mut(topic) {
            subscribers.retain(|tx| !tx.is_closed());
            if subscribers.is_empty() {
                self.subscribers.remove(topic);
            }
        }
    }
}

fn lock_local(local: &Mutex<Local>) -> MutexGuard<'_, Local> {
    match local.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Connection to a hub, usable as a [`Transport`].
pub struct HubClient {
    addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    local: Arc<Mutex<Local>>,
    subscribe_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl HubClient {
    /// Connect to a hub.
    ///
    /// Uses the connection timeout from `HubConfig`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(HubConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RpcError::transport(format!(
                    "Timed out connecting to hub at {} after {:?}",
                    addr,
                    HubConfig::CONNECT_TIMEOUT
                ))
            })?
            .map_err(|e| RpcError::transport(format!("Failed to connect to hub at {}: {}", addr, e)))?;

        debug!("Hub client connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let local = Arc::new(Mutex::new(Local::default()));
        let reader_task = tokio::spawn(Self::read_loop(reader, local.clone(), addr));

        Ok(Self {
            addr,
            writer: tokio::sync::Mutex::new(writer),
            local,
            subscribe_timeout: HubConfig::CONNECT_TIMEOUT,
            reader_task,
        })
    }

    /// Set how long `subscribe` waits for the hub's acknowledgement.
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Get the address of the connected hub.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns true while the connection to the hub is up.
    pub fn is_connected(&self) -> bool {
        !self.reader_task.is_finished()
    }

    async fn send(&self, frame: &HubFrame) -> Result<()> {
        let bytes = frame.to_bytes()?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &bytes)
            .await
            .map_err(|e| RpcError::transport(format!("Lost connection to hub at {}: {}", self.addr, e)))
    }

    async fn read_loop(mut reader: OwnedReadHalf, local: Arc<Mutex<Local>>, addr: SocketAddr) {
        loop {
            let bytes = match read_frame(&mut reader).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!("Hub at {} closed the connection", addr);
                    break;
                }
                Err(e) => {
                    warn!("Hub connection to {} failed: {}", addr, e);
                    break;
                }
            };

            let frame = match HubFrame::from_bytes(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Discarding frame from hub at {}: {}", addr, e);
                    continue;
                }
            };

            let mut state = lock_local(&local);
            match frame {
                HubFrame::Deliver { topic, payload } => {
                    if let Some(subscribers) = state.subscribers.get_mut(&topic) {
                        subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
                    }
                }
                HubFrame::Subscribed { topic } => {
                    // Waiters that gave up are skipped; the ack goes to the oldest live one.
                    if let Some(acks) = state.acks.get_mut(&topic) {
                        while let Some(ack) = acks.pop_front() {
                            if ack.send(()).is_ok() {
                                break;
                            }
                        }
                    }
                }
                other => {
                    warn!("Hub at {} sent unexpected frame {:?}; ignoring", addr, other);
                }
            }
        }

        // Closes every subscription and fails pending subscribes.
        let mut state = lock_local(&local);
        state.subscribers.clear();
        state.acks.clear();
    }
}

#[async_trait::async_trait]
impl Transport for HubClient {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.send(&HubFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        if !self.is_connected() {
            return Err(RpcError::transport(format!(
                "Not connected to hub at {}",
                self.addr
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut local = lock_local(&self.local);
            local.subscribers.entry(topic.to_string()).or_default().push(tx);
            local.acks.entry(topic.to_string()).or_default().push_back(ack_tx);
        }

        let sent = self
            .send(&HubFrame::Subscribe {
                topic: topic.to_string(),
            })
            .await;
        let acked = match sent {
            Ok(()) => tokio::time::timeout(self.subscribe_timeout, ack_rx).await,
            Err(e) => {
                drop(ack_rx);
                drop(rx);
                lock_local(&self.local).forget_closed(topic);
                return Err(e);
            }
        };

        let error = match acked {
            Ok(Ok(())) => {
                debug!("Subscribed to {} on hub at {}", topic, self.addr);
                return Ok(rx);
            }
            Ok(Err(_)) => RpcError::transport(format!(
                "Hub at {} closed before acknowledging {}",
                self.addr, topic
            )),
            Err(_) => RpcError::transport(format!(
                "Hub at {} did not acknowledge {} within {:?}",
                self.addr, topic, self.subscribe_timeout
            )),
        };

        drop(rx);
        lock_local(&self.local).forget_closed(topic);
        warn!("Subscribe to {} failed: {}", topic, error);
        Err(error)
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::server::HubServer;
    use serde_json::json;

    async fn hub() -> crate::hub::HubServerHandle {
        HubServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let mut handle = hub().await;
        let a = HubClient::connect(handle.addr()).await.unwrap();
        let b = HubClient::connect(handle.addr()).await.unwrap();

        let mut a_sub = a.subscribe("module.dice").await.unwrap();
        let mut b_sub = b.subscribe("module.dice").await.unwrap();

        a.publish("module.dice", json!({"roll": 6})).await.unwrap();

        assert_eq!(a_sub.recv().await.unwrap(), json!({"roll": 6}));
        assert_eq!(b_sub.recv().await.unwrap(), json!({"roll": 6}));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let mut handle = hub().await;
        let client = HubClient::connect(handle.addr()).await.unwrap();

        let mut dice = client.subscribe("module.dice").await.unwrap();
        let mut chat = client.subscribe("system.chat").await.unwrap();

        client.publish("system.chat", json!("hello")).await.unwrap();
        client.publish("module.dice", json!(3)).await.unwrap();

        assert_eq!(chat.recv().await.unwrap(), json!("hello"));
        assert_eq!(dice.recv().await.unwrap(), json!(3));
        assert!(dice.try_recv().is_err());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved() {
        let mut handle = hub().await;
        let a = HubClient::connect(handle.addr()).await.unwrap();
        let b = HubClient::connect(handle.addr()).await.unwrap();
        let mut sub = b.subscribe("module.dice").await.unwrap();

        for n in 0..20 {
            a.publish("module.dice", json!(n)).await.unwrap();
        }
        for n in 0..20 {
            assert_eq!(sub.recv().await.unwrap(), json!(n));
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_subscriptions_close_when_hub_stops() {
        let mut handle = hub().await;
        let client = HubClient::connect(handle.addr()).await.unwrap();
        let mut sub = client.subscribe("module.dice").await.unwrap();

        handle.shutdown();

        assert!(sub.recv().await.is_none());
    }

    /// Hub stand-in that leaves the first subscribe unacknowledged and
    /// echoes every publish back as a delivery.
    async fn hub_dropping_first_ack() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut skipped = false;
            while let Ok(Some(bytes)) = read_frame(&mut stream).await {
                let reply = match HubFrame::from_bytes(&bytes).unwrap() {
                    HubFrame::Subscribe { .. } if !skipped => {
                        skipped = true;
                        continue;
                    }
                    HubFrame::Subscribe { topic } => HubFrame::Subscribed { topic },
                    HubFrame::Publish { topic, payload } => HubFrame::Deliver { topic, payload },
                    _ => continue,
                };
                let bytes = reply.to_bytes().unwrap();
                if write_frame(&mut stream, &bytes).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_timed_out_subscribe_does_not_steal_later_acks() {
        let addr = hub_dropping_first_ack().await;
        let client = HubClient::connect(addr)
            .await
            .unwrap()
            .with_subscribe_timeout(Duration::from_millis(200));

        let first = client.subscribe("module.dice").await;
        assert!(matches!(first, Err(RpcError::Transport { .. })));

        let mut second = client.subscribe("module.dice").await.unwrap();
        let mut third = client.subscribe("module.dice").await.unwrap();
        {
            let local = lock_local(&client.local);
            assert_eq!(local.subscribers["module.dice"].len(), 2);
            assert!(local.acks.get("module.dice").map_or(true, VecDeque::is_empty));
        }

        client.publish("module.dice", json!(5)).await.unwrap();
        assert_eq!(second.recv().await.unwrap(), json!(5));
        assert_eq!(third.recv().await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_connect_to_dead_hub_returns_transport_error() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = HubClient::connect(addr).await;
        assert!(matches!(result, Err(RpcError::Transport { .. })));
    }
}
