//! In-process transport.

use super::{Subscription, Transport};
use crate::error::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Transport whose subscribers all live in this process.
///
/// Clones share the same topics, so one bus handed to several peers forms a
/// room. Delivery is unbounded and synchronous with `publish`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<Topics>>,
}

type Topics = HashMap<String, Vec<mpsc::UnboundedSender<Value>>>;

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of open subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.lock();
        topics
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Transport for MemoryBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let mut topics = self.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            // Closed subscriptions are pruned as a side effect of delivery.
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        } else {
            debug!("Publish on {} with no subscribers", topic);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.lock();
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
