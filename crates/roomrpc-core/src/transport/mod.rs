//! Room transport abstraction.
//!
//! A transport is a named publish/subscribe channel per room. The core relies on
//! it to deliver every publish on a topic to every current subscriber of that
//! topic, the publisher included, in publish order per publisher. It makes no
//! assumption about ordering between publishers or delivery to offline peers.
//!
//! # Implementations
//!
//! - [`MemoryBus`]: in-process delivery, for tests and single-process rooms
//! - [`HubClient`](crate::hub::HubClient): TCP connection to a relay process

mod memory;

pub use memory::MemoryBus;

use crate::error::Result;
use serde_json::Value;
use tokio::sync::mpsc;

/// Stream of raw payloads published on one topic.
pub type Subscription = mpsc::UnboundedReceiver<Value>;

/// Named pub/sub channel the channels of a peer publish on.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish a payload to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;

    /// Start receiving everything published on `topic` from now on.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}
