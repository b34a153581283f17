//! Pending-call table.
//!
//! Each outbound request registers a [`PendingCall`] under its [`CallId`]. The
//! first matching response completes it and removes it; later duplicates find
//! nothing and are dropped. Without a configured timeout an entry whose
//! response never arrives stays in the table.

use crate::envelope::CallId;
use crate::error::{Result, RpcError};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One in-flight request.
#[derive(Debug)]
pub struct PendingCall {
    /// Handler the request targets, for diagnostics.
    pub handler_name: String,
    reply_tx: oneshot::Sender<Result<Value>>,
}

/// Map from correlation ID to in-flight request.
#[derive(Debug)]
pub struct PendingCalls {
    topic: String,
    calls: Mutex<HashMap<CallId, PendingCall>>,
}

impl PendingCalls {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, PendingCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a pending call and return the reply that will observe it.
    ///
    /// With `timeout` set, a reaper task rejects the call with
    /// [`RpcError::Timeout`] once it elapses.
    pub fn register(
        self: &Arc<Self>,
        id: CallId,
        handler_name: &str,
        timeout: Option<Duration>,
    ) -> PendingReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let previous = self.lock().insert(
            id.clone(),
            PendingCall {
                handler_name: handler_name.to_string(),
                reply_tx,
            },
        );
        if previous.is_some() {
            warn!("Correlation ID {} reused on {}", id, self.topic);
        }

        if let Some(after) = timeout {
            let table = Arc::downgrade(self);
            let id = id.clone();
            tokio::spawn(reap_after(table, id, after));
        }

        PendingReply {
            inner: ReplyInner::Remote {
                topic: self.topic.clone(),
                reply_rx,
            },
        }
    }

    /// Complete the call registered under `id`, removing it from the table.
    ///
    /// Returns false when no such call is pending. The completion closure
    /// receives the pending call's handler name.
    pub fn complete(&self, id: &CallId, outcome: impl FnOnce(&str) -> Result<Value>) -> bool {
        let Some(call) = self.lock().remove(id) else {
            return false;
        };
        let outcome = outcome(&call.handler_name);
        // The caller may have dropped its reply; the entry is gone either way.
        let _ = call.reply_tx.send(outcome);
        true
    }

    /// Drop a pending call without completing it.
    pub fn forget(&self, id: &CallId) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

async fn reap_after(table: Weak<PendingCalls>, id: CallId, after: Duration) {
    tokio::time::sleep(after).await;
    let Some(table) = table.upgrade() else {
        return;
    };
    let reaped = table.complete(&id, |handler| {
        Err(RpcError::Timeout {
            handler: handler.to_string(),
            after,
        })
    });
    if reaped {
        debug!("Request {} on {} timed out after {:?}", id, table.topic, after);
    }
}

/// The eventual outcome of a request.
///
/// Await it directly for the raw JSON value, or use [`PendingReply::decode`].
#[derive(Debug)]
pub struct PendingReply {
    inner: ReplyInner,
}

#[derive(Debug)]
enum ReplyInner {
    Ready(Result<Value>),
    Remote {
        topic: String,
        reply_rx: oneshot::Receiver<Result<Value>>,
    },
}

impl PendingReply {
    /// A reply whose outcome is already known, e.g. from local execution.
    pub fn ready(outcome: Result<Value>) -> Self {
        Self {
            inner: ReplyInner::Ready(outcome),
        }
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Result<Value> {
        match self.inner {
            ReplyInner::Ready(outcome) => outcome,
            ReplyInner::Remote { topic, reply_rx } => match reply_rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::ChannelClosed { topic }),
            },
        }
    }

    /// Wait for the outcome and deserialize it.
    pub async fn decode<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.wait().await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl IntoFuture for PendingReply {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}
