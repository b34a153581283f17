//! Handler registry.
//!
//! Handlers are registered by name on a channel and invoked through the
//! [`HandlerHandle`] registration returns. Names are write-once: a second
//! registration under an existing name is refused and the first handler stays.

use crate::error::{Result, RpcError};
use crate::peer::PeerId;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Value a handler produces. The error side never crosses the network.
pub type HandlerResult = anyhow::Result<Value>;

/// How a handler invocation reached this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Fire-and-forget; the return value is discarded.
    Command,
    /// A caller awaits the return value.
    Request,
    /// Executed in-process by the coordinator for its own call.
    Local,
}

/// Information about the call a handler is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Peer that issued the call, when the envelope named one.
    pub sender: Option<PeerId>,
    /// Topic of the channel the handler is registered on.
    pub topic: String,
    pub kind: CallKind,
}

/// A callable registered on a channel.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> HandlerResult;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> HandlerResult {
        (self)(ctx, args).await
    }
}

/// Opaque reference to a registered handler.
///
/// Only the registry that minted a handle will accept it, even when another
/// channel in the process is open on the same topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerHandle {
    registry: u64,
    topic: Arc<str>,
    name: Arc<str>,
}

impl HandlerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

type HandlerMap = HashMap<String, Arc<dyn Handler>>;

/// Per-channel map from handler name to callable.
pub struct HandlerRegistry {
    id: u64,
    topic: Arc<str>,
    handlers: RwLock<HandlerMap>,
}

impl HandlerRegistry {
    pub fn new(topic: &str) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            topic: Arc::from(topic),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    // Registered handlers are immutable, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HandlerMap> {
        match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HandlerMap> {
        match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `handler` under `name`.
    ///
    /// An existing registration is kept and [`RpcError::DuplicateHandler`] is
    /// returned.
    pub fn register(&self, name: &str, handler: Arc<dyn Handler>) -> Result<HandlerHandle> {
        if name.is_empty() {
            return Err(RpcError::validation("handler_name", "must not be empty"));
        }

        let mut handlers = self.write();

        if handlers.contains_key(name) {
            warn!(
                "Handler '{}' is already registered on {}; keeping the first registration",
                name, self.topic
            );
            return Err(RpcError::DuplicateHandler {
                topic: self.topic.to_string(),
                handler: name.to_string(),
            });
        }

        handlers.insert(name.to_string(), handler);
        debug!("Registered handler '{}' on {}", name, self.topic);

        Ok(HandlerHandle {
            registry: self.id,
            topic: self.topic.clone(),
            name: Arc::from(name),
        })
    }

    /// Resolve a handle minted by this registry.
    pub fn resolve(&self, handle: &HandlerHandle) -> Result<Arc<dyn Handler>> {
        if handle.registry != self.id {
            return Err(RpcError::UnregisteredHandler {
                handler: handle.name.to_string(),
                responder: None,
            });
        }
        self.lookup(&handle.name).ok_or_else(|| RpcError::UnregisteredHandler {
            handler: handle.name.to_string(),
            responder: None,
        })
    }

    /// Look up a handler by the name carried in an inbound envelope.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }
}
