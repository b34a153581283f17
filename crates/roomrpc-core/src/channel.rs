//! Channel: the addressable RPC endpoint bound to one transport topic.
//!
//! A channel owns a handler registry and a pending-call table. Outbound, it
//! turns invocations into envelopes and publishes them. Inbound, a dispatch
//! loop reads every envelope on the topic and either serves it (calls addressed
//! to this peer) or settles a pending request (responses).
//!
//! # Concurrency
//!
//! The dispatch loop never awaits a handler. Each inbound call that passes the
//! recipient filter runs in its own spawned task, so a slow handler does not
//! hold up unrelated envelopes. Responses are settled inline.

use crate::config::ChannelConfig;
use crate::election;
use crate::envelope::{
    CallId, Envelope, Inbound, InboundCall, InboundResponse, MessageKind, Recipient, Target,
};
use crate::error::{Result, RpcError};
use crate::handler::{CallContext, CallKind, Handler, HandlerHandle, HandlerRegistry, HandlerResult};
use crate::peer::{PeerId, Roster};
use crate::pending::{PendingCalls, PendingReply};
use crate::transport::{Subscription, Transport};
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// RPC endpoint on one topic.
pub struct Channel {
    topic: String,
    transport: Arc<dyn Transport>,
    roster: Arc<dyn Roster>,
    handlers: HandlerRegistry,
    pending: Arc<PendingCalls>,
    config: ChannelConfig,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Subscribe to `topic` and start the dispatch loop.
    ///
    /// The loop stops when the channel is dropped or the subscription ends.
    pub async fn open(
        topic: impl Into<String>,
        transport: Arc<dyn Transport>,
        roster: Arc<dyn Roster>,
        config: ChannelConfig,
    ) -> Result<Arc<Self>> {
        let topic = topic.into();
        let subscription = transport.subscribe(&topic).await?;

        let channel = Arc::new(Self {
            handlers: HandlerRegistry::new(&topic),
            pending: Arc::new(PendingCalls::new(topic.clone())),
            topic,
            transport,
            roster,
            config,
            dispatch_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::dispatch_loop(Arc::downgrade(&channel), subscription));
        let mut slot = match channel.dispatch_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(task);
        drop(slot);

        info!(
            "Channel {} open as peer {}",
            channel.topic,
            channel.roster.local_peer_id()
        );
        Ok(channel)
    }

    async fn dispatch_loop(channel: Weak<Self>, mut subscription: Subscription) {
        while let Some(payload) = subscription.recv().await {
            let Some(channel) = channel.upgrade() else {
                break;
            };
            channel.dispatch(payload);
        }
        debug!("Dispatch loop finished");
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.roster.local_peer_id()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Number of requests still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Names of the handlers registered on this channel.
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.names()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an async closure as a handler.
    pub fn register<F, Fut>(&self, name: &str, handler: F) -> Result<HandlerHandle>
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(name, Arc::new(handler))
    }

    /// Register a handler object.
    pub fn register_handler(&self, name: &str, handler: Arc<dyn Handler>) -> Result<HandlerHandle> {
        self.handlers.register(name, handler)
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Run a handler on the coordinator.
    ///
    /// A live coordinator-eligible local peer executes the handler itself,
    /// without a network round trip; the returned reply is already settled.
    /// Otherwise the request goes to the elected coordinator.
    pub async fn invoke_as_coordinator(
        &self,
        handle: &HandlerHandle,
        args: Vec<Value>,
    ) -> Result<PendingReply> {
        let handler = self.handlers.resolve(handle)?;
        let local = self.roster.local_peer_id();
        let peers = self.roster.peers();

        let local_is_coordinator = peers
            .iter()
            .any(|p| p.id == local && p.is_live_coordinator());
        if local_is_coordinator {
            let ctx = self.context(Some(local), CallKind::Local);
            let outcome = run_handler(handler, ctx, args).await.map_err(|e| {
                warn!("Local coordinator call '{}' failed: {:#}", handle.name(), e);
                RpcError::HandlerFailed {
                    handler: handle.name().to_string(),
                    message: format!("{:#}", e),
                }
            });
            return Ok(PendingReply::ready(outcome));
        }

        if !election::has_live_coordinator(&peers) {
            return Err(RpcError::NoCoordinatorConnected);
        }

        self.send_request(handle.name(), args, Recipient::ONE_COORDINATOR)
            .await
    }

    /// Run a handler on one specific live peer.
    pub async fn invoke_on_peer(
        &self,
        handle: &HandlerHandle,
        peer: &PeerId,
        args: Vec<Value>,
    ) -> Result<PendingReply> {
        self.handlers.resolve(handle)?;

        let is_live = self.roster.peer(peer).is_some_and(|p| p.live);
        if !is_live {
            return Err(RpcError::InvalidPeer { peer: peer.clone() });
        }

        self.send_request(handle.name(), args, Recipient::Peers(vec![peer.clone()]))
            .await
    }

    /// Fire a handler on every live coordinator-eligible peer.
    pub async fn invoke_on_all_coordinators(
        &self,
        handle: &HandlerHandle,
        args: Vec<Value>,
    ) -> Result<()> {
        self.send_command(handle, args, Recipient::ALL_COORDINATORS)
            .await
    }

    /// Fire a handler on every live peer, this one included.
    pub async fn invoke_on_everyone(&self, handle: &HandlerHandle, args: Vec<Value>) -> Result<()> {
        self.send_command(handle, args, Recipient::EVERYONE).await
    }

    /// Fire a handler on an explicit list of peers.
    ///
    /// Identifiers that are not live are not checked; they simply receive
    /// nothing. An empty list publishes nothing.
    pub async fn invoke_on_peers(
        &self,
        handle: &HandlerHandle,
        peers: &[PeerId],
        args: Vec<Value>,
    ) -> Result<()> {
        if let Some(position) = peers.iter().position(|p| p.as_str().is_empty()) {
            return Err(RpcError::validation(
                "peers",
                format!("entry {} is an empty peer identifier", position),
            ));
        }
        self.send_command_to_list(handle, peers.to_vec(), args).await
    }

    /// Fire a handler on every live peer except this one.
    pub async fn invoke_on_others(&self, handle: &HandlerHandle, args: Vec<Value>) -> Result<()> {
        let local = self.roster.local_peer_id();
        let others = self
            .roster
            .peers()
            .into_iter()
            .filter(|p| p.live && p.id != local)
            .map(|p| p.id)
            .collect();
        self.send_command_to_list(handle, others, args).await
    }

    /// Fire a handler on every live coordinator-eligible peer except this one.
    pub async fn invoke_on_other_coordinators(
        &self,
        handle: &HandlerHandle,
        args: Vec<Value>,
    ) -> Result<()> {
        let local = self.roster.local_peer_id();
        let others = self
            .roster
            .peers()
            .into_iter()
            .filter(|p| p.is_live_coordinator() && p.id != local)
            .map(|p| p.id)
            .collect();
        self.send_command_to_list(handle, others, args).await
    }

    async fn send_command_to_list(
        &self,
        handle: &HandlerHandle,
        peers: Vec<PeerId>,
        args: Vec<Value>,
    ) -> Result<()> {
        if peers.is_empty() {
            self.handlers.resolve(handle)?;
            debug!("Command '{}' on {} has no recipients", handle.name(), self.topic);
            return Ok(());
        }
        self.send_command(handle, args, Recipient::Peers(peers)).await
    }

    async fn send_command(
        &self,
        handle: &HandlerHandle,
        args: Vec<Value>,
        recipient: Recipient,
    ) -> Result<()> {
        self.handlers.resolve(handle)?;
        let envelope = Envelope::command(handle.name(), args, recipient, self.local_peer_id());
        self.publish(&envelope).await
    }

    async fn send_request(
        &self,
        handler_name: &str,
        args: Vec<Value>,
        recipient: Recipient,
    ) -> Result<PendingReply> {
        let id = CallId::generate();
        // Registered before publishing: a loopback response may arrive at once.
        let reply = self
            .pending
            .register(id.clone(), handler_name, self.config.request_timeout);

        let envelope = Envelope::request(id.clone(), handler_name, args, recipient, self.local_peer_id());
        if let Err(e) = self.publish(&envelope).await {
            self.pending.forget(&id);
            return Err(e);
        }

        debug!("Request {} for '{}' sent on {}", id, handler_name, self.topic);
        Ok(reply)
    }

    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_value(envelope)?;
        self.transport.publish(&self.topic, payload).await
    }

    fn context(&self, sender: Option<PeerId>, kind: CallKind) -> CallContext {
        CallContext {
            sender,
            topic: self.topic.clone(),
            kind,
        }
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Process one raw payload received on the topic.
    ///
    /// Never fails: malformed or misaddressed envelopes are logged and dropped.
    /// A malformed envelope whose `id` matches a pending request still settles it.
    pub fn dispatch(self: &Arc<Self>, payload: Value) {
        let id = payload.get("id").and_then(Value::as_str).map(CallId::from);
        let envelope: Envelope = match serde_json::from_value(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Discarding malformed envelope on {}: {}", self.topic, e);
                // A mangled answer to one of our requests still ends that request.
                if let Some(id) = id {
                    self.pending.complete(&id, |handler| {
                        Err(RpcError::protocol(format!(
                            "malformed response for '{}': {}",
                            handler, e
                        )))
                    });
                }
                return;
            }
        };

        match envelope.into_inbound() {
            Ok(Inbound::Call(call)) => self.accept_call(call),
            Ok(Inbound::Response(response)) => self.settle(response),
            Err(e) => error!("Discarding envelope on {}: {}", self.topic, e),
        }
    }

    fn accept_call(self: &Arc<Self>, call: InboundCall) {
        match self.is_addressed_here(&call.recipient) {
            Ok(true) => {}
            Ok(false) => {
                trace!("Call '{}' on {} is not for this peer", call.handler_name, self.topic);
                return;
            }
            Err(e) => {
                error!(
                    "Discarding call '{}' on {}: {}",
                    call.handler_name, self.topic, e
                );
                return;
            }
        }

        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.serve(call).await });
    }

    fn is_addressed_here(&self, recipient: &Recipient) -> Result<bool> {
        let local = self.roster.local_peer_id();
        match recipient {
            Recipient::Peers(peers) => Ok(peers.contains(&local)),
            Recipient::Target(Target::OneCoordinator) => Ok(election::is_responsible_coordinator(
                &self.roster.peers(),
                &local,
            )),
            Recipient::Target(Target::AllCoordinators) => Ok(self
                .roster
                .local_peer()
                .is_some_and(|p| p.coordinator_eligible)),
            Recipient::Target(Target::Everyone) => Ok(true),
            Recipient::Target(Target::Unknown(tag)) => Err(RpcError::protocol(format!(
                "unknown recipient tag {}",
                tag
            ))),
        }
    }

    async fn serve(&self, call: InboundCall) {
        let local = self.roster.local_peer_id();
        let InboundCall {
            reply_to,
            handler_name,
            args,
            sender,
            ..
        } = call;

        let Some(handler) = self.handlers.lookup(&handler_name) else {
            warn!(
                "No handler '{}' registered on {} (called by {})",
                handler_name,
                self.topic,
                describe_sender(&sender)
            );
            if let Some(id) = reply_to {
                self.respond(Envelope::unregistered(id, local)).await;
            }
            return;
        };

        let kind = match reply_to {
            Some(_) => CallKind::Request,
            None => CallKind::Command,
        };
        let ctx = self.context(sender.clone(), kind);
        let outcome = run_handler(handler, ctx, args).await;

        match (reply_to, outcome) {
            (None, Ok(_)) => {}
            (None, Err(e)) => {
                error!(
                    "Command '{}' on {} from {} failed: {:#}",
                    handler_name,
                    self.topic,
                    describe_sender(&sender),
                    e
                );
            }
            (Some(id), Ok(value)) => {
                self.respond(Envelope::result(id, value, local)).await;
            }
            (Some(id), Err(e)) => {
                error!(
                    "Request '{}' ({}) on {} from {} failed: {:#}",
                    handler_name,
                    id,
                    self.topic,
                    describe_sender(&sender),
                    e
                );
                self.respond(Envelope::exception(id, local)).await;
            }
        }
    }

    async fn respond(&self, envelope: Envelope) {
        if let Err(e) = self.publish(&envelope).await {
            error!("Failed to publish response on {}: {}", self.topic, e);
        }
    }

    fn settle(&self, response: InboundResponse) {
        let InboundResponse {
            id,
            kind,
            result,
            responder,
        } = response;

        let settled = self.pending.complete(&id, |handler| match kind {
            MessageKind::Result => Ok(result),
            MessageKind::Exception => match responder {
                Some(responder) => Err(RpcError::RemoteExecutionFailure {
                    handler: handler.to_string(),
                    responder,
                }),
                None => Err(RpcError::protocol(format!(
                    "exception response for '{}' without a responding peer",
                    handler
                ))),
            },
            MessageKind::Unregistered => Err(RpcError::UnregisteredHandler {
                handler: handler.to_string(),
                responder,
            }),
            other => {
                error!(
                    "Unknown response kind {} for '{}' on {}",
                    u64::from(other),
                    handler,
                    self.topic
                );
                Err(RpcError::protocol(format!(
                    "unknown response kind {} for '{}'",
                    u64::from(other),
                    handler
                )))
            }
        });

        if !settled {
            debug!("Discarding response {} on {}: no pending call", id, self.topic);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let task = match self.dispatch_task.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Run a handler, turning a panic into an ordinary failure.
async fn run_handler(handler: Arc<dyn Handler>, ctx: CallContext, args: Vec<Value>) -> HandlerResult {
    match AssertUnwindSafe(handler.call(ctx, args)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => Err(anyhow::anyhow!("handler panicked")),
    }
}

fn describe_sender(sender: &Option<PeerId>) -> String {
    match sender {
        Some(peer) => peer.to_string(),
        None => "an unnamed peer".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerInfo, RoomRoster};
    use crate::transport::MemoryBus;
    use serde_json::json;
    use std::time::Duration;

    async fn open(bus: &MemoryBus, room: &RoomRoster, local: &str) -> Arc<Channel> {
        Channel::open(
            "module.test",
            Arc::new(bus.clone()),
            Arc::new(room.view_as(local)),
            ChannelConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_coordinator_executes_locally_without_publishing() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([PeerInfo::coordinator("gm")]);
        let channel = open(&bus, &room, "gm").await;

        let mut spy = bus.subscribe("module.test").await.unwrap();

        let handle = channel
            .register("whoami", |ctx: CallContext, _args: Vec<Value>| async move {
                anyhow::Ok(json!({"kind": format!("{:?}", ctx.kind), "sender": ctx.sender}))
            })
            .unwrap();

        let reply = channel.invoke_as_coordinator(&handle, vec![]).await.unwrap();
        assert_eq!(
            reply.await.unwrap(),
            json!({"kind": "Local", "sender": "gm"})
        );
        assert!(spy.try_recv().is_err());
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_local_coordinator_failure_is_handler_failed() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([PeerInfo::coordinator("gm")]);
        let channel = open(&bus, &room, "gm").await;

        let handle = channel
            .register("boom", |_ctx: CallContext, _args: Vec<Value>| async move {
                Err::<Value, _>(anyhow::anyhow!("kaboom"))
            })
            .unwrap();

        let reply = channel.invoke_as_coordinator(&handle, vec![]).await.unwrap();
        match reply.await {
            Err(RpcError::HandlerFailed { handler, message }) => {
                assert_eq!(handler, "boom");
                assert!(message.contains("kaboom"));
            }
            other => panic!("Expected HandlerFailed, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_coordinator_fails_before_sending() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([
            PeerInfo::member("player"),
            PeerInfo::coordinator("gm").offline(),
        ]);
        let channel = open(&bus, &room, "player").await;
        let mut spy = bus.subscribe("module.test").await.unwrap();

        let handle = channel
            .register("noop", |_ctx: CallContext, _args: Vec<Value>| async move {
                anyhow::Ok(Value::Null)
            })
            .unwrap();

        assert!(matches!(
            channel.invoke_as_coordinator(&handle, vec![]).await,
            Err(RpcError::NoCoordinatorConnected)
        ));
        assert!(spy.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_peer_fails_before_sending() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([
            PeerInfo::member("a"),
            PeerInfo::member("gone").offline(),
        ]);
        let channel = open(&bus, &room, "a").await;
        let mut spy = bus.subscribe("module.test").await.unwrap();

        let handle = channel
            .register("noop", |_ctx: CallContext, _args: Vec<Value>| async move {
                anyhow::Ok(Value::Null)
            })
            .unwrap();

        for target in ["gone", "never-joined"] {
            match channel.invoke_on_peer(&handle, &PeerId::from(target), vec![]).await {
                Err(RpcError::InvalidPeer { peer }) => assert_eq!(peer.as_str(), target),
                other => panic!("Expected InvalidPeer, got: {:?}", other),
            }
        }
        assert!(spy.try_recv().is_err());
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_request_to_self_round_trips_over_loopback() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([PeerInfo::member("a")]);
        let channel = open(&bus, &room, "a").await;

        let handle = channel
            .register("double", |_ctx: CallContext, args: Vec<Value>| async move {
                let x = args.first().and_then(Value::as_i64).unwrap_or_default();
                anyhow::Ok(json!(x * 2))
            })
            .unwrap();

        let reply = channel
            .invoke_on_peer(&handle, &PeerId::from("a"), vec![json!(21)])
            .await
            .unwrap();
        assert_eq!(reply.decode::<i64>().await.unwrap(), 42);
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_peer_identifier_is_validation_error() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([PeerInfo::member("a")]);
        let channel = open(&bus, &room, "a").await;
        let handle = channel
            .register("noop", |_ctx: CallContext, _args: Vec<Value>| async move {
                anyhow::Ok(Value::Null)
            })
            .unwrap();

        let peers = [PeerId::from("a"), PeerId::from("")];
        assert!(matches!(
            channel.invoke_on_peers(&handle, &peers, vec![]).await,
            Err(RpcError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_handle_is_rejected_locally() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([PeerInfo::member("a")]);
        let ours = open(&bus, &room, "a").await;
        let theirs = Channel::open(
            "module.other",
            Arc::new(bus.clone()),
            Arc::new(room.view_as("a")),
            ChannelConfig::default(),
        )
        .await
        .unwrap();

        let handle = theirs
            .register("noop", |_ctx: CallContext, _args: Vec<Value>| async move {
                anyhow::Ok(Value::Null)
            })
            .unwrap();

        assert!(matches!(
            ours.invoke_on_everyone(&handle, vec![]).await,
            Err(RpcError::UnregisteredHandler { responder: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_handle_from_other_channel_on_same_topic_is_rejected() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([PeerInfo::member("a"), PeerInfo::member("b")]);
        let a = open(&bus, &room, "a").await;
        let b = open(&bus, &room, "b").await;
        let mut spy = bus.subscribe("module.test").await.unwrap();

        let noop = |_ctx: CallContext, _args: Vec<Value>| async move { anyhow::Ok(Value::Null) };
        let handle = a.register("noop", noop).unwrap();
        b.register("noop", noop).unwrap();

        assert!(matches!(
            b.invoke_on_everyone(&handle, vec![]).await,
            Err(RpcError::UnregisteredHandler { responder: None, .. })
        ));
        assert!(spy.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_payloads_do_not_stop_dispatch() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([PeerInfo::member("a")]);
        let channel = open(&bus, &room, "a").await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = channel
            .register("note", move |_ctx: CallContext, args: Vec<Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(args);
                    anyhow::Ok(Value::Null)
                }
            })
            .unwrap();

        for junk in [
            json!("not an envelope"),
            json!({"type": 0, "handlerName": "note", "args": [], "recipient": 42}),
            json!({"type": 1, "handlerName": "note", "args": [], "recipient": 2}),
            json!({"type": 7}),
        ] {
            bus.publish("module.test", junk).await.unwrap();
        }
        channel.invoke_on_everyone(&handle, vec![json!("ok")]).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, vec![json!("ok")]);
    }

    #[tokio::test]
    async fn test_dropping_channel_stops_dispatch() {
        let bus = MemoryBus::new();
        let room = RoomRoster::with_peers([PeerInfo::member("a")]);
        let channel = open(&bus, &room, "a").await;
        assert_eq!(bus.subscriber_count("module.test"), 1);

        drop(channel);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.subscriber_count("module.test"), 0);
    }
}
