//! roomrpc - Peer-to-peer RPC over a room's pub/sub channel.
//!
//! Every peer in a room (one coordinator-capable "game master" and any number
//! of players) opens a [`Channel`] per extension topic. Handlers registered on
//! a channel can then be invoked on the elected coordinator, on a specific
//! peer, on every coordinator, on everyone, or on an explicit list of peers.
//! Requests return a [`PendingReply`] that settles when the target answers.
//!
//! The room itself is abstracted behind two seams: a [`Transport`] that
//! delivers every publish to every subscriber of a topic, and a [`Roster`]
//! that knows who is in the room. [`MemoryBus`] and [`RoomRoster`] cover
//! single-process rooms; [`HubClient`] connects to a relay for multi-process
//! rooms.
//!
//! # Example
//!
//! ```rust,ignore
//! use roomrpc_core::{CallContext, MemoryBus, PeerInfo, RoomRoster, RpcContext};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> roomrpc_core::Result<()> {
//!     let room = RoomRoster::with_peers([PeerInfo::coordinator("gm"), PeerInfo::member("ada")]);
//!     let bus = MemoryBus::new();
//!     let gm = RpcContext::new(bus.clone(), room.view_as("gm"));
//!     let ada = RpcContext::new(bus, room.view_as("ada"));
//!
//!     // Every peer registers the same handlers on the same module.
//!     let roll = |_ctx: CallContext, args: Vec<Value>| async move {
//!         let sides = args.first().and_then(Value::as_u64).unwrap_or(6);
//!         anyhow::Ok(json!(sides))
//!     };
//!     gm.register_module("dice").await?.register("roll", roll)?;
//!     let dice = ada.register_module("dice").await?;
//!     let handle = dice.register("roll", roll)?;
//!
//!     // Runs on gm, the elected coordinator, and waits for its answer.
//!     let sides: u64 = dice.invoke_as_coordinator(&handle, vec![json!(20)]).await?.decode().await?;
//!     println!("rolled a d{}", sides);
//!
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod election;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod hub;
pub mod peer;
pub mod pending;
pub mod transport;

// Re-export commonly used types
pub use channel::Channel;
pub use config::{ChannelConfig, HubConfig, TopicConfig};
pub use context::RpcContext;
pub use envelope::{CallId, Envelope, MessageKind, Recipient, Target};
pub use error::{Result, RpcError};
pub use handler::{CallContext, CallKind, Handler, HandlerHandle, HandlerResult};
pub use hub::{HubClient, HubServer, HubServerHandle};
pub use peer::{PeerId, PeerInfo, PeerRoster, RoomRoster, Roster};
pub use pending::PendingReply;
pub use transport::{MemoryBus, Subscription, Transport};
