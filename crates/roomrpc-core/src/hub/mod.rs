//! TCP relay transport.
//!
//! Lets peers in different processes share topics through a small relay
//! ("hub"). Frames are length-prefixed JSON over plain TCP.
//!
//! # Architecture
//!
//! - **Server**: accepts connections, remembers which connection subscribed to
//!   which topic, and relays every publish to all subscribers of its topic
//! - **Client**: one connection per peer process; implements [`Transport`](crate::Transport)
//! - **Protocol**: shared framing and frame types used by both

pub mod client;
pub mod protocol;
pub mod server;

pub use client::HubClient;
pub use protocol::HubFrame;
pub use server::{HubServer, HubServerHandle};
