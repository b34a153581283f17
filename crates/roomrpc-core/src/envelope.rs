//! Wire envelope exchanged over a channel topic.
//!
//! One flat JSON record carries every message kind; which fields are present
//! depends on the kind:
//!
//! ```text
//! {"id":"…","type":1,"handlerName":"roll","args":[2],"recipient":["peer-b"],"sender":"peer-a"}
//! {"id":"…","type":2,"result":4,"respondingPeerId":"peer-b"}
//! ```
//!
//! Kind and symbolic-recipient tags are small integers. Unknown tags still
//! deserialize so the dispatcher can report them instead of dropping the frame.

use crate::error::{Result, RpcError};
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation identifier linking a request to its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `type` tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub enum MessageKind {
    Command,
    Request,
    Result,
    Exception,
    Unregistered,
    Unknown(u64),
}

impl MessageKind {
    /// COMMAND and REQUEST carry a call; everything else is a response.
    pub fn is_call(&self) -> bool {
        matches!(self, MessageKind::Command | MessageKind::Request)
    }
}

impl From<u64> for MessageKind {
    fn from(tag: u64) -> Self {
        match tag {
            0 => MessageKind::Command,
            1 => MessageKind::Request,
            2 => MessageKind::Result,
            3 => MessageKind::Exception,
            4 => MessageKind::Unregistered,
            other => MessageKind::Unknown(other),
        }
    }
}

impl From<MessageKind> for u64 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Command => 0,
            MessageKind::Request => 1,
            MessageKind::Result => 2,
            MessageKind::Exception => 3,
            MessageKind::Unregistered => 4,
            MessageKind::Unknown(other) => other,
        }
    }
}

/// Symbolic recipient tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub enum Target {
    /// The single elected coordinator.
    OneCoordinator,
    /// Every live coordinator-eligible peer.
    AllCoordinators,
    /// Every live peer.
    Everyone,
    Unknown(u64),
}

impl From<u64> for Target {
    fn from(tag: u64) -> Self {
        match tag {
            0 => Target::OneCoordinator,
            1 => Target::AllCoordinators,
            2 => Target::Everyone,
            other => Target::Unknown(other),
        }
    }
}

impl From<Target> for u64 {
    fn from(target: Target) -> Self {
        match target {
            Target::OneCoordinator => 0,
            Target::AllCoordinators => 1,
            Target::Everyone => 2,
            Target::Unknown(other) => other,
        }
    }
}

/// Who an inbound call is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    Peers(Vec<PeerId>),
    Target(Target),
}

impl Recipient {
    pub const ONE_COORDINATOR: Recipient = Recipient::Target(Target::OneCoordinator);
    pub const ALL_COORDINATORS: Recipient = Recipient::Target(Target::AllCoordinators);
    pub const EVERYONE: Recipient = Recipient::Target(Target::Everyone);
}

/// The unit published on a channel topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CallId>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Recipient>,
    /// Calling peer, handed to the handler as context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responding_peer_id: Option<PeerId>,
}

impl Envelope {
    fn empty(kind: MessageKind, id: Option<CallId>) -> Self {
        Self {
            id,
            kind,
            handler_name: None,
            args: None,
            recipient: None,
            sender: None,
            result: None,
            responding_peer_id: None,
        }
    }

    fn call(
        kind: MessageKind,
        id: Option<CallId>,
        handler_name: &str,
        args: Vec<Value>,
        recipient: Recipient,
        sender: PeerId,
    ) -> Self {
        Self {
            handler_name: Some(handler_name.to_string()),
            args: Some(args),
            recipient: Some(recipient),
            sender: Some(sender),
            ..Self::empty(kind, id)
        }
    }

    /// Fire-and-forget call.
    pub fn command(handler_name: &str, args: Vec<Value>, recipient: Recipient, sender: PeerId) -> Self {
        Self::call(MessageKind::Command, None, handler_name, args, recipient, sender)
    }

    /// Call expecting exactly one response correlated by `id`.
    pub fn request(
        id: CallId,
        handler_name: &str,
        args: Vec<Value>,
        recipient: Recipient,
        sender: PeerId,
    ) -> Self {
        Self::call(MessageKind::Request, Some(id), handler_name, args, recipient, sender)
    }

    pub fn result(id: CallId, result: Value, responder: PeerId) -> Self {
        Self {
            result: Some(result),
            responding_peer_id: Some(responder),
            ..Self::empty(MessageKind::Result, Some(id))
        }
    }

    pub fn exception(id: CallId, responder: PeerId) -> Self {
        Self {
            responding_peer_id: Some(responder),
            ..Self::empty(MessageKind::Exception, Some(id))
        }
    }

    pub fn unregistered(id: CallId, responder: PeerId) -> Self {
        Self {
            responding_peer_id: Some(responder),
            ..Self::empty(MessageKind::Unregistered, Some(id))
        }
    }

    /// Split into the inbound-call or response view the dispatcher acts on.
    ///
    /// Fails with [`RpcError::InternalProtocol`] when a field the kind requires
    /// is missing.
    pub fn into_inbound(self) -> Result<Inbound> {
        if !self.kind.is_call() {
            let id = self
                .id
                .ok_or_else(|| RpcError::protocol("response envelope without an id"))?;
            return Ok(Inbound::Response(InboundResponse {
                id,
                kind: self.kind,
                result: self.result.unwrap_or(Value::Null),
                responder: self.responding_peer_id,
            }));
        }

        let handler_name = self
            .handler_name
            .ok_or_else(|| RpcError::protocol("call envelope without a handlerName"))?;
        let recipient = self
            .recipient
            .ok_or_else(|| RpcError::protocol("call envelope without a recipient"))?;

        let reply_to = match (self.kind, self.id) {
            (MessageKind::Request, Some(id)) => Some(id),
            (MessageKind::Request, None) => {
                return Err(RpcError::protocol(format!(
                    "request for '{}' without an id",
                    handler_name
                )))
            }
            _ => None,
        };

        Ok(Inbound::Call(InboundCall {
            reply_to,
            handler_name,
            args: self.args.unwrap_or_default(),
            recipient,
            sender: self.sender,
        }))
    }
}

/// Inbound envelope, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Call(InboundCall),
    Response(InboundResponse),
}

/// A COMMAND (`reply_to == None`) or REQUEST addressed to someone in the room.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCall {
    pub reply_to: Option<CallId>,
    pub handler_name: String,
    pub args: Vec<Value>,
    pub recipient: Recipient,
    pub sender: Option<PeerId>,
}

/// A response to some peer's request.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundResponse {
    pub id: CallId,
    pub kind: MessageKind,
    pub result: Value,
    pub responder: Option<PeerId>,
}
