//! Operation codes, topic naming and the wire messages exchanged between
//! front and back channels.
//!
//! Every message travels inside a `{"type": ..., "payload": ...}` JSON
//! envelope. Topics are `<code>` or `<code>-<scope>`; codes never contain
//! `-`, so distinct `(operation, scope)` pairs never share a topic.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};
use crate::types::{
    ChannelId, ClientUid, ConnectionSignal, FrontUid, MasterIndex, StateUpdateKind,
};

/// Delivery shape of an operation's topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePattern {
    /// One producer, any number of live subscribers.
    Publish,
    /// One producer, exactly one logical consumer per scope.
    Push,
    /// Many independent handlers on the same scoped topic.
    Subscribe,
    /// A single handler that replaces any previous one for the scope.
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Front master → back master batch, scoped by back master index.
    SendQueued,
    /// Back master → front master batch, scoped by front master index.
    SendQueuedFront,
    Connect,
    /// Direct front → back message, scoped by back channel id.
    SendBack,
    BroadcastAllBack,
    /// LINK, UNLINK and CLIENT_WRITE from one front to its mirror, scoped by front uid.
    Link,
    /// ACCEPT_LINK replies, state updates and linked broadcasts from the
    /// mirror to one front, scoped by front uid.
    AcceptLink,
    ConnectionChange,
    BroadcastAllFronts,
    /// Direct back → front message, scoped by front uid.
    SendFront,
}

impl Operation {
    pub const ALL: [Operation; 10] = [
        Operation::SendQueued,
        Operation::SendQueuedFront,
        Operation::Connect,
        Operation::SendBack,
        Operation::BroadcastAllBack,
        Operation::Link,
        Operation::AcceptLink,
        Operation::ConnectionChange,
        Operation::BroadcastAllFronts,
        Operation::SendFront,
    ];

    pub fn code(self) -> u8 {
        match self {
            Operation::SendQueued => 0,
            Operation::SendQueuedFront => 1,
            Operation::Connect => 2,
            Operation::SendBack => 4,
            Operation::BroadcastAllBack => 5,
            Operation::Link => 6,
            Operation::AcceptLink => 8,
            Operation::ConnectionChange => 9,
            Operation::BroadcastAllFronts => 11,
            Operation::SendFront => 12,
        }
    }

    pub fn pattern(self) -> MessagePattern {
        match self {
            Operation::Connect | Operation::BroadcastAllBack => MessagePattern::Subscribe,
            Operation::BroadcastAllFronts => MessagePattern::Publish,
            Operation::AcceptLink | Operation::ConnectionChange | Operation::SendFront => {
                MessagePattern::Push
            }
            Operation::SendQueued
            | Operation::SendQueuedFront
            | Operation::SendBack
            | Operation::Link => MessagePattern::Pull,
        }
    }
}

pub fn topic_for(operation: Operation, scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!("{}-{}", operation.code(), scope),
        None => operation.code().to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub front_uid: FrontUid,
    pub front_master_index: MasterIndex,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionChange {
    pub channel_id: ChannelId,
    pub back_master_index: MasterIndex,
    pub connection_status: ConnectionSignal,
    #[serde(default)]
    pub options: Option<Value>,
}

/// Body of LINK and UNLINK. No `client_uid` means the channel-level link.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkRequest {
    #[serde(default)]
    pub client_uid: Option<ClientUid>,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AcceptLink {
    #[serde(default)]
    pub encoded_state: Option<Bytes>,
    #[serde(default)]
    pub client_uid: Option<ClientUid>,
    #[serde(default)]
    pub response_options: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AcceptLink {
    pub fn rejected(client_uid: Option<ClientUid>, reason: impl Into<String>) -> Self {
        Self {
            client_uid,
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientWrite {
    pub client_uid: ClientUid,
    pub enabled: bool,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub channel_id: ChannelId,
    pub payload: Value,
    #[serde(default)]
    pub client_uid: Option<ClientUid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedBatch {
    pub from_master_index: MasterIndex,
    pub messages: Vec<QueuedMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontToBack {
    pub front_uid: FrontUid,
    pub message: Value,
    #[serde(default)]
    pub client_uid: Option<ClientUid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackToFront {
    pub channel_id: ChannelId,
    pub message: Value,
    #[serde(default)]
    pub client_uid: Option<ClientUid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBroadcast {
    pub channel_id: ChannelId,
    pub kind: StateUpdateKind,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ProtocolMessage {
    Connect(ConnectRequest),
    ConnectionChange(ConnectionChange),
    Link(LinkRequest),
    Unlink(LinkRequest),
    AcceptLink(AcceptLink),
    ClientWrite(ClientWrite),
    Batch(QueuedBatch),
    FrontToBack(FrontToBack),
    BackToFront(BackToFront),
    StateUpdate(StateBroadcast),
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Connect(_) => "connect",
            ProtocolMessage::ConnectionChange(_) => "connection_change",
            ProtocolMessage::Link(_) => "link",
            ProtocolMessage::Unlink(_) => "unlink",
            ProtocolMessage::AcceptLink(_) => "accept_link",
            ProtocolMessage::ClientWrite(_) => "client_write",
            ProtocolMessage::Batch(_) => "batch",
            ProtocolMessage::FrontToBack(_) => "front_to_back",
            ProtocolMessage::BackToFront(_) => "back_to_front",
            ProtocolMessage::StateUpdate(_) => "state_update",
        }
    }

    pub(crate) fn unexpected(&self, context: &str) -> ChannelError {
        ChannelError::UnrecognizedSignal(format!(
            "{} message is not valid on {context}",
            self.kind()
        ))
    }
}

pub fn encode(message: &ProtocolMessage) -> ChannelResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode(payload: &[u8]) -> ChannelResult<ProtocolMessage> {
    serde_json::from_slice(payload)
        .map_err(|err| ChannelError::UnrecognizedSignal(format!("undecodable message: {err}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;

    #[test]
    fn topics_are_distinct_per_operation_and_scope() {
        let scopes = [None, Some(""), Some("0"), Some("1"), Some("1-0"), Some("lobby-2")];
        let mut seen = HashSet::new();
        for op in Operation::ALL {
            for scope in scopes {
                assert!(
                    seen.insert(topic_for(op, scope)),
                    "duplicate topic for {op:?} / {scope:?}"
                );
            }
        }
        assert_eq!(topic_for(Operation::Link, Some("lobby-2")), "6-lobby-2");
        assert_eq!(topic_for(Operation::Connect, None), "2");
    }

    #[test]
    fn codes_are_unique() {
        let codes: HashSet<u8> = Operation::ALL.iter().map(|op| op.code()).collect();
        assert_eq!(codes.len(), Operation::ALL.len());
    }

    #[test]
    fn envelope_uses_type_and_payload() {
        let message = ProtocolMessage::Link(LinkRequest {
            client_uid: Some("c1".into()),
            options: Some(json!({"seat": 2})),
        });
        let value: Value = serde_json::from_slice(&encode(&message).unwrap()).unwrap();
        assert_eq!(value["type"], "link");
        assert_eq!(value["payload"]["client_uid"], "c1");
        assert_eq!(decode(&encode(&message).unwrap()).unwrap(), message);
    }

    #[test]
    fn accept_link_keeps_encoded_state_bytes() {
        let message = ProtocolMessage::AcceptLink(AcceptLink {
            encoded_state: Some(Bytes::from_static(b"{\"hp\":3}")),
            client_uid: None,
            response_options: None,
            error: None,
        });
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        match decoded {
            ProtocolMessage::AcceptLink(reply) => {
                assert_eq!(reply.encoded_state.unwrap().as_ref(), b"{\"hp\":3}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_an_unrecognized_signal() {
        let err = decode(br#"{"type":"teleport","payload":{}}"#).unwrap_err();
        assert!(matches!(err, ChannelError::UnrecognizedSignal(_)));
    }
}
