use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ChannelId = String;
pub type ClientUid = String;
pub type MasterIndex = u32;

/// Cluster-wide identity of one front channel instance: `<channel_id>-<front_master_index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrontUid(String);

impl FrontUid {
    pub fn new(channel_id: &str, front_master_index: MasterIndex) -> Self {
        Self(format!("{channel_id}-{front_master_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrontUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// Reserved; no transition enters it.
    Disconnecting,
    Connecting,
    Connected,
}

/// Status carried by a CONNECTION_CHANGE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionSignal {
    Connected,
    Disconnected,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateUpdateKind {
    Set,
    Patch,
}

/// One entry of a client's pending state updates for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub kind: StateUpdateKind,
    pub payload: Bytes,
}

impl StateUpdate {
    pub fn set(payload: Bytes) -> Self {
        Self {
            kind: StateUpdateKind::Set,
            payload,
        }
    }

    pub fn patch(payload: Bytes) -> Self {
        Self {
            kind: StateUpdateKind::Patch,
            payload,
        }
    }
}

/// What a back channel knows about a front that completed the handshake with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedFrontData {
    pub channel_id: ChannelId,
    pub front_uid: FrontUid,
    pub front_master_index: MasterIndex,
    pub back_master_index: MasterIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectOutcome {
    /// Distinct back channel ids that acknowledged, in arrival order.
    pub channel_ids: Vec<ChannelId>,
    pub back_master_indexes: Vec<MasterIndex>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkResponse {
    pub encoded_state: Bytes,
    pub response_options: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub channel_id: ChannelId,
    pub front_uid: FrontUid,
    pub connection_status: ConnectionStatus,
    pub connected_channel_ids: Vec<ChannelId>,
    pub back_master_index: Option<MasterIndex>,
    pub is_linked: bool,
    pub linked_client_uids: Vec<ClientUid>,
    pub pending_client_uids: Vec<ClientUid>,
}
