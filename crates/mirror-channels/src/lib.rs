//! Mirrored front/back channels over a topic bus.
//!
//! Every logical channel exists twice: a [`FrontChannel`] on the
//! client-facing side and a [`BackChannel`] holding the authoritative state.
//! Front channels connect to every back channel, link clients through their
//! mirror, and forward the mirror's SET/PATCH stream to linked clients.
//! Writes are batched per destination by the master coordinators and
//! flushed by the host on an interval.

pub mod back;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod front;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod types;

pub use back::{BackChannel, BackInbound, BackMasterChannel, InboundRoute};
pub use channel::Channel;
pub use client::Client;
pub use codec::{JsonSpliceCodec, StateCodec};
pub use config::MasterOptions;
pub use error::{ChannelError, ChannelResult};
pub use front::{FrontChannel, FrontMasterChannel};
pub use protocol::{topic_for, MessagePattern, Operation, ProtocolMessage};
pub use queue::{FlushReport, LinkedMasterStats};
pub use registry::ProtocolRegistry;
pub use types::{
    ChannelId, ClientUid, ConnectOutcome, ConnectedFrontData, ConnectionInfo, ConnectionStatus,
    FrontUid, LinkResponse, MasterIndex, StateUpdate, StateUpdateKind,
};
