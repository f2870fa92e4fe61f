//! Front-side instance of one logical channel.
//!
//! A front channel announces itself to every back channel, collects their
//! acknowledgements, and once its mirror (the back channel with the same id)
//! has answered it can link clients. Everything the mirror sends to this
//! front arrives on one topic, so link replies and state updates are seen in
//! the order the back channel produced them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use transport_bus::Bus;

use crate::channel::{Channel, ChannelBase};
use crate::client::{Client, WeakClient};
use crate::config::MasterOptions;
use crate::error::{ChannelError, ChannelResult};
use crate::protocol::{
    AcceptLink, BackToFront, ClientWrite, ConnectRequest, ConnectionChange, FrontToBack,
    LinkRequest, Operation, ProtocolMessage, QueuedMessage, StateBroadcast,
};
use crate::queue::MasterQueue;
use crate::types::{
    ChannelId, ClientUid, ConnectOutcome, ConnectionInfo, ConnectionSignal, ConnectionStatus,
    FrontUid, LinkResponse, MasterIndex, StateUpdate, StateUpdateKind,
};

type MessageHandler = Arc<dyn Fn(&Value, &str) + Send + Sync>;
type ConnectedHandler = Arc<dyn Fn(&str, MasterIndex) + Send + Sync>;
type StateHandler = Arc<dyn Fn(&Bytes) + Send + Sync>;

/// `None` is the channel-level link, `Some` a client link.
type LinkKey = Option<ClientUid>;

#[derive(Default)]
struct FrontHandlers {
    on_message: Option<MessageHandler>,
    on_connected: Option<ConnectedHandler>,
    on_set_state: Option<StateHandler>,
    on_patch_state: Option<StateHandler>,
}

struct PendingLink {
    attempt: u64,
    reply: oneshot::Sender<ChannelResult<LinkResponse>>,
    client: Option<WeakClient>,
}

#[derive(Default)]
struct FrontState {
    status: ConnectionStatus,
    connected_channel_ids: Vec<ChannelId>,
    back_master_indexes: Vec<MasterIndex>,
    send_targets: BTreeSet<ChannelId>,
    mirror_master_index: Option<MasterIndex>,
    connect_waiter: Option<oneshot::Sender<ConnectOutcome>>,
    linked: bool,
    direct_link: bool,
    linked_clients: BTreeMap<ClientUid, WeakClient>,
    pending_links: HashMap<LinkKey, PendingLink>,
    next_link_attempt: u64,
}

impl FrontState {
    fn refresh_linked(&mut self) {
        self.linked = self.direct_link || !self.linked_clients.is_empty();
    }

    /// Removes the pending entry for `key` only if it still belongs to
    /// `attempt`.
    fn take_pending(&mut self, key: &LinkKey, attempt: u64) -> Option<PendingLink> {
        match self.pending_links.get(key) {
            Some(pending) if pending.attempt == attempt => self.pending_links.remove(key),
            _ => None,
        }
    }
}

/// Resets a connect attempt whose future is dropped before it settled, so a
/// later `connect` starts clean.
struct ConnectGuard<'a> {
    channel: &'a FrontChannel,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.channel.inner.state.lock();
        if state.connect_waiter.take().is_some() {
            state.status = ConnectionStatus::Disconnected;
            debug!(
                target = "mirror.front",
                front_uid = %self.channel.inner.front_uid,
                "connect abandoned"
            );
        }
    }
}

/// Retracts a link request whose future is dropped while still pending.
struct LinkGuard<'a> {
    channel: &'a FrontChannel,
    key: LinkKey,
    attempt: u64,
}

impl Drop for LinkGuard<'_> {
    fn drop(&mut self) {
        self.channel.retract_link(&self.key, self.attempt);
    }
}

struct FrontInner {
    base: ChannelBase,
    front_uid: FrontUid,
    front_master_index: MasterIndex,
    total_channels: usize,
    options: MasterOptions,
    queue: Arc<MasterQueue>,
    state: Mutex<FrontState>,
    handlers: RwLock<FrontHandlers>,
}

#[derive(Clone)]
pub struct FrontChannel {
    inner: Arc<FrontInner>,
}

impl FrontChannel {
    pub(crate) fn new(
        channel_id: ChannelId,
        total_channels: usize,
        front_master_index: MasterIndex,
        bus: Arc<dyn Bus>,
        queue: Arc<MasterQueue>,
        options: MasterOptions,
    ) -> ChannelResult<Self> {
        let front_uid = FrontUid::new(&channel_id, front_master_index);
        let channel = Self {
            inner: Arc::new(FrontInner {
                base: ChannelBase::new(channel_id, bus, "front"),
                front_uid,
                front_master_index,
                total_channels,
                options,
                queue,
                state: Mutex::new(FrontState::default()),
                handlers: RwLock::new(FrontHandlers::default()),
            }),
        };
        channel.register_inbound()?;
        Ok(channel)
    }

    pub fn front_uid(&self) -> &FrontUid {
        &self.inner.front_uid
    }

    pub fn front_master_index(&self) -> MasterIndex {
        self.inner.front_master_index
    }

    pub fn total_channels(&self) -> usize {
        self.inner.total_channels
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn is_linked(&self) -> bool {
        self.inner.state.lock().linked
    }

    /// Back master hosting the mirror, once it has acknowledged.
    pub fn back_master_index(&self) -> Option<MasterIndex> {
        self.inner.state.lock().mirror_master_index
    }

    pub fn connected_channel_ids(&self) -> Vec<ChannelId> {
        self.inner.state.lock().connected_channel_ids.clone()
    }

    pub fn linked_client_uids(&self) -> Vec<ClientUid> {
        self.inner.state.lock().linked_clients.keys().cloned().collect()
    }

    pub fn is_client_linked(&self, client_uid: &str) -> bool {
        self.inner.state.lock().linked_clients.contains_key(client_uid)
    }

    pub fn is_client_pending(&self, client_uid: &str) -> bool {
        self.inner
            .state
            .lock()
            .pending_links
            .contains_key(&Some(client_uid.to_string()))
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let state = self.inner.state.lock();
        ConnectionInfo {
            channel_id: self.channel_id().to_string(),
            front_uid: self.inner.front_uid.clone(),
            connection_status: state.status,
            connected_channel_ids: state.connected_channel_ids.clone(),
            back_master_index: state.mirror_master_index,
            is_linked: state.linked,
            linked_client_uids: state.linked_clients.keys().cloned().collect(),
            pending_client_uids: state.pending_links.keys().flatten().cloned().collect(),
        }
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        self.inner.handlers.write().on_message = Some(Arc::new(handler));
    }

    pub fn on_connected<F>(&self, handler: F)
    where
        F: Fn(&str, MasterIndex) + Send + Sync + 'static,
    {
        self.inner.handlers.write().on_connected = Some(Arc::new(handler));
    }

    pub fn on_set_state<F>(&self, handler: F)
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.inner.handlers.write().on_set_state = Some(Arc::new(handler));
    }

    pub fn on_patch_state<F>(&self, handler: F)
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.inner.handlers.write().on_patch_state = Some(Arc::new(handler));
    }

    /// Announces this front to every back channel and waits until
    /// `total_channels` distinct back channels acknowledged, or `timeout`
    /// elapsed. Acknowledgements received before a timeout stay recorded.
    pub async fn connect(&self, timeout: Duration) -> ChannelResult<ConnectOutcome> {
        self.inner.base.ensure_open()?;
        let mut rx = {
            let mut state = self.inner.state.lock();
            if matches!(
                state.status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            ) {
                return Err(ChannelError::misuse(format!(
                    "channel {} is connected or in the process of connecting",
                    self.channel_id()
                )));
            }
            state.connected_channel_ids.clear();
            state.back_master_indexes.clear();
            if self.inner.total_channels == 0 {
                state.status = ConnectionStatus::Connected;
                return Ok(ConnectOutcome::default());
            }
            state.status = ConnectionStatus::Connecting;
            let (tx, rx) = oneshot::channel();
            state.connect_waiter = Some(tx);
            rx
        };
        let _guard = ConnectGuard { channel: self };

        let announce = ProtocolMessage::Connect(ConnectRequest {
            front_uid: self.inner.front_uid.clone(),
            front_master_index: self.inner.front_master_index,
            channel_id: self.channel_id().to_string(),
        });
        self.inner
            .base
            .registry()
            .publish(Operation::Connect, None, &announce)?;
        debug!(
            target = "mirror.front",
            front_uid = %self.inner.front_uid,
            expected = self.inner.total_channels,
            "connecting"
        );

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(self.abandoned_connect()),
            Err(_) => {
                let outstanding = {
                    let mut state = self.inner.state.lock();
                    if state.connect_waiter.take().is_some() {
                        state.status = ConnectionStatus::Disconnected;
                        Some(
                            self.inner
                                .total_channels
                                .saturating_sub(state.connected_channel_ids.len()),
                        )
                    } else {
                        None
                    }
                };
                match outstanding {
                    Some(outstanding) => {
                        warn!(
                            target = "mirror.front",
                            front_uid = %self.inner.front_uid,
                            outstanding,
                            "connect timed out"
                        );
                        Err(ChannelError::ConnectTimeout {
                            channel_id: self.channel_id().to_string(),
                            outstanding,
                        })
                    }
                    // the last acknowledgement won the race with the timer
                    None => rx.await.map_err(|_| self.abandoned_connect()),
                }
            }
        }
    }

    /// Links `client` to this channel through the mirror back channel and
    /// returns the mirror's current encoded state.
    pub async fn link_client(
        &self,
        client: &Client,
        options: Option<Value>,
    ) -> ChannelResult<LinkResponse> {
        if client.uid().is_empty() {
            return Err(ChannelError::misuse("client uid must not be empty"));
        }
        self.request_link(Some(client.uid().to_string()), Some(client.downgrade()), options)
            .await
    }

    /// Channel-level link without a client. Counts as one link reference.
    pub async fn link(&self, options: Option<Value>) -> ChannelResult<LinkResponse> {
        self.request_link(None, None, options).await
    }

    /// Removes a linked or pending client. Returns `false` when the client
    /// had neither.
    pub fn unlink_client(&self, client_uid: &str, options: Option<Value>) -> ChannelResult<bool> {
        let (was_linked, mirror_index, pending) = {
            let mut state = self.inner.state.lock();
            let pending = state.pending_links.remove(&Some(client_uid.to_string()));
            let linked = state.linked_clients.remove(client_uid);
            if pending.is_none() && linked.is_none() {
                return Ok(false);
            }
            if let Some(client) = linked.as_ref().and_then(WeakClient::upgrade) {
                client.on_channel_unlinked(self.channel_id());
            }
            state.refresh_linked();
            (linked.is_some(), state.mirror_master_index, pending)
        };
        if pending.is_some() {
            debug!(
                target = "mirror.front",
                front_uid = %self.inner.front_uid,
                client_uid,
                "withdrawing pending link"
            );
        }
        drop(pending);
        if was_linked {
            if let Some(index) = mirror_index {
                self.release_master(index);
            }
        }
        self.publish_to_mirror(&ProtocolMessage::Unlink(LinkRequest {
            client_uid: Some(client_uid.to_string()),
            options,
        }))?;
        debug!(
            target = "mirror.front",
            front_uid = %self.inner.front_uid,
            client_uid,
            "client unlinked"
        );
        Ok(true)
    }

    /// Unlinks every client and then the channel-level link.
    pub fn unlink(&self, options: Option<Value>) -> ChannelResult<()> {
        let client_uids: Vec<ClientUid> = {
            let state = self.inner.state.lock();
            state
                .linked_clients
                .keys()
                .cloned()
                .chain(state.pending_links.keys().flatten().cloned())
                .collect()
        };
        for client_uid in client_uids {
            self.unlink_client(&client_uid, options.clone())?;
        }

        let (had_direct, pending, mirror_index) = {
            let mut state = self.inner.state.lock();
            let had_direct = mem::replace(&mut state.direct_link, false);
            let pending = state.pending_links.remove(&None);
            state.refresh_linked();
            (had_direct, pending, state.mirror_master_index)
        };
        if !had_direct && pending.is_none() {
            return Ok(());
        }
        drop(pending);
        if had_direct {
            if let Some(index) = mirror_index {
                self.release_master(index);
            }
        }
        self.publish_to_mirror(&ProtocolMessage::Unlink(LinkRequest {
            client_uid: None,
            options,
        }))
    }

    /// Tells the mirror that `client_uid` now writes through this channel.
    pub fn add_client_write(&self, client_uid: &str, options: Option<Value>) -> ChannelResult<()> {
        self.client_write(client_uid, true, options)
    }

    pub fn remove_client_write(
        &self,
        client_uid: &str,
        options: Option<Value>,
    ) -> ChannelResult<()> {
        self.client_write(client_uid, false, options)
    }

    /// Queues `message` for the mirror on the master's outbound buffer.
    pub fn add_message(&self, message: Value) -> ChannelResult<()> {
        self.add_message_from(message, None)
    }

    /// Sends straight to one back channel, the mirror when `back_channel_id`
    /// is `None`.
    pub fn send(&self, message: Value, back_channel_id: Option<&str>) -> ChannelResult<()> {
        self.send_from(message, back_channel_id, None)
    }

    /// Sends to the named back channels, or to every back channel.
    pub fn broadcast(&self, message: Value, back_channel_ids: Option<&[ChannelId]>) -> ChannelResult<()> {
        self.broadcast_from(message, back_channel_ids, None)
    }

    pub(crate) fn add_message_from(
        &self,
        message: Value,
        client_uid: Option<ClientUid>,
    ) -> ChannelResult<()> {
        let mirror_index = {
            let state = self.inner.state.lock();
            match (state.linked, state.mirror_master_index) {
                (true, Some(index)) => index,
                _ => {
                    return Err(ChannelError::misuse(format!(
                        "channel {} is not linked to its back channel",
                        self.channel_id()
                    )))
                }
            }
        };
        self.inner.queue.push(
            mirror_index,
            QueuedMessage {
                channel_id: self.channel_id().to_string(),
                payload: message,
                client_uid,
            },
        )
    }

    pub(crate) fn send_from(
        &self,
        message: Value,
        back_channel_id: Option<&str>,
        client_uid: Option<ClientUid>,
    ) -> ChannelResult<()> {
        self.inner.base.ensure_open()?;
        let target = back_channel_id.unwrap_or(self.channel_id());
        if !self.inner.state.lock().send_targets.contains(target) {
            return Err(ChannelError::misuse(format!(
                "back channel {target} has not acknowledged front {}",
                self.inner.front_uid
            )));
        }
        self.inner.base.registry().publish(
            Operation::SendBack,
            Some(target),
            &ProtocolMessage::FrontToBack(FrontToBack {
                front_uid: self.inner.front_uid.clone(),
                message,
                client_uid,
            }),
        )?;
        Ok(())
    }

    pub(crate) fn broadcast_from(
        &self,
        message: Value,
        back_channel_ids: Option<&[ChannelId]>,
        client_uid: Option<ClientUid>,
    ) -> ChannelResult<()> {
        self.inner.base.ensure_open()?;
        match back_channel_ids {
            Some(ids) => ids
                .iter()
                .try_for_each(|id| self.send_from(message.clone(), Some(id), client_uid.clone())),
            None => {
                self.inner.base.registry().publish(
                    Operation::BroadcastAllBack,
                    None,
                    &ProtocolMessage::FrontToBack(FrontToBack {
                        front_uid: self.inner.front_uid.clone(),
                        message,
                        client_uid,
                    }),
                )?;
                Ok(())
            }
        }
    }

    /// Entry point for messages the back master queued for this channel.
    pub(crate) fn receive_queued(&self, message: QueuedMessage) {
        self.deliver(BackToFront {
            channel_id: message.channel_id,
            message: message.payload,
            client_uid: message.client_uid,
        });
    }

    async fn request_link(
        &self,
        key: LinkKey,
        client: Option<WeakClient>,
        options: Option<Value>,
    ) -> ChannelResult<LinkResponse> {
        self.inner.base.ensure_open()?;
        let (attempt, rx) = {
            let mut state = self.inner.state.lock();
            let established = match &key {
                Some(uid) => state.linked_clients.contains_key(uid),
                None => state.direct_link,
            };
            if established || state.pending_links.contains_key(&key) {
                return Err(ChannelError::misuse(format!(
                    "{} is already in connection state on channel {}",
                    describe_link(&key),
                    self.channel_id()
                )));
            }
            if state.mirror_master_index.is_none() {
                return Err(ChannelError::misuse(format!(
                    "channel {} has no connected back channel to link through",
                    self.channel_id()
                )));
            }
            let attempt = state.next_link_attempt;
            state.next_link_attempt += 1;
            let (tx, rx) = oneshot::channel();
            state.pending_links.insert(
                key.clone(),
                PendingLink {
                    attempt,
                    reply: tx,
                    client,
                },
            );
            (attempt, rx)
        };
        let guard = LinkGuard {
            channel: self,
            key: key.clone(),
            attempt,
        };

        let request = ProtocolMessage::Link(LinkRequest {
            client_uid: key.clone(),
            options,
        });
        if let Err(err) = self.publish_to_mirror(&request) {
            self.inner.state.lock().take_pending(&key, attempt);
            return Err(err);
        }
        debug!(
            target = "mirror.front",
            front_uid = %self.inner.front_uid,
            link = %describe_link(&key),
            "link requested"
        );
        self.await_link(guard, rx).await
    }

    async fn await_link(
        &self,
        guard: LinkGuard<'_>,
        mut rx: oneshot::Receiver<ChannelResult<LinkResponse>>,
    ) -> ChannelResult<LinkResponse> {
        let key = guard.key.clone();
        match tokio::time::timeout(self.inner.options.client_link_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.withdrawn(&key)),
            Err(_) => {
                if !self.retract_link(&key, guard.attempt) {
                    // settled concurrently with the timer; the settler always sends or drops
                    return rx.await.unwrap_or_else(|_| Err(self.withdrawn(&key)));
                }
                warn!(
                    target = "mirror.front",
                    front_uid = %self.inner.front_uid,
                    link = %describe_link(&key),
                    "link request timed out"
                );
                Err(ChannelError::LinkTimeout {
                    client_uid: key.unwrap_or_else(|| self.inner.front_uid.to_string()),
                    channel_id: self.channel_id().to_string(),
                })
            }
        }
    }

    /// Drops the pending entry of `attempt` and tells the mirror to forget
    /// it, so a late accept cannot leave the back side holding the link.
    /// Returns `false` when the entry was already settled.
    fn retract_link(&self, key: &LinkKey, attempt: u64) -> bool {
        if self.inner.state.lock().take_pending(key, attempt).is_none() {
            return false;
        }
        let forget = ProtocolMessage::Unlink(LinkRequest {
            client_uid: key.clone(),
            options: None,
        });
        if let Err(err) = self.publish_to_mirror(&forget) {
            warn!(
                target = "mirror.front",
                front_uid = %self.inner.front_uid,
                error = %err,
                "failed to retract link request"
            );
        }
        true
    }

    fn client_write(
        &self,
        client_uid: &str,
        enabled: bool,
        options: Option<Value>,
    ) -> ChannelResult<()> {
        if !self.is_client_linked(client_uid) {
            return Err(ChannelError::misuse(format!(
                "client {client_uid} is not linked to channel {}",
                self.channel_id()
            )));
        }
        self.publish_to_mirror(&ProtocolMessage::ClientWrite(ClientWrite {
            client_uid: client_uid.to_string(),
            enabled,
            options,
        }))
    }

    fn publish_to_mirror(&self, message: &ProtocolMessage) -> ChannelResult<()> {
        self.inner.base.registry().publish(
            Operation::Link,
            Some(self.inner.front_uid.as_str()),
            message,
        )?;
        Ok(())
    }

    fn release_master(&self, index: MasterIndex) {
        if let Err(err) = self.inner.queue.unlink(index) {
            warn!(
                target = "mirror.front",
                front_uid = %self.inner.front_uid,
                back_master_index = index,
                error = %err,
                "link reference already released"
            );
        }
    }

    fn withdrawn(&self, key: &LinkKey) -> ChannelError {
        ChannelError::misuse(format!(
            "{} on channel {} was withdrawn before it completed",
            describe_link(key),
            self.channel_id()
        ))
    }

    fn abandoned_connect(&self) -> ChannelError {
        ChannelError::misuse(format!(
            "connect on channel {} was abandoned",
            self.channel_id()
        ))
    }

    fn register_inbound(&self) -> ChannelResult<()> {
        let uid = self.inner.front_uid.as_str();
        let registry = self.inner.base.registry();
        registry.pull(
            Operation::ConnectionChange,
            Some(uid),
            self.handler(Self::on_connection_change),
        )?;
        registry.pull(Operation::SendFront, Some(uid), self.handler(Self::on_direct_message))?;
        registry.subscribe(
            Operation::BroadcastAllFronts,
            None,
            uid,
            self.handler(Self::on_direct_message),
        )?;
        Ok(())
    }

    fn register_mirror(&self) -> ChannelResult<()> {
        let uid = self.inner.front_uid.as_str();
        let registry = self.inner.base.registry();
        if !registry.is_registered(Operation::AcceptLink, Some(uid)) {
            registry.pull(
                Operation::AcceptLink,
                Some(uid),
                self.handler(Self::on_mirror_message),
            )?;
        }
        Ok(())
    }

    fn handler<F>(&self, handle: F) -> impl Fn(ProtocolMessage) + Send + Sync + 'static
    where
        F: Fn(&FrontChannel, ProtocolMessage) -> ChannelResult<()> + Send + Sync + 'static,
    {
        let weak: Weak<FrontInner> = Arc::downgrade(&self.inner);
        move |message| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let channel = FrontChannel { inner };
            if let Err(err) = handle(&channel, message) {
                error!(
                    target = "mirror.front",
                    front_uid = %channel.inner.front_uid,
                    error = %err,
                    "failed to process message"
                );
            }
        }
    }

    fn on_connection_change(&self, message: ProtocolMessage) -> ChannelResult<()> {
        let change = match message {
            ProtocolMessage::ConnectionChange(change) => change,
            other => return Err(other.unexpected("the connection change topic")),
        };
        match change.connection_status {
            ConnectionSignal::Connected => self.on_back_connected(change),
            ConnectionSignal::Disconnected => {
                self.on_back_disconnected(&change.channel_id);
                Ok(())
            }
            ConnectionSignal::Unknown => Err(ChannelError::UnrecognizedSignal(format!(
                "back channel {} sent an unknown connection status",
                change.channel_id
            ))),
        }
    }

    fn on_back_connected(&self, change: ConnectionChange) -> ChannelResult<()> {
        let is_mirror = change.channel_id == self.channel_id();
        if is_mirror {
            self.register_mirror()?;
        }
        let back_master_index = change.back_master_index;
        let completed = {
            let mut state = self.inner.state.lock();
            if is_mirror {
                state.mirror_master_index = Some(back_master_index);
            }
            state.send_targets.insert(change.channel_id.clone());
            if !state.connected_channel_ids.contains(&change.channel_id) {
                state.connected_channel_ids.push(change.channel_id.clone());
            }
            if !state.back_master_indexes.contains(&back_master_index) {
                state.back_master_indexes.push(back_master_index);
            }
            let mut completed = None;
            if state.connected_channel_ids.len() >= self.inner.total_channels {
                if let Some(waiter) = state.connect_waiter.take() {
                    state.status = ConnectionStatus::Connected;
                    let outcome = ConnectOutcome {
                        channel_ids: state.connected_channel_ids.clone(),
                        back_master_indexes: state.back_master_indexes.clone(),
                    };
                    completed = Some((waiter, outcome));
                }
            }
            completed
        };
        debug!(
            target = "mirror.front",
            front_uid = %self.inner.front_uid,
            back_channel_id = %change.channel_id,
            back_master_index,
            mirror = is_mirror,
            "back channel acknowledged"
        );

        let on_connected = self.inner.handlers.read().on_connected.clone();
        if let Some(on_connected) = on_connected {
            on_connected(&change.channel_id, back_master_index);
        }
        if let Some((waiter, outcome)) = completed {
            info!(
                target = "mirror.front",
                front_uid = %self.inner.front_uid,
                back_masters = ?outcome.back_master_indexes,
                "front channel connected"
            );
            let _ = waiter.send(outcome);
        }
        Ok(())
    }

    fn on_back_disconnected(&self, back_channel_id: &str) {
        let is_mirror = back_channel_id == self.channel_id();
        let (released, clients, pending) = {
            let mut state = self.inner.state.lock();
            state.connected_channel_ids.retain(|id| id != back_channel_id);
            state.send_targets.remove(back_channel_id);
            if state.status == ConnectionStatus::Connected {
                state.status = ConnectionStatus::Disconnected;
            }
            if is_mirror {
                let references = state.linked_clients.len() + usize::from(state.direct_link);
                let released = state
                    .mirror_master_index
                    .take()
                    .map(|index| (index, references));
                state.direct_link = false;
                state.linked = false;
                let pending: Vec<PendingLink> =
                    state.pending_links.drain().map(|(_, link)| link).collect();
                (released, mem::take(&mut state.linked_clients), pending)
            } else {
                (None, BTreeMap::new(), Vec::new())
            }
        };
        warn!(
            target = "mirror.front",
            front_uid = %self.inner.front_uid,
            back_channel_id,
            mirror = is_mirror,
            "back channel disconnected"
        );
        if !is_mirror {
            return;
        }

        self.inner
            .base
            .registry()
            .unsubscribe_topic(Operation::AcceptLink, Some(self.inner.front_uid.as_str()));
        for link in pending {
            let _ = link.reply.send(Err(ChannelError::RemoteRejection(format!(
                "back channel {back_channel_id} disconnected"
            ))));
        }
        if let Some((index, references)) = released {
            for _ in 0..references {
                self.release_master(index);
            }
        }
        for client in clients.values().filter_map(WeakClient::upgrade) {
            client.on_channel_unlinked(self.channel_id());
        }
    }

    fn on_mirror_message(&self, message: ProtocolMessage) -> ChannelResult<()> {
        match message {
            ProtocolMessage::AcceptLink(reply) => self.on_accept_link(reply),
            ProtocolMessage::StateUpdate(update) => self.on_state_update(update),
            ProtocolMessage::BackToFront(message) => {
                if self.is_linked() {
                    self.deliver(message);
                } else {
                    debug!(
                        target = "mirror.front",
                        front_uid = %self.inner.front_uid,
                        "ignoring linked broadcast while unlinked"
                    );
                }
            }
            other => return Err(other.unexpected("the mirror stream")),
        }
        Ok(())
    }

    fn on_accept_link(&self, reply: AcceptLink) {
        let key = reply.client_uid;
        let mut state = self.inner.state.lock();
        let Some(pending) = state.pending_links.remove(&key) else {
            debug!(
                target = "mirror.front",
                front_uid = %self.inner.front_uid,
                link = %describe_link(&key),
                "ignoring accept for a link that is no longer pending"
            );
            return;
        };
        if let Some(reason) = reply.error {
            drop(state);
            warn!(
                target = "mirror.front",
                front_uid = %self.inner.front_uid,
                link = %describe_link(&key),
                reason = %reason,
                "link rejected"
            );
            let _ = pending.reply.send(Err(ChannelError::RemoteRejection(reason)));
            return;
        }
        let Some(mirror_index) = state.mirror_master_index else {
            drop(state);
            let _ = pending.reply.send(Err(ChannelError::misuse(format!(
                "channel {} lost its back channel before the link completed",
                self.channel_id()
            ))));
            return;
        };

        let encoded_state = reply.encoded_state.unwrap_or_default();
        match (&key, pending.client) {
            (Some(uid), Some(client)) => {
                let Some(strong) = client.upgrade() else {
                    drop(state);
                    warn!(
                        target = "mirror.front",
                        front_uid = %self.inner.front_uid,
                        client_uid = %uid,
                        "client dropped before its link was accepted"
                    );
                    if let Err(err) = self.publish_to_mirror(&ProtocolMessage::Unlink(LinkRequest {
                        client_uid: key.clone(),
                        options: None,
                    })) {
                        warn!(
                            target = "mirror.front",
                            front_uid = %self.inner.front_uid,
                            error = %err,
                            "failed to retract link request"
                        );
                    }
                    let _ = pending.reply.send(Err(self.withdrawn(&key)));
                    return;
                };
                strong.record_link(self.channel_id(), encoded_state.clone());
                state.linked_clients.insert(uid.clone(), client);
            }
            _ => state.direct_link = true,
        }
        state.linked = true;
        let references = self.inner.queue.link(mirror_index);
        drop(state);

        debug!(
            target = "mirror.front",
            front_uid = %self.inner.front_uid,
            link = %describe_link(&key),
            back_master_index = mirror_index,
            references,
            "link accepted"
        );
        let response = LinkResponse {
            encoded_state,
            response_options: reply.response_options,
        };
        if pending.reply.send(Ok(response)).is_err() {
            debug!(
                target = "mirror.front",
                front_uid = %self.inner.front_uid,
                "link requester went away before the reply"
            );
        }
    }

    fn on_state_update(&self, update: StateBroadcast) {
        if update.channel_id != self.channel_id() {
            warn!(
                target = "mirror.front",
                front_uid = %self.inner.front_uid,
                from = %update.channel_id,
                "dropping state update for another channel"
            );
            return;
        }
        {
            let state = self.inner.state.lock();
            if !state.linked {
                return;
            }
            for (uid, client) in &state.linked_clients {
                let Some(client) = client.upgrade() else {
                    continue;
                };
                let entry = StateUpdate {
                    kind: update.kind,
                    payload: update.payload.clone(),
                };
                if !client.add_state_update(self.channel_id(), entry) {
                    warn!(
                        target = "mirror.front",
                        front_uid = %self.inner.front_uid,
                        client_uid = %uid,
                        "client refused state update"
                    );
                }
            }
        }
        let handler = {
            let handlers = self.inner.handlers.read();
            match update.kind {
                StateUpdateKind::Set => handlers.on_set_state.clone(),
                StateUpdateKind::Patch => handlers.on_patch_state.clone(),
            }
        };
        if let Some(handler) = handler {
            handler(&update.payload);
        }
    }

    fn on_direct_message(&self, message: ProtocolMessage) -> ChannelResult<()> {
        match message {
            ProtocolMessage::BackToFront(message) => {
                self.deliver(message);
                Ok(())
            }
            other => Err(other.unexpected("a front delivery topic")),
        }
    }

    fn deliver(&self, message: BackToFront) {
        match message.client_uid {
            Some(client_uid) => {
                let client = self
                    .inner
                    .state
                    .lock()
                    .linked_clients
                    .get(&client_uid)
                    .and_then(WeakClient::upgrade);
                match client {
                    Some(client) => client.deliver_message(&message.message, &message.channel_id),
                    None => warn!(
                        target = "mirror.front",
                        front_uid = %self.inner.front_uid,
                        client_uid = %client_uid,
                        "dropping message for a client not linked here"
                    ),
                }
            }
            None => {
                let handler = self.inner.handlers.read().on_message.clone();
                match handler {
                    Some(handler) => handler(&message.message, &message.channel_id),
                    None => debug!(
                        target = "mirror.front",
                        front_uid = %self.inner.front_uid,
                        "no message handler installed"
                    ),
                }
            }
        }
    }
}

impl Channel for FrontChannel {
    fn channel_id(&self) -> &str {
        self.inner.base.channel_id()
    }

    fn is_open(&self) -> bool {
        self.inner.base.is_open()
    }

    fn close(&self) {
        if !self.inner.base.close() {
            return;
        }
        let mut state = self.inner.state.lock();
        state.connect_waiter = None;
        state.pending_links.clear();
        debug!(target = "mirror.front", front_uid = %self.inner.front_uid, "closed");
    }
}

fn describe_link(key: &LinkKey) -> String {
    match key {
        Some(uid) => format!("client {uid}"),
        None => "channel link".to_string(),
    }
}
