//! Back-side instance of one logical channel: owner of the authoritative
//! state and of the link bookkeeping for every front that mirrors it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use transport_bus::Bus;

use crate::channel::{Channel, ChannelBase};
use crate::codec::StateCodec;
use crate::error::{ChannelError, ChannelResult};
use crate::protocol::{
    AcceptLink, BackToFront, ClientWrite, ConnectRequest, ConnectionChange, Operation,
    ProtocolMessage, QueuedMessage, StateBroadcast,
};
use crate::queue::MasterQueue;
use crate::types::{
    ChannelId, ClientUid, ConnectedFrontData, ConnectionSignal, FrontUid, MasterIndex,
    StateUpdateKind,
};

/// How a front message reached the back channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRoute {
    /// Flushed in a batch by the front master.
    Queued,
    /// Sent to this back channel only.
    Direct,
    /// Broadcast to every back channel.
    Broadcast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackInbound {
    pub message: Value,
    pub front_uid: FrontUid,
    pub client_uid: Option<ClientUid>,
    pub route: InboundRoute,
}

type InboundHandler = Arc<dyn Fn(BackInbound) + Send + Sync>;
type LinkValidator =
    Arc<dyn Fn(&FrontUid, Option<&str>, Option<&Value>) -> Result<Option<Value>, String> + Send + Sync>;
type ClientWriteHandler = Arc<dyn Fn(&str, bool, Option<&Value>) + Send + Sync>;

#[derive(Default)]
struct BackHandlers {
    on_message: Option<InboundHandler>,
    on_link: Option<LinkValidator>,
    on_client_write: Option<ClientWriteHandler>,
}

/// Links one front holds on this channel.
#[derive(Debug, Default)]
struct FrontLinks {
    direct: bool,
    clients: BTreeSet<ClientUid>,
}

impl FrontLinks {
    fn is_empty(&self) -> bool {
        !self.direct && self.clients.is_empty()
    }
}

struct BackState {
    current: Value,
    previous_encoded: Option<Bytes>,
    connected_fronts: BTreeMap<FrontUid, ConnectedFrontData>,
    mirrored_front_uids: BTreeSet<FrontUid>,
    linked_fronts: BTreeMap<FrontUid, FrontLinks>,
    client_fronts: BTreeMap<ClientUid, FrontUid>,
    writing_client_uids: BTreeSet<ClientUid>,
}

impl BackState {
    fn new() -> Self {
        Self {
            current: Value::Null,
            previous_encoded: None,
            connected_fronts: BTreeMap::new(),
            mirrored_front_uids: BTreeSet::new(),
            linked_fronts: BTreeMap::new(),
            client_fronts: BTreeMap::new(),
            writing_client_uids: BTreeSet::new(),
        }
    }

    /// Drops every link `front_uid` held and reports whether any existed.
    fn forget_links(&mut self, front_uid: &FrontUid) -> bool {
        let Some(links) = self.linked_fronts.remove(front_uid) else {
            return false;
        };
        for client_uid in &links.clients {
            self.client_fronts.remove(client_uid);
            self.writing_client_uids.remove(client_uid);
        }
        true
    }
}

struct BackInner {
    base: ChannelBase,
    back_master_index: MasterIndex,
    codec: Arc<dyn StateCodec>,
    queue: Arc<MasterQueue>,
    state: Mutex<BackState>,
    handlers: RwLock<BackHandlers>,
}

#[derive(Clone)]
pub struct BackChannel {
    inner: Arc<BackInner>,
}

impl BackChannel {
    pub(crate) fn new(
        channel_id: ChannelId,
        back_master_index: MasterIndex,
        bus: Arc<dyn Bus>,
        queue: Arc<MasterQueue>,
        codec: Arc<dyn StateCodec>,
    ) -> ChannelResult<Self> {
        let channel = Self {
            inner: Arc::new(BackInner {
                base: ChannelBase::new(channel_id, bus, "back"),
                back_master_index,
                codec,
                queue,
                state: Mutex::new(BackState::new()),
                handlers: RwLock::new(BackHandlers::default()),
            }),
        };
        channel.register_inbound()?;
        Ok(channel)
    }

    pub fn back_master_index(&self) -> MasterIndex {
        self.inner.back_master_index
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(BackInbound) + Send + Sync + 'static,
    {
        self.inner.handlers.write().on_message = Some(Arc::new(handler));
    }

    /// Decides whether a link is granted. `Ok` carries the response options
    /// handed back to the front; `Err` carries the rejection reason.
    pub fn on_link<F>(&self, validator: F)
    where
        F: Fn(&FrontUid, Option<&str>, Option<&Value>) -> Result<Option<Value>, String>
            + Send
            + Sync
            + 'static,
    {
        self.inner.handlers.write().on_link = Some(Arc::new(validator));
    }

    pub fn on_client_write<F>(&self, handler: F)
    where
        F: Fn(&str, bool, Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.handlers.write().on_client_write = Some(Arc::new(handler));
    }

    pub fn state(&self) -> Value {
        self.inner.state.lock().current.clone()
    }

    /// Replaces the state, makes it the new patch baseline and sends it as a
    /// SET to every mirrored front.
    pub fn set_state(&self, new_state: Value) -> ChannelResult<()> {
        let mut state = self.inner.state.lock();
        let encoded = self.inner.codec.encode_snapshot(&new_state)?;
        state.current = new_state;
        state.previous_encoded = Some(encoded.clone());
        let targets: Vec<FrontUid> = state.mirrored_front_uids.iter().cloned().collect();
        self.push_state(StateUpdateKind::Set, encoded, &targets)
    }

    /// Mutates the state in place; call [`BackChannel::patch_state`] to
    /// broadcast the result.
    pub fn update_state<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Value),
    {
        mutate(&mut self.inner.state.lock().current);
    }

    /// Broadcasts the delta between the last broadcast snapshot and the
    /// current state. Returns `false`, sending nothing, when they match.
    pub fn patch_state(&self) -> ChannelResult<bool> {
        let mut state = self.inner.state.lock();
        let next = self.inner.codec.encode_snapshot(&state.current)?;
        let (kind, payload) = match &state.previous_encoded {
            Some(previous) => match self.inner.codec.compute_delta(previous, &next)? {
                Some(delta) => (StateUpdateKind::Patch, delta),
                None => return Ok(false),
            },
            // nothing to diff against yet, so the snapshot goes out whole
            None => (StateUpdateKind::Set, next.clone()),
        };
        state.previous_encoded = Some(next);
        let targets: Vec<FrontUid> = state.mirrored_front_uids.iter().cloned().collect();
        self.push_state(kind, payload, &targets)?;
        Ok(true)
    }

    /// Sends the current baseline as a SET to one mirrored front.
    pub fn send_state(&self, front_uid: &FrontUid) -> ChannelResult<()> {
        let mut state = self.inner.state.lock();
        if !state.mirrored_front_uids.contains(front_uid) {
            return Err(ChannelError::misuse(format!(
                "front {front_uid} does not mirror back channel {}",
                self.channel_id()
            )));
        }
        let encoded = self.baseline(&mut state)?;
        self.push_state(StateUpdateKind::Set, encoded, std::slice::from_ref(front_uid))
    }

    /// Grants or refuses a link for `front_uid` (and `client_uid` when it is
    /// a client link) and replies on the front's mirror stream.
    pub fn accept_link(
        &self,
        front_uid: &FrontUid,
        client_uid: Option<ClientUid>,
        options: Option<Value>,
    ) -> ChannelResult<()> {
        let validator = self.inner.handlers.read().on_link.clone();
        let verdict = match validator {
            Some(validate) => validate(front_uid, client_uid.as_deref(), options.as_ref()),
            None => Ok(None),
        };

        // the reply leaves under the state lock, so no state update built on
        // a newer baseline can reach the front ahead of it
        let mut state = self.inner.state.lock();
        let connected = state.connected_fronts.get(front_uid).cloned();
        let reply = match (connected, verdict) {
            (None, _) => AcceptLink::rejected(
                client_uid,
                format!(
                    "front {front_uid} has not connected to back channel {}",
                    self.channel_id()
                ),
            ),
            (Some(_), Err(reason)) => AcceptLink::rejected(client_uid, reason),
            (Some(front), Ok(response_options)) => {
                match self.register_link(&mut state, &front, client_uid.as_ref()) {
                    Ok(encoded_state) => AcceptLink {
                        encoded_state: Some(encoded_state),
                        client_uid,
                        response_options,
                        error: None,
                    },
                    Err(err) => AcceptLink::rejected(client_uid, err.to_string()),
                }
            }
        };
        let granted = reply.error.is_none();
        self.inner.base.registry().publish(
            Operation::AcceptLink,
            Some(front_uid.as_str()),
            &ProtocolMessage::AcceptLink(reply),
        )?;
        drop(state);
        debug!(
            target = "mirror.back",
            channel_id = %self.channel_id(),
            front_uid = %front_uid,
            granted,
            "answered link request"
        );
        Ok(())
    }

    /// Direct push to one connected front.
    pub fn send(&self, message: Value, front_uid: &FrontUid) -> ChannelResult<()> {
        self.send_to_front(message, front_uid, None)
    }

    /// Sends to the named fronts, or publishes to every front when `None`.
    pub fn broadcast(&self, message: Value, front_uids: Option<&[FrontUid]>) -> ChannelResult<()> {
        match front_uids {
            Some(front_uids) => front_uids
                .iter()
                .try_for_each(|uid| self.send_to_front(message.clone(), uid, None)),
            None => {
                self.inner.base.registry().publish(
                    Operation::BroadcastAllFronts,
                    None,
                    &ProtocolMessage::BackToFront(BackToFront {
                        channel_id: self.channel_id().to_string(),
                        message,
                        client_uid: None,
                    }),
                )?;
                Ok(())
            }
        }
    }

    /// Sends to every mirrored front that currently holds a link.
    pub fn broadcast_linked(&self, message: Value) -> ChannelResult<usize> {
        let envelope = ProtocolMessage::BackToFront(BackToFront {
            channel_id: self.channel_id().to_string(),
            message,
            client_uid: None,
        });
        let state = self.inner.state.lock();
        for uid in state.linked_fronts.keys() {
            self.inner
                .base
                .registry()
                .publish(Operation::AcceptLink, Some(uid.as_str()), &envelope)?;
        }
        Ok(state.linked_fronts.len())
    }

    /// Routes a message to one linked client through the front it linked from.
    pub fn send_to_client(&self, message: Value, client_uid: &str) -> ChannelResult<()> {
        let front_uid = self.front_uid_for_client(client_uid).ok_or_else(|| {
            ChannelError::misuse(format!(
                "client {client_uid} is not linked to back channel {}",
                self.channel_id()
            ))
        })?;
        self.send_to_front(message, &front_uid, Some(client_uid.to_string()))
    }

    /// Queues a message for a linked mirrored front on the back master's
    /// outbound buffer.
    pub fn add_message(&self, message: Value, front_uid: &FrontUid) -> ChannelResult<()> {
        let front_master_index = {
            let state = self.inner.state.lock();
            let linked = state.linked_fronts.contains_key(front_uid);
            match state.connected_fronts.get(front_uid) {
                Some(front) if linked => front.front_master_index,
                _ => {
                    return Err(ChannelError::misuse(format!(
                        "front {front_uid} is not linked to back channel {}",
                        self.channel_id()
                    )))
                }
            }
        };
        self.inner.queue.push(
            front_master_index,
            QueuedMessage {
                channel_id: self.channel_id().to_string(),
                payload: message,
                client_uid: None,
            },
        )
    }

    pub fn connected_fronts_data(&self) -> Vec<ConnectedFrontData> {
        self.inner.state.lock().connected_fronts.values().cloned().collect()
    }

    pub fn mirrored_front_uids(&self) -> Vec<FrontUid> {
        self.inner.state.lock().mirrored_front_uids.iter().cloned().collect()
    }

    pub fn linked_front_uids(&self) -> Vec<FrontUid> {
        self.inner.state.lock().linked_fronts.keys().cloned().collect()
    }

    pub fn listening_client_uids(&self) -> Vec<ClientUid> {
        self.inner.state.lock().client_fronts.keys().cloned().collect()
    }

    pub fn writing_client_uids(&self) -> Vec<ClientUid> {
        self.inner.state.lock().writing_client_uids.iter().cloned().collect()
    }

    pub fn front_uid_for_client(&self, client_uid: &str) -> Option<FrontUid> {
        self.inner.state.lock().client_fronts.get(client_uid).cloned()
    }

    pub(crate) fn receive_queued(&self, message: QueuedMessage, front_master_index: MasterIndex) {
        let front_uid = FrontUid::new(&message.channel_id, front_master_index);
        self.dispatch(BackInbound {
            message: message.payload,
            front_uid,
            client_uid: message.client_uid,
            route: InboundRoute::Queued,
        });
    }

    fn send_to_front(
        &self,
        message: Value,
        front_uid: &FrontUid,
        client_uid: Option<ClientUid>,
    ) -> ChannelResult<()> {
        self.inner.base.ensure_open()?;
        if !self.inner.state.lock().connected_fronts.contains_key(front_uid) {
            return Err(ChannelError::misuse(format!(
                "front {front_uid} has not connected to back channel {}",
                self.channel_id()
            )));
        }
        self.inner.base.registry().publish(
            Operation::SendFront,
            Some(front_uid.as_str()),
            &ProtocolMessage::BackToFront(BackToFront {
                channel_id: self.channel_id().to_string(),
                message,
                client_uid,
            }),
        )?;
        Ok(())
    }

    /// Callers hold the state lock, which keeps updates on each front's
    /// stream in the order their baselines advanced.
    fn push_state(&self, kind: StateUpdateKind, payload: Bytes, targets: &[FrontUid]) -> ChannelResult<()> {
        let update = ProtocolMessage::StateUpdate(StateBroadcast {
            channel_id: self.channel_id().to_string(),
            kind,
            payload,
        });
        for uid in targets {
            self.inner
                .base
                .registry()
                .publish(Operation::AcceptLink, Some(uid.as_str()), &update)?;
        }
        debug!(
            target = "mirror.back",
            channel_id = %self.channel_id(),
            kind = ?kind,
            fronts = targets.len(),
            "state pushed"
        );
        Ok(())
    }

    /// Last broadcast snapshot, encoding the current state first if none was
    /// broadcast yet.
    fn baseline(&self, state: &mut BackState) -> ChannelResult<Bytes> {
        if let Some(encoded) = &state.previous_encoded {
            return Ok(encoded.clone());
        }
        let encoded = self.inner.codec.encode_snapshot(&state.current)?;
        state.previous_encoded = Some(encoded.clone());
        Ok(encoded)
    }

    fn register_link(
        &self,
        state: &mut BackState,
        front: &ConnectedFrontData,
        client_uid: Option<&ClientUid>,
    ) -> ChannelResult<Bytes> {
        let encoded = self.baseline(state)?;
        let newly_linked = !state.linked_fronts.contains_key(&front.front_uid);
        let links = state.linked_fronts.entry(front.front_uid.clone()).or_default();
        match client_uid {
            Some(uid) => {
                links.clients.insert(uid.clone());
                state.client_fronts.insert(uid.clone(), front.front_uid.clone());
            }
            None => links.direct = true,
        }
        if newly_linked {
            self.inner.queue.link(front.front_master_index);
        }
        Ok(encoded)
    }

    fn remove_link(&self, front_uid: &FrontUid, client_uid: Option<&str>) {
        let released = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(links) = state.linked_fronts.get_mut(front_uid) else {
                return;
            };
            match client_uid {
                Some(uid) => {
                    links.clients.remove(uid);
                    if state.client_fronts.get(uid) == Some(front_uid) {
                        state.client_fronts.remove(uid);
                        state.writing_client_uids.remove(uid);
                    }
                }
                None => links.direct = false,
            }
            if links.is_empty() {
                state.linked_fronts.remove(front_uid);
                state
                    .connected_fronts
                    .get(front_uid)
                    .map(|front| front.front_master_index)
            } else {
                None
            }
        };
        debug!(
            target = "mirror.back",
            channel_id = %self.channel_id(),
            front_uid = %front_uid,
            client_uid = ?client_uid,
            front_released = released.is_some(),
            "link removed"
        );
        if let Some(index) = released {
            self.release_front_master(index);
        }
    }

    fn release_front_master(&self, index: MasterIndex) {
        if let Err(err) = self.inner.queue.unlink(index) {
            warn!(
                target = "mirror.back",
                channel_id = %self.channel_id(),
                front_master_index = index,
                error = %err,
                "front master reference already released"
            );
        }
    }

    fn register_inbound(&self) -> ChannelResult<()> {
        let channel_id = self.channel_id().to_string();
        let registry = self.inner.base.registry();
        registry.subscribe(
            Operation::Connect,
            None,
            &channel_id,
            self.handler(Self::on_front_connect),
        )?;
        registry.subscribe(
            Operation::BroadcastAllBack,
            None,
            &channel_id,
            self.handler(|channel, message| channel.on_front_message(message, InboundRoute::Broadcast)),
        )?;
        registry.pull(
            Operation::SendBack,
            Some(&channel_id),
            self.handler(|channel, message| channel.on_front_message(message, InboundRoute::Direct)),
        )?;
        Ok(())
    }

    fn handler<F>(&self, handle: F) -> impl Fn(ProtocolMessage) + Send + Sync + 'static
    where
        F: Fn(&BackChannel, ProtocolMessage) -> ChannelResult<()> + Send + Sync + 'static,
    {
        let weak: Weak<BackInner> = Arc::downgrade(&self.inner);
        move |message| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let channel = BackChannel { inner };
            if let Err(err) = handle(&channel, message) {
                error!(
                    target = "mirror.back",
                    channel_id = %channel.channel_id(),
                    error = %err,
                    "failed to process message"
                );
            }
        }
    }

    fn on_front_connect(&self, message: ProtocolMessage) -> ChannelResult<()> {
        let request: ConnectRequest = match message {
            ProtocolMessage::Connect(request) => request,
            other => return Err(other.unexpected("the connect topic")),
        };
        let front_uid = request.front_uid.clone();
        let mirrored = request.channel_id == self.channel_id();
        let stale = {
            let mut state = self.inner.state.lock();
            // a front announcing itself again starts over without links
            let stale = state.forget_links(&front_uid);
            state.connected_fronts.insert(
                front_uid.clone(),
                ConnectedFrontData {
                    channel_id: request.channel_id.clone(),
                    front_uid: front_uid.clone(),
                    front_master_index: request.front_master_index,
                    back_master_index: self.inner.back_master_index,
                },
            );
            if mirrored {
                state.mirrored_front_uids.insert(front_uid.clone());
            }
            stale
        };
        if stale {
            self.release_front_master(request.front_master_index);
        }

        if mirrored {
            let scope = front_uid.clone();
            self.inner.base.registry().pull(
                Operation::Link,
                Some(front_uid.as_str()),
                self.handler(move |channel, message| channel.on_link_traffic(&scope, message)),
            )?;
        }

        self.inner.base.registry().publish(
            Operation::ConnectionChange,
            Some(front_uid.as_str()),
            &ProtocolMessage::ConnectionChange(ConnectionChange {
                channel_id: self.channel_id().to_string(),
                back_master_index: self.inner.back_master_index,
                connection_status: ConnectionSignal::Connected,
                options: None,
            }),
        )?;
        debug!(
            target = "mirror.back",
            channel_id = %self.channel_id(),
            front_uid = %front_uid,
            mirrored,
            "front connected"
        );
        Ok(())
    }

    fn on_link_traffic(&self, front_uid: &FrontUid, message: ProtocolMessage) -> ChannelResult<()> {
        match message {
            ProtocolMessage::Link(request) => {
                self.accept_link(front_uid, request.client_uid, request.options)
            }
            ProtocolMessage::Unlink(request) => {
                self.remove_link(front_uid, request.client_uid.as_deref());
                Ok(())
            }
            ProtocolMessage::ClientWrite(write) => {
                self.on_client_write_change(front_uid, write);
                Ok(())
            }
            other => Err(other.unexpected("a link request topic")),
        }
    }

    fn on_client_write_change(&self, front_uid: &FrontUid, write: ClientWrite) {
        {
            let mut state = self.inner.state.lock();
            if state.client_fronts.get(&write.client_uid) != Some(front_uid) {
                warn!(
                    target = "mirror.back",
                    channel_id = %self.channel_id(),
                    client_uid = %write.client_uid,
                    "write change for a client not linked through this front"
                );
                return;
            }
            if write.enabled {
                state.writing_client_uids.insert(write.client_uid.clone());
            } else {
                state.writing_client_uids.remove(&write.client_uid);
            }
        }
        let handler = self.inner.handlers.read().on_client_write.clone();
        if let Some(handler) = handler {
            handler(&write.client_uid, write.enabled, write.options.as_ref());
        }
    }

    fn on_front_message(&self, message: ProtocolMessage, route: InboundRoute) -> ChannelResult<()> {
        match message {
            ProtocolMessage::FrontToBack(inbound) => {
                self.dispatch(BackInbound {
                    message: inbound.message,
                    front_uid: inbound.front_uid,
                    client_uid: inbound.client_uid,
                    route,
                });
                Ok(())
            }
            other => Err(other.unexpected("a back delivery topic")),
        }
    }

    fn dispatch(&self, inbound: BackInbound) {
        let handler = self.inner.handlers.read().on_message.clone();
        match handler {
            Some(handler) => handler(inbound),
            None => warn!(
                target = "mirror.back",
                channel_id = %self.channel_id(),
                front_uid = %inbound.front_uid,
                "no message handler installed; dropping message"
            ),
        }
    }
}

impl Channel for BackChannel {
    fn channel_id(&self) -> &str {
        self.inner.base.channel_id()
    }

    fn is_open(&self) -> bool {
        self.inner.base.is_open()
    }

    /// Tells every connected front this back channel is gone, then drops all
    /// registrations.
    fn close(&self) {
        if !self.inner.base.is_open() {
            return;
        }
        let fronts: Vec<FrontUid> = self.inner.state.lock().connected_fronts.keys().cloned().collect();
        let farewell = ProtocolMessage::ConnectionChange(ConnectionChange {
            channel_id: self.channel_id().to_string(),
            back_master_index: self.inner.back_master_index,
            connection_status: ConnectionSignal::Disconnected,
            options: None,
        });
        for uid in &fronts {
            if let Err(err) = self.inner.base.registry().publish(
                Operation::ConnectionChange,
                Some(uid.as_str()),
                &farewell,
            ) {
                warn!(
                    target = "mirror.back",
                    channel_id = %self.channel_id(),
                    front_uid = %uid,
                    error = %err,
                    "failed to announce disconnect"
                );
            }
        }
        self.inner.base.close();
        info!(
            target = "mirror.back",
            channel_id = %self.channel_id(),
            fronts = fronts.len(),
            "back channel closed"
        );
    }
}
