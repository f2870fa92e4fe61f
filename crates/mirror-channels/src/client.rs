//! One end consumer attached to a front master.
//!
//! A client reads from every channel it is linked to and writes through at
//! most one of them, its processor channel. State updates from linked
//! channels pile up per channel until the owner drains them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{ChannelError, ChannelResult};
use crate::front::{FrontChannel, FrontMasterChannel};
use crate::types::{ChannelId, ClientUid, LinkResponse, StateUpdate};

type MessageHandler = Arc<dyn Fn(&Value, &str) + Send + Sync>;

#[derive(Default)]
struct ClientState {
    linked_channels: BTreeSet<ChannelId>,
    processor_channel: Option<ChannelId>,
    queued_updates: BTreeMap<ChannelId, Vec<StateUpdate>>,
}

pub(crate) struct ClientInner {
    uid: ClientUid,
    master: FrontMasterChannel,
    state: Mutex<ClientState>,
    on_message: RwLock<Option<MessageHandler>>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Non-owning reference front channels keep to their linked clients.
#[derive(Clone)]
pub(crate) struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    pub(crate) fn upgrade(&self) -> Option<Client> {
        self.0.upgrade().map(|inner| Client { inner })
    }
}

impl Client {
    pub fn new(uid: impl Into<ClientUid>, master: FrontMasterChannel) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                uid: uid.into(),
                master,
                state: Mutex::new(ClientState::default()),
                on_message: RwLock::new(None),
            }),
        }
    }

    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn master(&self) -> &FrontMasterChannel {
        &self.inner.master
    }

    /// Receives messages addressed to this client, with the sending channel id.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        *self.inner.on_message.write() = Some(Arc::new(handler));
    }

    pub async fn link_channel(
        &self,
        channel_id: &str,
        options: Option<Value>,
    ) -> ChannelResult<LinkResponse> {
        self.front(channel_id)?.link_client(self, options).await
    }

    /// Unlinks one channel, or every channel the client is linked to or
    /// still waiting on when `channel_id` is `None`.
    pub fn unlink_channel(&self, channel_id: Option<&str>, options: Option<Value>) -> ChannelResult<()> {
        let targets: Vec<ChannelId> = match channel_id {
            Some(id) => vec![id.to_string()],
            None => {
                let mut ids = self.linked_channel_ids();
                ids.extend(
                    self.inner
                        .master
                        .channels()
                        .filter(|front| front.is_client_pending(self.uid()))
                        .map(|front| front.channel_id().to_string()),
                );
                ids.sort();
                ids.dedup();
                ids
            }
        };
        for id in targets {
            self.front(&id)?.unlink_client(self.uid(), options.clone())?;
        }
        Ok(())
    }

    /// Makes `channel_id` the channel this client writes through. The client
    /// must already be linked to it.
    pub fn set_processor_channel(
        &self,
        channel_id: &str,
        unlink_old: bool,
        add_options: Option<Value>,
        remove_options: Option<Value>,
    ) -> ChannelResult<bool> {
        if !self.is_linked_to_channel(channel_id) {
            return Err(ChannelError::misuse(format!(
                "client {} must link to channel {channel_id} before processing through it",
                self.uid()
            )));
        }
        let previous = self.processor_channel();
        if previous.as_deref() == Some(channel_id) {
            return Ok(true);
        }
        let next = self.front(channel_id)?;

        if let Some(old_id) = &previous {
            self.front(old_id)?
                .remove_client_write(self.uid(), remove_options)?;
        }
        next.add_client_write(self.uid(), add_options)?;
        if unlink_old {
            if let Some(old_id) = &previous {
                self.unlink_channel(Some(old_id), None)?;
            }
        }
        self.inner.state.lock().processor_channel = Some(channel_id.to_string());
        debug!(
            target = "mirror.client",
            client_uid = %self.uid(),
            from = ?previous,
            to = channel_id,
            "processor channel changed"
        );
        Ok(true)
    }

    /// Sends `data` to every back channel through the processor channel.
    pub fn send_global(&self, data: Value) -> ChannelResult<()> {
        self.processor()?
            .broadcast_from(data, None, Some(self.inner.uid.clone()))
    }

    /// Queues `data` for the processor channel's back channel.
    pub fn send_local(&self, data: Value) -> ChannelResult<()> {
        self.processor()?
            .add_message_from(data, Some(self.inner.uid.clone()))
    }

    /// Sends `data` to the processor channel's back channel right away.
    pub fn send_local_immediate(&self, data: Value) -> ChannelResult<()> {
        self.processor()?
            .send_from(data, None, Some(self.inner.uid.clone()))
    }

    /// Appends a state update for a linked channel. Updates for channels the
    /// client is not linked to are refused.
    pub fn add_state_update(&self, channel_id: &str, update: StateUpdate) -> bool {
        let mut state = self.inner.state.lock();
        if !state.linked_channels.contains(channel_id) {
            return false;
        }
        state
            .queued_updates
            .entry(channel_id.to_string())
            .or_default()
            .push(update);
        true
    }

    pub fn queued_encoded_updates(&self) -> BTreeMap<ChannelId, Vec<StateUpdate>> {
        self.inner.state.lock().queued_updates.clone()
    }

    /// Empties every channel's update list after the owner delivered them.
    pub fn clear_state_updates(&self) {
        for updates in self.inner.state.lock().queued_updates.values_mut() {
            updates.clear();
        }
    }

    pub fn linked_channel_ids(&self) -> Vec<ChannelId> {
        self.inner.state.lock().linked_channels.iter().cloned().collect()
    }

    pub fn processor_channel(&self) -> Option<ChannelId> {
        self.inner.state.lock().processor_channel.clone()
    }

    pub fn is_linked_to_channel(&self, channel_id: &str) -> bool {
        self.inner.state.lock().linked_channels.contains(channel_id)
    }

    /// Unlinks everything. The client can link again afterwards.
    pub fn disconnect(&self) -> ChannelResult<()> {
        self.unlink_channel(None, None)?;
        debug!(target = "mirror.client", client_uid = %self.uid(), "client disconnected");
        Ok(())
    }

    pub(crate) fn downgrade(&self) -> WeakClient {
        WeakClient(Arc::downgrade(&self.inner))
    }

    pub(crate) fn record_link(&self, channel_id: &str, encoded_state: Bytes) {
        let mut state = self.inner.state.lock();
        state.linked_channels.insert(channel_id.to_string());
        state
            .queued_updates
            .entry(channel_id.to_string())
            .or_default()
            .push(StateUpdate::set(encoded_state));
    }

    pub(crate) fn on_channel_unlinked(&self, channel_id: &str) {
        let mut state = self.inner.state.lock();
        state.linked_channels.remove(channel_id);
        state.queued_updates.remove(channel_id);
        if state.processor_channel.as_deref() == Some(channel_id) {
            state.processor_channel = None;
        }
    }

    pub(crate) fn deliver_message(&self, message: &Value, channel_id: &str) {
        let handler = self.inner.on_message.read().clone();
        match handler {
            Some(handler) => handler(message, channel_id),
            None => warn!(
                target = "mirror.client",
                client_uid = %self.uid(),
                channel_id,
                "no message handler installed; dropping message"
            ),
        }
    }

    fn processor(&self) -> ChannelResult<FrontChannel> {
        let channel_id = self.processor_channel().ok_or_else(|| {
            ChannelError::misuse(format!("client {} has no processor channel", self.uid()))
        })?;
        self.front(&channel_id)
    }

    fn front(&self, channel_id: &str) -> ChannelResult<FrontChannel> {
        self.inner.master.channel(channel_id).ok_or_else(|| {
            ChannelError::misuse(format!(
                "channel {channel_id} is not hosted by front master {}",
                self.inner.master.front_master_index()
            ))
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uid", &self.inner.uid)
            .field("processor_channel", &self.processor_channel())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use transport_bus::LocalBus;

    use super::*;
    use crate::config::MasterOptions;

    fn client() -> Client {
        let master =
            FrontMasterChannel::new(["a", "b"], 0, Arc::new(LocalBus::new()), MasterOptions::default())
                .unwrap();
        master.create_client("c1")
    }

    #[tokio::test]
    async fn updates_for_unlinked_channels_are_refused() {
        let client = client();
        assert!(!client.add_state_update("a", StateUpdate::patch(Bytes::from_static(b"x"))));

        client.record_link("a", Bytes::from_static(b"{}"));
        assert!(client.add_state_update("a", StateUpdate::patch(Bytes::from_static(b"x"))));
        let queued = client.queued_encoded_updates();
        assert_eq!(queued["a"].len(), 2);
        assert_eq!(queued["a"][0], StateUpdate::set(Bytes::from_static(b"{}")));

        client.on_channel_unlinked("a");
        assert!(!client.add_state_update("a", StateUpdate::patch(Bytes::from_static(b"y"))));
        assert!(client.queued_encoded_updates().is_empty());
    }

    #[tokio::test]
    async fn clearing_keeps_channel_entries() {
        let client = client();
        client.record_link("b", Bytes::from_static(b"[]"));
        client.clear_state_updates();
        let queued = client.queued_encoded_updates();
        assert!(queued["b"].is_empty());
        assert!(client.is_linked_to_channel("b"));
    }

    #[tokio::test]
    async fn sending_requires_a_processor() {
        let client = client();
        assert!(client.send_global(Value::Null).unwrap_err().is_misuse());
        assert!(client.send_local(Value::Null).unwrap_err().is_misuse());
        assert!(client.send_local_immediate(Value::Null).unwrap_err().is_misuse());
        let err = client
            .set_processor_channel("a", false, None, None)
            .unwrap_err();
        assert!(err.is_misuse());
    }
}
