use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use transport_bus::Bus;

use super::FrontChannel;
use crate::channel::Channel;
use crate::client::Client;
use crate::config::MasterOptions;
use crate::error::{ChannelError, ChannelResult};
use crate::protocol::{Operation, ProtocolMessage, QueuedBatch, QueuedMessage};
use crate::queue::{FlushReport, LinkedMasterStats, MasterQueue};
use crate::registry::ProtocolRegistry;
use crate::types::{ChannelId, ClientUid, ConnectionStatus, MasterIndex};

struct FrontMasterInner {
    front_master_index: MasterIndex,
    options: MasterOptions,
    channels: BTreeMap<ChannelId, FrontChannel>,
    queue: Arc<MasterQueue>,
    registry: ProtocolRegistry,
    connected_back_masters: Mutex<BTreeSet<MasterIndex>>,
}

/// Owns the front channels of one process and batches their traffic
/// towards back masters.
#[derive(Clone)]
pub struct FrontMasterChannel {
    inner: Arc<FrontMasterInner>,
}

impl FrontMasterChannel {
    /// Every channel id is expected to have a back channel somewhere in the
    /// cluster; each local front waits for all of them when connecting.
    pub fn new<I, S>(
        channel_ids: I,
        front_master_index: MasterIndex,
        bus: Arc<dyn Bus>,
        options: MasterOptions,
    ) -> ChannelResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        let ids: Vec<ChannelId> = channel_ids.into_iter().map(Into::into).collect();
        let distinct: BTreeSet<&ChannelId> = ids.iter().collect();
        if ids.is_empty() || distinct.len() != ids.len() {
            return Err(ChannelError::misuse(
                "a front master needs a non-empty list of distinct channel ids",
            ));
        }
        let total_channels = options.total_channels.unwrap_or(ids.len());
        if total_channels < ids.len() {
            return Err(ChannelError::misuse(format!(
                "a front master hosting {} channels cannot expect only {total_channels} in the cluster",
                ids.len()
            )));
        }

        let queue = Arc::new(MasterQueue::new());
        let mut channels = BTreeMap::new();
        for id in &ids {
            let channel = FrontChannel::new(
                id.clone(),
                total_channels,
                front_master_index,
                Arc::clone(&bus),
                Arc::clone(&queue),
                options,
            )?;
            channels.insert(id.clone(), channel);
        }

        let master = Self {
            inner: Arc::new(FrontMasterInner {
                front_master_index,
                options,
                channels,
                queue,
                registry: ProtocolRegistry::new(bus, format!("front-master:{front_master_index}")),
                connected_back_masters: Mutex::new(BTreeSet::new()),
            }),
        };
        let weak: Weak<FrontMasterInner> = Arc::downgrade(&master.inner);
        master.inner.registry.pull(
            Operation::SendQueuedFront,
            Some(&front_master_index.to_string()),
            move |message| {
                if let Some(inner) = weak.upgrade() {
                    FrontMasterChannel { inner }.dispatch(message);
                }
            },
        )?;
        Ok(master)
    }

    pub fn front_master_index(&self) -> MasterIndex {
        self.inner.front_master_index
    }

    pub fn options(&self) -> &MasterOptions {
        &self.inner.options
    }

    pub fn channel(&self, channel_id: &str) -> Option<FrontChannel> {
        self.inner.channels.get(channel_id).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &FrontChannel> {
        self.inner.channels.values()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.inner.channels.keys().cloned().collect()
    }

    pub fn connected_back_masters(&self) -> BTreeSet<MasterIndex> {
        self.inner.connected_back_masters.lock().clone()
    }

    pub fn create_client(&self, uid: impl Into<ClientUid>) -> Client {
        Client::new(uid, self.clone())
    }

    /// Connects every local front channel that is not connected yet, all at
    /// once, and returns the back master indexes discovered so far. Every
    /// attempt settles before the first failure is reported, so calling
    /// `connect` again retries only the channels that failed.
    pub async fn connect(&self) -> ChannelResult<BTreeSet<MasterIndex>> {
        let timeout = self.inner.options.connect_timeout;
        let attempts: Vec<&FrontChannel> = self
            .inner
            .channels
            .values()
            .filter(|channel| channel.connection_status() != ConnectionStatus::Connected)
            .collect();
        let results = join_all(attempts.iter().map(|channel| channel.connect(timeout))).await;

        let mut first_error = None;
        let mut failed = 0;
        let connected = {
            let mut guard = self.inner.connected_back_masters.lock();
            for result in results {
                match result {
                    Ok(outcome) => guard.extend(outcome.back_master_indexes.iter().copied()),
                    Err(err) => {
                        failed += 1;
                        first_error.get_or_insert(err);
                    }
                }
            }
            guard.clone()
        };
        if let Some(err) = first_error {
            warn!(
                target = "mirror.master",
                front_master_index = self.inner.front_master_index,
                attempted = attempts.len(),
                failed,
                error = %err,
                "front master connect failed"
            );
            return Err(err);
        }
        info!(
            target = "mirror.master",
            front_master_index = self.inner.front_master_index,
            channels = attempts.len(),
            back_masters = ?connected,
            "front master connected"
        );
        Ok(connected)
    }

    pub fn link_channel(&self, back_master_index: MasterIndex) -> usize {
        self.inner.queue.link(back_master_index)
    }

    pub fn unlink_channel(&self, back_master_index: MasterIndex) -> ChannelResult<usize> {
        self.inner.queue.unlink(back_master_index)
    }

    pub fn add_queued_message(
        &self,
        message: Value,
        back_master_index: MasterIndex,
        channel_id: &str,
        client_uid: Option<ClientUid>,
    ) -> ChannelResult<()> {
        self.inner.queue.push(
            back_master_index,
            QueuedMessage {
                channel_id: channel_id.to_string(),
                payload: message,
                client_uid,
            },
        )
    }

    pub fn linked_back_master_lookup(&self) -> BTreeMap<MasterIndex, LinkedMasterStats> {
        self.inner.queue.lookup()
    }

    /// Pushes one batch per back master with queued messages and empties
    /// the buffers.
    pub fn send_queued_messages(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for (back_master_index, messages) in self.inner.queue.drain_all() {
            let count = messages.len();
            let batch = ProtocolMessage::Batch(QueuedBatch {
                from_master_index: self.inner.front_master_index,
                messages,
            });
            match self.inner.registry.publish(
                Operation::SendQueued,
                Some(&back_master_index.to_string()),
                &batch,
            ) {
                Ok(_) => {
                    report.batches += 1;
                    report.messages += count;
                }
                Err(err) => warn!(
                    target = "mirror.master",
                    front_master_index = self.inner.front_master_index,
                    back_master_index,
                    dropped = count,
                    error = %err,
                    "failed to flush batch"
                ),
            }
        }
        report
    }

    pub fn close(&self) {
        for channel in self.inner.channels.values() {
            channel.close();
        }
        self.inner.registry.close();
    }

    fn dispatch(&self, message: ProtocolMessage) {
        let batch = match message {
            ProtocolMessage::Batch(batch) => batch,
            other => {
                error!(
                    target = "mirror.master",
                    front_master_index = self.inner.front_master_index,
                    error = %other.unexpected("the front batch topic"),
                    "dropping message"
                );
                return;
            }
        };
        debug!(
            target = "mirror.master",
            front_master_index = self.inner.front_master_index,
            from = batch.from_master_index,
            messages = batch.messages.len(),
            "dispatching batch"
        );
        for message in batch.messages {
            match self.inner.channels.get(&message.channel_id) {
                Some(channel) => channel.receive_queued(message),
                None => warn!(
                    target = "mirror.master",
                    front_master_index = self.inner.front_master_index,
                    channel_id = %message.channel_id,
                    "batch addressed an unknown channel"
                ),
            }
        }
    }
}
