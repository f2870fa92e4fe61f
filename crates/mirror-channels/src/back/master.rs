use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};
use transport_bus::Bus;

use super::BackChannel;
use crate::channel::Channel;
use crate::codec::{JsonSpliceCodec, StateCodec};
use crate::error::{ChannelError, ChannelResult};
use crate::protocol::{Operation, ProtocolMessage, QueuedBatch};
use crate::queue::{FlushReport, LinkedMasterStats, MasterQueue};
use crate::registry::ProtocolRegistry;
use crate::types::{ChannelId, MasterIndex};

struct BackMasterInner {
    back_master_index: MasterIndex,
    channels: BTreeMap<ChannelId, BackChannel>,
    queue: Arc<MasterQueue>,
    registry: ProtocolRegistry,
}

/// Owns the back channels of one process. Consumes the batches front
/// masters flush to it and batches back → front messages per front master.
#[derive(Clone)]
pub struct BackMasterChannel {
    inner: Arc<BackMasterInner>,
}

impl BackMasterChannel {
    pub fn new<I, S>(channel_ids: I, back_master_index: MasterIndex, bus: Arc<dyn Bus>) -> ChannelResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        Self::with_codec(channel_ids, back_master_index, bus, Arc::new(JsonSpliceCodec))
    }

    pub fn with_codec<I, S>(
        channel_ids: I,
        back_master_index: MasterIndex,
        bus: Arc<dyn Bus>,
        codec: Arc<dyn StateCodec>,
    ) -> ChannelResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        let ids: Vec<ChannelId> = channel_ids.into_iter().map(Into::into).collect();
        let distinct: BTreeSet<&ChannelId> = ids.iter().collect();
        if ids.is_empty() || distinct.len() != ids.len() {
            return Err(ChannelError::misuse(
                "a back master needs a non-empty list of distinct channel ids",
            ));
        }

        let queue = Arc::new(MasterQueue::new());
        let mut channels = BTreeMap::new();
        for id in ids {
            let channel = BackChannel::new(
                id.clone(),
                back_master_index,
                Arc::clone(&bus),
                Arc::clone(&queue),
                Arc::clone(&codec),
            )?;
            channels.insert(id, channel);
        }

        let master = Self {
            inner: Arc::new(BackMasterInner {
                back_master_index,
                channels,
                queue,
                registry: ProtocolRegistry::new(bus, format!("back-master:{back_master_index}")),
            }),
        };
        let weak: Weak<BackMasterInner> = Arc::downgrade(&master.inner);
        master.inner.registry.pull(
            Operation::SendQueued,
            Some(&back_master_index.to_string()),
            move |message| {
                if let Some(inner) = weak.upgrade() {
                    BackMasterChannel { inner }.dispatch(message);
                }
            },
        )?;
        Ok(master)
    }

    pub fn back_master_index(&self) -> MasterIndex {
        self.inner.back_master_index
    }

    pub fn channel(&self, channel_id: &str) -> Option<BackChannel> {
        self.inner.channels.get(channel_id).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &BackChannel> {
        self.inner.channels.values()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.inner.channels.keys().cloned().collect()
    }

    pub fn linked_front_master_lookup(&self) -> BTreeMap<MasterIndex, LinkedMasterStats> {
        self.inner.queue.lookup()
    }

    /// Pushes one batch per front master with queued messages.
    pub fn send_queued_messages(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for (front_master_index, messages) in self.inner.queue.drain_all() {
            let count = messages.len();
            let batch = ProtocolMessage::Batch(QueuedBatch {
                from_master_index: self.inner.back_master_index,
                messages,
            });
            match self.inner.registry.publish(
                Operation::SendQueuedFront,
                Some(&front_master_index.to_string()),
                &batch,
            ) {
                Ok(_) => {
                    report.batches += 1;
                    report.messages += count;
                }
                Err(err) => warn!(
                    target = "mirror.master",
                    back_master_index = self.inner.back_master_index,
                    front_master_index,
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
                    back_master_index = self.inner.back_master_index,
                    error = %other.unexpected("the back batch topic"),
                    "dropping message"
                );
                return;
            }
        };
        debug!(
            target = "mirror.master",
            back_master_index = self.inner.back_master_index,
            from = batch.from_master_index,
            messages = batch.messages.len(),
            "dispatching batch"
        );
        let from = batch.from_master_index;
        for message in batch.messages {
            match self.inner.channels.get(&message.channel_id) {
                Some(channel) => channel.receive_queued(message, from),
                None => warn!(
                    target = "mirror.master",
                    back_master_index = self.inner.back_master_index,
                    channel_id = %message.channel_id,
                    "batch addressed an unknown channel"
                ),
            }
        }
    }
}
