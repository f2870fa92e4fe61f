//! Per-destination outbound buffers kept by a master coordinator.
//!
//! A destination has a buffer only while its link count is above zero.
//! Draining swaps every buffer out under one lock, so a message pushed
//! concurrently lands either in the drained batch or in the next one.

use std::collections::BTreeMap;
use std::mem;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ChannelError, ChannelResult};
use crate::protocol::QueuedMessage;
use crate::types::MasterIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub batches: usize,
    pub messages: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.batches == 0
    }
}

/// Snapshot of one destination's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedMasterStats {
    pub linked_channels_count: usize,
    pub queued_messages: usize,
}

#[derive(Debug, Default)]
struct LinkedMaster {
    linked_channels_count: usize,
    queued: Vec<QueuedMessage>,
}

#[derive(Debug, Default)]
pub struct MasterQueue {
    linked: Mutex<BTreeMap<MasterIndex, LinkedMaster>>,
}

impl MasterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one link reference to `index` and returns the new count. The
    /// first reference opens the destination's buffer.
    pub fn link(&self, index: MasterIndex) -> usize {
        let mut guard = self.linked.lock();
        let entry = guard.entry(index).or_default();
        entry.linked_channels_count += 1;
        entry.linked_channels_count
    }

    /// Drops one link reference. At zero the buffer is discarded along with
    /// anything still queued in it.
    pub fn unlink(&self, index: MasterIndex) -> ChannelResult<usize> {
        let mut guard = self.linked.lock();
        let Some(entry) = guard.get_mut(&index) else {
            return Err(not_linked(index));
        };
        entry.linked_channels_count -= 1;
        let remaining = entry.linked_channels_count;
        if remaining == 0 {
            if let Some(dropped) = guard.remove(&index) {
                if !dropped.queued.is_empty() {
                    debug!(
                        target = "mirror.master",
                        master_index = index,
                        dropped = dropped.queued.len(),
                        "discarding queue of unlinked master"
                    );
                }
            }
        }
        Ok(remaining)
    }

    pub fn is_linked(&self, index: MasterIndex) -> bool {
        self.linked.lock().contains_key(&index)
    }

    pub fn linked_count(&self, index: MasterIndex) -> usize {
        self.linked
            .lock()
            .get(&index)
            .map(|entry| entry.linked_channels_count)
            .unwrap_or(0)
    }

    pub fn push(&self, index: MasterIndex, message: QueuedMessage) -> ChannelResult<()> {
        let mut guard = self.linked.lock();
        let entry = guard.get_mut(&index).ok_or_else(|| not_linked(index))?;
        entry.queued.push(message);
        Ok(())
    }

    pub fn pending(&self, index: MasterIndex) -> usize {
        self.linked
            .lock()
            .get(&index)
            .map(|entry| entry.queued.len())
            .unwrap_or(0)
    }

    /// Takes every non-empty buffer, leaving them empty but still linked.
    pub fn drain_all(&self) -> Vec<(MasterIndex, Vec<QueuedMessage>)> {
        let mut guard = self.linked.lock();
        guard
            .iter_mut()
            .filter(|(_, entry)| !entry.queued.is_empty())
            .map(|(index, entry)| (*index, mem::take(&mut entry.queued)))
            .collect()
    }

    pub fn lookup(&self) -> BTreeMap<MasterIndex, LinkedMasterStats> {
        self.linked
            .lock()
            .iter()
            .map(|(index, entry)| {
                (
                    *index,
                    LinkedMasterStats {
                        linked_channels_count: entry.linked_channels_count,
                        queued_messages: entry.queued.len(),
                    },
                )
            })
            .collect()
    }
}

fn not_linked(index: MasterIndex) -> ChannelError {
    ChannelError::misuse(format!("the master at index {index} was not linked"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(n: u32) -> QueuedMessage {
        QueuedMessage {
            channel_id: "arena".into(),
            payload: json!({ "n": n }),
            client_uid: None,
        }
    }

    #[test]
    fn push_requires_link() {
        let queue = MasterQueue::new();
        let err = queue.push(4, message(0)).unwrap_err();
        assert!(err.is_misuse());
        assert!(queue.unlink(4).unwrap_err().is_misuse());
    }

    #[test]
    fn drain_takes_everything_in_order() {
        let queue = MasterQueue::new();
        queue.link(1);
        for n in 0..5 {
            queue.push(1, message(n)).unwrap();
        }
        let drained = queue.drain_all();
        assert_eq!(drained.len(), 1);
        let (index, batch) = &drained[0];
        assert_eq!(*index, 1);
        let order: Vec<_> = batch.iter().map(|m| m.payload["n"].as_u64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pending(1), 0);
        assert!(queue.is_linked(1));
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn references_close_buffer_at_zero() {
        let queue = MasterQueue::new();
        assert_eq!(queue.link(0), 1);
        assert_eq!(queue.link(0), 2);
        queue.push(0, message(1)).unwrap();
        assert_eq!(queue.unlink(0).unwrap(), 1);
        assert_eq!(queue.pending(0), 1);
        assert_eq!(queue.unlink(0).unwrap(), 0);
        assert!(!queue.is_linked(0));
        assert!(queue.lookup().is_empty());
    }
}
