use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use transport_bus::Bus;

use crate::error::{ChannelError, ChannelResult};
use crate::registry::ProtocolRegistry;
use crate::types::ChannelId;

/// Behaviour shared by the front and back instance of a logical channel.
pub trait Channel {
    fn channel_id(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Drops every registration the channel holds. Closing twice is a no-op.
    fn close(&self);
}

/// Identity, lifecycle flag and topic registrations of one channel instance.
pub(crate) struct ChannelBase {
    channel_id: ChannelId,
    registry: ProtocolRegistry,
    open: AtomicBool,
}

impl ChannelBase {
    pub(crate) fn new(channel_id: ChannelId, bus: Arc<dyn Bus>, role: &str) -> Self {
        let owner = format!("{role}:{channel_id}");
        Self {
            channel_id,
            registry: ProtocolRegistry::new(bus, owner),
            open: AtomicBool::new(true),
        }
    }

    pub(crate) fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub(crate) fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> ChannelResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ChannelError::misuse(format!(
                "channel {} is closed",
                self.channel_id
            )))
        }
    }

    /// Returns `true` only for the call that actually closed the channel.
    pub(crate) fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.registry.close();
        true
    }
}
